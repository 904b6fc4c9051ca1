// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bitflags::bitflags;
use tracing::error;

use crate::{
    agent::AgentSession,
    error::{TapiError, TapiResult},
};

/// Argument or output of a generic remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcArg {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl RpcArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RpcArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcArg::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for RpcArg {
    fn from(v: i64) -> Self {
        RpcArg::Int(v)
    }
}

impl From<&str> for RpcArg {
    fn from(v: &str) -> Self {
        RpcArg::Str(v.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcReply {
    pub local_rc: i32,
    pub remote_rc: i32,
    pub outputs: Vec<RpcArg>,
}

impl RpcReply {
    pub fn ok(outputs: Vec<RpcArg>) -> Self {
        Self {
            local_rc: 0,
            remote_rc: 0,
            outputs,
        }
    }

    /// Success requires both return codes to be zero.
    pub fn check(self, function: &str) -> TapiResult<Self> {
        if self.local_rc != 0 || self.remote_rc != 0 {
            error!(
                function,
                local_rc = self.local_rc,
                remote_rc = self.remote_rc,
                "remote call failed"
            );
            return Err(TapiError::Rpc {
                function: function.to_string(),
                local_rc: self.local_rc,
                remote_rc: self.remote_rc,
            });
        }
        Ok(self)
    }

    pub fn int_output(&self, idx: usize) -> TapiResult<i64> {
        self.outputs
            .get(idx)
            .and_then(RpcArg::as_int)
            .ok_or_else(|| TapiError::Format(format!("reply has no integer output #{idx}")))
    }
}

/// Generic call primitive of the agent.
pub trait TaRpc: Send + Sync {
    fn call(
        &self,
        session: &AgentSession,
        function: &str,
        args: &[RpcArg],
    ) -> impl Future<Output = TapiResult<RpcReply>> + Send;

    /// Uploads `contents` to `remote_path` on the agent.
    fn put_file(
        &self,
        ta: &str,
        contents: &[u8],
        remote_path: &str,
    ) -> impl Future<Output = TapiResult<()>> + Send;
}

bitflags! {
    /// `open(2)` flags as understood by the agent (Linux values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR   = 0o2;
        const CREAT  = 0o100;
        const TRUNC  = 0o1000;
        const DIRECT = 0o40000;
        const SYNC   = 0o4010000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();
}

/// Address of a buffer allocated in the agent's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePtr(pub u64);

impl RemotePtr {
    pub const NULL: RemotePtr = RemotePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A dedicated RPC server on the agent. Failures carry the remote errno
/// (`TapiError::from_errno`).
pub trait RpcServer: Send + Sync {
    fn name(&self) -> &str;

    fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> impl Future<Output = TapiResult<i32>> + Send;

    fn close(&self, fd: i32) -> impl Future<Output = TapiResult<()>> + Send;

    /// `lseek(fd, offset, SEEK_SET)`.
    fn lseek(&self, fd: i32, offset: u64) -> impl Future<Output = TapiResult<u64>> + Send;

    /// Reads into a remote buffer, returns the byte count (0 at EOF).
    fn read(
        &self,
        fd: i32,
        buf: RemotePtr,
        len: usize,
    ) -> impl Future<Output = TapiResult<usize>> + Send;

    fn write(
        &self,
        fd: i32,
        buf: RemotePtr,
        len: usize,
    ) -> impl Future<Output = TapiResult<usize>> + Send;

    fn memalign(
        &self,
        align: usize,
        size: usize,
    ) -> impl Future<Output = TapiResult<RemotePtr>> + Send;

    fn free(&self, ptr: RemotePtr) -> impl Future<Output = TapiResult<()>> + Send;

    /// Copies local bytes into a remote buffer.
    fn set_buf(
        &self,
        data: &[u8],
        ptr: RemotePtr,
    ) -> impl Future<Output = TapiResult<()>> + Send;

    fn get_buf(
        &self,
        ptr: RemotePtr,
        len: usize,
    ) -> impl Future<Output = TapiResult<Vec<u8>>> + Send;

    /// Runs a shell command, returns its exit status.
    fn system(&self, cmd: &str) -> impl Future<Output = TapiResult<i32>> + Send;
}

/// Creates and destroys dedicated RPC servers.
pub trait AgentRpc: Send + Sync {
    type Server: RpcServer + 'static;

    fn create_server(
        &self,
        ta: &str,
        name: &str,
    ) -> impl Future<Output = TapiResult<Self::Server>> + Send;

    fn destroy_server(
        &self,
        server: Self::Server,
    ) -> impl Future<Output = TapiResult<()>> + Send;
}
