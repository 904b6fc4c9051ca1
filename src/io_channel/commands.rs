// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{debug, warn};

use crate::{
    agent::rpc::{OpenFlags, RemotePtr, RpcServer},
    cfg::config::SCRATCH_ALIGN,
    error::{TapiError, TapiResult},
    io_channel::task::IoCommand,
};

/// What a successful command leaves behind.
#[derive(Debug, Default)]
pub(crate) struct Executed {
    /// Descriptor the command produced (open) or used.
    pub fd: Option<i32>,
    pub data: Option<Vec<u8>>,
}

/// Worker-owned state: the RPC server, the aligned scratch buffer and the
/// descriptor later tasks inherit.
pub(crate) struct Executor<S: RpcServer> {
    pub server: S,
    pub scratch: RemotePtr,
    pub scratch_len: usize,
    pub chunk_size: usize,
    pub current_fd: Option<i32>,
}

fn round_up(len: usize) -> usize {
    len.div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN
}

impl<S: RpcServer> Executor<S> {
    /// Grows the scratch buffer to hold at least `len` bytes.
    async fn ensure_scratch(&mut self, len: usize) -> TapiResult<()> {
        if len <= self.scratch_len && !self.scratch.is_null() {
            return Ok(());
        }
        let size = round_up(len.max(self.chunk_size));
        let ptr = self.server.memalign(SCRATCH_ALIGN, size).await?;
        if ptr.is_null() {
            return Err(TapiError::NoMemory(format!("memalign({size}) on the agent")));
        }
        self.free_quietly(self.scratch).await;
        debug!("scratch buffer grown from {} to {size} bytes", self.scratch_len);
        self.scratch = ptr;
        self.scratch_len = size;
        Ok(())
    }

    fn resolve_fd(&self, fd: Option<i32>) -> TapiResult<i32> {
        match fd.or(self.current_fd) {
            Some(fd) if fd >= 0 => Ok(fd),
            other => Err(TapiError::BadFile(format!("no descriptor ({other:?})"))),
        }
    }

    pub async fn execute(
        &mut self,
        command: IoCommand,
        fd: Option<i32>,
    ) -> TapiResult<Executed> {
        match command {
            IoCommand::Open { path, flags } => {
                let fd = self
                    .server
                    .open(&path, flags | OpenFlags::DIRECT | OpenFlags::SYNC, 0o644)
                    .await?;
                Ok(Executed {
                    fd: Some(fd),
                    data: None,
                })
            },
            IoCommand::Close => {
                let fd = self.resolve_fd(fd)?;
                self.server.close(fd).await?;
                if self.current_fd == Some(fd) {
                    self.current_fd = None;
                }
                Ok(Executed {
                    fd: Some(fd),
                    data: None,
                })
            },
            IoCommand::Seek { offset } => {
                let fd = self.resolve_fd(fd)?;
                self.server.lseek(fd, offset).await?;
                Ok(Executed {
                    fd: Some(fd),
                    data: None,
                })
            },
            IoCommand::Read { length } => {
                let fd = self.resolve_fd(fd)?;
                self.ensure_scratch(length).await?;
                let n = self.server.read(fd, self.scratch, length).await?;
                if n != length {
                    return Err(TapiError::Failed(format!(
                        "short read: {n} of {length} bytes"
                    )));
                }
                let data = self.server.get_buf(self.scratch, length).await?;
                Ok(Executed {
                    fd: Some(fd),
                    data: Some(data),
                })
            },
            IoCommand::Write { data } => {
                let fd = self.resolve_fd(fd)?;
                self.ensure_scratch(data.len()).await?;
                self.server.set_buf(&data, self.scratch).await?;
                let n = self.server.write(fd, self.scratch, data.len()).await?;
                if n != data.len() {
                    return Err(TapiError::NoSpace {
                        written: n,
                        expected: data.len(),
                    });
                }
                Ok(Executed {
                    fd: Some(fd),
                    data: None,
                })
            },
            IoCommand::CopyIn { source } => {
                let fd = self.resolve_fd(fd)?;
                let src = self.server.open(&source, OpenFlags::RDONLY, 0).await?;
                let r = self.stream(src, fd).await;
                self.close_quietly(src).await;
                r.map(|total| {
                    debug!("copied {total} bytes from {source}");
                    Executed {
                        fd: Some(fd),
                        data: None,
                    }
                })
            },
            IoCommand::CopyOut { dest } => {
                let fd = self.resolve_fd(fd)?;
                let dst = self
                    .server
                    .open(
                        &dest,
                        OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
                        0o644,
                    )
                    .await?;
                let r = self.stream(fd, dst).await;
                self.close_quietly(dst).await;
                r.map(|total| {
                    debug!("copied {total} bytes into {dest}");
                    Executed {
                        fd: Some(fd),
                        data: None,
                    }
                })
            },
            IoCommand::Shell { cmd } => {
                let status = self.server.system(&cmd).await?;
                if status != 0 {
                    return Err(TapiError::ShellCommand { cmd, status });
                }
                Ok(Executed::default())
            },
        }
    }

    /// Copies `from` into `to` in `chunk_size` pieces until EOF.
    async fn stream(&mut self, from: i32, to: i32) -> TapiResult<usize> {
        self.ensure_scratch(self.chunk_size).await?;
        let mut total = 0;
        loop {
            let n = self.server.read(from, self.scratch, self.chunk_size).await?;
            if n == 0 {
                return Ok(total);
            }
            let w = self.server.write(to, self.scratch, n).await?;
            if w != n {
                return Err(TapiError::NoSpace {
                    written: total + w,
                    expected: total + n,
                });
            }
            total += n;
        }
    }

    async fn close_quietly(&self, fd: i32) {
        if let Err(e) = self.server.close(fd).await {
            warn!("close({fd}) failed: {e}");
        }
    }

    /// Frees the scratch buffer and hands the server back for destruction.
    pub async fn release(self) -> S {
        self.free_quietly(self.scratch).await;
        self.server
    }

    async fn free_quietly(&self, ptr: RemotePtr) {
        if ptr.is_null() {
            return;
        }
        if let Err(e) = self.server.free(ptr).await {
            warn!("freeing scratch buffer failed: {e}");
        }
    }
}
