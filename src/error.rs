// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error kinds surfaced by the iSCSI test API.
//!
//! Every public entry point either returns one of the kinds below or the
//! underlying OS / RPC error verbatim. Task statuses are copied between I/O
//! slots, so the type is `Clone`.

use thiserror::Error;

/// OS errno values used by the remote side (Linux numbering).
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const ENOTBLK: i32 = 15;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ENOBUFS: i32 = 105;
    pub const ETIMEDOUT: i32 = 110;
    pub const EINPROGRESS: i32 = 115;

    /// Test-environment specific codes, outside of the OS range.
    pub const TE_EWRONGPTR: i32 = 1001;
    pub const TE_EFAIL: i32 = 1002;
    pub const TE_ETOOMANY: i32 = 1003;
    pub const TE_ESHCMD: i32 = 1004;
    pub const TE_EFMT: i32 = 1005;
    pub const TE_EASN: i32 = 1006;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TapiError {
    #[error("EINVAL: {0}")]
    InvalidArgument(String),

    #[error("ENOMEM: {0}")]
    NoMemory(String),

    #[error("EWRONGPTR: {0}")]
    WrongPointer(String),

    #[error("ENODEV: no SCSI device exposed for target {target_id}")]
    NoDevice { target_id: u32 },

    #[error("ENOTBLK: filesystem operation on a raw block device channel")]
    NotBlock,

    #[error("ENXIO: backing store is not mounted at {0}")]
    NotMounted(String),

    #[error("ENOSPC: short write, {written} of {expected} bytes")]
    NoSpace { written: usize, expected: usize },

    #[error("EFAIL: {0}")]
    Failed(String),

    #[error("EINPROGRESS: task is not complete yet")]
    InProgress,

    #[error("ETOOMANY: all {0} task slots are in use")]
    TooMany(usize),

    #[error("ESHCMD: `{cmd}` exited with status {status}")]
    ShellCommand { cmd: String, status: i32 },

    #[error("EBADF: {0}")]
    BadFile(String),

    #[error("ENOENT: {0}")]
    NotFound(String),

    #[error("EFMT: {0}")]
    Format(String),

    #[error("ENOBUFS: need {needed} bytes, have {available}")]
    NoBuffers { needed: usize, available: usize },

    #[error("EOPNOTSUPP: {0}")]
    NotSupported(String),

    #[error("ETIMEDOUT: {0}")]
    TimedOut(String),

    #[error("ASN.1 value error: {0}")]
    Asn(String),

    #[error("OS error {errno} in {context}")]
    Os { errno: i32, context: String },

    #[error("RPC {function} failed: local rc {local_rc}, remote rc {remote_rc}")]
    Rpc {
        function: String,
        local_rc: i32,
        remote_rc: i32,
    },
}

pub type TapiResult<T> = Result<T, TapiError>;

impl TapiError {
    /// Maps an errno reported by the agent to the matching kind.
    pub fn from_errno(code: i32, context: impl Into<String>) -> Self {
        let context = context.into();
        match code {
            errno::ENOENT => TapiError::NotFound(context),
            errno::EINVAL => TapiError::InvalidArgument(context),
            errno::ENOMEM => TapiError::NoMemory(context),
            errno::ENOTBLK => TapiError::NotBlock,
            errno::ENXIO => TapiError::NotMounted(context),
            errno::EBADF => TapiError::BadFile(context),
            errno::ENOBUFS => TapiError::NoBuffers {
                needed: 0,
                available: 0,
            },
            errno::EOPNOTSUPP => TapiError::NotSupported(context),
            errno::ETIMEDOUT => TapiError::TimedOut(context),
            errno::EINPROGRESS => TapiError::InProgress,
            errno::TE_EWRONGPTR => TapiError::WrongPointer(context),
            errno::TE_EFAIL => TapiError::Failed(context),
            errno::TE_EFMT => TapiError::Format(context),
            errno::TE_EASN => TapiError::Asn(context),
            other => TapiError::Os {
                errno: other,
                context,
            },
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            TapiError::InvalidArgument(_) => errno::EINVAL,
            TapiError::NoMemory(_) => errno::ENOMEM,
            TapiError::WrongPointer(_) => errno::TE_EWRONGPTR,
            TapiError::NoDevice { .. } => errno::ENODEV,
            TapiError::NotBlock => errno::ENOTBLK,
            TapiError::NotMounted(_) => errno::ENXIO,
            TapiError::NoSpace { .. } => errno::ENOSPC,
            TapiError::Failed(_) => errno::TE_EFAIL,
            TapiError::InProgress => errno::EINPROGRESS,
            TapiError::TooMany(_) => errno::TE_ETOOMANY,
            TapiError::ShellCommand { .. } => errno::TE_ESHCMD,
            TapiError::BadFile(_) => errno::EBADF,
            TapiError::NotFound(_) => errno::ENOENT,
            TapiError::Format(_) => errno::TE_EFMT,
            TapiError::NoBuffers { .. } => errno::ENOBUFS,
            TapiError::NotSupported(_) => errno::EOPNOTSUPP,
            TapiError::TimedOut(_) => errno::ETIMEDOUT,
            TapiError::Asn(_) => errno::TE_EASN,
            TapiError::Os { errno, .. } => *errno,
            TapiError::Rpc {
                local_rc,
                remote_rc,
                ..
            } => {
                if *remote_rc != 0 {
                    *remote_rc
                } else {
                    *local_rc
                }
            },
        }
    }

    /// `true` for a receive that simply saw nothing before its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TapiError::TimedOut(_))
    }
}
