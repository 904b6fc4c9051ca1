//! Narrow interfaces to everything that lives on a Test Agent.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::error::{TapiError, TapiResult};

/// Configuration tree client.
pub mod conf;
/// Remote procedure calls and the dedicated RPC server used for device I/O.
pub mod rpc;
/// Packet transport (CSAP engine).
pub mod transport;

/// The `(ta, session)` pair carried by every remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentSession {
    pub ta: String,
    pub sid: u32,
}

impl AgentSession {
    pub fn new(ta: impl Into<String>, sid: u32) -> Self {
        Self { ta: ta.into(), sid }
    }

    /// An empty agent name is the null-pointer case of the remote API.
    pub fn validate(&self) -> TapiResult<()> {
        if self.ta.is_empty() {
            return Err(TapiError::WrongPointer("agent name is empty".into()));
        }
        Ok(())
    }
}
