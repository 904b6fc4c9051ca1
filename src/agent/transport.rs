// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use crate::{agent::AgentSession, asn::AsnValue, error::TapiResult};

/// Identifier of a CSAP, owned by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsapHandle(pub u32);

impl CsapHandle {
    pub const INVALID: CsapHandle = CsapHandle(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for CsapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("INVALID")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    Ms(u32),
    Infinite,
}

/// The protocol-agnostic packet send/receive engine of the agent.
///
/// Patterns and templates are [`AsnValue`] trees; received packets are
/// returned in the same model. A receive that sees nothing before its
/// deadline fails with `TapiError::TimedOut`.
pub trait Transport: Send + Sync {
    /// Creates a CSAP. `stack` is the `top.….lowest` identifier of the
    /// layered `spec`.
    fn csap_create(
        &self,
        session: &AgentSession,
        stack: &str,
        spec: &AsnValue,
    ) -> impl Future<Output = TapiResult<CsapHandle>> + Send;

    fn csap_destroy(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
    ) -> impl Future<Output = TapiResult<()>> + Send;

    /// Sends one template and returns once it is on the wire.
    fn send(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
        template: &AsnValue,
    ) -> impl Future<Output = TapiResult<()>> + Send;

    /// Arms a receive for `count` packets, 0 meaning no limit. Matched
    /// packets are stored on the agent and, when the pattern carries a
    /// forwarding action, re-emitted on the target CSAP.
    fn recv_start(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
        pattern: &AsnValue,
        timeout: RecvTimeout,
        count: u32,
    ) -> impl Future<Output = TapiResult<()>> + Send;

    /// Waits for the armed receive to finish and hands over stored packets.
    fn recv_wait(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
    ) -> impl Future<Output = TapiResult<Vec<AsnValue>>> + Send;

    /// Number of packets matched so far, without stopping the receive.
    fn recv_get(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
    ) -> impl Future<Output = TapiResult<u32>> + Send;

    /// Stops the receive and returns the final matched count.
    fn recv_stop(
        &self,
        session: &AgentSession,
        csap: CsapHandle,
    ) -> impl Future<Output = TapiResult<u32>> + Send;

    /// Waits for a connection on a listening TCP CSAP and returns the
    /// accepted socket descriptor (agent-side).
    fn tcp_accept(
        &self,
        session: &AgentSession,
        listen: CsapHandle,
        timeout: RecvTimeout,
    ) -> impl Future<Output = TapiResult<i32>> + Send;
}
