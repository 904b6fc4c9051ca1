// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    agent::{
        AgentSession,
        rpc::TaRpc,
        transport::{CsapHandle, RecvTimeout, Transport},
    },
    asn::{AsnValue, parse_value},
    cfg::enums::Digest,
    csap::spec::{
        add_iscsi_layer, add_socket_fd_layer, add_tcp_server_layer, iscsi_layer_mut,
        stack_id,
    },
    error::{TapiError, TapiResult},
    target,
};

const PDU_TEMPLATE: &str = "{ pdus { iscsi:{} } }";
const PDU_PATTERN: &str = "{ { pdus { iscsi:{} } } }";

/// Outcome of [`IscsiCsap::recv_pdu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// One PDU copied into the caller's buffer.
    Pdu { len: usize, param: Option<i64> },
    /// PDUs seen without copying (no buffer, or forwarded elsewhere).
    Counted(u32),
    TimedOut,
}

/// An iSCSI CSAP bound to a connected socket on the agent.
pub struct IscsiCsap<T: Transport> {
    transport: Arc<T>,
    session: AgentSession,
    handle: CsapHandle,
    header_digest: Digest,
    data_digest: Digest,
}

impl<T: Transport> std::fmt::Debug for IscsiCsap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiCsap")
            .field("ta", &self.session.ta)
            .field("handle", &self.handle)
            .field("header_digest", &self.header_digest)
            .field("data_digest", &self.data_digest)
            .finish()
    }
}

impl<T: Transport> IscsiCsap<T> {
    /// Target side: starts a receive thread of the target on the agent and
    /// binds the CSAP to the local socket it hands back.
    pub async fn create_target_side<R: TaRpc>(
        transport: Arc<T>,
        rpc: &R,
        session: &AgentSession,
        header_digest: Digest,
        data_digest: Digest,
    ) -> TapiResult<Self> {
        let fd = target::start_rx_thread(rpc, session).await?;
        Self::over_socket(transport, session, fd, header_digest, data_digest).await
    }

    /// Initiator side: takes the next connection accepted by a listening TCP
    /// CSAP.
    pub async fn create_initiator_side(
        transport: Arc<T>,
        session: &AgentSession,
        listen: CsapHandle,
        timeout: RecvTimeout,
        header_digest: Digest,
        data_digest: Digest,
    ) -> TapiResult<Self> {
        session.validate()?;
        if !listen.is_valid() {
            return Err(TapiError::WrongPointer("listening CSAP is INVALID".into()));
        }
        let fd = transport.tcp_accept(session, listen, timeout).await?;
        info!("accepted initiator connection on {}, socket {fd}", session.ta);
        Self::over_socket(transport, session, fd, header_digest, data_digest).await
    }

    pub async fn over_socket(
        transport: Arc<T>,
        session: &AgentSession,
        fd: i32,
        header_digest: Digest,
        data_digest: Digest,
    ) -> TapiResult<Self> {
        session.validate()?;
        if fd < 0 {
            return Err(TapiError::WrongPointer(format!("socket {fd}")));
        }
        let mut spec = None;
        add_socket_fd_layer(&mut spec, fd)?;
        add_iscsi_layer(&mut spec, fd, Digest::None, Digest::None)?;
        let spec =
            spec.ok_or_else(|| TapiError::NoMemory("CSAP spec was not built".into()))?;
        Self::create_with_digests(transport, session, spec, header_digest, data_digest)
            .await
    }

    async fn create_with_digests(
        transport: Arc<T>,
        session: &AgentSession,
        mut spec: AsnValue,
        header_digest: Digest,
        data_digest: Digest,
    ) -> TapiResult<Self> {
        let layer = iscsi_layer_mut(&mut spec)
            .ok_or_else(|| TapiError::InvalidArgument("CSAP spec has no iSCSI layer".into()))?;
        layer.write_enum("header-digest", header_digest.asn_label())?;
        layer.write_enum("data-digest", data_digest.asn_label())?;

        let stack = stack_id(&spec)?;
        let handle = transport.csap_create(session, &stack, &spec).await?;
        debug!("{stack} CSAP {handle} created on {}: {spec}", session.ta);
        Ok(Self {
            transport,
            session: session.clone(),
            handle,
            header_digest,
            data_digest,
        })
    }

    /// Listening TCP CSAP for [`IscsiCsap::create_initiator_side`].
    pub async fn tcp_server(
        transport: &T,
        session: &AgentSession,
        addr: &str,
        port: u16,
    ) -> TapiResult<CsapHandle> {
        session.validate()?;
        let mut spec = None;
        add_tcp_server_layer(&mut spec, addr, port)?;
        let spec =
            spec.ok_or_else(|| TapiError::NoMemory("CSAP spec was not built".into()))?;
        transport.csap_create(session, &stack_id(&spec)?, &spec).await
    }

    pub fn handle(&self) -> CsapHandle {
        self.handle
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub fn digests(&self) -> (Digest, Digest) {
        (self.header_digest, self.data_digest)
    }

    /// Sends one PDU. `param` surfaces control info to the target stub;
    /// `last_data` asks the transport to carry a following FIN in the same
    /// push.
    pub async fn send_pdu(
        &self,
        data: &[u8],
        param: Option<i64>,
        last_data: bool,
    ) -> TapiResult<()> {
        let mut template = parse_value(PDU_TEMPLATE)?;
        template.write_bytes("payload.#bytes", data)?;
        if let Some(p) = param {
            template.write_int("pdus.0.#iscsi.param", p)?;
        }
        if last_data {
            template.write_null("pdus.0.#iscsi.last-data")?;
        }
        self.transport
            .send(&self.session, self.handle, &template)
            .await?;
        debug!("sent {} bytes on CSAP {}", data.len(), self.handle);
        Ok(())
    }

    /// Receives one PDU. With `forward` the PDU is re-emitted on that CSAP
    /// and only counted; with no buffer the call only waits for it.
    pub async fn recv_pdu(
        &self,
        buf: Option<&mut [u8]>,
        forward: Option<CsapHandle>,
        timeout: RecvTimeout,
    ) -> TapiResult<RecvStatus> {
        let mut pattern = parse_value(PDU_PATTERN)?;
        if let Some(fwd) = forward {
            if !fwd.is_valid() {
                return Err(TapiError::WrongPointer("forward CSAP is INVALID".into()));
            }
            let action = AsnValue::choice(
                "forw-pld",
                AsnValue::Sequence(vec![("csap-id".into(), AsnValue::Integer(fwd.0.into()))]),
            );
            pattern.insert_indexed("0.actions", None, action)?;
        }

        self.transport
            .recv_start(&self.session, self.handle, &pattern, timeout, 1)
            .await?;
        let pkts = match self.transport.recv_wait(&self.session, self.handle).await {
            Ok(pkts) => pkts,
            Err(e) if e.is_timeout() => {
                debug!("no PDU on CSAP {} before timeout", self.handle);
                return Ok(RecvStatus::TimedOut);
            },
            Err(e) => return Err(e),
        };

        let Some(buf) = buf.filter(|_| forward.is_none()) else {
            return Ok(RecvStatus::Counted(pkts.len() as u32));
        };
        let Some(pkt) = pkts.first() else {
            return Ok(RecvStatus::TimedOut);
        };

        let payload = pkt.read_bytes("payload.#bytes")?;
        let len = if payload.len() > buf.len() {
            warn!(
                "PDU of {} bytes truncated to buffer of {}",
                payload.len(),
                buf.len()
            );
            buf.len()
        } else {
            payload.len()
        };
        buf[..len].copy_from_slice(&payload[..len]);
        let param = pkt.read_int("pdus.0.#iscsi.param").ok();
        Ok(RecvStatus::Pdu { len, param })
    }

    /// Destroys the CSAP on the agent. Callers run this on cleanup paths too.
    pub async fn destroy(self) -> TapiResult<()> {
        let r = self.transport.csap_destroy(&self.session, self.handle).await;
        if let Err(e) = &r {
            warn!("destroying CSAP {} on {} failed: {e}", self.handle, self.session.ta);
        }
        r
    }
}
