// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::{
        AgentSession,
        transport::{CsapHandle, RecvTimeout, Transport},
    },
    asn::{AsnValue, parse_value},
    error::{TapiError, TapiResult, errno},
};

fn forward_pattern(to: CsapHandle) -> TapiResult<AsnValue> {
    let mut pattern = parse_value("{ { pdus { iscsi:{} } } }")?;
    pattern.insert_indexed(
        "0.actions",
        None,
        AsnValue::choice(
            "forw-pld",
            AsnValue::Sequence(vec![("csap-id".into(), AsnValue::Integer(to.0.into()))]),
        ),
    )?;
    Ok(pattern)
}

/// Forwards PDUs `a → b` and `b → a` until neither side received anything
/// during one full `quiet` interval.
///
/// Both receives are stopped before returning, whatever the outcome.
/// Cancelling `cancel` while sleeping fails with `EINTR`.
pub async fn exchange_until_silent<T: Transport>(
    transport: &T,
    session: &AgentSession,
    a: CsapHandle,
    b: CsapHandle,
    quiet: Duration,
    cancel: &CancellationToken,
) -> TapiResult<()> {
    session.validate()?;
    if !a.is_valid() || !b.is_valid() {
        return Err(TapiError::WrongPointer(format!(
            "exchange between CSAP {a} and {b}"
        )));
    }

    transport
        .recv_start(session, a, &forward_pattern(b)?, RecvTimeout::Infinite, 0)
        .await?;
    if let Err(e) = transport
        .recv_start(session, b, &forward_pattern(a)?, RecvTimeout::Infinite, 0)
        .await
    {
        if let Err(stop) = transport.recv_stop(session, a).await {
            warn!("stopping receive on {a} failed: {stop}");
        }
        return Err(e);
    }
    info!("forwarding {a} <-> {b} on {} until silent for {quiet:?}", session.ta);

    let polled = poll_until_silent(transport, session, a, b, quiet, cancel).await;

    let stop_a = transport.recv_stop(session, a).await;
    let stop_b = transport.recv_stop(session, b).await;
    polled?;
    let (na, nb) = (stop_a?, stop_b?);
    debug!("exchange finished: {na} PDUs from {a}, {nb} from {b}");
    Ok(())
}

async fn poll_until_silent<T: Transport>(
    transport: &T,
    session: &AgentSession,
    a: CsapHandle,
    b: CsapHandle,
    quiet: Duration,
    cancel: &CancellationToken,
) -> TapiResult<()> {
    let mut last = (0u32, 0u32);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("exchange {a} <-> {b} interrupted");
                return Err(TapiError::Os {
                    errno: errno::EINTR,
                    context: "exchange sleep interrupted".into(),
                });
            }
            _ = tokio::time::sleep(quiet) => {}
        }

        let now = (
            transport.recv_get(session, a).await?,
            transport.recv_get(session, b).await?,
        );
        if now == last {
            return Ok(());
        }
        debug!("exchange {a} <-> {b}: {} / {} PDUs", now.0, now.1);
        last = now;
    }
}
