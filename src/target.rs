// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Calls into the target running on a Test Agent, and its file-backed
//! storage.

use tracing::{debug, info};

use crate::{
    agent::{
        AgentSession,
        conf::{ConfTree, backing_store_mp},
        rpc::{RpcArg, TaRpc},
    },
    error::{TapiError, TapiResult},
};

/// Mount point of the backing store, unique per test process.
pub fn backing_store_mount_point() -> String {
    format!("/tmp/te_target_fs.{}", std::process::id())
}

async fn call_checked<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
    function: &str,
    args: &[RpcArg],
) -> TapiResult<Vec<RpcArg>> {
    session.validate()?;
    let reply = rpc.call(session, function, args).await?.check(function)?;
    Ok(reply.outputs)
}

/// Starts a receive thread of the target; the agent hands back the target
/// end of a local socket pair.
pub async fn start_rx_thread<R: TaRpc>(rpc: &R, session: &AgentSession) -> TapiResult<i32> {
    let outputs = call_checked(rpc, session, "iscsi_target_start_rx_thread", &[]).await?;
    let fd = outputs
        .first()
        .and_then(RpcArg::as_int)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| {
            TapiError::Format("iscsi_target_start_rx_thread returned no socket".into())
        })?;
    info!("target rx thread started on {}, socket {fd}", session.ta);
    Ok(fd)
}

/// Overrides a negotiation parameter of the custom session `id`.
pub async fn set_custom_value<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
    id: i32,
    name: &str,
    value: i32,
) -> TapiResult<()> {
    let args = [
        RpcArg::Int(id.into()),
        RpcArg::from(name),
        RpcArg::Int(value.into()),
    ];
    call_checked(rpc, session, "iscsi_set_custom_value", &args).await?;
    debug!("custom #{id} on {}: {name}={value}", session.ta);
    Ok(())
}

/// Sessions started after this call get fresh custom ids.
pub async fn start_new_session_group<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
) -> TapiResult<()> {
    call_checked(rpc, session, "iscsi_start_new_session_group", &[]).await?;
    Ok(())
}

pub async fn sync_device<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
    target: u8,
    lun: u8,
) -> TapiResult<()> {
    let args = [RpcArg::Int(target.into()), RpcArg::Int(lun.into())];
    call_checked(rpc, session, "iscsi_sync_device", &args).await?;
    Ok(())
}

/// Loads `len` bytes of the agent file `fname` into the device at `offset`.
pub async fn write_to_device<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
    target: u8,
    lun: u8,
    offset: u32,
    fname: &str,
    len: u32,
) -> TapiResult<()> {
    let args = device_args(target, lun, offset, fname, len);
    call_checked(rpc, session, "iscsi_write_to_device", &args).await?;
    debug!("{len} bytes of {fname} written to {target}/{lun}@{offset}");
    Ok(())
}

/// Dumps `len` bytes of the device at `offset` into the agent file `fname`.
pub async fn read_from_device<R: TaRpc>(
    rpc: &R,
    session: &AgentSession,
    target: u8,
    lun: u8,
    offset: u32,
    fname: &str,
    len: u32,
) -> TapiResult<()> {
    let args = device_args(target, lun, offset, fname, len);
    call_checked(rpc, session, "iscsi_read_from_device", &args).await?;
    debug!("{len} bytes of {target}/{lun}@{offset} read into {fname}");
    Ok(())
}

fn device_args(target: u8, lun: u8, offset: u32, fname: &str, len: u32) -> [RpcArg; 5] {
    [
        RpcArg::Int(target.into()),
        RpcArg::Int(lun.into()),
        RpcArg::Int(offset.into()),
        RpcArg::from(fname),
        RpcArg::Int(len.into()),
    ]
}

/// Mounts the backing store of the target on `ta`; returns the mount point.
pub async fn mount_backing_store<C: ConfTree>(conf: &C, ta: &str) -> TapiResult<String> {
    let mp = backing_store_mount_point();
    conf.cfg_set(&backing_store_mp(ta), &mp).await?;
    info!("backing store of {ta} mounted at {mp}");
    Ok(mp)
}

pub async fn unmount_backing_store<C: ConfTree>(conf: &C, ta: &str) -> TapiResult<()> {
    conf.cfg_set(&backing_store_mp(ta), "").await?;
    info!("backing store of {ta} unmounted");
    Ok(())
}

/// Uploads `data` as `name` right below the mounted backing store.
pub async fn target_file_write<R: TaRpc, C: ConfTree>(
    rpc: &R,
    conf: &C,
    ta: &str,
    name: &str,
    data: &[u8],
) -> TapiResult<()> {
    let expected = backing_store_mount_point();
    let mounted = match conf.cfg_get(&backing_store_mp(ta)).await {
        Ok(mp) => mp,
        Err(TapiError::NotFound(_)) => String::new(),
        Err(e) => return Err(e),
    };
    if mounted != expected {
        return Err(TapiError::NotMounted(expected));
    }
    let path = format!("{expected}/{name}");
    rpc.put_file(ta, data, &path).await?;
    debug!("{} bytes uploaded to {path} on {ta}", data.len());
    Ok(())
}
