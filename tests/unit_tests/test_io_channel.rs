// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use iscsi_tapi::{
    agent::{
        AgentSession,
        conf::{leaf, target_data},
        rpc::OpenFlags,
    },
    error::{TapiError, errno},
    io_channel::{IoChannel, IoCommand, IoOptions, IoTask, MAX_TASKS, PATH_MAX, TaskId},
};

use super::common::{MemAgent, MemConf, TA, load_config, session};

const DEV: &str = "/dev/sdx";

fn conf_with_device(ta: &str, target_id: u32) -> MemConf {
    MemConf::with(&[(&leaf(&target_data(ta, target_id), "host_device"), DEV)])
}

async fn channel(agent: &MemAgent, use_fs: bool) -> Result<IoChannel> {
    let cfg = load_config()?;
    let mut options = IoOptions::from(&cfg);
    options.use_fs = use_fs;
    let conf = conf_with_device(TA, 0);
    Ok(IoChannel::prepare(Arc::new(agent.clone()), &conf, &session(), 0, options).await?)
}

async fn wait_all(ch: &IoChannel, ids: &[TaskId]) {
    for id in ids {
        let _ = tokio::time::timeout(Duration::from_secs(5), ch.wait_complete(*id)).await;
    }
}

#[tokio::test]
async fn test_failed_leader_poisons_chain() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;

    let t0 = ch.open("/nonexistent", OpenFlags::RDONLY, true).await?;
    let t1 = ch.write(None, vec![0x5A; 4096]).await?;
    let t2 = ch.close(None).await?;
    wait_all(&ch, &[t0, t1, t2]).await;

    for t in [t0, t1, t2] {
        assert!(ch.is_complete(t).await?);
        let err = ch.get_status(t).await.unwrap_err();
        assert_eq!(err.errno(), errno::ENOENT, "{t}");
    }
    assert_eq!(agent.state.opened.lock().unwrap().len(), 1);
    assert_eq!(agent.state.open_fds(), 0);

    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_mount_descriptor_reaches_later_tasks() -> Result<()> {
    let agent = MemAgent::default();
    let mut image = vec![0u8; 8192];
    image[512..516].copy_from_slice(b"DATA");
    agent.state.put(DEV, &image);
    let ch = channel(&agent, false).await?;

    let mount = ch.mount().await?;
    let seek = ch.seek(None, 512).await?;
    let read = ch.read(None, 4).await?;
    ch.wait_complete(read).await?;

    ch.get_status(mount).await?;
    ch.get_status(seek).await?;
    assert_eq!(ch.take_read_data(read).await?.as_deref(), Some(&b"DATA"[..]));
    assert_eq!(ch.take_read_data(read).await?, None);

    let opened = agent.state.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].0, DEV);
    assert!(opened[0].1.contains(OpenFlags::RDWR | OpenFlags::SYNC | OpenFlags::DIRECT));
    assert_eq!(
        agent.state.shell.lock().unwrap().as_slice(),
        &[format!("blockdev --setra 0 {DEV}")]
    );

    let unmount = ch.unmount().await?;
    ch.wait_complete(unmount).await?;
    assert_eq!(agent.state.open_fds(), 0);
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_write_then_read_back() -> Result<()> {
    let agent = MemAgent::default();
    agent.state.put(DEV, &[0u8; 16384]);
    let ch = channel(&agent, false).await?;

    ch.mount().await?;
    ch.seek(None, 4096).await?;
    // Bigger than the scratch buffer, so it has to grow.
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let write = ch.write(None, payload.clone()).await?;
    ch.seek(None, 4096).await?;
    let read = ch.read(None, payload.len()).await?;
    ch.wait_complete(read).await?;

    ch.get_status(write).await?;
    assert_eq!(ch.take_read_data(read).await?, Some(payload.clone()));
    let image = agent.state.file(DEV).expect("device");
    assert_eq!(&image[4096..4096 + payload.len()], payload.as_slice());

    ch.finish().await?;
    assert_eq!(agent.state.live_buffers(), 0);
    Ok(())
}

#[tokio::test]
async fn test_short_write_is_no_space() -> Result<()> {
    let agent = MemAgent::default();
    agent.state.put(DEV, &[]);
    *agent.state.write_limit.lock().unwrap() = Some(100);
    let ch = channel(&agent, false).await?;

    ch.mount().await?;
    let write = ch.write(None, vec![1; 512]).await?;
    let read = ch.read(None, 16).await?;
    wait_all(&ch, &[write, read]).await;

    assert_eq!(ch.get_status(write).await.unwrap_err().errno(), errno::ENOSPC);
    assert_eq!(ch.get_status(read).await.unwrap_err().errno(), errno::ENOSPC);
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_leader_restarts_chain() -> Result<()> {
    let agent = MemAgent::default();
    agent
        .state
        .failing_shell
        .lock()
        .unwrap()
        .insert("false".into());
    let ch = channel(&agent, false).await?;

    let bad = ch.shell("false", true).await?;
    let skipped = ch.shell("echo skipped", false).await?;
    let good = ch.shell("true", true).await?;
    let follow = ch.shell("echo ran", false).await?;
    wait_all(&ch, &[bad, skipped, good, follow]).await;

    let err = ch.get_status(bad).await.unwrap_err();
    assert!(matches!(err, TapiError::ShellCommand { status: 1, .. }));
    assert_eq!(err.errno(), errno::TE_ESHCMD);
    assert_eq!(
        ch.get_status(skipped).await.unwrap_err().errno(),
        errno::TE_ESHCMD
    );
    ch.get_status(good).await?;
    ch.get_status(follow).await?;
    assert_eq!(
        agent.state.shell.lock().unwrap().as_slice(),
        &["false", "true", "echo ran"]
    );
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_completion_counter() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;

    let a = ch.shell("true", true).await?;
    let b = ch.post(IoTask::new(IoCommand::Shell { cmd: "sync".into() }).silent()).await?;
    let c = ch.shell("true", true).await?;
    wait_all(&ch, &[a, b, c]).await;

    assert_eq!(ch.completed_count(), 2);
    assert!(ch.is_complete(a).await?);
    assert_eq!(ch.completed_count(), 1);
    assert!(ch.is_complete(b).await?);
    assert_eq!(ch.completed_count(), 0);
    assert!(ch.is_complete(c).await?);
    assert_eq!(ch.completed_count(), 0);

    assert!(ch.is_complete(TaskId(MAX_TASKS)).await.is_err());
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_slots_run_out_until_reset() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;

    let mut ids = Vec::new();
    for _ in 0..MAX_TASKS {
        ids.push(ch.shell("true", true).await?);
    }
    let err = ch.shell("true", true).await.unwrap_err();
    assert_eq!(err.errno(), errno::TE_ETOOMANY);

    wait_all(&ch, &ids).await;
    ch.reset().await?;
    assert_eq!(ch.shell("true", true).await?, TaskId(0));
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_reset_refuses_pending_tasks() -> Result<()> {
    let agent = MemAgent::default();
    let gate = agent.state.gate("sleep 1");
    let ch = channel(&agent, false).await?;

    let blocked = ch.shell("sleep 1", true).await?;
    let after = ch.shell("true", true).await?;
    let err = ch.reset().await.unwrap_err();
    assert_eq!(err.errno(), errno::EINPROGRESS);
    assert!(!ch.is_complete(blocked).await?);

    gate.add_permits(1);
    wait_all(&ch, &[blocked, after]).await;
    ch.get_status(blocked).await?;
    ch.reset().await?;
    assert_eq!(ch.shell("true", true).await?, TaskId(0));
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_mount_without_room_posts_nothing() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;

    let mut ids = Vec::new();
    for _ in 0..MAX_TASKS - 1 {
        ids.push(ch.shell("true", true).await?);
    }
    let err = ch.mount().await.unwrap_err();
    assert_eq!(err.errno(), errno::TE_ETOOMANY);

    let last = ch.shell("true", true).await?;
    assert_eq!(last, TaskId(MAX_TASKS - 1));
    ids.push(last);
    wait_all(&ch, &ids).await;
    let shell = agent.state.shell.lock().unwrap().clone();
    assert_eq!(shell.len(), MAX_TASKS);
    assert!(shell.iter().all(|c| c == "true"));
    assert!(agent.state.opened.lock().unwrap().is_empty());
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_device_stays_current_across_reset() -> Result<()> {
    let agent = MemAgent::default();
    agent.state.put(DEV, b"abcdefgh");
    let ch = channel(&agent, false).await?;

    let mount = ch.mount().await?;
    ch.wait_complete(mount).await?;
    ch.reset().await?;

    let read = ch.read(None, 4).await?;
    ch.wait_complete(read).await?;
    assert_eq!(ch.take_read_data(read).await?.as_deref(), Some(&b"abcd"[..]));
    assert_eq!(agent.state.open_fds(), 1);

    let unmount = ch.unmount().await?;
    ch.wait_complete(unmount).await?;
    let orphan = ch.read(None, 4).await?;
    let _ = tokio::time::timeout(Duration::from_secs(5), ch.wait_complete(orphan)).await;
    assert_eq!(ch.get_status(orphan).await.unwrap_err().errno(), errno::EBADF);
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_fs_mode_files() -> Result<()> {
    let agent = MemAgent::default();
    agent.state.put("/tmp/src.bin", &[7u8; 9000]);
    let ch = channel(&agent, true).await?;
    assert!(ch.uses_fs());
    let mp = ch.mount_point().to_string();
    assert_eq!(mp, format!("/tmp/te_iscsi_fs_{TA}.0"));

    let mount = ch.mount().await?;
    let open = ch
        .open_file("data.bin", OpenFlags::RDWR | OpenFlags::CREAT)
        .await?;
    let copy_in = ch.copy_in(None, "/tmp/src.bin").await?;
    let seek = ch.seek(None, 0).await?;
    let copy_out = ch.copy_out(None, "/tmp/dst.bin").await?;
    let close = ch.close(None).await?;
    let unmount = ch.unmount().await?;
    wait_all(&ch, &[mount, open, copy_in, seek, copy_out, close, unmount]).await;

    for t in [mount, open, copy_in, seek, copy_out, close, unmount] {
        ch.get_status(t).await?;
    }
    assert_eq!(
        agent.state.file(&format!("{mp}/data.bin")),
        Some(vec![7u8; 9000])
    );
    assert_eq!(agent.state.file("/tmp/dst.bin"), Some(vec![7u8; 9000]));
    assert_eq!(
        agent.state.shell.lock().unwrap().as_slice(),
        &[
            format!("blockdev --setra 0 {DEV}"),
            format!("mkdir {mp} && mount -o sync {DEV} {mp}"),
            format!("umount {mp} && rmdir {mp}"),
        ]
    );
    assert_eq!(agent.state.open_fds(), 0);

    let name = ch.temp_file_name()?;
    assert!(name.starts_with(&format!("{mp}/te_scratch_")));
    assert_ne!(name, ch.temp_file_name()?);
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_fs_helpers_need_fs_mode() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;

    assert_eq!(ch.temp_file_name().unwrap_err().errno(), errno::ENOTBLK);
    assert_eq!(
        ch.open_file("x", OpenFlags::RDONLY).await.unwrap_err().errno(),
        errno::ENOTBLK
    );
    assert_eq!(
        ch.copy_in(None, "/tmp/a").await.unwrap_err().errno(),
        errno::ENOTBLK
    );
    assert_eq!(
        ch.copy_out(None, "/tmp/a").await.unwrap_err().errno(),
        errno::ENOTBLK
    );
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_temp_name_longer_than_path_max() -> Result<()> {
    let agent = MemAgent::default();
    let ta = "A".repeat(PATH_MAX);
    let conf = conf_with_device(&ta, 2);
    let options = IoOptions {
        use_fs: true,
        ..IoOptions::default()
    };
    let ch = IoChannel::prepare(
        Arc::new(agent.clone()),
        &conf,
        &AgentSession::new(ta, 0),
        2,
        options,
    )
    .await?;

    assert_eq!(ch.temp_file_name().unwrap_err().errno(), errno::EBADF);
    ch.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_prepare_without_device() -> Result<()> {
    let agent = MemAgent::default();
    let s = session();

    let missing = MemConf::default();
    let err = IoChannel::prepare(Arc::new(agent.clone()), &missing, &s, 0, IoOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.errno(), errno::ENODEV);

    let empty = MemConf::with(&[(&leaf(&target_data(TA, 1), "host_device"), "")]);
    let err = IoChannel::prepare(Arc::new(agent.clone()), &empty, &s, 1, IoOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TapiError::NoDevice { target_id: 1 }));

    let err = IoChannel::prepare(
        Arc::new(agent.clone()),
        &conf_with_device("", 0),
        &AgentSession::new("", 0),
        0,
        IoOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.errno(), errno::TE_EWRONGPTR);
    assert!(agent.state.created.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_finish_releases_agent_resources() -> Result<()> {
    let agent = MemAgent::default();
    let ch = channel(&agent, false).await?;
    assert_eq!(ch.device(), DEV);
    assert_eq!(ch.target_id(), 0);
    assert_eq!(agent.state.live_buffers(), 1);

    ch.finish().await?;
    assert_eq!(
        agent.state.created.lock().unwrap().as_slice(),
        &[format!("{TA}/iscsi_io_0")]
    );
    assert_eq!(
        agent.state.destroyed.lock().unwrap().as_slice(),
        &["iscsi_io_0"]
    );
    assert_eq!(agent.state.live_buffers(), 0);
    Ok(())
}
