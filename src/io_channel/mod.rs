//! Initiator-side I/O task queue driven by a worker on the tokio runtime.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    agent::{
        AgentSession,
        conf::{ConfTree, leaf, target_data},
        rpc::{AgentRpc, OpenFlags, RpcServer},
    },
    cfg::config::{Config, SCRATCH_ALIGN},
    error::{TapiError, TapiResult},
    utils::random_token,
};

pub(crate) mod commands;
/// Tasks, commands and the fixed slot table.
pub mod task;
pub(crate) mod worker;

use commands::Executor;
pub use task::{IoCommand, IoTask, MAX_TASKS, TaskId};
use task::TaskTable;
use worker::Shared;

/// Longest path the agent accepts.
pub const PATH_MAX: usize = 4096;

/// Per-channel knobs, usually taken from the `io` section of [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOptions {
    pub chunk_size: usize,
    pub notify_completion: bool,
    pub use_fs: bool,
    /// Prefix of the dedicated RPC server name; the target id is appended.
    pub server_name: String,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            notify_completion: true,
            use_fs: false,
            server_name: "iscsi_io".into(),
        }
    }
}

impl From<&Config> for IoOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            chunk_size: cfg.io.chunk_size,
            notify_completion: cfg.io.notify_completion.as_bool(),
            use_fs: cfg.io.use_fs.as_bool(),
            server_name: cfg.agent.rpc_server_name.clone(),
        }
    }
}

/// I/O channel bound to the block device an initiator exposes for one
/// target.
///
/// Tasks are posted into one of [`MAX_TASKS`] slots and executed in slot
/// order by a dedicated worker. A failed task poisons every later
/// non-leader task up to the next leader.
#[derive(Debug)]
pub struct IoChannel {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<TapiResult<()>>>,
    ta: String,
    target_id: u32,
    device: String,
    mount_point: String,
    use_fs: bool,
}

impl IoChannel {
    /// Looks up the device of `target_id`, creates the RPC server and its
    /// scratch buffer, then starts the worker.
    pub async fn prepare<A, C>(
        agent: Arc<A>,
        conf: &C,
        session: &AgentSession,
        target_id: u32,
        options: IoOptions,
    ) -> TapiResult<Self>
    where
        A: AgentRpc + 'static,
        C: ConfTree,
    {
        session.validate()?;
        let ta = session.ta.clone();

        let device = match conf
            .cfg_get(&leaf(&target_data(&ta, target_id), "host_device"))
            .await
        {
            Ok(dev) if !dev.is_empty() => dev,
            Ok(_) | Err(TapiError::NotFound(_)) => {
                return Err(TapiError::NoDevice { target_id });
            },
            Err(e) => return Err(e),
        };
        let mount_point = format!("/tmp/te_iscsi_fs_{ta}.{target_id}");

        let server_name = format!("{}_{target_id}", options.server_name);
        let server = agent.create_server(&ta, &server_name).await?;
        let scratch_len = options.chunk_size.div_ceil(SCRATCH_ALIGN) * SCRATCH_ALIGN;
        let scratch = match server.memalign(SCRATCH_ALIGN, scratch_len).await {
            Ok(ptr) if !ptr.is_null() => ptr,
            other => {
                let err = other.err().unwrap_or_else(|| {
                    TapiError::NoMemory(format!("memalign({scratch_len}) on {ta}"))
                });
                if let Err(e) = agent.destroy_server(server).await {
                    warn!("destroying RPC server {server_name} failed: {e}");
                }
                return Err(err);
            },
        };

        let exec = Executor {
            server,
            scratch,
            scratch_len,
            chunk_size: scratch_len,
            current_fd: None,
        };
        let shared = Arc::new(Shared::new(options.notify_completion));
        let cancel = CancellationToken::new();
        let span = info_span!("io_channel", ta = %ta, target = target_id);
        let worker = tokio::spawn(
            worker::run(agent, exec, Arc::clone(&shared), cancel.clone()).instrument(span),
        );

        info!(
            "I/O channel for target {target_id} on {ta} prepared: device {device}, \
             server {server_name}, fs={}",
            options.use_fs
        );
        Ok(Self {
            shared,
            cancel,
            worker: Some(worker),
            ta,
            target_id,
            device,
            mount_point,
            use_fs: options.use_fs,
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }

    pub fn uses_fs(&self) -> bool {
        self.use_fs
    }

    pub fn target_id(&self) -> u32 {
        self.target_id
    }

    /// Queues a task into the next free slot and wakes the worker.
    pub async fn post(&self, task: IoTask) -> TapiResult<TaskId> {
        let id = {
            let mut table = self.shared.table.lock().await;
            table.post(task)?
        };
        self.shared.posted.add_permits(1);
        Ok(id)
    }

    /// Queues `tasks` into consecutive slots. Nothing is posted unless all
    /// of them fit.
    async fn post_batch(&self, tasks: Vec<IoTask>) -> TapiResult<Vec<TaskId>> {
        let ids = {
            let mut table = self.shared.table.lock().await;
            table.post_batch(tasks)?
        };
        self.shared.posted.add_permits(ids.len());
        Ok(ids)
    }

    pub async fn open(&self, path: &str, flags: OpenFlags, leader: bool) -> TapiResult<TaskId> {
        let mut task = IoTask::new(IoCommand::Open {
            path: path.to_string(),
            flags,
        });
        task.leader = leader;
        self.post(task).await
    }

    pub async fn close(&self, fd: Option<i32>) -> TapiResult<TaskId> {
        self.post(with_fd(IoTask::new(IoCommand::Close), fd)).await
    }

    pub async fn seek(&self, fd: Option<i32>, offset: u64) -> TapiResult<TaskId> {
        self.post(with_fd(IoTask::new(IoCommand::Seek { offset }), fd))
            .await
    }

    pub async fn read(&self, fd: Option<i32>, length: usize) -> TapiResult<TaskId> {
        self.post(with_fd(IoTask::new(IoCommand::Read { length }), fd))
            .await
    }

    pub async fn write(&self, fd: Option<i32>, data: Vec<u8>) -> TapiResult<TaskId> {
        self.post(with_fd(IoTask::new(IoCommand::Write { data }), fd))
            .await
    }

    pub async fn shell(&self, cmd: impl Into<String>, leader: bool) -> TapiResult<TaskId> {
        let mut task = IoTask::new(IoCommand::Shell { cmd: cmd.into() });
        task.leader = leader;
        self.post(task).await
    }

    fn require_fs(&self) -> TapiResult<()> {
        if self.use_fs {
            Ok(())
        } else {
            Err(TapiError::NotBlock)
        }
    }

    /// Opens `name` below the mount point; the descriptor becomes current.
    pub async fn open_file(&self, name: &str, flags: OpenFlags) -> TapiResult<TaskId> {
        self.require_fs()?;
        let path = format!("{}/{name}", self.mount_point);
        self.post(
            IoTask::new(IoCommand::Open { path, flags })
                .leader()
                .spread_fd(),
        )
        .await
    }

    pub async fn copy_in(&self, fd: Option<i32>, source: &str) -> TapiResult<TaskId> {
        self.require_fs()?;
        let task = IoTask::new(IoCommand::CopyIn {
            source: source.to_string(),
        });
        self.post(with_fd(task, fd)).await
    }

    pub async fn copy_out(&self, fd: Option<i32>, dest: &str) -> TapiResult<TaskId> {
        self.require_fs()?;
        let task = IoTask::new(IoCommand::CopyOut {
            dest: dest.to_string(),
        });
        self.post(with_fd(task, fd)).await
    }

    /// Fresh file name under the mount point.
    pub fn temp_file_name(&self) -> TapiResult<String> {
        self.require_fs()?;
        let name = format!("{}/te_scratch_{}", self.mount_point, random_token());
        if name.len() >= PATH_MAX {
            return Err(TapiError::BadFile(format!(
                "temporary name of {} bytes exceeds PATH_MAX",
                name.len()
            )));
        }
        Ok(name)
    }

    /// Disables read-ahead on the device, then mounts it (filesystem mode) or
    /// opens it and makes the descriptor current for later tasks (raw mode).
    /// Returns the id of the mount task.
    pub async fn mount(&self) -> TapiResult<TaskId> {
        let readahead = IoTask::new(IoCommand::Shell {
            cmd: format!("blockdev --setra 0 {}", self.device),
        })
        .leader()
        .silent();

        let mount = if self.use_fs {
            IoTask::new(IoCommand::Shell {
                cmd: format!(
                    "mkdir {mp} && mount -o sync {dev} {mp}",
                    mp = self.mount_point,
                    dev = self.device
                ),
            })
            .leader()
        } else {
            IoTask::new(IoCommand::Open {
                path: self.device.clone(),
                flags: OpenFlags::RDWR | OpenFlags::SYNC,
            })
            .leader()
            .spread_fd()
        };
        let ids = self.post_batch(vec![readahead, mount]).await?;
        let id = ids
            .last()
            .copied()
            .ok_or_else(|| TapiError::Failed("mount posted no tasks".into()))?;
        debug!("mount of {} posted as {id}", self.device);
        Ok(id)
    }

    pub async fn unmount(&self) -> TapiResult<TaskId> {
        let task = if self.use_fs {
            IoTask::new(IoCommand::Shell {
                cmd: format!("umount {mp} && rmdir {mp}", mp = self.mount_point),
            })
            .leader()
        } else {
            IoTask::new(IoCommand::Close).leader()
        };
        self.post(task).await
    }

    /// Completion flag of `task`. Each call also consumes one pending
    /// completion notification, if any.
    pub async fn is_complete(&self, task: TaskId) -> TapiResult<bool> {
        let idx = task.check()?;
        let done = self.shared.table.lock().await.slots[idx].is_complete;
        let _ = self
            .shared
            .completed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(done)
    }

    /// Status of `task`; `EINPROGRESS` until it completes.
    pub async fn get_status(&self, task: TaskId) -> TapiResult<()> {
        let idx = task.check()?;
        let table = self.shared.table.lock().await;
        let slot = &table.slots[idx];
        if slot.is_complete {
            slot.status.clone()
        } else {
            Err(TapiError::InProgress)
        }
    }

    /// Waits until `task` completes and returns its status.
    pub async fn wait_complete(&self, task: TaskId) -> TapiResult<()> {
        let idx = task.check()?;
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let table = self.shared.table.lock().await;
                let slot = &table.slots[idx];
                if slot.is_complete {
                    return slot.status.clone();
                }
            }
            notified.await;
        }
    }

    /// Bytes produced by a completed read task.
    pub async fn take_read_data(&self, task: TaskId) -> TapiResult<Option<Vec<u8>>> {
        let idx = task.check()?;
        let mut table = self.shared.table.lock().await;
        let slot = &mut table.slots[idx];
        if !slot.is_complete {
            return Err(TapiError::InProgress);
        }
        Ok(slot.data.take())
    }

    /// Completion notifications not yet consumed by [`IoChannel::is_complete`].
    pub fn completed_count(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Drops every slot's data and returns the table to its prepared state.
    ///
    /// The current descriptor is kept: a device opened by [`IoChannel::mount`]
    /// stays open and current until [`IoChannel::unmount`] closes it.
    pub async fn reset(&self) -> TapiResult<()> {
        let mut table = self.shared.table.lock().await;
        if !table.all_complete() {
            return Err(TapiError::InProgress);
        }
        *table = TaskTable::new();
        debug!("I/O channel of target {} on {} reset", self.target_id, self.ta);
        Ok(())
    }

    /// Stops the worker; its cleanup frees the scratch buffer and destroys
    /// the RPC server.
    pub async fn finish(mut self) -> TapiResult<()> {
        self.cancel.cancel();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.await {
            Ok(r) => r,
            Err(e) => Err(TapiError::Failed(format!("I/O worker aborted: {e}"))),
        }
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn with_fd(task: IoTask, fd: Option<i32>) -> IoTask {
    match fd {
        Some(fd) => task.with_fd(fd),
        None => task,
    }
}
