// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::rpc::{AgentRpc, RpcServer},
    error::{TapiError, TapiResult},
    io_channel::{
        commands::{Executed, Executor},
        task::TaskTable,
    },
};

/// State shared between the channel handle and its worker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub table: Mutex<TaskTable>,
    /// One permit per posted task.
    pub posted: Semaphore,
    /// Finished tasks not yet consumed by `is_complete`.
    pub completed: AtomicUsize,
    pub done: Notify,
    pub notify_completion: bool,
}

impl Shared {
    pub fn new(notify_completion: bool) -> Self {
        Self {
            table: Mutex::new(TaskTable::new()),
            posted: Semaphore::new(0),
            completed: AtomicUsize::new(0),
            done: Notify::new(),
            notify_completion,
        }
    }
}

/// Runs posted tasks in slot order until cancelled, then frees the scratch
/// buffer and destroys the RPC server.
pub(crate) async fn run<A: AgentRpc>(
    agent: Arc<A>,
    mut exec: Executor<A::Server>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> TapiResult<()> {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            p = shared.posted.acquire() => p,
        };
        match permit {
            Ok(p) => p.forget(),
            Err(_) => break,
        }

        let (idx, command, fd, leader, spread_fd, inherited) = {
            let mut table = shared.table.lock().await;
            let Some((idx, command)) = table.take_next() else {
                continue;
            };
            let slot = &table.slots[idx];
            let (fd, leader, spread_fd) = (slot.fd, slot.leader, slot.spread_fd);
            (idx, command, fd, leader, spread_fd, table.chain.clone())
        };

        let name = command.name();
        let outcome = if leader || inherited.is_ok() {
            debug!("task#{idx}: {command:?}");
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("task#{idx} ({name}) interrupted by channel shutdown");
                    break;
                }
                r = exec.execute(command, fd) => r,
            }
        } else {
            debug!("task#{idx}: {name} skipped after chain failure");
            inherited.map(|()| Default::default())
        };

        if let (true, Ok(Executed { fd: Some(fd), .. })) = (spread_fd, &outcome) {
            exec.current_fd = Some(*fd);
        }

        let status = outcome.as_ref().map(|_| ()).map_err(TapiError::clone);
        if let Err(e) = &status {
            debug!("task#{idx} ({name}) failed: {e}");
        }
        {
            let mut table = shared.table.lock().await;
            table.chain = status.clone();
            let slot = &mut table.slots[idx];
            if let Ok(done) = outcome {
                slot.fd = done.fd.or(slot.fd);
                slot.data = done.data;
            }
            slot.status = status;
            slot.is_complete = true;
            // Counted before the slot becomes visible as complete.
            if shared.notify_completion && slot.notify {
                shared.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
        shared.done.notify_waiters();
    }

    let server = exec.release().await;
    let name = server.name().to_string();
    let r = agent.destroy_server(server).await;
    match &r {
        Ok(()) => info!("I/O worker stopped, RPC server {name} destroyed"),
        Err(e) => warn!("destroying RPC server {name} failed: {e}"),
    }
    r
}
