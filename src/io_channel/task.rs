// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use crate::{
    agent::rpc::OpenFlags,
    error::{TapiError, TapiResult},
};

/// Number of task slots of one channel.
pub const MAX_TASKS: usize = 16;

/// Index of a task slot, `0..MAX_TASKS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    pub(crate) fn check(self) -> TapiResult<usize> {
        if self.0 < MAX_TASKS {
            Ok(self.0)
        } else {
            Err(TapiError::InvalidArgument(format!(
                "task id {} outside 0..{MAX_TASKS}",
                self.0
            )))
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Operation executed on the agent by the channel worker.
#[derive(Clone, PartialEq, Eq)]
pub enum IoCommand {
    /// `open(path, flags | O_DIRECT | O_SYNC, 0644)`; yields a descriptor.
    Open { path: String, flags: OpenFlags },
    Close,
    /// Absolute seek.
    Seek { offset: u64 },
    /// Reads exactly `length` bytes; short reads fail with `EFAIL`.
    Read { length: usize },
    /// Writes all of `data`; short writes fail with `ENOSPC`.
    Write { data: Vec<u8> },
    /// Streams the agent file `source` into the descriptor until EOF.
    CopyIn { source: String },
    /// Streams the descriptor into the agent file `dest` until EOF.
    CopyOut { dest: String },
    /// Runs a shell command; a non-zero exit status fails with `ESHCMD`.
    Shell { cmd: String },
}

impl IoCommand {
    pub fn name(&self) -> &'static str {
        match self {
            IoCommand::Open { .. } => "open",
            IoCommand::Close => "close",
            IoCommand::Seek { .. } => "seek",
            IoCommand::Read { .. } => "read",
            IoCommand::Write { .. } => "write",
            IoCommand::CopyIn { .. } => "copy-in",
            IoCommand::CopyOut { .. } => "copy-out",
            IoCommand::Shell { .. } => "shell",
        }
    }
}

impl fmt::Debug for IoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCommand::Open { path, flags } => write!(f, "open({path}, {flags:?})"),
            IoCommand::Close => f.write_str("close"),
            IoCommand::Seek { offset } => write!(f, "seek({offset})"),
            IoCommand::Read { length } => write!(f, "read({length})"),
            IoCommand::Write { data } => write!(f, "write({} bytes)", data.len()),
            IoCommand::CopyIn { source } => write!(f, "copy-in({source})"),
            IoCommand::CopyOut { dest } => write!(f, "copy-out({dest})"),
            IoCommand::Shell { cmd } => write!(f, "shell({cmd:?})"),
        }
    }
}

/// A command plus its chaining options, ready to be posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoTask {
    pub command: IoCommand,
    /// Descriptor to use; `None` takes the channel's current one.
    pub fd: Option<i32>,
    /// Starts an independent chain, runs even after earlier failures.
    pub leader: bool,
    /// On success the descriptor this task yields becomes the channel's
    /// current one.
    pub spread_fd: bool,
    /// Counts towards the completion counter when it finishes.
    pub notify: bool,
}

impl IoTask {
    pub fn new(command: IoCommand) -> Self {
        Self {
            command,
            fd: None,
            leader: false,
            spread_fd: false,
            notify: true,
        }
    }

    pub fn leader(mut self) -> Self {
        self.leader = true;
        self
    }

    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = Some(fd);
        self
    }

    pub fn spread_fd(mut self) -> Self {
        self.spread_fd = true;
        self
    }

    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }
}

/// One of the `MAX_TASKS` slots.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub command: Option<IoCommand>,
    pub fd: Option<i32>,
    pub leader: bool,
    pub spread_fd: bool,
    pub notify: bool,
    pub is_complete: bool,
    pub status: TapiResult<()>,
    /// Bytes produced by a read, released on reset or finish.
    pub data: Option<Vec<u8>>,
}

impl Default for Slot {
    /// Complete, with no command.
    fn default() -> Self {
        Self {
            command: None,
            fd: None,
            leader: false,
            spread_fd: false,
            notify: false,
            is_complete: true,
            status: Ok(()),
            data: None,
        }
    }
}

/// Slot array plus the bookkeeping that must change together with it.
#[derive(Debug)]
pub(crate) struct TaskTable {
    pub slots: Vec<Slot>,
    /// Next slot a post will use.
    pub next: usize,
    /// Status inherited by non-leader tasks.
    pub chain: TapiResult<()>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); MAX_TASKS],
            next: 0,
            chain: Ok(()),
        }
    }

    pub fn post(&mut self, task: IoTask) -> TapiResult<TaskId> {
        if self.next >= MAX_TASKS {
            return Err(TapiError::TooMany(MAX_TASKS));
        }
        let id = self.next;
        self.slots[id] = Slot {
            command: Some(task.command),
            fd: task.fd,
            leader: task.leader,
            spread_fd: task.spread_fd,
            notify: task.notify,
            is_complete: false,
            status: Ok(()),
            data: None,
        };
        self.next += 1;
        Ok(TaskId(id))
    }

    /// Posts all of `tasks` into consecutive slots, or none of them.
    pub fn post_batch(&mut self, tasks: Vec<IoTask>) -> TapiResult<Vec<TaskId>> {
        if self.next + tasks.len() > MAX_TASKS {
            return Err(TapiError::TooMany(MAX_TASKS));
        }
        tasks.into_iter().map(|t| self.post(t)).collect()
    }

    /// First slot that still holds an untaken command.
    pub fn take_next(&mut self) -> Option<(usize, IoCommand)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find_map(|(i, s)| s.command.take().map(|c| (i, c)))
    }

    pub fn all_complete(&self) -> bool {
        self.slots.iter().all(|s| s.is_complete)
    }
}
