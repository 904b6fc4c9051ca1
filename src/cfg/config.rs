// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentSession, transport::RecvTimeout},
    cfg::enums::{Digest, TimeoutSetting, YesNo},
};

/// Block size the remote scratch buffer is aligned to.
pub const SCRATCH_ALIGN: usize = 512;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Which Test Agent the scenario drives and how to reach it.
    pub agent: AgentConfig,
    /// Defaults for iSCSI CSAPs and PDU exchange.
    pub csap: CsapConfig,
    /// Initiator I/O channel settings.
    pub io: IoConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AgentConfig {
    #[serde(rename = "Name")]
    /// Test Agent name, e.g. `Agt_A`.
    pub name: String,
    #[serde(rename = "Session", default)]
    /// RCF session id used for CSAP operations.
    pub session: u32,
    #[serde(rename = "RpcServerName", default = "default_rpc_server_name")]
    /// Name prefix of the dedicated RPC server an I/O channel creates.
    pub rpc_server_name: String,
}

fn default_rpc_server_name() -> String {
    "iscsi_io".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CsapConfig {
    #[serde(rename = "HeaderDigest", default)]
    pub header_digest: Digest,
    #[serde(rename = "DataDigest", default)]
    pub data_digest: Digest,
    #[serde(rename = "RecvTimeoutMs")]
    /// Per-PDU receive timeout (`INF` waits forever).
    pub recv_timeout: TimeoutSetting,
    #[serde(rename = "ExchangeQuietMs", with = "serde_millis")]
    /// Quiet period after which the forwarder considers both sides silent.
    pub exchange_quiet: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IoConfig {
    #[serde(rename = "ChunkSize")]
    /// Size of the remote scratch buffer used for device-direct I/O.
    pub chunk_size: usize,
    #[serde(rename = "NotifyCompletion", default = "yes")]
    /// Count finished tasks for `IoChannel::is_complete`.
    pub notify_completion: YesNo,
    #[serde(rename = "UseFs", default = "no")]
    /// Mount the device and work with files instead of the raw device.
    pub use_fs: YesNo,
}

fn yes() -> YesNo {
    YesNo::Yes
}

fn no() -> YesNo {
    YesNo::No
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        Self::from_yaml(&s)
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        let mut cfg: Config =
            serde_yaml::from_str(s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.agent.name.is_empty(), "agent Name must not be empty");
        ensure!(
            !self.agent.rpc_server_name.is_empty(),
            "RpcServerName must not be empty"
        );
        ensure!(self.io.chunk_size > 0, "ChunkSize must be > 0");

        // Direct I/O needs whole blocks.
        let rem = self.io.chunk_size % SCRATCH_ALIGN;
        if rem != 0 {
            self.io.chunk_size += SCRATCH_ALIGN - rem;
        }

        ensure!(
            !self.csap.exchange_quiet.is_zero(),
            "ExchangeQuietMs must be > 0"
        );
        Ok(())
    }

    pub fn session(&self) -> AgentSession {
        AgentSession::new(self.agent.name.clone(), self.agent.session)
    }

    pub fn recv_timeout(&self) -> RecvTimeout {
        match self.csap.recv_timeout {
            TimeoutSetting::Ms(ms) => RecvTimeout::Ms(ms),
            TimeoutSetting::Keyword(_) => RecvTimeout::Infinite,
        }
    }
}

/// Turns a path relative to the current directory into a canonical one.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
