// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{
    agent::conf::{ConfTree, connection, leaf, target_data, target_oper},
    error::{TapiError, TapiResult},
    models::params::{ConnectionStatus, IscsiParam, OfferFlags, ParamScope},
};

/// Connection selector accepted by the parameter setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnSel {
    Id(u32),
    All,
}

/// Applies a setter to every connection allocated for the target.
pub const ALL_CONNECTIONS: ConnSel = ConnSel::All;

/// One connection (or all of them) of one target on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitiatorNode {
    pub ta: String,
    pub target_id: u32,
    pub conn: ConnSel,
}

impl InitiatorNode {
    pub fn new(ta: impl Into<String>, target_id: u32, conn: ConnSel) -> Self {
        Self {
            ta: ta.into(),
            target_id,
            conn,
        }
    }

    /// Same target, every connection.
    pub fn all_connections(&self) -> Self {
        Self {
            conn: ConnSel::All,
            ..self.clone()
        }
    }
}

#[derive(Debug, Default)]
struct AgentIds {
    next_target: u32,
    /// Target id → next connection id.
    conns: BTreeMap<u32, u32>,
}

/// Initiator configuration on top of the agent configuration tree.
///
/// Target and connection ids are allocated per agent, starting from zero.
#[derive(Debug)]
pub struct InitiatorConf<C: ConfTree> {
    conf: C,
    ids: DashMap<String, AgentIds>,
}

impl<C: ConfTree> InitiatorConf<C> {
    pub fn new(conf: C) -> Self {
        Self {
            conf,
            ids: DashMap::new(),
        }
    }

    pub fn conf(&self) -> &C {
        &self.conf
    }

    /// Adds `target_data:target_<id>` and writes the default target name.
    pub async fn add_target(&self, ta: &str) -> TapiResult<u32> {
        let id = {
            let mut ids = self.ids.entry(ta.to_string()).or_default();
            let id = ids.next_target;
            ids.next_target += 1;
            ids.conns.insert(id, 0);
            id
        };
        let node = target_data(ta, id);
        self.conf.cfg_add(&node, "").await?;
        if let Some(name) = IscsiParam::TargetName.default_value() {
            self.conf
                .cfg_set(&leaf(&node, IscsiParam::TargetName.cfg_name()), name)
                .await?;
        }
        info!("initiator target {id} added on {ta}");
        Ok(id)
    }

    /// Adds the next connection of `target_id` and seeds it with the
    /// protocol defaults, none of them advertised.
    pub async fn add_connection(&self, ta: &str, target_id: u32) -> TapiResult<InitiatorNode> {
        let cid = {
            let mut ids = self
                .ids
                .get_mut(ta)
                .ok_or_else(|| TapiError::NotFound(format!("no targets on {ta}")))?;
            let next = ids
                .conns
                .get_mut(&target_id)
                .ok_or_else(|| TapiError::NotFound(format!("target {target_id} on {ta}")))?;
            let cid = *next;
            *next += 1;
            cid
        };

        let node = connection(ta, target_id, cid);
        self.conf.cfg_add(&node, "").await?;
        for param in IscsiParam::ALL {
            if param.scope() != ParamScope::Connection {
                continue;
            }
            if let Some(value) = param.default_value() {
                self.conf
                    .cfg_set(&leaf(&node, param.cfg_name()), value)
                    .await?;
            }
        }
        self.conf
            .cfg_set(&leaf(&node, "parameters2advertize"), "0")
            .await?;
        debug!("connection {cid} of target {target_id} added on {ta}");
        Ok(InitiatorNode::new(ta, target_id, ConnSel::Id(cid)))
    }

    pub async fn del_target(&self, ta: &str, target_id: u32) -> TapiResult<()> {
        self.conf.cfg_del(&target_data(ta, target_id)).await?;
        if let Some(mut ids) = self.ids.get_mut(ta) {
            ids.conns.remove(&target_id);
        }
        info!("initiator target {target_id} removed from {ta}");
        Ok(())
    }

    fn connections(&self, node: &InitiatorNode) -> TapiResult<Vec<u32>> {
        match node.conn {
            ConnSel::Id(cid) => Ok(vec![cid]),
            ConnSel::All => {
                let ids = self
                    .ids
                    .get(&node.ta)
                    .ok_or_else(|| TapiError::NotFound(format!("no targets on {}", node.ta)))?;
                let next = ids.conns.get(&node.target_id).copied().ok_or_else(|| {
                    TapiError::NotFound(format!("target {} on {}", node.target_id, node.ta))
                })?;
                Ok((0..next).collect())
            },
        }
    }

    /// Writes `param` and marks it for advertisement during login.
    pub async fn set_param(
        &self,
        node: &InitiatorNode,
        param: IscsiParam,
        value: &str,
    ) -> TapiResult<()> {
        if param.scope() == ParamScope::Target {
            let path = leaf(&target_data(&node.ta, node.target_id), param.cfg_name());
            return self.conf.cfg_set(&path, value).await;
        }

        for cid in self.connections(node)? {
            let conn = connection(&node.ta, node.target_id, cid);
            self.conf
                .cfg_set(&leaf(&conn, param.cfg_name()), value)
                .await?;
            if !param.offer().is_empty() {
                self.advertize(&conn, param.offer()).await?;
            }
            debug!("{param}={value} set on connection {cid} of target {}", node.target_id);
        }
        Ok(())
    }

    async fn advertize(&self, conn: &str, bit: OfferFlags) -> TapiResult<()> {
        let path = leaf(conn, "parameters2advertize");
        let current = match self.conf.cfg_get(&path).await {
            Ok(v) => v.trim().parse::<u32>().map_err(|_| {
                TapiError::Format(format!("{path} holds {v:?}, not a bit mask"))
            })?,
            Err(TapiError::NotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let mask = OfferFlags::from_bits_truncate(current) | bit;
        self.conf.cfg_set(&path, &mask.bits().to_string()).await
    }

    /// Value of `param`; `ALL_CONNECTIONS` reads connection 0.
    pub async fn get_param(&self, node: &InitiatorNode, param: IscsiParam) -> TapiResult<String> {
        let path = match (param.scope(), node.conn) {
            (ParamScope::Target, _) => target_data(&node.ta, node.target_id),
            (ParamScope::Connection, ConnSel::Id(cid)) => {
                connection(&node.ta, node.target_id, cid)
            },
            (ParamScope::Connection, ConnSel::All) => connection(&node.ta, node.target_id, 0),
        };
        self.conf.cfg_get(&leaf(&path, param.cfg_name())).await
    }

    /// Stops advertising every parameter on the selected connections.
    pub async fn clear_advertize(&self, node: &InitiatorNode) -> TapiResult<()> {
        for cid in self.connections(node)? {
            let conn = connection(&node.ta, node.target_id, cid);
            self.conf
                .cfg_set(&leaf(&conn, "parameters2advertize"), "0")
                .await?;
        }
        Ok(())
    }

    pub async fn set_target_name(&self, ta: &str, target_id: u32, name: &str) -> TapiResult<()> {
        self.set_target_leaf(ta, target_id, IscsiParam::TargetName, name)
            .await
    }

    pub async fn set_target_addr(&self, ta: &str, target_id: u32, addr: &str) -> TapiResult<()> {
        self.set_target_leaf(ta, target_id, IscsiParam::TargetAddress, addr)
            .await
    }

    pub async fn set_target_port(&self, ta: &str, target_id: u32, port: u16) -> TapiResult<()> {
        self.set_target_leaf(ta, target_id, IscsiParam::TargetPort, &port.to_string())
            .await
    }

    async fn set_target_leaf(
        &self,
        ta: &str,
        target_id: u32,
        param: IscsiParam,
        value: &str,
    ) -> TapiResult<()> {
        self.conf
            .cfg_set(&leaf(&target_data(ta, target_id), param.cfg_name()), value)
            .await
    }

    pub async fn connection_up(&self, node: &InitiatorNode) -> TapiResult<()> {
        self.set_status(node, ConnectionStatus::Up).await
    }

    pub async fn connection_down(&self, node: &InitiatorNode) -> TapiResult<()> {
        self.set_status(node, ConnectionStatus::Down).await
    }

    async fn set_status(&self, node: &InitiatorNode, status: ConnectionStatus) -> TapiResult<()> {
        for cid in self.connections(node)? {
            let conn = connection(&node.ta, node.target_id, cid);
            self.conf
                .cfg_set(&leaf(&conn, "status"), &(status as i32).to_string())
                .await?;
            info!(
                "connection {cid} of target {} on {} -> {status:?}",
                node.target_id, node.ta
            );
        }
        Ok(())
    }

    pub async fn connection_status(
        &self,
        ta: &str,
        target_id: u32,
        cid: u32,
    ) -> TapiResult<ConnectionStatus> {
        let path = leaf(&connection(ta, target_id, cid), "status");
        let raw = self.conf.cfg_get(&path).await?;
        raw.trim()
            .parse::<i32>()
            .ok()
            .and_then(ConnectionStatus::from_i32)
            .ok_or_else(|| TapiError::Format(format!("{path} holds {raw:?}")))
    }

    /// SCSI device the initiator exposes for the target; empty until the
    /// session is up.
    pub async fn device_name(&self, ta: &str, target_id: u32) -> TapiResult<String> {
        self.conf
            .cfg_get(&leaf(&target_data(ta, target_id), "host_device"))
            .await
    }

    /// Sets an operational parameter of the target on `ta`.
    pub async fn set_target_param(
        &self,
        ta: &str,
        param: IscsiParam,
        value: &str,
    ) -> TapiResult<()> {
        let path = leaf(&target_oper(ta), param.cfg_name());
        self.conf.cfg_set(&path, value).await?;
        debug!("target on {ta}: {param}={value}");
        Ok(())
    }
}
