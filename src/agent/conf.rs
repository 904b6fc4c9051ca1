// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use crate::error::TapiResult;

/// Client of the agent configuration tree. Instance paths end with `:`
/// after the last node name, e.g. `/agent:Agt_A/iscsi_target:/oper:/max_burst_length:`.
pub trait ConfTree: Send + Sync {
    fn cfg_set(&self, path: &str, value: &str) -> impl Future<Output = TapiResult<()>> + Send;

    /// Missing instance → `TapiError::NotFound`.
    fn cfg_get(&self, path: &str) -> impl Future<Output = TapiResult<String>> + Send;

    fn cfg_add(&self, path: &str, value: &str) -> impl Future<Output = TapiResult<()>> + Send;

    /// Removes the instance together with everything below it.
    fn cfg_del(&self, path: &str) -> impl Future<Output = TapiResult<()>> + Send;
}

pub fn initiator_root(ta: &str) -> String {
    format!("/agent:{ta}/iscsi_initiator:")
}

pub fn target_data(ta: &str, target_id: u32) -> String {
    format!("{}/target_data:target_{target_id}", initiator_root(ta))
}

pub fn connection(ta: &str, target_id: u32, cid: u32) -> String {
    format!("{}/conn:{cid}", target_data(ta, target_id))
}

pub fn target_oper(ta: &str) -> String {
    format!("/agent:{ta}/iscsi_target:/oper:")
}

pub fn backing_store_mp(ta: &str) -> String {
    format!("/agent:{ta}/iscsi_target:/backing_store_mp:")
}

/// `<node>/<leaf>:`
pub fn leaf(node: &str, name: &str) -> String {
    format!("{node}/{name}:")
}
