// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Layered CSAP specs.
//!
//! A spec is `{ layers { <layer>:{ ... }, ... } }`. Layers are kept in the
//! order they were added, lowest first, so a socket layer is added before the
//! iSCSI layer that rides on it. [`stack_id`] gives the `top.….lowest`
//! identifier the transport wants alongside the spec.

use core::{fmt, str::FromStr};

use tracing::debug;

use crate::{
    asn::AsnValue,
    cfg::enums::Digest,
    error::{TapiError, TapiResult},
    models::atm::AtmType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Socket,
    Iscsi,
    Atm,
    Aal5,
    Tcp,
}

impl LayerType {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerType::Socket => "socket",
            LayerType::Iscsi => "iscsi",
            LayerType::Atm => "atm",
            LayerType::Aal5 => "aal5",
            LayerType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerType {
    type Err = TapiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "socket" => LayerType::Socket,
            "iscsi" => LayerType::Iscsi,
            "atm" => LayerType::Atm,
            "aal5" => LayerType::Aal5,
            "tcp" => LayerType::Tcp,
            other => {
                return Err(TapiError::InvalidArgument(format!(
                    "unknown CSAP layer type {other:?}"
                )));
            },
        })
    }
}

/// Appends a generic-layer element selecting `choice_tag` and returns the
/// (empty) inner layer. `spec` is initialised to an empty CSAP spec on first
/// use.
pub fn add_layer<'a>(
    spec: Option<&'a mut Option<AsnValue>>,
    layer_type: &str,
    choice_tag: &str,
) -> TapiResult<&'a mut AsnValue> {
    let spec = spec.ok_or_else(|| {
        TapiError::InvalidArgument("no location to store the CSAP spec".into())
    })?;
    let layer_type: LayerType = layer_type.parse()?;
    let tag = choice_tag.strip_prefix('#').unwrap_or(choice_tag);
    if tag.is_empty() {
        return Err(TapiError::InvalidArgument("empty layer choice tag".into()));
    }

    let spec = spec.get_or_insert_with(AsnValue::empty_sequence);
    let idx = spec.insert_indexed(
        "layers",
        None,
        AsnValue::choice(tag, AsnValue::empty_sequence()),
    )?;
    debug!(%layer_type, tag, idx, "CSAP layer added");
    spec.get_or_create(&format!("layers.{idx}.#{tag}"))
}

fn add_typed_layer(spec: &mut Option<AsnValue>, t: LayerType) -> TapiResult<&mut AsnValue> {
    add_layer(Some(spec), t.as_str(), t.as_str())
}

/// Socket layer over an already open descriptor on the agent.
pub fn add_socket_fd_layer(spec: &mut Option<AsnValue>, fd: i32) -> TapiResult<()> {
    let layer = add_typed_layer(spec, LayerType::Socket)?;
    layer.write_int("type.#file-descr", fd.into())
}

/// Listening TCP CSAP (`data.#server`); accepted connections are taken
/// with `Transport::tcp_accept`.
pub fn add_tcp_server_layer(
    spec: &mut Option<AsnValue>,
    addr: &str,
    port: u16,
) -> TapiResult<()> {
    let layer = add_typed_layer(spec, LayerType::Tcp)?;
    layer.write_int("local-port.#plain", port.into())?;
    layer.write_string("local-addr.#plain", addr)?;
    layer.write_null("data.#server")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AtmLayer {
    pub kind: AtmType,
    pub vpi: Option<u16>,
    pub vci: Option<u16>,
    pub congestion: Option<bool>,
    pub clp: Option<bool>,
    pub gfc: Option<u8>,
}

pub fn add_atm_layer(spec: &mut Option<AsnValue>, atm: &AtmLayer) -> TapiResult<()> {
    let layer = add_typed_layer(spec, LayerType::Atm)?;
    layer.write_enum("type", atm.kind.asn_label())?;
    if let Some(v) = atm.vpi {
        layer.write_int("vpi.#plain", v.into())?;
    }
    if let Some(v) = atm.vci {
        layer.write_int("vci.#plain", v.into())?;
    }
    if let Some(v) = atm.congestion {
        layer.write_int("congestion.#plain", v.into())?;
    }
    if let Some(v) = atm.clp {
        layer.write_int("clp.#plain", v.into())?;
    }
    if let Some(v) = atm.gfc {
        layer.write_int("gfc.#plain", v.into())?;
    }
    Ok(())
}

pub fn add_aal5_layer(
    spec: &mut Option<AsnValue>,
    cpcs_uu: Option<u8>,
    cpi: Option<u8>,
) -> TapiResult<()> {
    let layer = add_typed_layer(spec, LayerType::Aal5)?;
    if let Some(v) = cpcs_uu {
        layer.write_int("cpcs-uu.#plain", v.into())?;
    }
    if let Some(v) = cpi {
        layer.write_int("cpi.#plain", v.into())?;
    }
    Ok(())
}

pub fn add_iscsi_layer(
    spec: &mut Option<AsnValue>,
    socket: i32,
    header_digest: Digest,
    data_digest: Digest,
) -> TapiResult<()> {
    let layer = add_typed_layer(spec, LayerType::Iscsi)?;
    layer.write_int("socket", socket.into())?;
    layer.write_enum("header-digest", header_digest.asn_label())?;
    layer.write_enum("data-digest", data_digest.asn_label())
}

/// Finds the iSCSI layer of a spec.
pub fn iscsi_layer_mut(spec: &mut AsnValue) -> Option<&mut AsnValue> {
    let n = spec.length("layers")?;
    let idx = (0..n).find(|i| spec.choice_label(&format!("layers.{i}")) == Some("iscsi"))?;
    spec.get_mut(&format!("layers.{idx}.#iscsi"))
}

/// `top.….lowest`, e.g. `iscsi.socket` or `aal5.atm.socket`.
pub fn stack_id(spec: &AsnValue) -> TapiResult<String> {
    let layers = spec
        .get("layers")
        .and_then(AsnValue::as_sequence_of)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| TapiError::InvalidArgument("CSAP spec has no layers".into()))?;
    let names = layers
        .iter()
        .rev()
        .map(|l| match l {
            AsnValue::Choice(label, _) => Ok(label.as_str()),
            other => Err(TapiError::Asn(format!(
                "layer is {}, expected CHOICE",
                other.type_name()
            ))),
        })
        .collect::<TapiResult<Vec<_>>>()?;
    Ok(names.join("."))
}
