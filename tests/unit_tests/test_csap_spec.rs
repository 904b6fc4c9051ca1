// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use iscsi_tapi::{
    cfg::enums::Digest,
    csap::spec::{
        AtmLayer, LayerType, add_aal5_layer, add_atm_layer, add_iscsi_layer, add_layer,
        add_socket_fd_layer, add_tcp_server_layer, iscsi_layer_mut, stack_id,
    },
    error::errno,
    models::atm::AtmType,
};

#[test]
fn test_aal5_over_atm_over_socket() -> Result<()> {
    let mut spec = None;
    add_socket_fd_layer(&mut spec, 7)?;
    add_atm_layer(
        &mut spec,
        &AtmLayer {
            kind: AtmType::Nni,
            vpi: Some(0),
            vci: Some(5),
            clp: Some(false),
            ..Default::default()
        },
    )?;
    add_aal5_layer(&mut spec, Some(1), None)?;

    let spec = spec.expect("spec initialised");
    assert_eq!(stack_id(&spec)?, "aal5.atm.socket");
    assert_eq!(spec.length("layers"), Some(3));

    assert_eq!(spec.read_int("layers.0.#socket.type.#file-descr")?, 7);
    assert_eq!(spec.read_string("layers.1.#atm.type")?, "NNI");
    assert_eq!(spec.read_int("layers.1.#atm.vci.#plain")?, 5);
    assert_eq!(spec.read_int("layers.1.#atm.clp.#plain")?, 0);
    assert!(spec.get("layers.1.#atm.congestion").is_none());
    assert!(spec.get("layers.1.#atm.gfc").is_none());
    assert_eq!(spec.read_int("layers.2.#aal5.cpcs-uu.#plain")?, 1);
    assert!(spec.get("layers.2.#aal5.cpi").is_none());
    Ok(())
}

#[test]
fn test_iscsi_layer_holds_digests() -> Result<()> {
    let mut spec = None;
    add_socket_fd_layer(&mut spec, 12)?;
    add_iscsi_layer(&mut spec, 12, Digest::CRC32C, Digest::None)?;

    let mut spec = spec.expect("spec initialised");
    assert_eq!(stack_id(&spec)?, "iscsi.socket");

    let iscsi = iscsi_layer_mut(&mut spec).expect("iscsi layer");
    assert_eq!(iscsi.read_int("socket")?, 12);
    assert_eq!(iscsi.read_string("header-digest")?, "crc32c");
    assert_eq!(iscsi.read_string("data-digest")?, "none");

    iscsi.write_enum("data-digest", Digest::CRC32C.asn_label())?;
    assert_eq!(spec.read_string("layers.1.#iscsi.data-digest")?, "crc32c");
    Ok(())
}

#[test]
fn test_tcp_server_layer() -> Result<()> {
    let mut spec = None;
    add_tcp_server_layer(&mut spec, "127.0.0.1", 3260)?;

    let mut spec = spec.expect("spec initialised");
    assert_eq!(stack_id(&spec)?, "tcp");
    assert_eq!(spec.choice_label("layers.0"), Some("tcp"));
    assert_eq!(spec.choice_label("layers.0.#tcp.data"), Some("server"));
    assert_eq!(spec.read_string("layers.0.#tcp.local-addr.#plain")?, "127.0.0.1");
    assert_eq!(spec.read_int("layers.0.#tcp.local-port.#plain")?, 3260);
    assert!(iscsi_layer_mut(&mut spec).is_none());
    Ok(())
}

#[test]
fn test_add_layer_errors() -> Result<()> {
    let mut spec = None;
    let err = add_layer(Some(&mut spec), "ppp", "#ppp").unwrap_err();
    assert_eq!(err.errno(), errno::EINVAL);
    let err = add_layer(None, "iscsi", "#iscsi").unwrap_err();
    assert_eq!(err.errno(), errno::EINVAL);
    assert!(spec.is_none());

    let layer = add_layer(Some(&mut spec), "iscsi", "#iscsi")?;
    layer.write_int("socket", 1)?;
    assert_eq!(stack_id(spec.as_ref().expect("spec"))?, "iscsi");

    assert_eq!("aal5".parse::<LayerType>()?, LayerType::Aal5);
    assert_eq!("tcp".parse::<LayerType>()?.to_string(), "tcp");
    assert!("".parse::<LayerType>().is_err());
    Ok(())
}
