//! iSCSI CSAPs: building layered specs, sending and receiving PDUs, and
//! forwarding traffic between two CSAPs.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Bidirectional forwarding until both sides fall silent.
pub mod exchange;
/// iSCSI CSAP constructors and PDU send / receive.
pub mod iscsi;
/// Layered CSAP spec builder.
pub mod spec;
