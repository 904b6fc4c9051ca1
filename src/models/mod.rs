//! This module defines the data carried inside iSCSI and ATM PDUs.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// ATM cell headers and AAL5 segmentation / reassembly.
pub mod atm;
/// The registry of known iSCSI parameters and connection states.
pub mod params;
/// Raw PDU layout, digests and segment data extraction.
pub mod pdu;
/// The `Key=Value` segment data engine.
pub mod segment_data;
