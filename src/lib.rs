//! Test API for iSCSI traffic instrumentation on remote Test Agents.
// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Interfaces to the RPC, configuration and packet services of an agent.
pub mod agent;
/// ASN.1 values for CSAP specs, templates and patterns.
pub mod asn;
/// Handles configuration and logging.
pub mod cfg;
/// iSCSI CSAP construction, PDU exchange and forwarding.
pub mod csap;
/// Error kinds and errno mapping.
pub mod error;
/// Initiator configuration: targets, connections, parameters.
pub mod initiator;
/// Queued file and block I/O on the initiator's device.
pub mod io_channel;
/// Defines the data structures carried in iSCSI and ATM PDUs.
pub mod models;
/// Remote calls into the target and its backing store.
pub mod target;
/// Provides utility functions used throughout the crate.
pub mod utils;
