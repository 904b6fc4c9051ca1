//! ASN.1 value model used for CSAP specs, templates, patterns and received
//! packets.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Parser for the textual value notation.
pub mod text;
/// The value tree and its path accessors.
pub mod value;

pub use text::parse_value;
pub use value::AsnValue;
