// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::RngExt;

/// Bytes needed to pad `len` up to a 4-byte boundary.
#[inline]
pub fn pad_len(len: usize) -> usize {
    (4 - (len & 3)) & 3
}

/// Random 8-byte token rendered as 16 lowercase hex digits.
pub fn random_token() -> String {
    let mut raw = [0u8; 8];
    rand::rng().fill(&mut raw);
    hex::encode(raw)
}
