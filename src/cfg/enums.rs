// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TapiError;

/// Boolean enumeration with string serialization support
///
/// Represents yes/no values with support for various string representations
/// including "Yes"/"No", "true"/"false", and "1"/"0".
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}
impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}
impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}
impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Header / data digest mode negotiated per connection.
///
/// `Display` gives the iSCSI wire spelling (`None`, `CRC32C`), while
/// [`Digest::asn_label`] gives the enumeration label the CSAP layer expects.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Digest {
    #[default]
    #[serde(rename = "None", alias = "none", alias = "NONE")]
    None,
    #[serde(rename = "CRC32C", alias = "crc32c")]
    CRC32C,
}
impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Digest::None => "None",
            Digest::CRC32C => "CRC32C",
        })
    }
}
impl Digest {
    pub fn asn_label(self) -> &'static str {
        match self {
            Digest::None => "none",
            Digest::CRC32C => "crc32c",
        }
    }

    /// Digest length in bytes on the wire.
    pub fn wire_len(self) -> usize {
        match self {
            Digest::None => 0,
            Digest::CRC32C => 4,
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, Digest::CRC32C)
    }
}
impl FromStr for Digest {
    type Err = TapiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" | "none" | "NONE" => Ok(Digest::None),
            "CRC32C" | "crc32c" => Ok(Digest::CRC32C),
            other => Err(TapiError::InvalidArgument(format!(
                "unknown digest mode {other:?}"
            ))),
        }
    }
}

/// Receive timeout as written in the configuration file: a number of
/// milliseconds or the literal `INF`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Ms(u32),
    Keyword(InfiniteKeyword),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfiniteKeyword {
    #[serde(rename = "INF", alias = "inf", alias = "Infinite")]
    Inf,
}
