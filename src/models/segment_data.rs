// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `Key=Value[,Value]*` lists carried in Login and Text PDUs.
//!
//! Wire layout (RFC 3720 §5.1): NUL-terminated tuples concatenated without a
//! separator and zero-padded to a 4-byte boundary.
//!
//! ```text
//! H e a d e r D i g e s t = C R C 3 2 C , N o n e \0 D a t a ... \0 \0 \0
//! ```
//!
//! Keys are addressed by index within one observation. Any structural change
//! (`add_new_key`, `delete_key`, `change_values`) invalidates indices obtained
//! before it.

use core::fmt;

use tracing::{debug, warn};

use crate::{
    asn::AsnValue,
    error::{TapiError, TapiResult},
    utils::pad_len,
};

/// Index callers use for "no such key" in index arithmetic.
pub const KEY_INVALID: isize = -1;

/// How a value reads, decided once from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFlavour {
    Int,
    Hex,
    Str,
}

impl ValueFlavour {
    fn of(text: &str) -> Self {
        if let Some(digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            if !digits.is_empty() && digits.bytes().all(|c| c.is_ascii_hexdigit()) {
                return ValueFlavour::Hex;
            }
            return ValueFlavour::Str;
        }
        if !text.is_empty() && text.bytes().all(|c| c.is_ascii_digit()) {
            ValueFlavour::Int
        } else {
            ValueFlavour::Str
        }
    }
}

/// One value of a key together with its flavour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    flavour: ValueFlavour,
    text: String,
}

impl KeyValue {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            flavour: ValueFlavour::of(&text),
            text,
        }
    }

    /// Flavour and text, always consistent with each other.
    pub fn get(&self) -> (ValueFlavour, &str) {
        (self.flavour, &self.text)
    }

    pub fn flavour(&self) -> ValueFlavour {
        self.flavour
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Numeric reading of `Int` and `Hex` values.
    pub fn as_u64(&self) -> Option<u64> {
        match self.flavour {
            ValueFlavour::Int => self.text.parse().ok(),
            ValueFlavour::Hex => u64::from_str_radix(&self.text[2..], 16).ok(),
            ValueFlavour::Str => None,
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::new(s)
    }
}

/// The values list of one key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValues(Vec<KeyValue>);

impl KeyValues {
    pub fn value_count(&self) -> usize {
        self.0.len()
    }

    pub fn value_at(&self, j: usize) -> Option<&KeyValue> {
        self.0.get(j)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    pub fn push(&mut self, v: impl Into<KeyValue>) {
        self.0.push(v.into());
    }

    pub fn contains(&self, text: &str) -> bool {
        self.0.iter().any(|v| v.text == text)
    }

    pub fn to_strings(&self) -> Vec<&str> {
        self.0.iter().map(KeyValue::as_str).collect()
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(&v.text)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// Append the given values.
    Insert,
    /// Drop every existing value, then append.
    Replace,
    /// Not supported, always fails.
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub key: String,
    pub values: KeyValues,
}

/// Ordered list of key pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentData {
    pairs: Vec<KeyPair>,
}

/// Builds a values list from strings.
pub fn values_create(values: &[&str]) -> KeyValues {
    KeyValues(values.iter().map(|v| KeyValue::new(*v)).collect())
}

/// Builds segment data holding the given keys, each with an empty values list.
pub fn keys_create(names: &[&str]) -> SegmentData {
    SegmentData {
        pairs: names
            .iter()
            .map(|n| KeyPair {
                key: (*n).to_string(),
                values: KeyValues::default(),
            })
            .collect(),
    }
}

impl SegmentData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn key_name(&self, i: usize) -> Option<&str> {
        self.pairs.get(i).map(|p| p.key.as_str())
    }

    /// Case-sensitive, first match wins.
    pub fn find_index_by_name(&self, name: &str) -> Option<usize> {
        self.pairs.iter().position(|p| p.key == name)
    }

    pub fn values_of(&self, i: usize) -> Option<&KeyValues> {
        self.pairs.get(i).map(|p| &p.values)
    }

    pub fn values_by_name(&self, name: &str) -> Option<&KeyValues> {
        self.find_index_by_name(name).and_then(|i| self.values_of(i))
    }

    pub fn pairs(&self) -> &[KeyPair] {
        &self.pairs
    }

    /// Inserts a key with no values. `at == None` appends. Returns the index
    /// the key landed at.
    pub fn add_new_key(&mut self, name: &str, at: Option<usize>) -> TapiResult<usize> {
        let idx = at.unwrap_or(self.pairs.len());
        if idx > self.pairs.len() {
            return Err(TapiError::InvalidArgument(format!(
                "key index {idx} beyond key count {}",
                self.pairs.len()
            )));
        }
        self.pairs.insert(
            idx,
            KeyPair {
                key: name.to_string(),
                values: KeyValues::default(),
            },
        );
        Ok(idx)
    }

    pub fn set_values(&mut self, i: usize, values: KeyValues) -> TapiResult<()> {
        let count = self.pairs.len();
        let pair = self.pairs.get_mut(i).ok_or_else(|| {
            TapiError::InvalidArgument(format!("key index {i} beyond key count {count}"))
        })?;
        pair.values = values;
        Ok(())
    }

    /// Removes key `i`; later keys shift down by one.
    pub fn delete_key(&mut self, i: usize) -> TapiResult<KeyPair> {
        if i >= self.pairs.len() {
            return Err(TapiError::InvalidArgument(format!(
                "key index {i} beyond key count {}",
                self.pairs.len()
            )));
        }
        Ok(self.pairs.remove(i))
    }

    pub fn change_values(
        &mut self,
        name: &str,
        mode: ChangeMode,
        args: &[&str],
    ) -> TapiResult<()> {
        if mode == ChangeMode::Remove {
            return Err(TapiError::NotSupported(
                "removing individual key values".into(),
            ));
        }
        let i = self
            .find_index_by_name(name)
            .ok_or_else(|| TapiError::NotFound(format!("key {name:?}")))?;
        let values = &mut self.pairs[i].values;
        if mode == ChangeMode::Replace {
            values.0.clear();
        }
        values.0.extend(args.iter().map(|a| KeyValue::new(*a)));
        debug!(key = name, ?mode, values = %values, "key values changed");
        Ok(())
    }

    /// `true` iff every `arg` appears among the values of `name`.
    pub fn find_key_and_value(&self, name: &str, args: &[&str]) -> bool {
        match self.values_by_name(name) {
            Some(values) => args.iter().all(|a| values.contains(a)),
            None => false,
        }
    }

    /// Comma-joined values of `name`.
    pub fn return_key_value(&self, name: &str) -> Option<String> {
        self.values_by_name(name).map(ToString::to_string)
    }

    fn unpadded_len(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| {
                let vals: usize = p.values.iter().map(|v| v.text.len()).sum();
                let commas = p.values.value_count().saturating_sub(1);
                p.key.len() + 1 + vals + commas + 1
            })
            .sum()
    }

    /// Length on the wire including padding.
    pub fn encoded_len(&self) -> usize {
        let n = self.unpadded_len();
        n + pad_len(n)
    }

    /// Serializes into `out`, returns the bytes used including padding.
    pub fn encode_into(&self, out: &mut [u8]) -> TapiResult<usize> {
        let need = self.encoded_len();
        if out.len() < need {
            warn!(need, have = out.len(), "segment data buffer too small");
            return Err(TapiError::NoBuffers {
                needed: need,
                available: out.len(),
            });
        }
        let mut pos = 0;
        let mut put = |bytes: &[u8]| {
            out[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        for p in &self.pairs {
            put(p.key.as_bytes());
            put(b"=");
            for (j, v) in p.values.iter().enumerate() {
                if j > 0 {
                    put(b",");
                }
                put(v.text.as_bytes());
            }
            put(&[0]);
        }
        out[pos..need].fill(0);
        Ok(need)
    }

    pub fn asn_to_bin(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        // Sized exactly above, cannot run short.
        let n = self.encode_into(&mut out).unwrap_or(0);
        out.truncate(n);
        debug!(keys = self.key_count(), len = n, "segment data encoded");
        out
    }

    /// Parses the wire form. The first empty tuple or tuple without `=`
    /// starts the padding, which must be all zeroes.
    pub fn bin_to_asn(data: &[u8]) -> TapiResult<SegmentData> {
        let mut sd = SegmentData::new();
        let mut rest = data;

        while !rest.is_empty() {
            let nul = rest.iter().position(|&c| c == 0).ok_or_else(|| {
                TapiError::Format("key=value tuple is not NUL-terminated".into())
            })?;
            let tuple = &rest[..nul];
            let Some(eq) = tuple.iter().position(|&c| c == b'=') else {
                break;
            };
            let key = core::str::from_utf8(&tuple[..eq])
                .map_err(|_| TapiError::Format("key is not UTF-8".into()))?;
            let values = core::str::from_utf8(&tuple[eq + 1..])
                .map_err(|_| TapiError::Format(format!("values of {key:?} are not UTF-8")))?;
            // A bare `Key=` yields one empty value.
            let values = KeyValues(values.split(',').map(KeyValue::new).collect());
            sd.pairs.push(KeyPair {
                key: key.to_string(),
                values,
            });
            rest = &rest[nul + 1..];
        }

        if rest.iter().any(|&c| c != 0) {
            return Err(TapiError::Format("padding is not zeroed".into()));
        }
        Ok(sd)
    }

    /// `ISCSI-Segment-Data ::= SEQUENCE OF { key, values SEQUENCE OF }`.
    pub fn to_asn(&self) -> AsnValue {
        AsnValue::SequenceOf(
            self.pairs
                .iter()
                .map(|p| {
                    AsnValue::Sequence(vec![
                        ("key".into(), AsnValue::CharString(p.key.clone())),
                        (
                            "values".into(),
                            AsnValue::SequenceOf(
                                p.values
                                    .iter()
                                    .map(|v| AsnValue::CharString(v.text.clone()))
                                    .collect(),
                            ),
                        ),
                    ])
                })
                .collect(),
        )
    }

    pub fn from_asn(v: &AsnValue) -> TapiResult<SegmentData> {
        let pairs = v
            .as_sequence_of()
            .ok_or_else(|| TapiError::Asn("segment data is not a SEQUENCE OF".into()))?;
        let mut sd = SegmentData::new();
        for pair in pairs {
            let key = pair.read_string("key")?.to_string();
            let mut values = KeyValues::default();
            if let Some(list) = pair.get("values") {
                let list = list.as_sequence_of().ok_or_else(|| {
                    TapiError::Asn(format!("values of {key:?} are not a SEQUENCE OF"))
                })?;
                for item in list {
                    values.push(item.read_string("")?);
                }
            }
            sd.pairs.push(KeyPair { key, values });
        }
        Ok(sd)
    }
}

impl fmt::Display for SegmentData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", p.key, p.values)?;
        }
        Ok(())
    }
}
