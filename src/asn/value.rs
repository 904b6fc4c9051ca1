// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use crate::error::{TapiError, TapiResult};

/// One node of an ASN.1 value tree.
///
/// Children are owned by their parent. Sequence fields keep insertion order,
/// which is also the order they are printed in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AsnValue {
    #[default]
    Null,
    Integer(i64),
    /// Enumeration label, e.g. `crc32c` or `UNI`.
    Enum(String),
    CharString(String),
    Octets(Vec<u8>),
    Sequence(Vec<(String, AsnValue)>),
    SequenceOf(Vec<AsnValue>),
    Choice(String, Box<AsnValue>),
}

/// A parsed path component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step<'a> {
    Field(&'a str),
    Index(usize),
    Choice(&'a str),
}

fn steps(path: &str) -> impl Iterator<Item = Step<'_>> {
    path.split('.').filter(|s| !s.is_empty()).map(|s| {
        if let Some(label) = s.strip_prefix('#') {
            Step::Choice(label)
        } else if let Ok(i) = s.parse::<usize>() {
            Step::Index(i)
        } else {
            Step::Field(s)
        }
    })
}

impl AsnValue {
    pub fn empty_sequence() -> Self {
        AsnValue::Sequence(Vec::new())
    }

    pub fn empty_sequence_of() -> Self {
        AsnValue::SequenceOf(Vec::new())
    }

    pub fn choice(label: impl Into<String>, inner: AsnValue) -> Self {
        AsnValue::Choice(label.into(), Box::new(inner))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AsnValue::Null => "NULL",
            AsnValue::Integer(_) => "INTEGER",
            AsnValue::Enum(_) => "ENUMERATED",
            AsnValue::CharString(_) => "UniversalString",
            AsnValue::Octets(_) => "OCTET STRING",
            AsnValue::Sequence(_) => "SEQUENCE",
            AsnValue::SequenceOf(_) => "SEQUENCE OF",
            AsnValue::Choice(..) => "CHOICE",
        }
    }

    fn step(&self, step: Step<'_>) -> Option<&AsnValue> {
        match (self, step) {
            (AsnValue::Sequence(fields), Step::Field(label)) => {
                fields.iter().find(|(l, _)| l == label).map(|(_, v)| v)
            },
            (AsnValue::SequenceOf(items), Step::Index(i)) => items.get(i),
            (AsnValue::Choice(l, inner), Step::Choice(label)) if l == label => {
                Some(inner)
            },
            _ => None,
        }
    }

    /// Walks one step down, creating missing sequence fields and choices.
    fn step_mut_create(&mut self, step: Step<'_>) -> TapiResult<&mut AsnValue> {
        // An untouched `{}` (or NULL placeholder) takes the shape the first
        // write asks for.
        let untouched = matches!(self, AsnValue::Null)
            || matches!(self, AsnValue::Sequence(f) if f.is_empty())
            || matches!(self, AsnValue::SequenceOf(i) if i.is_empty());
        if untouched {
            *self = match step {
                Step::Field(_) => AsnValue::empty_sequence(),
                Step::Index(_) => AsnValue::empty_sequence_of(),
                Step::Choice(label) => AsnValue::choice(label, AsnValue::Null),
            };
        }

        let type_name = self.type_name();
        match (self, step) {
            (AsnValue::Sequence(fields), Step::Field(label)) => {
                let pos = match fields.iter().position(|(l, _)| l == label) {
                    Some(pos) => pos,
                    None => {
                        fields.push((label.to_string(), AsnValue::Null));
                        fields.len() - 1
                    },
                };
                Ok(&mut fields[pos].1)
            },
            (AsnValue::SequenceOf(items), Step::Index(i)) => {
                let len = items.len();
                items.get_mut(i).ok_or_else(|| {
                    TapiError::Asn(format!("index {i} out of range, length {len}"))
                })
            },
            (AsnValue::Choice(l, inner), Step::Choice(label)) => {
                if l != label {
                    *l = label.to_string();
                    **inner = AsnValue::Null;
                }
                Ok(inner)
            },
            (_, step) => Err(TapiError::Asn(format!(
                "cannot apply {step:?} to a {type_name} value"
            ))),
        }
    }

    /// Child by path; an empty path is the value itself.
    pub fn get(&self, path: &str) -> Option<&AsnValue> {
        steps(path).try_fold(self, |v, s| v.step(s))
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut AsnValue> {
        let mut cur = self;
        for s in steps(path) {
            cur = match (cur, s) {
                (AsnValue::Sequence(fields), Step::Field(label)) => {
                    fields.iter_mut().find(|(l, _)| l == label).map(|(_, v)| v)?
                },
                (AsnValue::SequenceOf(items), Step::Index(i)) => items.get_mut(i)?,
                (AsnValue::Choice(l, inner), Step::Choice(label)) if l == label => {
                    inner.as_mut()
                },
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Child by path, creating every missing intermediate node.
    pub fn get_or_create(&mut self, path: &str) -> TapiResult<&mut AsnValue> {
        let mut cur = self;
        for s in steps(path) {
            cur = cur.step_mut_create(s)?;
        }
        Ok(cur)
    }

    fn not_found(path: &str) -> TapiError {
        TapiError::Asn(format!("no value at {path:?}"))
    }

    fn wrong_type(path: &str, want: &str, got: &AsnValue) -> TapiError {
        TapiError::Asn(format!(
            "value at {path:?} is {}, expected {want}",
            got.type_name()
        ))
    }

    pub fn read_int(&self, path: &str) -> TapiResult<i64> {
        match self.get(path) {
            Some(AsnValue::Integer(v)) => Ok(*v),
            Some(other) => Err(Self::wrong_type(path, "INTEGER", other)),
            None => Err(Self::not_found(path)),
        }
    }

    /// Reads a character string; enumeration labels are read as strings too.
    pub fn read_string(&self, path: &str) -> TapiResult<&str> {
        match self.get(path) {
            Some(AsnValue::CharString(s)) | Some(AsnValue::Enum(s)) => Ok(s),
            Some(other) => Err(Self::wrong_type(path, "UniversalString", other)),
            None => Err(Self::not_found(path)),
        }
    }

    pub fn read_bytes(&self, path: &str) -> TapiResult<&[u8]> {
        match self.get(path) {
            Some(AsnValue::Octets(b)) => Ok(b),
            Some(other) => Err(Self::wrong_type(path, "OCTET STRING", other)),
            None => Err(Self::not_found(path)),
        }
    }

    pub fn write_int(&mut self, path: &str, v: i64) -> TapiResult<()> {
        *self.get_or_create(path)? = AsnValue::Integer(v);
        Ok(())
    }

    pub fn write_string(&mut self, path: &str, v: &str) -> TapiResult<()> {
        *self.get_or_create(path)? = AsnValue::CharString(v.to_string());
        Ok(())
    }

    pub fn write_enum(&mut self, path: &str, label: &str) -> TapiResult<()> {
        *self.get_or_create(path)? = AsnValue::Enum(label.to_string());
        Ok(())
    }

    pub fn write_bytes(&mut self, path: &str, v: &[u8]) -> TapiResult<()> {
        *self.get_or_create(path)? = AsnValue::Octets(v.to_vec());
        Ok(())
    }

    pub fn write_null(&mut self, path: &str) -> TapiResult<()> {
        *self.get_or_create(path)? = AsnValue::Null;
        Ok(())
    }

    /// Number of elements of the `SEQUENCE OF` at `path`, or of fields of a
    /// `SEQUENCE`. `None` when the path does not lead to a constructed value.
    pub fn length(&self, path: &str) -> Option<usize> {
        match self.get(path)? {
            AsnValue::SequenceOf(items) => Some(items.len()),
            AsnValue::Sequence(fields) => Some(fields.len()),
            AsnValue::Choice(..) => Some(1),
            _ => None,
        }
    }

    /// Inserts `value` into the `SEQUENCE OF` at `path`; `at == None` appends.
    /// Returns the index the value landed at.
    pub fn insert_indexed(
        &mut self,
        path: &str,
        at: Option<usize>,
        value: AsnValue,
    ) -> TapiResult<usize> {
        let target = self.get_or_create(path)?;
        if matches!(target, AsnValue::Null)
            || matches!(target, AsnValue::Sequence(f) if f.is_empty())
        {
            *target = AsnValue::empty_sequence_of();
        }
        match target {
            AsnValue::SequenceOf(items) => {
                let idx = at.unwrap_or(items.len());
                if idx > items.len() {
                    return Err(TapiError::Asn(format!(
                        "insert at {idx} beyond length {}",
                        items.len()
                    )));
                }
                items.insert(idx, value);
                Ok(idx)
            },
            other => Err(Self::wrong_type(path, "SEQUENCE OF", other)),
        }
    }

    pub fn remove_indexed(&mut self, path: &str, index: usize) -> TapiResult<AsnValue> {
        match self.get_mut(path) {
            Some(AsnValue::SequenceOf(items)) if index < items.len() => {
                Ok(items.remove(index))
            },
            Some(AsnValue::SequenceOf(items)) => Err(TapiError::Asn(format!(
                "remove at {index} beyond length {}",
                items.len()
            ))),
            Some(other) => Err(Self::wrong_type(path, "SEQUENCE OF", other)),
            None => Err(Self::not_found(path)),
        }
    }

    /// Label of the selected alternative of the `CHOICE` at `path`.
    pub fn choice_label(&self, path: &str) -> Option<&str> {
        match self.get(path)? {
            AsnValue::Choice(label, _) => Some(label),
            _ => None,
        }
    }

    pub fn as_sequence_of(&self) -> Option<&[AsnValue]> {
        match self {
            AsnValue::SequenceOf(items) => Some(items),
            AsnValue::Sequence(f) if f.is_empty() => Some(&[]),
            _ => None,
        }
    }
}

fn is_bare_label(s: &str) -> bool {
    s.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl fmt::Display for AsnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsnValue::Null => f.write_str("NULL"),
            AsnValue::Integer(v) => write!(f, "{v}"),
            AsnValue::Enum(label) if is_bare_label(label) => f.write_str(label),
            AsnValue::Enum(label) => write!(f, "{label:?}"),
            AsnValue::CharString(s) => write!(f, "{s:?}"),
            AsnValue::Octets(b) => write!(f, "'{}'H", hex::encode_upper(b)),
            AsnValue::Sequence(fields) => {
                f.write_str("{")?;
                for (i, (label, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {label} {v}")?;
                }
                f.write_str(if fields.is_empty() { "}" } else { " }" })
            },
            AsnValue::SequenceOf(items) => {
                f.write_str("{")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {v}")?;
                }
                f.write_str(if items.is_empty() { "}" } else { " }" })
            },
            AsnValue::Choice(label, inner) => write!(f, "{label}:{inner}"),
        }
    }
}
