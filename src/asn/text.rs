// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Brace notation, e.g. `{ pdus { iscsi:{ param 3 } }, payload bytes:'00FF'H }`.
//!
//! Inside braces an identifier followed by a value is a named field; anything
//! else is an element of a `SEQUENCE OF`. `label:value` selects a choice.

use crate::{
    asn::AsnValue,
    error::{TapiError, TapiResult},
};

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, what: &str) -> TapiError {
        TapiError::Asn(format!("{what} at offset {}", self.pos))
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> TapiResult<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(&format!("expected '{}'", c as char)))
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let start = self.pos;
        match self.src.get(self.pos) {
            Some(c) if c.is_ascii_alphabetic() => {},
            _ => return None,
        }
        while let Some(c) = self.src.get(self.pos) {
            if c.is_ascii_alphanumeric() || *c == b'-' || *c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        core::str::from_utf8(&self.src[start..self.pos]).ok()
    }

    fn value(&mut self) -> TapiResult<AsnValue> {
        match self.peek() {
            Some(b'{') => self.braces(),
            Some(b'"') => self.string(),
            Some(b'\'') => self.octets(),
            Some(c) if c == b'-' || c.is_ascii_digit() => self.integer(),
            Some(c) if c.is_ascii_alphabetic() => {
                let id = self.ident().ok_or_else(|| self.err("expected identifier"))?;
                if self.src.get(self.pos) == Some(&b':') {
                    self.pos += 1;
                    let inner = self.value()?;
                    return Ok(AsnValue::choice(id, inner));
                }
                if id == "NULL" {
                    return Ok(AsnValue::Null);
                }
                Ok(AsnValue::Enum(id.to_string()))
            },
            Some(_) => Err(self.err("unexpected character")),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn integer(&mut self) -> TapiResult<AsnValue> {
        self.skip_ws();
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.src.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        core::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(AsnValue::Integer)
            .ok_or_else(|| self.err("bad integer"))
    }

    fn string(&mut self) -> TapiResult<AsnValue> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.src.get(self.pos) {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                },
                Some(b'\\') => {
                    let c = self
                        .src
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.err("dangling escape"))?;
                    out.push(match c {
                        b'n' => b'\n',
                        b't' => b'\t',
                        b'0' => 0,
                        other => other,
                    });
                    self.pos += 2;
                },
                Some(c) => {
                    out.push(*c);
                    self.pos += 1;
                },
            }
        }
        String::from_utf8(out)
            .map(AsnValue::CharString)
            .map_err(|_| self.err("string is not UTF-8"))
    }

    fn octets(&mut self) -> TapiResult<AsnValue> {
        self.expect(b'\'')?;
        let start = self.pos;
        while self.src.get(self.pos).is_some_and(|c| *c != b'\'') {
            self.pos += 1;
        }
        let digits: String = core::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("bad octet string"))?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        self.expect(b'\'')?;
        if self.src.get(self.pos) != Some(&b'H') {
            return Err(self.err("octet string must end with 'H"));
        }
        self.pos += 1;
        hex::decode(&digits)
            .map(AsnValue::Octets)
            .map_err(|e| self.err(&format!("bad hex ({e})")))
    }

    /// Decides between a named field and a bare element by looking past a
    /// leading identifier.
    fn starts_field(&mut self) -> bool {
        let save = self.pos;
        let field = match self.ident() {
            Some(_) if self.src.get(self.pos) == Some(&b':') => false,
            Some(id) if id != "NULL" => {
                !matches!(self.peek(), Some(b',') | Some(b'}') | None)
            },
            _ => false,
        };
        self.pos = save;
        field
    }

    fn braces(&mut self) -> TapiResult<AsnValue> {
        self.expect(b'{')?;
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(AsnValue::empty_sequence());
        }

        let named = self.starts_field();
        let mut fields = Vec::new();
        let mut items = Vec::new();
        loop {
            if named {
                let label = self
                    .ident()
                    .ok_or_else(|| self.err("expected field name"))?
                    .to_string();
                let v = self.value()?;
                fields.push((label, v));
            } else {
                items.push(self.value()?);
            }
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                },
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
        Ok(if named {
            AsnValue::Sequence(fields)
        } else {
            AsnValue::SequenceOf(items)
        })
    }
}

/// Parses one value; trailing non-blank input is an error.
pub fn parse_value(text: &str) -> TapiResult<AsnValue> {
    let mut p = Parser {
        src: text.as_bytes(),
        pos: 0,
    };
    let v = p.value()?;
    if p.peek().is_some() {
        return Err(p.err("trailing input"));
    }
    Ok(v)
}
