// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Raw iSCSI PDU helpers for tests that look inside CSAP payloads.
//!
//! A PDU on the wire (RFC 3720 §10.2):
//!
//! ```text
//! +-----------+--------------+---------------+---------------------+-------------+
//! | BHS (48)  | AHS (4*N)    | Header digest | Data + pad to 4     | Data digest |
//! +-----------+--------------+---------------+---------------------+-------------+
//! ```
//!
//! Digests are CRC32C, big-endian. Login PDUs never carry digests.

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use crc32c::crc32c_append;
use zerocopy::{BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, U32};

use crate::{
    cfg::enums::Digest,
    error::{TapiError, TapiResult},
    models::segment_data::SegmentData,
    utils::pad_len,
};

pub const BHS_LEN: usize = 48;

const OPCODE_MASK: u8 = 0b0011_1111;
const I_MASK: u8 = 0b0100_0000;
const F_MASK: u8 = 0b1000_0000;

/// Largest value of the 24-bit DataSegmentLength field.
pub const MAX_DATA_SEGMENT: usize = 0x00FF_FFFF;

/// Op-codes of RFC 3720 §10.2.1.2.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    NopOut = 0x00,
    ScsiCommandReq = 0x01,
    ScsiTaskMgmtReq = 0x02,
    LoginReq = 0x03,
    TextReq = 0x04,
    ScsiDataOut = 0x05,
    LogoutReq = 0x06,
    SnackReq = 0x10,
    NopIn = 0x20,
    ScsiCommandResp = 0x21,
    ScsiTaskMgmtResp = 0x22,
    LoginResp = 0x23,
    TextResp = 0x24,
    ScsiDataIn = 0x25,
    LogoutResp = 0x26,
    ReadyToTransfer = 0x31,
    AsyncMsg = 0x32,
    Reject = 0x3F,
}

impl Opcode {
    pub fn from_u6(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::NopOut,
            0x01 => Self::ScsiCommandReq,
            0x02 => Self::ScsiTaskMgmtReq,
            0x03 => Self::LoginReq,
            0x04 => Self::TextReq,
            0x05 => Self::ScsiDataOut,
            0x06 => Self::LogoutReq,
            0x10 => Self::SnackReq,
            0x20 => Self::NopIn,
            0x21 => Self::ScsiCommandResp,
            0x22 => Self::ScsiTaskMgmtResp,
            0x23 => Self::LoginResp,
            0x24 => Self::TextResp,
            0x25 => Self::ScsiDataIn,
            0x26 => Self::LogoutResp,
            0x31 => Self::ReadyToTransfer,
            0x32 => Self::AsyncMsg,
            0x3F => Self::Reject,
            _ => return None,
        })
    }

    /// Login and Text PDUs carry segment data as key=value text.
    pub fn carries_text(self) -> bool {
        matches!(
            self,
            Opcode::LoginReq | Opcode::LoginResp | Opcode::TextReq | Opcode::TextResp
        )
    }
}

/// The fields every BHS shares; opcode specific bytes stay opaque.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Bhs {
    pub opcode: u8,                         // byte 0: I bit | opcode
    pub flags: u8,                          // byte 1: F bit | opcode specific
    pub specific0: [u8; 2],                 // bytes 2..4
    pub total_ahs_length: u8,               // byte 4: in 4-byte words
    pub data_segment_length: [u8; 3],       // bytes 5..8
    pub lun_or_specific: [u8; 8],           // bytes 8..16
    pub initiator_task_tag: U32<BigEndian>, // bytes 16..20
    pub specific1: [u8; 28],                // bytes 20..48
}

impl Bhs {
    pub fn new(opcode: Opcode, immediate: bool, final_bit: bool) -> Self {
        let mut bhs = Bhs {
            opcode: opcode as u8,
            ..Default::default()
        };
        if immediate {
            bhs.opcode |= I_MASK;
        }
        if final_bit {
            bhs.flags |= F_MASK;
        }
        bhs
    }

    /// Borrows the BHS at the start of `pdu`.
    pub fn parse(pdu: &[u8]) -> TapiResult<&Bhs> {
        Bhs::ref_from_prefix(pdu).map(|(bhs, _)| bhs).map_err(|_| {
            TapiError::Format(format!("PDU is {} bytes, BHS needs {BHS_LEN}", pdu.len()))
        })
    }

    #[inline]
    pub fn opcode_raw(&self) -> u8 {
        self.opcode & OPCODE_MASK
    }

    #[inline]
    pub fn opcode_known(&self) -> Option<Opcode> {
        Opcode::from_u6(self.opcode_raw())
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.opcode & I_MASK != 0
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.flags & F_MASK != 0
    }

    /// Login request or response: `opcode & 0x1f == 3`.
    #[inline]
    pub fn is_login(&self) -> bool {
        self.opcode & 0x1f == Opcode::LoginReq as u8
    }

    #[inline]
    pub fn ahs_len(&self) -> usize {
        self.total_ahs_length as usize * 4
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        let [a, b, c] = self.data_segment_length;
        u32::from_be_bytes([0, a, b, c]) as usize
    }

    pub fn set_data_len(&mut self, len: usize) -> TapiResult<()> {
        if len > MAX_DATA_SEGMENT {
            return Err(TapiError::InvalidArgument(format!(
                "data segment of {len} bytes does not fit 24 bits"
            )));
        }
        let be = (len as u32).to_be_bytes();
        self.data_segment_length.copy_from_slice(&be[1..]);
        Ok(())
    }
}

impl fmt::Display for Bhs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode_known() {
            Some(op) => write!(f, "{op:?}")?,
            None => write!(f, "opcode 0x{:02x}", self.opcode_raw())?,
        }
        write!(
            f,
            " I={} F={} ahs={} data={} itt=0x{:08x}",
            self.is_immediate() as u8,
            self.is_final() as u8,
            self.ahs_len(),
            self.data_len(),
            self.initiator_task_tag.get()
        )
    }
}

fn crc32c_padded(parts: &[&[u8]], pad: usize) -> u32 {
    let mut acc = 0u32;
    for p in parts.iter().filter(|p| !p.is_empty()) {
        acc = crc32c_append(acc, p);
    }
    if pad != 0 {
        acc = crc32c_append(acc, &[0u8; 3][..pad]);
    }
    acc
}

fn effective_digests(bhs: &Bhs, hdig: Digest, ddig: Digest) -> (usize, usize) {
    if bhs.is_login() {
        return (0, 0);
    }
    let dd = if bhs.data_len() == 0 { 0 } else { ddig.wire_len() };
    (hdig.wire_len(), dd)
}

/// Bytes that follow the BHS: AHS, digests and the padded data segment.
pub fn rest_data_len(bhs: &Bhs, hdig: Digest, ddig: Digest) -> usize {
    let (hd, dd) = effective_digests(bhs, hdig, ddig);
    let data = bhs.data_len();
    bhs.ahs_len() + hd + data + pad_len(data) + dd
}

/// Assembles a PDU, filling in both length fields and any digests.
pub fn build_pdu(
    bhs: &Bhs,
    ahs: &[u8],
    data: &[u8],
    hdig: Digest,
    ddig: Digest,
) -> TapiResult<Bytes> {
    if ahs.len() % 4 != 0 || ahs.len() / 4 > u8::MAX as usize {
        return Err(TapiError::InvalidArgument(format!(
            "AHS length {} is not a multiple of 4 below 1024",
            ahs.len()
        )));
    }
    let mut hdr = bhs.clone();
    hdr.total_ahs_length = (ahs.len() / 4) as u8;
    hdr.set_data_len(data.len())?;

    let (hd, dd) = effective_digests(&hdr, hdig, ddig);
    let mut out = BytesMut::with_capacity(BHS_LEN + rest_data_len(&hdr, hdig, ddig));
    out.put_slice(hdr.as_bytes());
    out.put_slice(ahs);
    if hd != 0 {
        out.put_u32(crc32c_padded(&[hdr.as_bytes(), ahs], 0));
    }
    out.put_slice(data);
    out.put_bytes(0, pad_len(data.len()));
    if dd != 0 {
        out.put_u32(crc32c_padded(&[data], pad_len(data.len())));
    }
    Ok(out.freeze())
}

fn data_offset(bhs: &Bhs, hdig: Digest, ddig: Digest) -> usize {
    BHS_LEN + bhs.ahs_len() + effective_digests(bhs, hdig, ddig).0
}

/// The data segment of `pdu`, without padding or digest.
pub fn segment_data(pdu: &[u8], hdig: Digest) -> TapiResult<&[u8]> {
    let bhs = Bhs::parse(pdu)?;
    let start = data_offset(bhs, hdig, Digest::None);
    let end = start + bhs.data_len();
    pdu.get(start..end).ok_or_else(|| {
        TapiError::Format(format!(
            "PDU of {} bytes is shorter than its data segment end {end}",
            pdu.len()
        ))
    })
}

/// Recomputes both digests and compares them with the ones carried in `pdu`.
pub fn check_digests(pdu: &[u8], hdig: Digest, ddig: Digest) -> TapiResult<()> {
    let bhs = Bhs::parse(pdu)?;
    if pdu.len() < BHS_LEN + rest_data_len(bhs, hdig, ddig) {
        return Err(TapiError::Format("PDU is truncated".into()));
    }
    let (hd, dd) = effective_digests(bhs, hdig, ddig);
    let ahs_end = BHS_LEN + bhs.ahs_len();
    let read_be = |at: usize| u32::from_be_bytes([pdu[at], pdu[at + 1], pdu[at + 2], pdu[at + 3]]);

    if hd != 0 {
        let want = crc32c_padded(&[&pdu[..ahs_end]], 0);
        if read_be(ahs_end) != want {
            return Err(TapiError::Format("header digest mismatch".into()));
        }
    }
    if dd != 0 {
        let data = segment_data(pdu, hdig)?;
        let at = ahs_end + hd + data.len() + pad_len(data.len());
        if read_be(at) != crc32c_padded(&[data], pad_len(data.len())) {
            return Err(TapiError::Format("data digest mismatch".into()));
        }
    }
    Ok(())
}

/// Rebuilds `pdu` around new segment data, keeping BHS and AHS.
pub fn replace_segment_data(
    pdu: &[u8],
    sd: &SegmentData,
    hdig: Digest,
    ddig: Digest,
) -> TapiResult<Bytes> {
    let bhs = Bhs::parse(pdu)?;
    let ahs_end = BHS_LEN + bhs.ahs_len();
    let ahs = pdu
        .get(BHS_LEN..ahs_end)
        .ok_or_else(|| TapiError::Format("PDU is shorter than its AHS".into()))?;

    let mut data = sd.asn_to_bin();
    // The length field counts the text without trailing pad bytes.
    while data.len() > 1 && data[data.len() - 1] == 0 && data[data.len() - 2] == 0 {
        data.pop();
    }
    build_pdu(bhs, ahs, &data, hdig, ddig)
}
