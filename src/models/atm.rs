// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ATM cells and AAL5 framing, enough to check what an `aal5.atm.socket`
//! CSAP puts on the wire.
//!
//! UNI cell header (ITU-T I.361):
//!
//! ```text
//!  7     4 3     0
//! +-------+-------+
//! |  GFC  |  VPI  |   byte 0
//! |  VPI  |  VCI  |   byte 1
//! |      VCI      |   byte 2
//! |  VCI  |PTI|CLP|   byte 3
//! |      HEC      |   byte 4
//! +-------+-------+
//! ```
//!
//! NNI cells use the GFC nibble for four more VPI bits. HEC is CRC-8
//! (x^8+x^2+x+1) xor 0x55. The AAL5 CPCS-PDU is the payload, zero padding and
//! an 8-byte trailer `CPCS-UU | CPI | Length(16) | CRC-32`, cut into 48-byte
//! cell payloads; the last cell has the PTI end-of-PDU bit set.

use crc::{CRC_8_I_432_1, CRC_32_BZIP2, Crc};
use tracing::debug;

use crate::error::{TapiError, TapiResult};

pub const CELL_LEN: usize = 53;
pub const HEADER_LEN: usize = 5;
pub const PAYLOAD_LEN: usize = 48;
pub const TRAILER_LEN: usize = 8;

/// PTI bit marking the last cell of an AAL5 PDU (ATM-user-to-ATM-user).
const PTI_AUU: u8 = 0b001;
/// PTI bit for explicit forward congestion indication.
const PTI_EFCI: u8 = 0b010;

const HEC: Crc<u8> = Crc::<u8>::new(&CRC_8_I_432_1);
const AAL5_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_BZIP2);

pub type Cell = [u8; CELL_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtmType {
    #[default]
    Uni,
    Nni,
}

impl AtmType {
    pub fn asn_label(self) -> &'static str {
        match self {
            AtmType::Uni => "UNI",
            AtmType::Nni => "NNI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellHeader {
    pub gfc: u8,
    pub vpi: u16,
    pub vci: u16,
    pub pti: u8,
    pub clp: bool,
}

impl CellHeader {
    pub fn new(vpi: u16, vci: u16) -> Self {
        Self {
            vpi,
            vci,
            ..Default::default()
        }
    }

    pub fn is_end_of_pdu(&self) -> bool {
        self.pti & 0b100 == 0 && self.pti & PTI_AUU != 0
    }

    pub fn congestion(&self) -> bool {
        self.pti & 0b100 == 0 && self.pti & PTI_EFCI != 0
    }

    pub fn encode(&self, kind: AtmType) -> TapiResult<[u8; HEADER_LEN]> {
        let (hi, vpi_max) = match kind {
            AtmType::Uni => (self.gfc, 0xFF),
            AtmType::Nni => ((self.vpi >> 8) as u8, 0xFFF),
        };
        if self.vpi > vpi_max || self.gfc > 0xF || self.pti > 0b111 {
            return Err(TapiError::InvalidArgument(format!(
                "{kind:?} header out of range: gfc={} vpi={} pti={}",
                self.gfc, self.vpi, self.pti
            )));
        }
        if kind == AtmType::Nni && self.gfc != 0 {
            return Err(TapiError::InvalidArgument("NNI cells have no GFC".into()));
        }
        let vpi_lo = (self.vpi & 0xFF) as u8;
        let mut h = [0u8; HEADER_LEN];
        h[0] = (hi << 4) | (vpi_lo >> 4);
        h[1] = (vpi_lo << 4) | (self.vci >> 12) as u8;
        h[2] = (self.vci >> 4) as u8;
        h[3] = ((self.vci as u8 & 0x0F) << 4) | (self.pti << 1) | self.clp as u8;
        h[4] = hec(&h[..4]);
        Ok(h)
    }

    pub fn decode(h: &[u8], kind: AtmType) -> TapiResult<Self> {
        if h.len() < HEADER_LEN {
            return Err(TapiError::Format(format!("ATM header of {} bytes", h.len())));
        }
        if hec(&h[..4]) != h[4] {
            return Err(TapiError::Format(format!(
                "HEC mismatch: 0x{:02x} != 0x{:02x}",
                h[4],
                hec(&h[..4])
            )));
        }
        let vpi_lo = ((h[0] & 0x0F) << 4) | (h[1] >> 4);
        let (gfc, vpi) = match kind {
            AtmType::Uni => (h[0] >> 4, vpi_lo as u16),
            AtmType::Nni => (0, ((h[0] >> 4) as u16) << 8 | vpi_lo as u16),
        };
        Ok(Self {
            gfc,
            vpi,
            vci: ((h[1] & 0x0F) as u16) << 12 | (h[2] as u16) << 4 | (h[3] >> 4) as u16,
            pti: (h[3] >> 1) & 0b111,
            clp: h[3] & 1 != 0,
        })
    }
}

/// Header error control over the first four header bytes.
pub fn hec(header4: &[u8]) -> u8 {
    HEC.checksum(header4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aal5Trailer {
    pub cpcs_uu: u8,
    pub cpi: u8,
}

/// Zero bytes needed so that payload plus trailer fill whole cells.
pub fn aal5_pad_len(payload_len: usize) -> usize {
    (PAYLOAD_LEN - (payload_len + TRAILER_LEN) % PAYLOAD_LEN) % PAYLOAD_LEN
}

/// Segments one AAL5 CPCS-PDU into cells. `header.pti` congestion bit is
/// kept; the end-of-PDU bit is set on the last cell only.
pub fn aal5_segment(
    header: &CellHeader,
    kind: AtmType,
    trailer: Aal5Trailer,
    payload: &[u8],
) -> TapiResult<Vec<Cell>> {
    let length = u16::try_from(payload.len()).map_err(|_| {
        TapiError::InvalidArgument(format!(
            "AAL5 payload of {} bytes exceeds 65535",
            payload.len()
        ))
    })?;

    let mut pdu = Vec::with_capacity(payload.len() + PAYLOAD_LEN + TRAILER_LEN);
    pdu.extend_from_slice(payload);
    pdu.resize(payload.len() + aal5_pad_len(payload.len()), 0);
    pdu.push(trailer.cpcs_uu);
    pdu.push(trailer.cpi);
    pdu.extend_from_slice(&length.to_be_bytes());
    let crc = AAL5_CRC.checksum(&pdu);
    pdu.extend_from_slice(&crc.to_be_bytes());

    let n = pdu.len() / PAYLOAD_LEN;
    let mut cells = Vec::with_capacity(n);
    for (i, chunk) in pdu.chunks_exact(PAYLOAD_LEN).enumerate() {
        let mut h = *header;
        h.pti &= !PTI_AUU;
        if i + 1 == n {
            h.pti |= PTI_AUU;
        }
        let mut cell = [0u8; CELL_LEN];
        cell[..HEADER_LEN].copy_from_slice(&h.encode(kind)?);
        cell[HEADER_LEN..].copy_from_slice(chunk);
        cells.push(cell);
    }
    debug!(len = payload.len(), cells = n, crc, "AAL5 PDU segmented");
    Ok(cells)
}

/// A reassembled AAL5 PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aal5Pdu {
    pub header: CellHeader,
    pub trailer: Aal5Trailer,
    pub payload: Vec<u8>,
}

/// Reassembles the first PDU found in a stream of whole cells.
pub fn aal5_reassemble(stream: &[u8], kind: AtmType) -> TapiResult<Aal5Pdu> {
    if stream.is_empty() || stream.len() % CELL_LEN != 0 {
        return Err(TapiError::Format(format!(
            "{} bytes is not a whole number of cells",
            stream.len()
        )));
    }
    let mut pdu = Vec::new();
    let mut first = None;
    for cell in stream.chunks_exact(CELL_LEN) {
        let h = CellHeader::decode(cell, kind)?;
        first.get_or_insert(h);
        pdu.extend_from_slice(&cell[HEADER_LEN..]);
        if h.is_end_of_pdu() {
            let tail = pdu.len() - TRAILER_LEN;
            let t = &pdu[tail..];
            let length = u16::from_be_bytes([t[2], t[3]]) as usize;
            let crc = u32::from_be_bytes([t[4], t[5], t[6], t[7]]);
            if AAL5_CRC.checksum(&pdu[..tail + 4]) != crc {
                return Err(TapiError::Format("AAL5 CRC-32 mismatch".into()));
            }
            if length > tail || tail - length >= PAYLOAD_LEN {
                return Err(TapiError::Format(format!(
                    "AAL5 length {length} does not match {} cells",
                    pdu.len() / PAYLOAD_LEN
                )));
            }
            return Ok(Aal5Pdu {
                header: first.unwrap_or(h),
                trailer: Aal5Trailer {
                    cpcs_uu: t[0],
                    cpi: t[1],
                },
                payload: pdu[..length].to_vec(),
            });
        }
    }
    Err(TapiError::Format("no end-of-PDU cell".into()))
}
