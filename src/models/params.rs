// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Registry of the iSCSI parameters the initiator configuration knows about.
//!
//! Each parameter maps to its wire spelling (as used in segment data), to the
//! node name under the initiator configuration subtree, and for negotiable
//! ones to the bit in `parameters2advertize` that makes the initiator offer it.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Bits of the `parameters2advertize` mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OfferFlags: u32 {
        const MAX_CONNECTIONS              = 1 << 0;
        const INITIAL_R2T                  = 1 << 1;
        const HEADER_DIGEST                = 1 << 2;
        const DATA_DIGEST                  = 1 << 3;
        const IMMEDIATE_DATA               = 1 << 4;
        const MAX_RECV_DATA_SEGMENT_LENGTH = 1 << 5;
        const MAX_BURST_LENGTH             = 1 << 6;
        const FIRST_BURST_LENGTH           = 1 << 7;
        const DEFAULT_TIME2WAIT            = 1 << 8;
        const DEFAULT_TIME2RETAIN          = 1 << 9;
        const MAX_OUTSTANDING_R2T          = 1 << 10;
        const DATA_PDU_IN_ORDER            = 1 << 11;
        const DATA_SEQUENCE_IN_ORDER       = 1 << 12;
        const ERROR_RECOVERY_LEVEL         = 1 << 13;
    }
}

/// Where a parameter lives in the initiator configuration subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    /// Directly below `target_data:target_<id>`.
    Target,
    /// Below `target_data:target_<id>/conn:<cid>`.
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IscsiParam {
    TargetName,
    TargetAddress,
    TargetPort,
    InitiatorName,
    InitiatorAlias,
    SessionType,
    MaxConnections,
    InitialR2T,
    HeaderDigest,
    DataDigest,
    ImmediateData,
    MaxRecvDataSegmentLength,
    FirstBurstLength,
    MaxBurstLength,
    DefaultTime2Wait,
    DefaultTime2Retain,
    MaxOutstandingR2T,
    DataPDUInOrder,
    DataSequenceInOrder,
    ErrorRecoveryLevel,
    AuthMethod,
    ChapLocalName,
    ChapPeerName,
    ChapLocalSecret,
    ChapPeerSecret,
    ChapChallengeLength,
    ChapEncFmt,
    ChapTargetAuth,
}

impl IscsiParam {
    pub const ALL: [IscsiParam; 28] = [
        IscsiParam::TargetName,
        IscsiParam::TargetAddress,
        IscsiParam::TargetPort,
        IscsiParam::InitiatorName,
        IscsiParam::InitiatorAlias,
        IscsiParam::SessionType,
        IscsiParam::MaxConnections,
        IscsiParam::InitialR2T,
        IscsiParam::HeaderDigest,
        IscsiParam::DataDigest,
        IscsiParam::ImmediateData,
        IscsiParam::MaxRecvDataSegmentLength,
        IscsiParam::FirstBurstLength,
        IscsiParam::MaxBurstLength,
        IscsiParam::DefaultTime2Wait,
        IscsiParam::DefaultTime2Retain,
        IscsiParam::MaxOutstandingR2T,
        IscsiParam::DataPDUInOrder,
        IscsiParam::DataSequenceInOrder,
        IscsiParam::ErrorRecoveryLevel,
        IscsiParam::AuthMethod,
        IscsiParam::ChapLocalName,
        IscsiParam::ChapPeerName,
        IscsiParam::ChapLocalSecret,
        IscsiParam::ChapPeerSecret,
        IscsiParam::ChapChallengeLength,
        IscsiParam::ChapEncFmt,
        IscsiParam::ChapTargetAuth,
    ];

    /// Key spelling in segment data (RFC 3720 §12, CHAP keys per §11.1.4).
    pub fn wire_name(self) -> &'static str {
        match self {
            IscsiParam::TargetName => "TargetName",
            IscsiParam::TargetAddress => "TargetAddress",
            IscsiParam::TargetPort => "TargetPort",
            IscsiParam::InitiatorName => "InitiatorName",
            IscsiParam::InitiatorAlias => "InitiatorAlias",
            IscsiParam::SessionType => "SessionType",
            IscsiParam::MaxConnections => "MaxConnections",
            IscsiParam::InitialR2T => "InitialR2T",
            IscsiParam::HeaderDigest => "HeaderDigest",
            IscsiParam::DataDigest => "DataDigest",
            IscsiParam::ImmediateData => "ImmediateData",
            IscsiParam::MaxRecvDataSegmentLength => "MaxRecvDataSegmentLength",
            IscsiParam::FirstBurstLength => "FirstBurstLength",
            IscsiParam::MaxBurstLength => "MaxBurstLength",
            IscsiParam::DefaultTime2Wait => "DefaultTime2Wait",
            IscsiParam::DefaultTime2Retain => "DefaultTime2Retain",
            IscsiParam::MaxOutstandingR2T => "MaxOutstandingR2T",
            IscsiParam::DataPDUInOrder => "DataPDUInOrder",
            IscsiParam::DataSequenceInOrder => "DataSequenceInOrder",
            IscsiParam::ErrorRecoveryLevel => "ErrorRecoveryLevel",
            IscsiParam::AuthMethod => "AuthMethod",
            IscsiParam::ChapLocalName => "CHAP_N",
            IscsiParam::ChapPeerName => "CHAP_PeerN",
            IscsiParam::ChapLocalSecret => "CHAP_Secret",
            IscsiParam::ChapPeerSecret => "CHAP_PeerSecret",
            IscsiParam::ChapChallengeLength => "CHAP_ChallengeLength",
            IscsiParam::ChapEncFmt => "CHAP_EncFmt",
            IscsiParam::ChapTargetAuth => "CHAP_TargetAuth",
        }
    }

    /// Node name relative to the scope node, without the trailing `:`.
    pub fn cfg_name(self) -> &'static str {
        match self {
            IscsiParam::TargetName => "target_name",
            IscsiParam::TargetAddress => "target_addr",
            IscsiParam::TargetPort => "target_port",
            IscsiParam::InitiatorName => "initiator_name",
            IscsiParam::InitiatorAlias => "initiator_alias",
            IscsiParam::SessionType => "session_type",
            IscsiParam::MaxConnections => "max_connections",
            IscsiParam::InitialR2T => "initial_r2t",
            IscsiParam::HeaderDigest => "header_digest",
            IscsiParam::DataDigest => "data_digest",
            IscsiParam::ImmediateData => "immediate_data",
            IscsiParam::MaxRecvDataSegmentLength => "max_recv_data_segment_length",
            IscsiParam::FirstBurstLength => "first_burst_length",
            IscsiParam::MaxBurstLength => "max_burst_length",
            IscsiParam::DefaultTime2Wait => "default_time2wait",
            IscsiParam::DefaultTime2Retain => "default_time2retain",
            IscsiParam::MaxOutstandingR2T => "max_outstanding_r2t",
            IscsiParam::DataPDUInOrder => "data_pdu_in_order",
            IscsiParam::DataSequenceInOrder => "data_sequence_in_order",
            IscsiParam::ErrorRecoveryLevel => "error_recovery_level",
            IscsiParam::AuthMethod => "chap",
            IscsiParam::ChapLocalName => "chap:/local_name",
            IscsiParam::ChapPeerName => "chap:/peer_name",
            IscsiParam::ChapLocalSecret => "chap:/local_secret",
            IscsiParam::ChapPeerSecret => "chap:/peer_secret",
            IscsiParam::ChapChallengeLength => "chap:/challenge_length",
            IscsiParam::ChapEncFmt => "chap:/enc_fmt",
            IscsiParam::ChapTargetAuth => "chap:/target_auth",
        }
    }

    pub fn scope(self) -> ParamScope {
        match self {
            IscsiParam::TargetName | IscsiParam::TargetAddress | IscsiParam::TargetPort => {
                ParamScope::Target
            },
            _ => ParamScope::Connection,
        }
    }

    /// Bit that makes the initiator offer this key; empty when the key is
    /// always sent or never negotiated.
    pub fn offer(self) -> OfferFlags {
        match self {
            IscsiParam::MaxConnections => OfferFlags::MAX_CONNECTIONS,
            IscsiParam::InitialR2T => OfferFlags::INITIAL_R2T,
            IscsiParam::HeaderDigest => OfferFlags::HEADER_DIGEST,
            IscsiParam::DataDigest => OfferFlags::DATA_DIGEST,
            IscsiParam::ImmediateData => OfferFlags::IMMEDIATE_DATA,
            IscsiParam::MaxRecvDataSegmentLength => {
                OfferFlags::MAX_RECV_DATA_SEGMENT_LENGTH
            },
            IscsiParam::MaxBurstLength => OfferFlags::MAX_BURST_LENGTH,
            IscsiParam::FirstBurstLength => OfferFlags::FIRST_BURST_LENGTH,
            IscsiParam::DefaultTime2Wait => OfferFlags::DEFAULT_TIME2WAIT,
            IscsiParam::DefaultTime2Retain => OfferFlags::DEFAULT_TIME2RETAIN,
            IscsiParam::MaxOutstandingR2T => OfferFlags::MAX_OUTSTANDING_R2T,
            IscsiParam::DataPDUInOrder => OfferFlags::DATA_PDU_IN_ORDER,
            IscsiParam::DataSequenceInOrder => OfferFlags::DATA_SEQUENCE_IN_ORDER,
            IscsiParam::ErrorRecoveryLevel => OfferFlags::ERROR_RECOVERY_LEVEL,
            _ => OfferFlags::empty(),
        }
    }

    /// Value a freshly added target or connection starts with.
    pub fn default_value(self) -> Option<&'static str> {
        Some(match self {
            IscsiParam::TargetName => "iqn.2004-01.com:0",
            IscsiParam::InitiatorName => "iqn.1999-11.edu.unh.iol.iscsi-initiator",
            IscsiParam::InitiatorAlias => "UNH",
            IscsiParam::SessionType => "Normal",
            IscsiParam::MaxConnections => "1",
            IscsiParam::InitialR2T => "Yes",
            IscsiParam::HeaderDigest => "None",
            IscsiParam::DataDigest => "None",
            IscsiParam::ImmediateData => "Yes",
            IscsiParam::MaxRecvDataSegmentLength => "8192",
            IscsiParam::FirstBurstLength => "65536",
            IscsiParam::MaxBurstLength => "262144",
            IscsiParam::DefaultTime2Wait => "2",
            IscsiParam::DefaultTime2Retain => "20",
            IscsiParam::MaxOutstandingR2T => "1",
            IscsiParam::DataPDUInOrder => "Yes",
            IscsiParam::DataSequenceInOrder => "Yes",
            IscsiParam::ErrorRecoveryLevel => "0",
            IscsiParam::AuthMethod => "None",
            IscsiParam::ChapChallengeLength => "256",
            _ => return None,
        })
    }

    /// Case-sensitive: `headerdigest` is not `HeaderDigest`.
    pub fn from_wire_name(name: &str) -> Option<IscsiParam> {
        Self::ALL.into_iter().find(|p| p.wire_name() == name)
    }
}

impl fmt::Display for IscsiParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Value of the per-connection `status:` node.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Removed = -1,
    Down = 0,
    Establishing = 1,
    WaitingDevice = 2,
    Up = 3,
    Closing = 4,
    Abnormal = 5,
    RecoverDown = 6,
    RecoverUp = 7,
    Discovering = 8,
}

impl ConnectionStatus {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            -1 => Self::Removed,
            0 => Self::Down,
            1 => Self::Establishing,
            2 => Self::WaitingDevice,
            3 => Self::Up,
            4 => Self::Closing,
            5 => Self::Abnormal,
            6 => Self::RecoverDown,
            7 => Self::RecoverUp,
            8 => Self::Discovering,
            _ => return None,
        })
    }
}
