//! Wire-level types: node identity, the closed message-type enum, node roles,
//! advertised capabilities, and the handshake payload.
//!
//! The core never interprets a message's payload bytes — only its `type` (to
//! pick a handler and a rate-limit bucket) and, for the handshake, its fixed
//! fields. Everything else is opaque to this crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a peer once its handshake has completed. Connections are keyed
/// by this id, not by host — a peer reconnecting from a different socket with
/// the same id is a duplicate connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..4]))
    }
}

/// The role a node plays in the network. Determines which handler table a
/// connection uses and which broadcast groups it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    FullNode = 1,
    Harvester = 2,
    Farmer = 3,
    Timelord = 4,
    Introducer = 5,
    Wallet = 6,
}

impl NodeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::FullNode,
            2 => Self::Harvester,
            3 => Self::Farmer,
            4 => Self::Timelord,
            5 => Self::Introducer,
            6 => Self::Wallet,
            _ => return None,
        })
    }
}

/// A feature flag advertised in the handshake. Both sides intersect their
/// sets to decide which rate-limit table and protocol behaviors apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Capability {
    Base = 1,
    BlockHeaders = 2,
    RateLimitsV2 = 3,
}

impl Capability {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Base,
            2 => Self::BlockHeaders,
            3 => Self::RateLimitsV2,
            _ => return None,
        })
    }
}

/// The handshake payload — the mandatory first message on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub network_id: String,
    pub protocol_version: String,
    pub software_version: String,
    pub server_port: u16,
    pub node_type: u8,
    pub capabilities: Vec<(u16, String)>,
}

impl Handshake {
    /// The mutually-understood capability set with `other`, decoded to the
    /// known [`Capability`] variants. Unknown capability ids are ignored.
    pub fn mutual_capabilities(&self, other: &Handshake) -> Vec<Capability> {
        let ours: Vec<Capability> = self
            .capabilities
            .iter()
            .filter_map(|(id, _)| Capability::from_u16(*id))
            .collect();
        let theirs: Vec<Capability> = other
            .capabilities
            .iter()
            .filter_map(|(id, _)| Capability::from_u16(*id))
            .collect();
        ours.into_iter().filter(|c| theirs.contains(c)).collect()
    }
}

/// A closed enum of message types. Each value maps to exactly one rate-limit
/// bucket; unknown values on the wire are a protocol violation. Numbering
/// follows the network's fixed protocol so it can never be renumbered
/// without a coordinated deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,

    HarvesterHandshake = 3,
    NewProofOfSpace = 5,
    RequestSignatures = 6,
    RespondSignatures = 7,

    NewSignagePoint = 8,
    DeclareProofOfSpace = 9,
    RequestSignedValues = 10,
    SignedValues = 11,
    FarmingInfo = 12,

    NewPeakTimelord = 13,
    NewUnfinishedBlockTimelord = 14,
    NewInfusionPointVdf = 15,
    NewSignagePointVdf = 16,
    NewEndOfSubSlotVdf = 17,
    RequestCompactProofOfTime = 18,
    RespondCompactProofOfTime = 19,

    NewPeak = 20,
    NewTransaction = 21,
    RequestTransaction = 22,
    RespondTransaction = 23,
    RequestProofOfWeight = 24,
    RespondProofOfWeight = 25,
    RequestBlock = 26,
    RespondBlock = 27,
    RejectBlock = 28,
    RequestBlocks = 29,
    RespondBlocks = 30,
    RejectBlocks = 31,
    NewUnfinishedBlock = 32,
    RequestUnfinishedBlock = 33,
    RespondUnfinishedBlock = 34,
    NewSignagePointOrEndOfSubSlot = 35,
    RequestSignagePointOrEndOfSubSlot = 36,
    RespondSignagePoint = 37,
    RespondEndOfSubSlot = 38,
    RequestMempoolTransactions = 39,
    RequestCompactVdf = 40,
    RespondCompactVdf = 41,
    NewCompactVdf = 42,
    RequestPeers = 43,
    RespondPeers = 44,

    RequestPuzzleSolution = 45,
    RespondPuzzleSolution = 46,
    RejectPuzzleSolution = 47,
    SendTransaction = 48,
    TransactionAck = 49,
    NewPeakWallet = 50,
    RequestBlockHeader = 51,
    RespondBlockHeader = 52,
    RejectHeaderRequest = 53,
    RequestRemovals = 54,
    RespondRemovals = 55,
    RejectRemovalsRequest = 56,
    RequestAdditions = 57,
    RespondAdditions = 58,
    RejectAdditionsRequest = 59,
    RequestHeaderBlocks = 60,
    RejectHeaderBlocks = 61,
    RespondHeaderBlocks = 62,

    RequestPeersIntroducer = 63,
    RespondPeersIntroducer = 64,

    FarmNewBlock = 65,

    NewSignagePointHarvester = 66,
    RequestPlots = 67,
    RespondPlots = 68,

    CoinStateUpdate = 69,
    RegisterInterestInPuzzleHash = 70,
    RespondToPhUpdate = 71,
    RegisterInterestInCoin = 72,
    RespondToCoinUpdate = 73,
    RequestChildren = 74,
    RespondChildren = 75,
    RequestSesHashes = 76,
    RespondSesHashes = 77,

    PlotSyncStart = 90,
    PlotSyncLoaded = 91,
    PlotSyncRemoved = 92,
    PlotSyncDone = 93,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            1 => Handshake,
            3 => HarvesterHandshake,
            5 => NewProofOfSpace,
            6 => RequestSignatures,
            7 => RespondSignatures,
            8 => NewSignagePoint,
            9 => DeclareProofOfSpace,
            10 => RequestSignedValues,
            11 => SignedValues,
            12 => FarmingInfo,
            13 => NewPeakTimelord,
            14 => NewUnfinishedBlockTimelord,
            15 => NewInfusionPointVdf,
            16 => NewSignagePointVdf,
            17 => NewEndOfSubSlotVdf,
            18 => RequestCompactProofOfTime,
            19 => RespondCompactProofOfTime,
            20 => NewPeak,
            21 => NewTransaction,
            22 => RequestTransaction,
            23 => RespondTransaction,
            24 => RequestProofOfWeight,
            25 => RespondProofOfWeight,
            26 => RequestBlock,
            27 => RespondBlock,
            28 => RejectBlock,
            29 => RequestBlocks,
            30 => RespondBlocks,
            31 => RejectBlocks,
            32 => NewUnfinishedBlock,
            33 => RequestUnfinishedBlock,
            34 => RespondUnfinishedBlock,
            35 => NewSignagePointOrEndOfSubSlot,
            36 => RequestSignagePointOrEndOfSubSlot,
            37 => RespondSignagePoint,
            38 => RespondEndOfSubSlot,
            39 => RequestMempoolTransactions,
            40 => RequestCompactVdf,
            41 => RespondCompactVdf,
            42 => NewCompactVdf,
            43 => RequestPeers,
            44 => RespondPeers,
            45 => RequestPuzzleSolution,
            46 => RespondPuzzleSolution,
            47 => RejectPuzzleSolution,
            48 => SendTransaction,
            49 => TransactionAck,
            50 => NewPeakWallet,
            51 => RequestBlockHeader,
            52 => RespondBlockHeader,
            53 => RejectHeaderRequest,
            54 => RequestRemovals,
            55 => RespondRemovals,
            56 => RejectRemovalsRequest,
            57 => RequestAdditions,
            58 => RespondAdditions,
            59 => RejectAdditionsRequest,
            60 => RequestHeaderBlocks,
            61 => RejectHeaderBlocks,
            62 => RespondHeaderBlocks,
            63 => RequestPeersIntroducer,
            64 => RespondPeersIntroducer,
            65 => FarmNewBlock,
            66 => NewSignagePointHarvester,
            67 => RequestPlots,
            68 => RespondPlots,
            69 => CoinStateUpdate,
            70 => RegisterInterestInPuzzleHash,
            71 => RespondToPhUpdate,
            72 => RegisterInterestInCoin,
            73 => RespondToCoinUpdate,
            74 => RequestChildren,
            75 => RespondChildren,
            76 => RequestSesHashes,
            77 => RespondSesHashes,
            90 => PlotSyncStart,
            91 => PlotSyncLoaded,
            92 => PlotSyncRemoved,
            93 => PlotSyncDone,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The decoded message envelope handed between the codec, the rate limiter,
/// and the dispatcher. `id` is present on requests expecting a reply and is
/// echoed on the reply.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub id: Option<u16>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(msg_type: MessageType, id: Option<u16>, payload: Bytes) -> Self {
        Self { msg_type, id, payload }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_u8() {
        for nt in [
            NodeType::FullNode,
            NodeType::Harvester,
            NodeType::Farmer,
            NodeType::Timelord,
            NodeType::Introducer,
            NodeType::Wallet,
        ] {
            assert_eq!(NodeType::from_u8(nt as u8), Some(nt));
        }
        assert_eq!(NodeType::from_u8(0), None);
        assert_eq!(NodeType::from_u8(200), None);
    }

    #[test]
    fn message_type_round_trips_through_u8() {
        assert_eq!(MessageType::from_u8(MessageType::Handshake as u8), Some(MessageType::Handshake));
        assert_eq!(MessageType::from_u8(MessageType::RequestBlock as u8), Some(MessageType::RequestBlock));
        assert_eq!(MessageType::from_u8(2), None, "reserved/unassigned values must not decode");
        assert_eq!(MessageType::from_u8(254), None);
    }

    #[test]
    fn mutual_capabilities_is_an_intersection() {
        let a = Handshake {
            network_id: "mainnet".into(),
            protocol_version: "1".into(),
            software_version: "1".into(),
            server_port: 8444,
            node_type: NodeType::FullNode as u8,
            capabilities: vec![(1, "1".into()), (3, "1".into())],
        };
        let b = Handshake {
            capabilities: vec![(1, "1".into()), (2, "1".into())],
            ..a.clone()
        };
        let mutual = a.mutual_capabilities(&b);
        assert_eq!(mutual, vec![Capability::Base]);
    }

    #[test]
    fn node_id_displays_as_hex() {
        let id = NodeId([0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
    }
}
