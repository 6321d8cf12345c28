//! Classified negotiation outcomes and the report handed to callers.

use std::fmt;

use multiaddr::Multiaddr;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::StorageAsk;
use crate::units::{fil, SectorSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Available,
    Unavailable,
    InternalError,
    Unknown,
}

/// Machine-readable reason code. One per terminal stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    ApiGateway,
    InvalidWallet,
    InvalidProvider,
    CannotRetrieveMinerInfo,
    NoPeerIdSetOnChain,
    InvalidMultiAddressInMinerInfo,
    NoMultiAddressSetOnChain,
    ConnectMinerPeerId,
    DealProtocolUnsupported,
    NoMatchingDealProtocolSupported,
    InvalidParamCommP,
    InvalidParamPieceSize,
    InvalidParamPayloadCid,
    InvalidParamCarSize,
    CannotRetrieveMinimumCollateral,
    CannotRetrieveCurrentChainHead,
    GetAsk,
    GetAskPricesNotSetToZero,
    GetAskSizesNotProperlySet,
    SendProposal,
    DiagnosisSuccess,
    ConnectorMisconfigured,
    Sent,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::ApiGateway => "ERR_API_GATEWAY",
            Reason::InvalidWallet => "ERR_INVALID_WALLET",
            Reason::InvalidProvider => "ERR_INVALID_PROVIDER",
            Reason::CannotRetrieveMinerInfo => "ERR_API_GATEWAY_CANNOT_RETRIEVE_MINER_INFO",
            Reason::NoPeerIdSetOnChain => "ERR_NO_PEER_ID_SET_ON_CHAIN",
            Reason::InvalidMultiAddressInMinerInfo => "ERR_INVALID_MULTI_ADDRESS_IN_MINER_INFO",
            Reason::NoMultiAddressSetOnChain => "ERR_NO_MULTI_ADDRESS_SET_ON_CHAIN",
            Reason::ConnectMinerPeerId => "ERR_CONNECT_MINER_PEER_ID",
            Reason::DealProtocolUnsupported => "ERR_DEAL_PROTOCOL_UNSUPPORTED",
            Reason::NoMatchingDealProtocolSupported => "ERR_NO_MATCHING_DEAL_PROTOCOL_SUPPORTED",
            Reason::InvalidParamCommP => "ERR_INVALID_PARAM_COMMP",
            Reason::InvalidParamPieceSize => "ERR_INVALID_PARAM_PIECE_SIZE",
            Reason::InvalidParamPayloadCid => "ERR_INVALID_PARAM_PAYLOAD_CID",
            Reason::InvalidParamCarSize => "ERR_INVALID_PARAM_CAR_SIZE",
            Reason::CannotRetrieveMinimumCollateral => {
                "ERR_API_GATEWAY_CANNOT_RETRIEVE_MINIMUM_COLLATERAL"
            }
            Reason::CannotRetrieveCurrentChainHead => {
                "ERR_API_GATEWAY_CANNOT_RETRIEVE_CURRENT_CHAIN_HEAD"
            }
            Reason::GetAsk => "ERR_GET_ASK",
            Reason::GetAskPricesNotSetToZero => "ERR_GET_ASK_PRICES_NOT_SET_TO_ZERO",
            Reason::GetAskSizesNotProperlySet => "ERR_GET_ASK_SIZES_NOT_PROPERLY_SET",
            Reason::SendProposal => "ERR_SEND_PROPOSAL",
            Reason::DiagnosisSuccess => "DIAGNOSIS_SUCCESS",
            Reason::ConnectorMisconfigured => "ERR_CIDGRAVITY_CONNECTOR_MISCONFIGURED",
            Reason::Sent => "SENT",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Terminal classification of one negotiation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: CheckStatus,
    pub reason: Reason,
    pub message: String,
}

impl Verdict {
    pub fn new(status: CheckStatus, reason: Reason, message: impl Into<String>) -> Self {
        Verdict {
            status,
            reason,
            message: message.into(),
        }
    }

    pub fn internal(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::InternalError, reason, message)
    }

    pub fn unavailable(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(CheckStatus::Unavailable, reason, message)
    }
}

/// Context gathered while negotiating, reported on every outcome.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    pub multiaddrs: Vec<Multiaddr>,
    pub peer_id: Option<PeerId>,
    pub protocol: Option<String>,
    pub sector_size: Option<SectorSize>,
    pub ask: Option<StorageAsk>,
    pub deal_uuid: Option<Uuid>,
}

impl Observed {
    pub fn report(&self, verdict: Verdict) -> NegotiationReport {
        let mut report = NegotiationReport {
            status: verdict.status,
            reason: verdict.reason,
            message: verdict.message,
            multiaddresses: self.multiaddrs.iter().map(|a| a.to_string()).collect(),
            peer_id: self.peer_id.as_ref().map(|p| p.to_string()).unwrap_or_default(),
            deal_protocols_supported: self.protocol.clone().unwrap_or_default(),
            deal_uuid: self.deal_uuid,
            ..NegotiationReport::default()
        };
        if let Some(ask) = &self.ask {
            report.get_ask_price_per_gib = fil(&ask.price);
            report.get_ask_verified_price_per_gib = fil(&ask.verified_price);
            report.get_ask_min_piece_size = ask.min_piece_size.size_str();
            report.get_ask_max_piece_size = ask.max_piece_size.size_str();
            report.get_ask_sector_size = self
                .sector_size
                .map(|s| s.short_string())
                .unwrap_or_default();
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationReport {
    pub status: CheckStatus,
    pub reason: Reason,
    pub message: String,
    pub multiaddresses: Vec<String>,
    pub peer_id: String,
    pub get_ask_price_per_gib: String,
    pub get_ask_verified_price_per_gib: String,
    pub get_ask_min_piece_size: String,
    pub get_ask_max_piece_size: String,
    pub get_ask_sector_size: String,
    pub deal_protocols_supported: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_uuid: Option<Uuid>,
}

impl Default for NegotiationReport {
    fn default() -> Self {
        NegotiationReport {
            status: CheckStatus::Unknown,
            reason: Reason::Sent,
            message: String::new(),
            multiaddresses: Vec::new(),
            peer_id: String::new(),
            get_ask_price_per_gib: String::new(),
            get_ask_verified_price_per_gib: String::new(),
            get_ask_min_piece_size: String::new(),
            get_ask_max_piece_size: String::new(),
            get_ask_sector_size: String::new(),
            deal_protocols_supported: String::new(),
            deal_uuid: None,
        }
    }
}
