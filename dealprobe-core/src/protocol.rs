//! Deal negotiation messages and their wire schemas.
//!
//! Map-encoded messages use the exact field names below as keys; the signed proposal is a tuple.
//! The JSON forms (serde) follow the same names and are what the storage deal filter receives.

use cid::Cid;
use fvm_shared::econ::TokenAmount;
use num_traits::Signed;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::identity::{serialize_address, serialize_signature, Address, Signature};
use crate::units::{serialize_atto, ChainEpoch, PaddedPieceSize};
use crate::wire::{DecodeError, EncodeError, Field, Fields, Kind, Record, Repr, Schema, Value};

/// Storage deal proposal protocol (v1.2.0).
pub const DEAL_PROTOCOL_V120: &str = "/fil/storage/mk/1.2.0";
/// Storage ask query protocol.
pub const ASK_PROTOCOL: &str = "/fil/storage/ask/1.1.0";
/// Deal status query protocol.
pub const DEAL_STATUS_PROTOCOL: &str = "/boost/status/1.2.0";

const fn field(name: &'static str, kind: Kind) -> Field {
    Field { name, kind }
}

pub const STORAGE_ASK: Schema = Schema {
    name: "StorageAsk",
    repr: Repr::Map,
    fields: &[
        field("Price", Kind::Bytes),
        field("VerifiedPrice", Kind::Bytes),
        field("MinPieceSize", Kind::Uint),
        field("MaxPieceSize", Kind::Uint),
        field("Miner", Kind::Bytes),
        field("Timestamp", Kind::Int),
        field("Expiry", Kind::Int),
        field("SeqNo", Kind::Uint),
    ],
};

pub const SIGNED_STORAGE_ASK: Schema = Schema {
    name: "SignedStorageAsk",
    repr: Repr::Map,
    fields: &[
        field("Ask", Kind::Record(&STORAGE_ASK)),
        field("Signature", Kind::Nullable(&Kind::Bytes)),
    ],
};

pub const ASK_REQUEST: Schema = Schema {
    name: "AskRequest",
    repr: Repr::Map,
    fields: &[field("Miner", Kind::Bytes)],
};

pub const ASK_RESPONSE: Schema = Schema {
    name: "AskResponse",
    repr: Repr::Map,
    fields: &[field("Ask", Kind::Nullable(&Kind::Record(&SIGNED_STORAGE_ASK)))],
};

pub const TRANSFER: Schema = Schema {
    name: "Transfer",
    repr: Repr::Map,
    fields: &[
        field("Type", Kind::Text),
        field("ClientID", Kind::Text),
        field("Params", Kind::Bytes),
        field("Size", Kind::Uint),
    ],
};

pub const DEAL_PROPOSAL: Schema = Schema {
    name: "DealProposal",
    repr: Repr::Tuple,
    fields: &[
        field("PieceCID", Kind::Cid),
        field("PieceSize", Kind::Uint),
        field("VerifiedDeal", Kind::Bool),
        field("Client", Kind::Bytes),
        field("Provider", Kind::Bytes),
        field("Label", Kind::TextOrBytes),
        field("StartEpoch", Kind::Int),
        field("EndEpoch", Kind::Int),
        field("StoragePricePerEpoch", Kind::Bytes),
        field("ProviderCollateral", Kind::Bytes),
        field("ClientCollateral", Kind::Bytes),
    ],
};

pub const CLIENT_DEAL_PROPOSAL: Schema = Schema {
    name: "ClientDealProposal",
    repr: Repr::Tuple,
    fields: &[
        field("Proposal", Kind::Record(&DEAL_PROPOSAL)),
        field("ClientSignature", Kind::Bytes),
    ],
};

pub const DEAL_PARAMS: Schema = Schema {
    name: "DealParams",
    repr: Repr::Map,
    fields: &[
        field("DealUUID", Kind::FixedBytes(16)),
        field("ClientDealProposal", Kind::Record(&CLIENT_DEAL_PROPOSAL)),
        field("DealDataRoot", Kind::Cid),
        field("Transfer", Kind::Record(&TRANSFER)),
        field("IsOffline", Kind::Bool),
        field("RemoveUnsealedCopy", Kind::Bool),
        field("SkipIPNIAnnounce", Kind::Bool),
    ],
};

pub const DEAL_RESPONSE: Schema = Schema {
    name: "DealResponse",
    repr: Repr::Map,
    fields: &[field("Accepted", Kind::Bool), field("Message", Kind::Text)],
};

pub const DEAL_STATUS_REQUEST: Schema = Schema {
    name: "DealStatusRequest",
    repr: Repr::Map,
    fields: &[field("DealUUID", Kind::FixedBytes(16))],
};

pub const DEAL_STATUS_RESPONSE: Schema = Schema {
    name: "DealStatusResponse",
    repr: Repr::Map,
    fields: &[
        field("DealUUID", Kind::FixedBytes(16)),
        field("Error", Kind::Text),
        field("DealStatus", Kind::Text),
    ],
};

fn invalid(field: &'static str, err: impl std::fmt::Display) -> DecodeError {
    DecodeError::Invalid {
        field,
        reason: err.to_string(),
    }
}

fn address(fields: &mut Fields, name: &'static str) -> Result<Address, DecodeError> {
    Address::from_bytes(&fields.bytes(name)?).map_err(|e| invalid(name, e))
}

/// Token amounts on this protocol are never negative.
fn amount(fields: &mut Fields, name: &'static str) -> Result<TokenAmount, DecodeError> {
    let amount: TokenAmount = fields.decoded(name)?;
    if amount.atto().is_negative() {
        return Err(invalid(name, "negative token amount"));
    }
    Ok(amount)
}

fn uuid(fields: &mut Fields, name: &'static str) -> Result<Uuid, DecodeError> {
    fields.fixed::<16>(name).map(Uuid::from_bytes)
}

/// Int-kind epoch as a wire value.
fn epoch(e: ChainEpoch) -> Value {
    Value::Int(e)
}

fn serialize_link<S: Serializer>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry("/", &cid.to_string())?;
    map.end()
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Provider's advertised terms. Prices are per GiB per epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageAsk {
    #[serde(serialize_with = "serialize_atto")]
    pub price: TokenAmount,
    #[serde(serialize_with = "serialize_atto")]
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    #[serde(serialize_with = "serialize_address")]
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

impl Record for StorageAsk {
    const SCHEMA: &'static Schema = &STORAGE_ASK;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::encoded(&self.price)?,
            Value::encoded(&self.verified_price)?,
            Value::Uint(self.min_piece_size.0),
            Value::Uint(self.max_piece_size.0),
            Value::Bytes(self.miner.to_bytes()),
            epoch(self.timestamp),
            epoch(self.expiry),
            Value::Uint(self.seq_no),
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(StorageAsk {
            price: amount(&mut f, "Price")?,
            verified_price: amount(&mut f, "VerifiedPrice")?,
            min_piece_size: PaddedPieceSize(f.uint("MinPieceSize")?),
            max_piece_size: PaddedPieceSize(f.uint("MaxPieceSize")?),
            miner: address(&mut f, "Miner")?,
            timestamp: f.int("Timestamp")?,
            expiry: f.int("Expiry")?,
            seq_no: f.uint("SeqNo")?,
        })
    }
}

/// An ask with the provider worker's signature over it. The signature is not checked here.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Option<Signature>,
}

impl Record for SignedStorageAsk {
    const SCHEMA: &'static Schema = &SIGNED_STORAGE_ASK;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Record(self.ask.to_values()?),
            match &self.signature {
                Some(sig) => Value::encoded(sig)?,
                None => Value::Null,
            },
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(SignedStorageAsk {
            ask: f.record("Ask")?,
            signature: f.decoded_opt("Signature")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    pub miner: Address,
}

impl Record for AskRequest {
    const SCHEMA: &'static Schema = &ASK_REQUEST;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![Value::Bytes(self.miner.to_bytes())])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(AskRequest {
            miner: address(&mut f, "Miner")?,
        })
    }
}

/// A provider without a current ask answers with a null `Ask`.
#[derive(Debug, Clone, PartialEq)]
pub struct AskResponse {
    pub ask: Option<SignedStorageAsk>,
}

impl Record for AskResponse {
    const SCHEMA: &'static Schema = &ASK_RESPONSE;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![match &self.ask {
            Some(signed) => Value::Record(signed.to_values()?),
            None => Value::Null,
        }])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(AskResponse {
            ask: f.record_opt("Ask")?,
        })
    }
}

/// How the provider will fetch the deal data. Offline deals leave `transfer_type` empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Transfer {
    #[serde(rename = "Type")]
    pub transfer_type: String,
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "Params", serialize_with = "serialize_base64")]
    pub params: Vec<u8>,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl Record for Transfer {
    const SCHEMA: &'static Schema = &TRANSFER;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Text(self.transfer_type.clone()),
            Value::Text(self.client_id.clone()),
            Value::Bytes(self.params.clone()),
            Value::Uint(self.size),
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(Transfer {
            transfer_type: f.text("Type")?,
            client_id: f.text("ClientID")?,
            params: f.bytes("Params")?,
            size: f.uint("Size")?,
        })
    }
}

/// Deal label: text on the wire for UTF-8 labels, a byte string otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealLabel {
    Text(String),
    Bytes(Vec<u8>),
}

impl Default for DealLabel {
    fn default() -> Self {
        DealLabel::Text(String::new())
    }
}

impl From<String> for DealLabel {
    fn from(s: String) -> Self {
        DealLabel::Text(s)
    }
}

impl DealLabel {
    fn to_value(&self) -> Value {
        match self {
            DealLabel::Text(s) => Value::Text(s.clone()),
            DealLabel::Bytes(b) => Value::Bytes(b.clone()),
        }
    }

    fn from_value(field: &'static str, value: Value) -> Result<Self, DecodeError> {
        match value {
            Value::Text(s) => Ok(DealLabel::Text(s)),
            Value::Bytes(b) => Ok(DealLabel::Bytes(b)),
            _ => Err(DecodeError::Shape {
                record: DEAL_PROPOSAL.name,
                field,
            }),
        }
    }
}

/// Text labels stay strings in JSON; byte labels become base64.
impl Serialize for DealLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DealLabel::Text(s) => serializer.serialize_str(s),
            DealLabel::Bytes(b) => serialize_base64(b, serializer),
        }
    }
}

/// The terms the client signs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealProposal {
    #[serde(rename = "PieceCID", serialize_with = "serialize_link")]
    pub piece_cid: Cid,
    #[serde(rename = "PieceSize")]
    pub piece_size: PaddedPieceSize,
    #[serde(rename = "VerifiedDeal")]
    pub verified_deal: bool,
    #[serde(rename = "Client", serialize_with = "serialize_address")]
    pub client: Address,
    #[serde(rename = "Provider", serialize_with = "serialize_address")]
    pub provider: Address,
    #[serde(rename = "Label")]
    pub label: DealLabel,
    #[serde(rename = "StartEpoch")]
    pub start_epoch: ChainEpoch,
    #[serde(rename = "EndEpoch")]
    pub end_epoch: ChainEpoch,
    #[serde(rename = "StoragePricePerEpoch", serialize_with = "serialize_atto")]
    pub storage_price_per_epoch: TokenAmount,
    #[serde(rename = "ProviderCollateral", serialize_with = "serialize_atto")]
    pub provider_collateral: TokenAmount,
    #[serde(rename = "ClientCollateral", serialize_with = "serialize_atto")]
    pub client_collateral: TokenAmount,
}

impl Record for DealProposal {
    const SCHEMA: &'static Schema = &DEAL_PROPOSAL;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Cid(self.piece_cid),
            Value::Uint(self.piece_size.0),
            Value::Bool(self.verified_deal),
            Value::Bytes(self.client.to_bytes()),
            Value::Bytes(self.provider.to_bytes()),
            self.label.to_value(),
            epoch(self.start_epoch),
            epoch(self.end_epoch),
            Value::encoded(&self.storage_price_per_epoch)?,
            Value::encoded(&self.provider_collateral)?,
            Value::encoded(&self.client_collateral)?,
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(DealProposal {
            piece_cid: f.cid("PieceCID")?,
            piece_size: PaddedPieceSize(f.uint("PieceSize")?),
            verified_deal: f.bool("VerifiedDeal")?,
            client: address(&mut f, "Client")?,
            provider: address(&mut f, "Provider")?,
            label: DealLabel::from_value("Label", f.value("Label")?)?,
            start_epoch: f.int("StartEpoch")?,
            end_epoch: f.int("EndEpoch")?,
            storage_price_per_epoch: amount(&mut f, "StoragePricePerEpoch")?,
            provider_collateral: amount(&mut f, "ProviderCollateral")?,
            client_collateral: amount(&mut f, "ClientCollateral")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    #[serde(serialize_with = "serialize_signature")]
    pub client_signature: Signature,
}

impl Record for ClientDealProposal {
    const SCHEMA: &'static Schema = &CLIENT_DEAL_PROPOSAL;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Record(self.proposal.to_values()?),
            Value::encoded(&self.client_signature)?,
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(ClientDealProposal {
            proposal: f.record("Proposal")?,
            client_signature: f.decoded("ClientSignature")?,
        })
    }
}

/// Submission envelope for one negotiation attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DealParams {
    #[serde(rename = "DealUUID")]
    pub deal_uuid: Uuid,
    #[serde(rename = "ClientDealProposal")]
    pub client_deal_proposal: ClientDealProposal,
    #[serde(rename = "DealDataRoot", serialize_with = "serialize_link")]
    pub deal_data_root: Cid,
    #[serde(rename = "Transfer")]
    pub transfer: Transfer,
    #[serde(rename = "IsOffline")]
    pub is_offline: bool,
    #[serde(rename = "RemoveUnsealedCopy")]
    pub remove_unsealed_copy: bool,
    #[serde(rename = "SkipIPNIAnnounce")]
    pub skip_ipni_announce: bool,
}

impl Record for DealParams {
    const SCHEMA: &'static Schema = &DEAL_PARAMS;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Bytes(self.deal_uuid.as_bytes().to_vec()),
            Value::Record(self.client_deal_proposal.to_values()?),
            Value::Cid(self.deal_data_root),
            Value::Record(self.transfer.to_values()?),
            Value::Bool(self.is_offline),
            Value::Bool(self.remove_unsealed_copy),
            Value::Bool(self.skip_ipni_announce),
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(DealParams {
            deal_uuid: uuid(&mut f, "DealUUID")?,
            client_deal_proposal: f.record("ClientDealProposal")?,
            deal_data_root: f.cid("DealDataRoot")?,
            transfer: f.record("Transfer")?,
            is_offline: f.bool("IsOffline")?,
            remove_unsealed_copy: f.bool("RemoveUnsealedCopy")?,
            skip_ipni_announce: f.bool("SkipIPNIAnnounce")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealResponse {
    pub accepted: bool,
    pub message: String,
}

impl Record for DealResponse {
    const SCHEMA: &'static Schema = &DEAL_RESPONSE;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![Value::Bool(self.accepted), Value::Text(self.message.clone())])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(DealResponse {
            accepted: f.bool("Accepted")?,
            message: f.text("Message")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealStatusRequest {
    pub deal_uuid: Uuid,
}

impl Record for DealStatusRequest {
    const SCHEMA: &'static Schema = &DEAL_STATUS_REQUEST;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![Value::Bytes(self.deal_uuid.as_bytes().to_vec())])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(DealStatusRequest {
            deal_uuid: uuid(&mut f, "DealUUID")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DealStatusResponse {
    #[serde(rename = "DealUUID")]
    pub deal_uuid: Uuid,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "DealStatus")]
    pub deal_status: String,
}

impl Record for DealStatusResponse {
    const SCHEMA: &'static Schema = &DEAL_STATUS_RESPONSE;

    fn to_values(&self) -> Result<Vec<Value>, EncodeError> {
        Ok(vec![
            Value::Bytes(self.deal_uuid.as_bytes().to_vec()),
            Value::Text(self.error.clone()),
            Value::Text(self.deal_status.clone()),
        ])
    }

    fn from_fields(mut f: Fields) -> Result<Self, DecodeError> {
        Ok(DealStatusResponse {
            deal_uuid: uuid(&mut f, "DealUUID")?,
            error: f.text("Error")?,
            deal_status: f.text("DealStatus")?,
        })
    }
}
