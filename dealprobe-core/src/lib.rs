//! Storage deal negotiation engine.
//! No concrete I/O: chain, wallet, provider host and deal store are supplied by the host program.

pub mod api;
pub mod ask;
pub mod checkpoint;
pub mod dealfilter;
pub mod identity;
pub mod negotiation;
pub mod outcome;
pub mod proposal;
pub mod protocol;
pub mod rpc;
pub mod staging;
pub mod units;
pub mod wire;

pub use api::{AddrInfo, ChainApi, CollateralBounds, MinerInfo, ProviderHost, Wallet};
pub use checkpoint::{Checkpoint, CheckpointStatus, DealRecord, DealStore};
pub use fvm_shared::econ::TokenAmount;
pub use identity::{Address, PeerId, Signature, SignatureType};
pub use negotiation::{DealRequest, NegotiationConfig, Negotiator};
pub use outcome::{CheckStatus, NegotiationReport, Reason, Verdict};
pub use proposal::ProposalInput;
pub use units::{ChainEpoch, PaddedPieceSize, SectorSize};
