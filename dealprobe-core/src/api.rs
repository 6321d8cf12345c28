//! Collaborators the negotiation engine drives but does not implement: chain state, the client
//! wallet, and the peer-to-peer host. Errors are opaque (`anyhow`) and end up in outcome messages.

use async_trait::async_trait;
use fvm_shared::econ::TokenAmount;
use multiaddr::Multiaddr;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::{Address, PeerId, Signature};
use crate::units::{ChainEpoch, PaddedPieceSize, SectorSize};

/// On-chain miner info relevant to reaching the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerInfo {
    pub peer_id: Option<PeerId>,
    /// Raw multiaddr bytes as stored on chain; may be malformed.
    pub multiaddrs: Vec<Vec<u8>>,
    pub sector_size: SectorSize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralBounds {
    pub min: TokenAmount,
    pub max: TokenAmount,
}

/// Resolved network identity of a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn miner_info(&self, miner: &Address) -> anyhow::Result<MinerInfo>;

    async fn provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> anyhow::Result<CollateralBounds>;

    /// Height of the current chain head.
    async fn chain_head(&self) -> anyhow::Result<ChainEpoch>;
}

#[async_trait]
pub trait Wallet: Send + Sync {
    async fn default_address(&self) -> anyhow::Result<Address>;

    async fn sign(&self, signer: &Address, msg: &[u8]) -> anyhow::Result<Signature>;
}

/// Peer-to-peer host: dial a provider, ask which protocols it speaks, open protocol streams.
#[async_trait]
pub trait ProviderHost: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self, peer: &AddrInfo) -> anyhow::Result<()>;

    /// The subset of `candidates` the peer supports, in the order given.
    async fn supported_protocols(
        &self,
        peer: &AddrInfo,
        candidates: &[String],
    ) -> anyhow::Result<Vec<String>>;

    async fn open_stream(&self, peer: &AddrInfo, protocol: &str) -> anyhow::Result<Self::Stream>;
}
