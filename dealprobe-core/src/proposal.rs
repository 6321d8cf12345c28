//! Proposal builder: derives default collateral and start epoch, assembles and signs the proposal,
//! and wraps it in deal params under a fresh deal id.

use cid::Cid;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use tracing::debug;
use uuid::Uuid;

use crate::api::{ChainApi, Wallet};
use crate::identity::Address;
use crate::protocol::{ClientDealProposal, DealLabel, DealParams, DealProposal, Transfer};
use crate::units::{ChainEpoch, PaddedPieceSize};
use crate::wire::{self, EncodeError};

/// Epochs between the chain head and the default deal start (two days).
pub const START_EPOCH_BUFFER: ChainEpoch = 5760;
/// Default deal duration in epochs (180 days).
pub const DEFAULT_DEAL_DURATION: ChainEpoch = 518_400;

const GIB: u64 = 1 << 30;

/// Caller-supplied deal terms. CIDs arrive as text and are parsed during the build.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalInput {
    pub piece_cid: String,
    pub piece_size: u64,
    pub payload_cid: String,
    pub car_size: u64,
    /// Defaults to the payload CID.
    pub label: Option<String>,
    pub duration: ChainEpoch,
    /// Price per GiB per epoch.
    pub storage_price: TokenAmount,
    pub verified: bool,
    pub provider_collateral: Option<TokenAmount>,
    pub start_epoch: Option<ChainEpoch>,
    pub remove_unsealed_copy: bool,
    pub skip_ipni_announce: bool,
}

impl Default for ProposalInput {
    fn default() -> Self {
        ProposalInput {
            piece_cid: String::new(),
            piece_size: 0,
            payload_cid: String::new(),
            car_size: 0,
            label: None,
            duration: DEFAULT_DEAL_DURATION,
            storage_price: TokenAmount::zero(),
            verified: false,
            provider_collateral: None,
            start_epoch: None,
            remove_unsealed_copy: true,
            skip_ipni_announce: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unable to parse commP : {0}")]
    InvalidPieceCid(String),
    #[error("must provide piece-size parameter for CAR url")]
    ZeroPieceSize,
    #[error("unable to parse payload cid : {0}")]
    InvalidPayloadCid(String),
    #[error("size of car file cannot be 0")]
    ZeroCarSize,
    #[error("node error getting collateral bounds : {0:#}")]
    CollateralBounds(anyhow::Error),
    #[error("unable to get chain head : {0:#}")]
    ChainHead(anyhow::Error),
    #[error("unable to sign deal proposal : {0:#}")]
    Sign(anyhow::Error),
    #[error("unable to encode deal proposal : {0}")]
    Encode(#[from] EncodeError),
}

/// Minimum collateral plus 20%, truncated.
pub fn default_collateral(min: &TokenAmount) -> TokenAmount {
    TokenAmount::from_atto(min.atto() * 6u32 / 5u32)
}

pub fn default_start_epoch(head: ChainEpoch) -> ChainEpoch {
    head + START_EPOCH_BUFFER
}

/// Total price per epoch for a piece, given a price per GiB per epoch.
pub fn storage_price_per_epoch(
    piece_size: PaddedPieceSize,
    price_per_gib: &TokenAmount,
) -> TokenAmount {
    TokenAmount::from_atto(price_per_gib.atto() * piece_size.0 / GIB)
}

pub struct ProposalBuilder<'a> {
    chain: &'a dyn ChainApi,
    wallet: &'a dyn Wallet,
}

impl<'a> ProposalBuilder<'a> {
    pub fn new(chain: &'a dyn ChainApi, wallet: &'a dyn Wallet) -> Self {
        ProposalBuilder { chain, wallet }
    }

    /// Build signed deal params. Every call gets a new deal id.
    pub async fn build(
        &self,
        input: &ProposalInput,
        client: &Address,
        provider: &Address,
    ) -> Result<DealParams, BuildError> {
        let piece_cid: Cid = input
            .piece_cid
            .parse()
            .map_err(|e: cid::Error| BuildError::InvalidPieceCid(e.to_string()))?;
        if input.piece_size == 0 {
            return Err(BuildError::ZeroPieceSize);
        }
        let piece_size = PaddedPieceSize(input.piece_size);
        let root: Cid = input
            .payload_cid
            .parse()
            .map_err(|e: cid::Error| BuildError::InvalidPayloadCid(e.to_string()))?;
        if input.car_size == 0 {
            return Err(BuildError::ZeroCarSize);
        }

        let provider_collateral = match &input.provider_collateral {
            Some(pinned) => pinned.clone(),
            None => {
                let bounds = self
                    .chain
                    .provider_collateral_bounds(piece_size, input.verified)
                    .await
                    .map_err(BuildError::CollateralBounds)?;
                default_collateral(&bounds.min)
            }
        };

        let start_epoch = match input.start_epoch {
            Some(pinned) => pinned,
            None => {
                let head = self.chain.chain_head().await.map_err(BuildError::ChainHead)?;
                debug!(head, "current chain head");
                default_start_epoch(head)
            }
        };

        let proposal = DealProposal {
            piece_cid,
            piece_size,
            verified_deal: input.verified,
            client: *client,
            provider: *provider,
            label: DealLabel::Text(input.label.clone().unwrap_or_else(|| root.to_string())),
            start_epoch,
            end_epoch: start_epoch + input.duration,
            storage_price_per_epoch: storage_price_per_epoch(piece_size, &input.storage_price),
            provider_collateral,
            client_collateral: TokenAmount::zero(),
        };

        let signed_bytes = wire::encode(&proposal)?;
        let client_signature = self
            .wallet
            .sign(client, &signed_bytes)
            .await
            .map_err(BuildError::Sign)?;

        Ok(DealParams {
            deal_uuid: Uuid::new_v4(),
            client_deal_proposal: ClientDealProposal {
                proposal,
                client_signature,
            },
            deal_data_root: root,
            transfer: Transfer {
                size: input.car_size,
                ..Transfer::default()
            },
            is_offline: true,
            remove_unsealed_copy: input.remove_unsealed_copy,
            skip_ipni_announce: input.skip_ipni_announce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CollateralBounds, MinerInfo};
    use crate::identity::Signature;
    use crate::units::SectorSize;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const PIECE: &str = "baga6ea4seaqao7s73y24kcutaosvacpdjgfe5pw76ooefnyqw4ynr3d2y6x2mpq";
    const ROOT: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";

    struct Chain {
        min: TokenAmount,
        head: ChainEpoch,
        fail: bool,
    }

    #[async_trait]
    impl ChainApi for Chain {
        async fn miner_info(&self, _: &Address) -> anyhow::Result<MinerInfo> {
            Ok(MinerInfo {
                peer_id: None,
                multiaddrs: Vec::new(),
                sector_size: SectorSize(2048),
            })
        }

        async fn provider_collateral_bounds(
            &self,
            _: PaddedPieceSize,
            _: bool,
        ) -> anyhow::Result<CollateralBounds> {
            if self.fail {
                anyhow::bail!("gateway down");
            }
            Ok(CollateralBounds {
                min: self.min.clone(),
                max: TokenAmount::from_whole(1_000_000),
            })
        }

        async fn chain_head(&self) -> anyhow::Result<ChainEpoch> {
            Ok(self.head)
        }
    }

    #[derive(Default)]
    struct RecordingWallet {
        signed: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Wallet for RecordingWallet {
        async fn default_address(&self) -> anyhow::Result<Address> {
            Ok(Address::new_id(1001))
        }

        async fn sign(&self, _: &Address, msg: &[u8]) -> anyhow::Result<Signature> {
            self.signed.lock().unwrap().push(msg.to_vec());
            Ok(Signature::new_secp256k1(vec![1; 65]))
        }
    }

    fn input() -> ProposalInput {
        ProposalInput {
            piece_cid: PIECE.to_string(),
            piece_size: 2048,
            payload_cid: ROOT.to_string(),
            car_size: 1024,
            ..ProposalInput::default()
        }
    }

    #[test]
    fn collateral_margin_truncates() {
        let collateral = |atto: u64| default_collateral(&TokenAmount::from_atto(atto));
        assert_eq!(collateral(100), TokenAmount::from_atto(120));
        assert_eq!(collateral(101), TokenAmount::from_atto(121));
        assert_eq!(
            default_collateral(&TokenAmount::from_whole(u64::MAX)),
            TokenAmount::from_atto(TokenAmount::from_whole(u64::MAX).atto() * 6u32 / 5u32)
        );
    }

    #[test]
    fn start_epoch_buffer() {
        assert_eq!(default_start_epoch(1_000_000), 1_005_760);
    }

    #[test]
    fn price_scales_with_piece_size() {
        let per_gib = TokenAmount::from_atto(1u64 << 30);
        assert_eq!(
            storage_price_per_epoch(PaddedPieceSize(2048), &per_gib),
            TokenAmount::from_atto(2048)
        );
        assert_eq!(
            storage_price_per_epoch(PaddedPieceSize(32 << 30), &TokenAmount::from_atto(1)),
            TokenAmount::from_atto(32)
        );
        assert!(storage_price_per_epoch(PaddedPieceSize(32 << 30), &TokenAmount::zero()).is_zero());
    }

    #[tokio::test]
    async fn builds_with_chain_defaults() {
        let chain = Chain {
            min: TokenAmount::from_atto(100),
            head: 1_000_000,
            fail: false,
        };
        let wallet = RecordingWallet::default();
        let builder = ProposalBuilder::new(&chain, &wallet);
        let client = Address::new_id(1001);
        let provider = Address::new_id(1000);

        let params = builder.build(&input(), &client, &provider).await.unwrap();
        let proposal = &params.client_deal_proposal.proposal;
        assert_eq!(proposal.provider_collateral, TokenAmount::from_atto(120));
        assert_eq!(proposal.start_epoch, 1_005_760);
        assert_eq!(proposal.end_epoch, 1_005_760 + DEFAULT_DEAL_DURATION);
        assert_eq!(proposal.label, DealLabel::Text(ROOT.to_string()));
        assert!(proposal.client_collateral.is_zero());
        assert_eq!(params.transfer.size, 1024);
        assert!(params.transfer.transfer_type.is_empty());
        assert!(params.is_offline);
        assert!(params.remove_unsealed_copy);
        assert!(!params.skip_ipni_announce);

        let signed = wallet.signed.lock().unwrap();
        assert_eq!(signed.as_slice(), &[wire::encode(proposal).unwrap()]);
    }

    #[tokio::test]
    async fn pinned_values_skip_chain() {
        let chain = Chain {
            min: TokenAmount::from_atto(100),
            head: 0,
            fail: true,
        };
        let wallet = RecordingWallet::default();
        let builder = ProposalBuilder::new(&chain, &wallet);
        let pinned = ProposalInput {
            provider_collateral: Some(TokenAmount::from_atto(7)),
            start_epoch: Some(42),
            label: Some("mine".to_string()),
            duration: 100,
            ..input()
        };
        let params = builder
            .build(&pinned, &Address::new_id(1), &Address::new_id(2))
            .await
            .unwrap();
        let proposal = &params.client_deal_proposal.proposal;
        assert_eq!(proposal.provider_collateral, TokenAmount::from_atto(7));
        assert_eq!((proposal.start_epoch, proposal.end_epoch), (42, 142));
        assert_eq!(proposal.label, DealLabel::Text("mine".to_string()));
    }

    #[tokio::test]
    async fn each_build_gets_a_new_deal_id() {
        let chain = Chain {
            min: TokenAmount::from_atto(1),
            head: 10,
            fail: false,
        };
        let wallet = RecordingWallet::default();
        let builder = ProposalBuilder::new(&chain, &wallet);
        let (c, p) = (Address::new_id(1), Address::new_id(2));
        let a = builder.build(&input(), &c, &p).await.unwrap();
        let b = builder.build(&input(), &c, &p).await.unwrap();
        assert_ne!(a.deal_uuid, b.deal_uuid);
    }

    #[tokio::test]
    async fn input_errors_are_distinct() {
        let chain = Chain {
            min: TokenAmount::from_atto(1),
            head: 10,
            fail: false,
        };
        let wallet = RecordingWallet::default();
        let builder = ProposalBuilder::new(&chain, &wallet);
        let (c, p) = (Address::new_id(1), Address::new_id(2));

        let cases = [
            (
                ProposalInput {
                    piece_cid: "nope".to_string(),
                    ..input()
                },
                "commP",
            ),
            (
                ProposalInput {
                    piece_size: 0,
                    ..input()
                },
                "piece-size",
            ),
            (
                ProposalInput {
                    payload_cid: String::new(),
                    ..input()
                },
                "payload cid",
            ),
            (
                ProposalInput {
                    car_size: 0,
                    ..input()
                },
                "car file",
            ),
        ];
        for (bad, needle) in cases {
            let err = builder.build(&bad, &c, &p).await.unwrap_err();
            assert!(err.to_string().contains(needle), "{err}");
        }
        assert!(wallet.signed.lock().unwrap().is_empty());

        let failing = Chain {
            min: TokenAmount::from_atto(1),
            head: 10,
            fail: true,
        };
        let builder = ProposalBuilder::new(&failing, &wallet);
        assert!(matches!(
            builder.build(&input(), &c, &p).await,
            Err(BuildError::CollateralBounds(_))
        ));
    }
}
