//! Negotiation orchestrator: resolve → connect → protocol check → ask → validate → build →
//! submit → classify. Each stage either hands its result to the next or ends the attempt with a
//! [`Verdict`]; the context gathered so far is always reported.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{AddrInfo, ChainApi, MinerInfo, ProviderHost, Wallet};
use crate::ask::{validate_ask, AskViolation};
use crate::identity::{Address, AddressError};
use crate::outcome::{CheckStatus, NegotiationReport, Observed, Reason, Verdict};
use crate::proposal::{BuildError, ProposalBuilder, ProposalInput};
use crate::protocol::{
    AskRequest, AskResponse, DealParams, DealResponse, DealStatusRequest, DealStatusResponse,
    StorageAsk, ASK_PROTOCOL, DEAL_PROTOCOL_V120, DEAL_STATUS_PROTOCOL,
};
use crate::rpc::{self, RpcError};
use crate::units::SectorSize;

/// Rejection text sent back by the diagnostic responder.
pub const DIAGNOSTIC_MARKER: &str = "CIDgravity miner status check successful";

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    /// Deal protocols this client speaks, most preferred first.
    pub deal_protocols: Vec<String>,
    pub ask_protocol: String,
    pub status_protocol: String,
    /// Substring marking a rejection as a successful diagnostic. Empty never matches.
    pub diagnostic_marker: String,
    /// Bound on one stream open plus exchange.
    pub rpc_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        NegotiationConfig {
            deal_protocols: vec![DEAL_PROTOCOL_V120.to_string()],
            ask_protocol: ASK_PROTOCOL.to_string(),
            status_protocol: DEAL_STATUS_PROTOCOL.to_string(),
            diagnostic_marker: DIAGNOSTIC_MARKER.to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// One negotiation attempt as requested by the caller.
#[derive(Debug, Clone)]
pub struct DealRequest {
    pub provider: String,
    /// Client wallet; the wallet's default address when absent.
    pub wallet: Option<String>,
    pub proposal: ProposalInput,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("storage provider {0} has no peer ID set on-chain")]
    NoPeerId(Address),
    #[error("storage provider {0} had invalid multiaddrs in their info: {1}")]
    InvalidMultiaddr(Address, String),
    #[error("storage provider {0} has no multiaddrs set on-chain")]
    NoMultiaddrs(Address),
}

impl ResolveError {
    pub fn reason(&self) -> Reason {
        match self {
            ResolveError::NoPeerId(_) => Reason::NoPeerIdSetOnChain,
            ResolveError::InvalidMultiaddr(..) => Reason::InvalidMultiAddressInMinerInfo,
            ResolveError::NoMultiaddrs(_) => Reason::NoMultiAddressSetOnChain,
        }
    }
}

/// Network identity of a provider from its on-chain miner info.
pub fn resolve_addr_info(miner: &Address, info: &MinerInfo) -> Result<AddrInfo, ResolveError> {
    let peer_id = info
        .peer_id
        .clone()
        .ok_or_else(|| ResolveError::NoPeerId(miner.clone()))?;
    let addrs = info
        .multiaddrs
        .iter()
        .map(|raw| multiaddr::Multiaddr::try_from(raw.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ResolveError::InvalidMultiaddr(miner.clone(), e.to_string()))?;
    if addrs.is_empty() {
        return Err(ResolveError::NoMultiaddrs(miner.clone()));
    }
    Ok(AddrInfo { peer_id, addrs })
}

/// Classify the provider's reply. Acceptance is never expected on this path and is flagged.
pub fn classify(resp: &DealResponse, marker: &str) -> Verdict {
    if resp.accepted {
        return Verdict::new(
            CheckStatus::Unknown,
            Reason::Sent,
            "deal proposal was accepted, which should not happen for a status check",
        );
    }
    if !marker.is_empty() && resp.message.contains(marker) {
        return Verdict::new(
            CheckStatus::Available,
            Reason::DiagnosisSuccess,
            "deal proposal successfully sent and received",
        );
    }
    Verdict::unavailable(Reason::ConnectorMisconfigured, resp.message.clone())
}

fn ask_verdict(violation: &AskViolation) -> Verdict {
    let reason = match violation {
        AskViolation::NonZeroPrice { .. } => Reason::GetAskPricesNotSetToZero,
        AskViolation::SizeBounds { .. } => Reason::GetAskSizesNotProperlySet,
    };
    Verdict::unavailable(reason, violation.to_string())
}

fn build_verdict(err: &BuildError) -> Verdict {
    let reason = match err {
        BuildError::InvalidPieceCid(_) => Reason::InvalidParamCommP,
        BuildError::ZeroPieceSize => Reason::InvalidParamPieceSize,
        BuildError::InvalidPayloadCid(_) => Reason::InvalidParamPayloadCid,
        BuildError::ZeroCarSize => Reason::InvalidParamCarSize,
        BuildError::CollateralBounds(_) => Reason::CannotRetrieveMinimumCollateral,
        BuildError::ChainHead(_) => Reason::CannotRetrieveCurrentChainHead,
        BuildError::Sign(_) | BuildError::Encode(_) => {
            return Verdict::internal(
                Reason::SendProposal,
                format!("unable to create a deal proposal : {err}"),
            )
        }
    };
    Verdict::internal(reason, err.to_string())
}

/// Map an exchange failure to a verdict, distinguishing stream-open failures.
fn rpc_verdict(reason: Reason, err: &RpcError, open_msg: &str, exchange_msg: &str) -> Verdict {
    let message = match err {
        RpcError::Open(e) => format!("{open_msg} : {e:#}"),
        other => format!("{exchange_msg} : {other}"),
    };
    Verdict::unavailable(reason, message)
}

pub struct Negotiator<H> {
    chain: Arc<dyn ChainApi>,
    wallet: Arc<dyn Wallet>,
    host: H,
    config: NegotiationConfig,
}

impl<H: ProviderHost> Negotiator<H> {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn Wallet>,
        host: H,
        config: NegotiationConfig,
    ) -> Self {
        Negotiator {
            chain,
            wallet,
            host,
            config,
        }
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    /// Run one attempt and report its outcome. Never fails: every failure is a classified report.
    pub async fn negotiate(&self, req: &DealRequest) -> NegotiationReport {
        let mut observed = Observed::default();
        let verdict = match self.run(req, &mut observed).await {
            Ok(v) | Err(v) => v,
        };
        info!(
            provider = %req.provider,
            status = ?verdict.status,
            reason = %verdict.reason,
            message = %verdict.message,
            "negotiation finished"
        );
        observed.report(verdict)
    }

    async fn run(&self, req: &DealRequest, observed: &mut Observed) -> Result<Verdict, Verdict> {
        let client = self.client_address(req.wallet.as_deref()).await?;
        debug!(wallet = %client, "selected wallet");

        let provider: Address = req
            .provider
            .parse()
            .map_err(|e: AddressError| Verdict::internal(Reason::InvalidProvider, e.to_string()))?;

        let (peer, sector_size) = self.resolve(&provider).await?;
        observed.multiaddrs = peer.addrs.clone();
        observed.peer_id = Some(peer.peer_id.clone());
        observed.sector_size = Some(sector_size);
        debug!(peer = %peer.peer_id, addrs = ?peer.addrs, %provider, "found storage provider");

        self.host.connect(&peer).await.map_err(|e| {
            Verdict::unavailable(Reason::ConnectMinerPeerId, format!("{e:#}"))
        })?;

        let protocol = self.deal_protocol(&peer).await?;
        observed.protocol = Some(protocol.clone());

        let ask = self.fetch_ask(&peer, &provider).await?;
        observed.ask = Some(ask.clone());
        debug!(
            price = %ask.price,
            verified_price = %ask.verified_price,
            min_piece_size = %ask.min_piece_size,
            max_piece_size = %ask.max_piece_size,
            %sector_size,
            "found get ask information"
        );
        validate_ask(&ask, sector_size).map_err(|v| {
            warn!(%provider, violation = %v, "ask rejected");
            ask_verdict(&v)
        })?;

        let params = ProposalBuilder::new(self.chain.as_ref(), self.wallet.as_ref())
            .build(&req.proposal, &client, &provider)
            .await
            .map_err(|e| build_verdict(&e))?;
        observed.deal_uuid = Some(params.deal_uuid);
        debug!(uuid = %params.deal_uuid, "about to submit deal proposal");

        let resp = self.submit(&peer, &protocol, &params).await?;
        if !resp.accepted {
            warn!(%provider, message = %resp.message, "deal proposal rejected");
        }
        Ok(classify(&resp, &self.config.diagnostic_marker))
    }

    async fn client_address(&self, wallet: Option<&str>) -> Result<Address, Verdict> {
        match wallet {
            Some(s) if !s.is_empty() => s
                .parse()
                .map_err(|e: AddressError| Verdict::internal(Reason::InvalidWallet, e.to_string())),
            _ => self
                .wallet
                .default_address()
                .await
                .map_err(|e| Verdict::internal(Reason::InvalidWallet, format!("{e:#}"))),
        }
    }

    async fn resolve(&self, provider: &Address) -> Result<(AddrInfo, SectorSize), Verdict> {
        let info = self.chain.miner_info(provider).await.map_err(|e| {
            Verdict::unavailable(Reason::CannotRetrieveMinerInfo, format!("{e:#}"))
        })?;
        let peer = resolve_addr_info(provider, &info)
            .map_err(|e| Verdict::unavailable(e.reason(), e.to_string()))?;
        Ok((peer, info.sector_size))
    }

    /// First configured deal protocol the provider supports.
    async fn deal_protocol(&self, peer: &AddrInfo) -> Result<String, Verdict> {
        let supported = self
            .host
            .supported_protocols(peer, &self.config.deal_protocols)
            .await
            .map_err(|e| {
                Verdict::unavailable(Reason::DealProtocolUnsupported, format!("{e:#}"))
            })?;
        supported.into_iter().next().ok_or_else(|| {
            Verdict::unavailable(
                Reason::NoMatchingDealProtocolSupported,
                format!(
                    "client cannot make a deal with storage provider because it does not support {}",
                    self.config.deal_protocols.join(", ")
                ),
            )
        })
    }

    async fn fetch_ask(&self, peer: &AddrInfo, provider: &Address) -> Result<StorageAsk, Verdict> {
        debug!(%provider, "about to send a get ask request");
        let req = AskRequest {
            miner: provider.clone(),
        };
        let resp: AskResponse = rpc::call(
            &self.host,
            peer,
            &self.config.ask_protocol,
            &req,
            self.config.rpc_timeout,
        )
        .await
        .map_err(|e| {
            rpc_verdict(
                Reason::GetAsk,
                &e,
                "failed to open stream to address",
                "error while send get ask request rpc",
            )
        })?;
        match resp.ask {
            Some(signed) => Ok(signed.ask),
            None => Err(Verdict::unavailable(
                Reason::GetAsk,
                "provider returned an empty ask",
            )),
        }
    }

    async fn submit(
        &self,
        peer: &AddrInfo,
        protocol: &str,
        params: &DealParams,
    ) -> Result<DealResponse, Verdict> {
        rpc::call(&self.host, peer, protocol, params, self.config.rpc_timeout)
            .await
            .map_err(|e| {
                rpc_verdict(
                    Reason::SendProposal,
                    &e,
                    "failed to open stream to peer",
                    "error while send proposal rpc",
                )
            })
    }

    /// Ask a provider for the status of a deal it received.
    pub async fn deal_status(
        &self,
        provider: &str,
        deal_uuid: Uuid,
    ) -> Result<DealStatusResponse, StatusQueryError> {
        let provider: Address = provider.parse()?;
        let info = self
            .chain
            .miner_info(&provider)
            .await
            .map_err(StatusQueryError::MinerInfo)?;
        let peer = resolve_addr_info(&provider, &info)?;
        self.host
            .connect(&peer)
            .await
            .map_err(StatusQueryError::Connect)?;
        debug!(%provider, %deal_uuid, "querying deal status");
        let resp = rpc::call(
            &self.host,
            &peer,
            &self.config.status_protocol,
            &DealStatusRequest { deal_uuid },
            self.config.rpc_timeout,
        )
        .await?;
        Ok(resp)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusQueryError {
    #[error("invalid provider address: {0}")]
    InvalidProvider(#[from] AddressError),
    #[error("unable to retrieve miner info: {0:#}")]
    MinerInfo(anyhow::Error),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("unable to connect to provider: {0:#}")]
    Connect(anyhow::Error),
    #[error("deal status rpc failed: {0}")]
    Rpc(#[from] RpcError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    fn reply(accepted: bool, message: &str) -> DealResponse {
        DealResponse {
            accepted,
            message: message.to_string(),
        }
    }

    #[test]
    fn marker_rejection_is_diagnostic_success() {
        let v = classify(
            &reply(false, "deal rejected: CIDgravity miner status check successful (id 4)"),
            DIAGNOSTIC_MARKER,
        );
        assert_eq!(v.status, CheckStatus::Available);
        assert_eq!(v.reason, Reason::DiagnosisSuccess);
    }

    #[test]
    fn other_rejection_is_misconfigured() {
        let v = classify(&reply(false, "no space"), DIAGNOSTIC_MARKER);
        assert_eq!(
            v,
            Verdict::unavailable(Reason::ConnectorMisconfigured, "no space")
        );
    }

    #[test]
    fn acceptance_is_unknown() {
        let v = classify(&reply(true, DIAGNOSTIC_MARKER), DIAGNOSTIC_MARKER);
        assert_eq!((v.status, v.reason), (CheckStatus::Unknown, Reason::Sent));
    }

    #[test]
    fn empty_marker_never_matches() {
        let v = classify(&reply(false, "anything"), "");
        assert_eq!(v.reason, Reason::ConnectorMisconfigured);
    }

    #[test]
    fn resolve_reasons() {
        let miner = Address::new_id(1000);
        let good: multiaddr::Multiaddr = "/ip4/10.0.0.1/tcp/24001".parse().unwrap();
        let peer_id = PeerId::from_bytes(&[0, 4, 1, 2, 3, 4]).unwrap();

        let mut info = MinerInfo {
            peer_id: None,
            multiaddrs: vec![good.to_vec()],
            sector_size: SectorSize(2048),
        };
        assert_eq!(
            resolve_addr_info(&miner, &info).unwrap_err().reason(),
            Reason::NoPeerIdSetOnChain
        );

        info.peer_id = Some(peer_id.clone());
        info.multiaddrs.push(vec![0xff, 0xff, 0xff]);
        assert_eq!(
            resolve_addr_info(&miner, &info).unwrap_err().reason(),
            Reason::InvalidMultiAddressInMinerInfo
        );

        info.multiaddrs.clear();
        let err = resolve_addr_info(&miner, &info).unwrap_err();
        assert_eq!(err.reason(), Reason::NoMultiAddressSetOnChain);
        assert_eq!(
            err.to_string(),
            "storage provider f01000 has no multiaddrs set on-chain"
        );

        info.multiaddrs.push(good.to_vec());
        let resolved = resolve_addr_info(&miner, &info).unwrap();
        assert_eq!(resolved.peer_id, peer_id);
        assert_eq!(resolved.addrs, vec![good]);
    }

    #[test]
    fn build_errors_map_to_param_reasons() {
        assert_eq!(
            build_verdict(&BuildError::ZeroCarSize),
            Verdict::internal(Reason::InvalidParamCarSize, "size of car file cannot be 0")
        );
        let v = build_verdict(&BuildError::Sign(anyhow::anyhow!("locked")));
        assert_eq!(v.reason, Reason::SendProposal);
        assert!(v.message.ends_with("locked"));
    }
}
