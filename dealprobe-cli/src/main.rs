// dealprobe: storage deal negotiation client. Results go to stdout as JSON, logs to stderr.

mod config;
mod gateway;
mod store;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use dealprobe_core::api::{ChainApi, Wallet};
use dealprobe_core::dealfilter::{
    CliDealFilter, CliRetrievalDealFilter, DealFilterParams, FilterDecision, RetrievalDealState,
};
use dealprobe_core::outcome::Observed;
use dealprobe_core::proposal::{ProposalBuilder, DEFAULT_DEAL_DURATION};
use dealprobe_core::units::parse_atto;
use dealprobe_core::{
    checkpoint, staging, Address, ChainEpoch, DealRequest, Negotiator, ProposalInput, Reason,
    TokenAmount, Verdict,
};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Config;
use crate::gateway::{LotusGateway, LotusWallet, RpcClient};
use crate::store::SqliteDealStore;
use crate::transport::Libp2pHost;

#[derive(Parser)]
#[command(name = "dealprobe", version, about = "Storage deal negotiation client")]
struct Cli {
    /// Config file (default: ~/.config/dealprobe/config.toml, /etc/dealprobe/config.toml)
    #[arg(long, env = "DEALPROBE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a status-check deal proposal to a provider and report how it was handled
    Negotiate(NegotiateArgs),
    /// Ask a provider for the status of a deal
    DealStatus {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        deal_uuid: Uuid,
    },
    /// Deal counts and sizes at every checkpoint
    Checkpoints,
    /// Deals waiting to be transferred, sealed or published
    StagingStatus,
    /// Build the proposal `negotiate` would send and run it through a storage deal filter
    FilterDeal {
        #[command(flatten)]
        filter: FilterArgs,
        #[command(flatten)]
        deal: NegotiateArgs,
    },
    /// Run a retrieval deal filter on a provider deal state read from a JSON file
    FilterRetrieval {
        #[command(flatten)]
        filter: FilterArgs,
        /// JSON object with the retrieval deal state
        #[arg(long)]
        deal_state: PathBuf,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Shell command receiving the deal as JSON on stdin; exit 0 accepts
    #[arg(long)]
    cmd: String,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

impl FilterArgs {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Serialize)]
struct FilterOutcome {
    accepted: bool,
    reason: String,
}

impl From<FilterDecision> for FilterOutcome {
    fn from(d: FilterDecision) -> Self {
        match d {
            FilterDecision::Accept => FilterOutcome {
                accepted: true,
                reason: String::new(),
            },
            FilterDecision::Reject(reason) => FilterOutcome {
                accepted: false,
                reason,
            },
        }
    }
}

#[derive(clap::Args)]
struct NegotiateArgs {
    /// Storage provider address, e.g. f01000
    #[arg(long)]
    provider: String,
    /// Piece commitment CID
    #[arg(long)]
    commp: String,
    /// Padded piece size in bytes
    #[arg(long)]
    piece_size: u64,
    /// CAR file size in bytes
    #[arg(long)]
    car_size: u64,
    /// Root CID of the payload
    #[arg(long)]
    payload_cid: String,
    /// Deal label (default: payload CID)
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    start_epoch: Option<ChainEpoch>,
    /// Deal duration in epochs
    #[arg(long, default_value_t = DEFAULT_DEAL_DURATION)]
    duration: ChainEpoch,
    /// Provider collateral in attoFIL (default: minimum bound + 20%)
    #[arg(long, value_parser = parse_atto)]
    provider_collateral: Option<TokenAmount>,
    /// Price per GiB per epoch in attoFIL
    #[arg(long, default_value = "1", value_parser = parse_atto)]
    storage_price: TokenAmount,
    /// Propose a verified deal (`--verified false` for an unverified one)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    verified: bool,
    /// Ask the provider to keep an unsealed copy
    #[arg(long)]
    keep_unsealed: bool,
    #[arg(long)]
    skip_ipni_announce: bool,
    /// Client wallet address (default: the node's default wallet)
    #[arg(long)]
    wallet: Option<String>,
}

impl NegotiateArgs {
    fn into_request(self) -> DealRequest {
        DealRequest {
            provider: self.provider,
            wallet: self.wallet,
            proposal: ProposalInput {
                piece_cid: self.commp,
                piece_size: self.piece_size,
                payload_cid: self.payload_cid,
                car_size: self.car_size,
                label: self.label,
                duration: self.duration,
                storage_price: self.storage_price,
                verified: self.verified,
                provider_collateral: self.provider_collateral,
                start_epoch: self.start_epoch,
                remove_unsealed_copy: !self.keep_unsealed,
                skip_ipni_announce: self.skip_ipni_announce,
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dealprobe=info".parse()?)
                .add_directive("dealprobe_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        tokio::select! {
            res = run(cli.command, cfg) => res,
            res = shutdown_signal() => {
                res?;
                warn!("interrupted");
                anyhow::bail!("interrupted")
            }
        }
    })
}

async fn run(command: Command, cfg: Config) -> anyhow::Result<()> {
    match command {
        Command::Negotiate(args) => {
            let negotiator = match negotiator(&cfg) {
                Ok(n) => n,
                Err(e) => {
                    let verdict = Verdict::internal(Reason::ApiGateway, format!("{e:#}"));
                    return print_json(&Observed::default().report(verdict));
                }
            };
            let report = negotiator.negotiate(&args.into_request()).await;
            print_json(&report)
        }
        Command::DealStatus {
            provider,
            deal_uuid,
        } => {
            let status = negotiator(&cfg)?
                .deal_status(&provider, deal_uuid)
                .await
                .with_context(|| format!("deal status from {provider}"))?;
            print_json(&status)
        }
        Command::Checkpoints => {
            let store = SqliteDealStore::open(&cfg.store.deals_db)?;
            print_json(&checkpoint::lifecycle_status(&store).await?)
        }
        Command::StagingStatus => {
            let store = SqliteDealStore::open(&cfg.store.deals_db)?;
            print_json(&staging::staging_status(&store).await?)
        }
        Command::FilterDeal { filter, deal } => filter_deal(&cfg, filter, deal).await,
        Command::FilterRetrieval { filter, deal_state } => {
            let raw = std::fs::read(&deal_state)
                .with_context(|| format!("reading {}", deal_state.display()))?;
            let state: RetrievalDealState =
                serde_json::from_slice(&raw).context("deal state must be a JSON object")?;
            let decision = CliRetrievalDealFilter::new(filter.cmd.clone(), filter.timeout())
                .filter(&state)
                .await?;
            print_json(&FilterOutcome::from(decision))
        }
    }
}

async fn filter_deal(cfg: &Config, filter: FilterArgs, deal: NegotiateArgs) -> anyhow::Result<()> {
    let (chain, wallet) = lotus_clients(cfg)?;
    let req = deal.into_request();
    let client: Address = match req.wallet.as_deref() {
        Some(w) if !w.is_empty() => w.parse().with_context(|| format!("invalid wallet {w}"))?,
        _ => wallet.default_address().await?,
    };
    let provider: Address = req
        .provider
        .parse()
        .with_context(|| format!("invalid provider {}", req.provider))?;
    let deal_params = ProposalBuilder::new(chain.as_ref(), wallet.as_ref())
        .build(&req.proposal, &client, &provider)
        .await?;
    let decision = CliDealFilter::new(filter.cmd.clone(), filter.timeout())
        .filter(&DealFilterParams {
            deal_params,
            sealing_pipeline_state: serde_json::Value::Null,
            funds_state: serde_json::Value::Null,
            storage_state: serde_json::Value::Null,
        })
        .await?;
    print_json(&FilterOutcome::from(decision))
}

fn lotus_clients(cfg: &Config) -> anyhow::Result<(Arc<dyn ChainApi>, Arc<LotusWallet>)> {
    let http_timeout = Duration::from_secs(cfg.gateway.timeout_secs);
    let chain: Arc<dyn ChainApi> = Arc::new(LotusGateway::new(
        RpcClient::new(&cfg.gateway.url, cfg.gateway.token.clone(), http_timeout)
            .context("gateway client")?,
    ));
    let wallet = Arc::new(LotusWallet::new(
        RpcClient::new(&cfg.wallet.url, cfg.wallet.token.clone(), http_timeout)
            .context("wallet client")?,
    ));
    Ok((chain, wallet))
}

fn negotiator(cfg: &Config) -> anyhow::Result<Negotiator<Libp2pHost>> {
    let (chain, wallet) = lotus_clients(cfg)?;
    let core_cfg = cfg.negotiation.to_core();
    let host = Libp2pHost::new(core_cfg.rpc_timeout).context("libp2p host")?;
    Ok(Negotiator::new(chain, wallet, host, core_cfg))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). Dropping the in-flight command closes its streams.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEGOTIATE: [&str; 12] = [
        "dealprobe",
        "negotiate",
        "--provider",
        "f01000",
        "--commp",
        "baga6ea4seaqao7s73y24kcutaosvacpdjgfe5pw76ooefnyqw4ynr3d2y6x2mpq",
        "--piece-size",
        "2048",
        "--car-size",
        "1500",
        "--payload-cid",
        "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n",
    ];

    fn negotiate_args(extra: &[&str]) -> NegotiateArgs {
        let argv = NEGOTIATE.iter().chain(extra).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Negotiate(args) => args,
            _ => panic!("expected negotiate"),
        }
    }

    #[test]
    fn negotiate_defaults_to_verified_deal_at_one_atto() {
        let req = negotiate_args(&[]).into_request();
        assert!(req.proposal.verified);
        assert_eq!(req.proposal.storage_price, TokenAmount::from_atto(1));
        assert_eq!(req.proposal.duration, DEFAULT_DEAL_DURATION);
        assert!(req.proposal.remove_unsealed_copy);
        assert_eq!(req.proposal.provider_collateral, None);
    }

    #[test]
    fn negotiate_overrides() {
        let req = negotiate_args(&[
            "--verified",
            "false",
            "--storage-price",
            "0",
            "--provider-collateral",
            "340282366920938463463374607431768211456",
        ])
        .into_request();
        assert!(!req.proposal.verified);
        assert_eq!(req.proposal.storage_price, TokenAmount::from_atto(0));
        assert!(req.proposal.provider_collateral.is_some());

        let argv = NEGOTIATE.iter().copied().chain(["--storage-price", "-1"]);
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn filter_deal_takes_proposal_arguments() {
        let argv = ["dealprobe", "filter-deal", "--cmd", "exit 0"]
            .into_iter()
            .chain(NEGOTIATE[2..].iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Command::FilterDeal { filter, deal } => {
                assert_eq!(filter.cmd, "exit 0");
                assert_eq!(filter.timeout(), Duration::from_secs(30));
                assert_eq!(deal.provider, "f01000");
            }
            _ => panic!("expected filter-deal"),
        }
    }

    #[test]
    fn filter_decision_json() {
        let json = serde_json::to_value(FilterOutcome::from(FilterDecision::Reject(
            "too big".to_string(),
        )))
        .unwrap();
        assert_eq!(json, serde_json::json!({"accepted": false, "reason": "too big"}));
    }
}
