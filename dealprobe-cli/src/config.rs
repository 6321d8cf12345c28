//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dealprobe_core::NegotiationConfig;

/// Client configuration. File: `--config PATH`, ~/.config/dealprobe/config.toml or
/// /etc/dealprobe/config.toml. Env overrides: DEALPROBE_GATEWAY_URL, DEALPROBE_GATEWAY_TOKEN,
/// DEALPROBE_WALLET_URL, DEALPROBE_WALLET_TOKEN, DEALPROBE_DEALS_DB, DEALPROBE_RPC_TIMEOUT_SECS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub negotiation: NegotiationSection,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Chain gateway (Lotus JSON-RPC).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

/// Full node holding the client wallet.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalletConfig {
    #[serde(default = "default_wallet_url")]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NegotiationSection {
    #[serde(default = "default_deal_protocols")]
    pub deal_protocols: Vec<String>,
    #[serde(default = "default_ask_protocol")]
    pub ask_protocol: String,
    #[serde(default = "default_status_protocol")]
    pub status_protocol: String,
    #[serde(default = "default_diagnostic_marker")]
    pub diagnostic_marker: String,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite deals database.
    #[serde(default = "default_deals_db")]
    pub deals_db: PathBuf,
}

fn default_gateway_url() -> String {
    "https://api.node.glif.io/rpc/v1".to_string()
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_wallet_url() -> String {
    "http://127.0.0.1:1234/rpc/v0".to_string()
}
fn default_deal_protocols() -> Vec<String> {
    NegotiationConfig::default().deal_protocols
}
fn default_ask_protocol() -> String {
    NegotiationConfig::default().ask_protocol
}
fn default_status_protocol() -> String {
    NegotiationConfig::default().status_protocol
}
fn default_diagnostic_marker() -> String {
    NegotiationConfig::default().diagnostic_marker
}
fn default_rpc_timeout_secs() -> u64 {
    NegotiationConfig::default().rpc_timeout.as_secs()
}
fn default_deals_db() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match home {
        Some(h) => h.join(".dealprobe/deals.db"),
        None => PathBuf::from("deals.db"),
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            url: default_wallet_url(),
            token: None,
        }
    }
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            deal_protocols: default_deal_protocols(),
            ask_protocol: default_ask_protocol(),
            status_protocol: default_status_protocol(),
            diagnostic_marker: default_diagnostic_marker(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            deals_db: default_deals_db(),
        }
    }
}

impl NegotiationSection {
    pub fn to_core(&self) -> NegotiationConfig {
        NegotiationConfig {
            deal_protocols: self.deal_protocols.clone(),
            ask_protocol: self.ask_protocol.clone(),
            status_protocol: self.status_protocol.clone(),
            diagnostic_marker: self.diagnostic_marker.clone(),
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must exist and parse; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => parse_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => parse_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str::<Config>(s)?)
}

/// Apply env overrides read through `var`. Unparsable numbers are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("DEALPROBE_GATEWAY_URL") {
        c.gateway.url = s;
    }
    if let Some(s) = var("DEALPROBE_GATEWAY_TOKEN") {
        c.gateway.token = Some(s);
    }
    if let Some(s) = var("DEALPROBE_WALLET_URL") {
        c.wallet.url = s;
    }
    if let Some(s) = var("DEALPROBE_WALLET_TOKEN") {
        c.wallet.token = Some(s);
    }
    if let Some(s) = var("DEALPROBE_DEALS_DB") {
        c.store.deals_db = PathBuf::from(s);
    }
    if let Some(s) = var("DEALPROBE_RPC_TIMEOUT_SECS") {
        if let Ok(secs) = s.parse::<u64>() {
            c.negotiation.rpc_timeout_secs = secs;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dealprobe/config.toml"));
    }
    out.push(PathBuf::from("/etc/dealprobe/config.toml"));
    out
}
