//! Lotus JSON-RPC clients: the chain gateway (miner info, collateral bounds, chain head) and the
//! full node holding the client wallet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::Engine;
use dealprobe_core::api::{ChainApi, CollateralBounds, MinerInfo, Wallet};
use dealprobe_core::identity::signature_type;
use dealprobe_core::units::parse_atto;
use dealprobe_core::{Address, ChainEpoch, PaddedPieceSize, PeerId, SectorSize, Signature};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Minimal JSON-RPC 2.0 client over HTTP with optional bearer token.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(RpcClient {
            http,
            url: url.to_string(),
            token,
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!(method, url = %self.url, "json-rpc call");
        let mut builder = self.http.post(&self.url).json(&req);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let resp: JsonRpcResponse = builder
            .send()
            .await
            .with_context(|| format!("{method}: request failed"))?
            .error_for_status()
            .with_context(|| format!("{method}: http error"))?
            .json()
            .await
            .with_context(|| format!("{method}: invalid json-rpc response"))?;
        decode_result(method, resp)
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, resp: JsonRpcResponse) -> anyhow::Result<T> {
    if let Some(err) = resp.error {
        return Err(anyhow!("{method}: {} (code {})", err.message, err.code));
    }
    let result = resp.result.unwrap_or(Value::Null);
    serde_json::from_value(result).with_context(|| format!("{method}: unexpected result"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LotusMinerInfo {
    #[serde(default)]
    peer_id: Option<String>,
    /// Base64 multiaddr bytes.
    #[serde(default)]
    multiaddrs: Option<Vec<String>>,
    sector_size: u64,
}

impl LotusMinerInfo {
    fn into_miner_info(self) -> anyhow::Result<MinerInfo> {
        let peer_id = match self.peer_id {
            Some(s) if !s.is_empty() => Some(
                s.parse::<PeerId>()
                    .with_context(|| format!("invalid peer id {s}"))?,
            ),
            _ => None,
        };
        let multiaddrs = self
            .multiaddrs
            .unwrap_or_default()
            .iter()
            .map(|m| base64::engine::general_purpose::STANDARD.decode(m))
            .collect::<Result<Vec<_>, _>>()
            .context("multiaddr is not base64")?;
        Ok(MinerInfo {
            peer_id,
            multiaddrs,
            sector_size: SectorSize(self.sector_size),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LotusCollateralBounds {
    min: String,
    max: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LotusTipSet {
    height: ChainEpoch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LotusSignature {
    #[serde(rename = "Type")]
    sig_type: u8,
    data: String,
}

impl LotusSignature {
    fn into_signature(self) -> anyhow::Result<Signature> {
        let sig_type = signature_type(self.sig_type)
            .ok_or_else(|| anyhow!("unknown signature type {}", self.sig_type))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .context("signature is not base64")?;
        Ok(Signature { sig_type, bytes })
    }
}

/// Chain state through a Lotus gateway.
pub struct LotusGateway {
    rpc: RpcClient,
}

impl LotusGateway {
    pub fn new(rpc: RpcClient) -> Self {
        LotusGateway { rpc }
    }
}

#[async_trait]
impl ChainApi for LotusGateway {
    async fn miner_info(&self, miner: &Address) -> anyhow::Result<MinerInfo> {
        let info: LotusMinerInfo = self
            .rpc
            .call("Filecoin.StateMinerInfo", json!([miner.to_string(), null]))
            .await?;
        info.into_miner_info()
    }

    async fn provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> anyhow::Result<CollateralBounds> {
        let bounds: LotusCollateralBounds = self
            .rpc
            .call(
                "Filecoin.StateDealProviderCollateralBounds",
                json!([size.0, verified, null]),
            )
            .await?;
        Ok(CollateralBounds {
            min: parse_atto(&bounds.min).context("minimum collateral")?,
            max: parse_atto(&bounds.max).context("maximum collateral")?,
        })
    }

    async fn chain_head(&self) -> anyhow::Result<ChainEpoch> {
        let head: LotusTipSet = self.rpc.call("Filecoin.ChainHead", json!([])).await?;
        Ok(head.height)
    }
}

/// Client wallet held by a Lotus full node.
pub struct LotusWallet {
    rpc: RpcClient,
}

impl LotusWallet {
    pub fn new(rpc: RpcClient) -> Self {
        LotusWallet { rpc }
    }
}

#[async_trait]
impl Wallet for LotusWallet {
    async fn default_address(&self) -> anyhow::Result<Address> {
        let addr: String = self
            .rpc
            .call("Filecoin.WalletDefaultAddress", json!([]))
            .await?;
        if addr.is_empty() {
            anyhow::bail!("no default wallet address set");
        }
        Ok(addr.parse()?)
    }

    async fn sign(&self, signer: &Address, msg: &[u8]) -> anyhow::Result<Signature> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(msg);
        let sig: LotusSignature = self
            .rpc
            .call("Filecoin.WalletSign", json!([signer.to_string(), encoded]))
            .await?;
        sig.into_signature()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_info_from_lotus_json() {
        let ma = base64::engine::general_purpose::STANDARD
            .encode("/ip4/1.2.3.4/tcp/24001".parse::<libp2p::Multiaddr>().unwrap().to_vec());
        let info: LotusMinerInfo = serde_json::from_value(json!({
            "Owner": "f01234",
            "PeerId": "12D3KooWGzxzKZYveHXtpG6AsrUJBcWxHBFS2HsEoGTxrMLvKXtf",
            "Multiaddrs": [ma],
            "SectorSize": 34359738368u64,
            "WindowPoStPartitionSectors": 2349
        }))
        .unwrap();
        let info = info.into_miner_info().unwrap();
        assert!(info.peer_id.is_some());
        assert_eq!(info.multiaddrs.len(), 1);
        assert_eq!(info.sector_size, SectorSize(32 << 30));
    }

    #[test]
    fn null_peer_and_addrs() {
        let info: LotusMinerInfo = serde_json::from_value(json!({
            "PeerId": null,
            "Multiaddrs": null,
            "SectorSize": 2048
        }))
        .unwrap();
        let info = info.into_miner_info().unwrap();
        assert_eq!(info.peer_id, None);
        assert!(info.multiaddrs.is_empty());
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let resp: JsonRpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 1, "message": "actor not found"}
        }))
        .unwrap();
        let err = decode_result::<LotusTipSet>("Filecoin.StateMinerInfo", resp).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Filecoin.StateMinerInfo: actor not found (code 1)"
        );
    }

    #[test]
    fn signature_from_lotus_json() {
        let sig: LotusSignature =
            serde_json::from_value(json!({"Type": 1, "Data": "AQID"})).unwrap();
        let sig = sig.into_signature().unwrap();
        assert_eq!(sig, Signature::new_secp256k1(vec![1, 2, 3]));

        let bad: LotusSignature =
            serde_json::from_value(json!({"Type": 9, "Data": "AQID"})).unwrap();
        assert!(bad.into_signature().is_err());
    }

    #[test]
    fn collateral_bounds_are_atto_strings() {
        let bounds: LotusCollateralBounds =
            serde_json::from_value(json!({"Min": "100", "Max": "340282366920938463463374607431768211456"}))
                .unwrap();
        assert_eq!(parse_atto(&bounds.min).unwrap(), dealprobe_core::TokenAmount::from_atto(100));
        assert!(parse_atto(&bounds.max).is_ok());
    }
}
