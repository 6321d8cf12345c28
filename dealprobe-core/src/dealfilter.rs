//! Deal filters: hand a deal to an external command as JSON on stdin. Exit status 0 accepts the
//! deal; anything else rejects it with the command's output as the reason.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::protocol::DealParams;

pub const AGENT: &str = "boost";
pub const FORMAT_VERSION: &str = "2.2.0";

/// Inputs to a storage deal filter. Node states are passed through as opaque JSON.
#[derive(Debug, Clone)]
pub struct DealFilterParams {
    pub deal_params: DealParams,
    pub sealing_pipeline_state: serde_json::Value,
    pub funds_state: serde_json::Value,
    pub storage_state: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StorageFilterDocument<'a> {
    #[serde(flatten)]
    deal_params: &'a DealParams,
    sealing_pipeline_state: &'a serde_json::Value,
    funds_state: &'a serde_json::Value,
    storage_state: &'a serde_json::Value,
    deal_type: &'static str,
    format_version: &'static str,
    agent: &'static str,
}

/// Provider-side state of a retrieval deal, as the retrieval market reports it. Its fields are
/// copied to the top level of the filter document.
pub type RetrievalDealState = serde_json::Map<String, serde_json::Value>;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RetrievalFilterDocument<'a> {
    #[serde(flatten)]
    deal_state: &'a RetrievalDealState,
    deal_type: &'static str,
    format_version: &'static str,
    agent: &'static str,
}

/// Document piped to a storage deal filter command.
pub fn filter_document(deal: &DealFilterParams) -> Result<Vec<u8>, FilterError> {
    let doc = StorageFilterDocument {
        deal_params: &deal.deal_params,
        sealing_pipeline_state: &deal.sealing_pipeline_state,
        funds_state: &deal.funds_state,
        storage_state: &deal.storage_state,
        deal_type: "storage",
        format_version: FORMAT_VERSION,
        agent: AGENT,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Document piped to a retrieval deal filter command.
pub fn retrieval_filter_document(deal: &RetrievalDealState) -> Result<Vec<u8>, FilterError> {
    let doc = RetrievalFilterDocument {
        deal_state: deal,
        deal_type: "retrieval",
        format_version: FORMAT_VERSION,
        agent: AGENT,
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("encoding deal filter document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("running deal filter: {0}")]
    Io(#[from] std::io::Error),
    #[error("deal filter timed out after {0:?}")]
    TimedOut(Duration),
}

/// Storage deal filter backed by a shell command.
#[derive(Debug, Clone)]
pub struct CliDealFilter {
    cmd: String,
    timeout: Duration,
}

impl CliDealFilter {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        CliDealFilter {
            cmd: cmd.into(),
            timeout,
        }
    }

    pub async fn filter(&self, deal: &DealFilterParams) -> Result<FilterDecision, FilterError> {
        run_deal_filter(&self.cmd, self.timeout, filter_document(deal)?).await
    }
}

/// Retrieval deal filter backed by a shell command.
#[derive(Debug, Clone)]
pub struct CliRetrievalDealFilter {
    cmd: String,
    timeout: Duration,
}

impl CliRetrievalDealFilter {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        CliRetrievalDealFilter {
            cmd: cmd.into(),
            timeout,
        }
    }

    pub async fn filter(&self, deal: &RetrievalDealState) -> Result<FilterDecision, FilterError> {
        run_deal_filter(&self.cmd, self.timeout, retrieval_filter_document(deal)?).await
    }
}

/// Runs `sh -c cmd` with `doc` on stdin. Feeding stdin and collecting output share one deadline;
/// on timeout the child is killed.
async fn run_deal_filter(
    cmd: &str,
    timeout: Duration,
    doc: Vec<u8>,
) -> Result<FilterDecision, FilterError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // The command may exit without reading its input.
            if let Err(e) = stdin.write_all(&doc).await {
                debug!(error = %e, "deal filter closed stdin early");
            }
        }
    };
    let run = async move {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };
    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| FilterError::TimedOut(timeout))??;

    if output.status.success() {
        return Ok(FilterDecision::Accept);
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let reason = if stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout
    };
    debug!(%cmd, status = ?output.status, %reason, "deal filter rejected deal");
    Ok(FilterDecision::Reject(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Address, Signature};
    use crate::protocol::{ClientDealProposal, DealLabel, DealProposal, Transfer};
    use crate::units::PaddedPieceSize;
    use fvm_shared::econ::TokenAmount;
    use num_traits::Zero;
    use std::time::Instant;
    use uuid::Uuid;

    fn params() -> DealFilterParams {
        let root = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n".parse().unwrap();
        DealFilterParams {
            deal_params: DealParams {
                deal_uuid: Uuid::from_bytes([5; 16]),
                client_deal_proposal: ClientDealProposal {
                    proposal: DealProposal {
                        piece_cid: root,
                        piece_size: PaddedPieceSize(2048),
                        verified_deal: true,
                        client: Address::new_id(1001),
                        provider: Address::new_id(1000),
                        label: DealLabel::Text("label".to_string()),
                        start_epoch: 10,
                        end_epoch: 20,
                        storage_price_per_epoch: TokenAmount::zero(),
                        provider_collateral: TokenAmount::from_atto(3),
                        client_collateral: TokenAmount::zero(),
                    },
                    client_signature: Signature::new_secp256k1(vec![1, 2, 3]),
                },
                deal_data_root: root,
                transfer: Transfer {
                    transfer_type: "http".to_string(),
                    size: 99,
                    ..Transfer::default()
                },
                is_offline: false,
                remove_unsealed_copy: true,
                skip_ipni_announce: false,
            },
            sealing_pipeline_state: serde_json::json!({"SectorStates": {}}),
            funds_state: serde_json::json!(null),
            storage_state: serde_json::json!({"Free": 10}),
        }
    }

    fn retrieval_state() -> RetrievalDealState {
        let serde_json::Value::Object(state) = serde_json::json!({
            "PayloadCID": {"/": "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n"},
            "Receiver": "12D3KooWAbc",
            "PricePerByte": "0",
        }) else {
            unreachable!()
        };
        state
    }

    #[test]
    fn document_flattens_deal_params() {
        let bytes = filter_document(&params()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["DealType"], "storage");
        assert_eq!(doc["FormatVersion"], "2.2.0");
        assert_eq!(doc["Agent"], "boost");
        assert_eq!(doc["DealUUID"], Uuid::from_bytes([5; 16]).to_string());
        assert_eq!(doc["Transfer"]["Type"], "http");
        assert_eq!(doc["StorageState"]["Free"], 10);
        assert_eq!(doc["ClientDealProposal"]["Proposal"]["Label"], "label");
    }

    #[test]
    fn retrieval_document_flattens_deal_state() {
        let bytes = retrieval_filter_document(&retrieval_state()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["DealType"], "retrieval");
        assert_eq!(doc["FormatVersion"], "2.2.0");
        assert_eq!(doc["Agent"], "boost");
        assert_eq!(doc["Receiver"], "12D3KooWAbc");
        assert_eq!(doc["PayloadCID"]["/"], "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n");
    }

    #[tokio::test]
    async fn exit_status_decides() {
        let timeout = Duration::from_secs(10);
        let accept = CliDealFilter::new("cat > /dev/null", timeout);
        assert_eq!(accept.filter(&params()).await.unwrap(), FilterDecision::Accept);

        let reject = CliDealFilter::new("echo too big; exit 1", timeout);
        assert_eq!(
            reject.filter(&params()).await.unwrap(),
            FilterDecision::Reject("too big".to_string())
        );

        let stderr_only = CliDealFilter::new("echo nope >&2; exit 3", timeout);
        assert_eq!(
            stderr_only.filter(&params()).await.unwrap(),
            FilterDecision::Reject("nope".to_string())
        );
    }

    #[tokio::test]
    async fn filter_reads_the_document() {
        let f = CliDealFilter::new("grep -q '\"Agent\": \"boost\"'", Duration::from_secs(10));
        assert_eq!(f.filter(&params()).await.unwrap(), FilterDecision::Accept);

        let retrieval = CliRetrievalDealFilter::new(
            "grep -q '\"DealType\": \"retrieval\"' && echo declined && exit 1",
            Duration::from_secs(10),
        );
        assert_eq!(
            retrieval.filter(&retrieval_state()).await.unwrap(),
            FilterDecision::Reject("declined".to_string())
        );
    }

    #[tokio::test]
    async fn deadline_covers_writing_the_document() {
        // Larger than a pipe buffer, to a command that never reads stdin.
        let mut deal = params();
        deal.storage_state = serde_json::json!({ "Blob": "x".repeat(1 << 20) });
        let f = CliDealFilter::new("sleep 10", Duration::from_millis(300));

        let started = Instant::now();
        let err = f.filter(&deal).await.unwrap_err();
        assert!(matches!(err, FilterError::TimedOut(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
