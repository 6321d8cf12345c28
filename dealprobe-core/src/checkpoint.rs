//! Deal checkpoints: the ordered milestones a deal passes after acceptance, and aggregation of the
//! deal record set by checkpoint. The execution pipeline advances checkpoints; this module only reads.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::units::PaddedPieceSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Checkpoint {
    Accepted,
    Transferred,
    Published,
    PublishConfirmed,
    AddedPiece,
    IndexedAndAnnounced,
    Complete,
}

impl Checkpoint {
    /// Every checkpoint, in lifecycle order.
    pub const ALL: [Checkpoint; 7] = [
        Checkpoint::Accepted,
        Checkpoint::Transferred,
        Checkpoint::Published,
        Checkpoint::PublishConfirmed,
        Checkpoint::AddedPiece,
        Checkpoint::IndexedAndAnnounced,
        Checkpoint::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Accepted => "Accepted",
            Checkpoint::Transferred => "Transferred",
            Checkpoint::Published => "Published",
            Checkpoint::PublishConfirmed => "PublishConfirmed",
            Checkpoint::AddedPiece => "AddedPiece",
            Checkpoint::IndexedAndAnnounced => "IndexedAndAnnounced",
            Checkpoint::Complete => "Complete",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown checkpoint {0:?}")]
pub struct UnknownCheckpoint(pub String);

impl FromStr for Checkpoint {
    type Err = UnknownCheckpoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checkpoint::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCheckpoint(s.to_string()))
    }
}

/// One persisted deal, reduced to what the trackers read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealRecord {
    pub deal_uuid: Uuid,
    pub checkpoint: Checkpoint,
    pub piece_size: PaddedPieceSize,
    /// Set once the deal failed; empty text counts as no error.
    pub error: Option<String>,
    pub transfer_type: String,
    pub is_offline: bool,
}

impl DealRecord {
    pub fn in_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Read access to the deal record store. Each call is one consistent read.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn by_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<Vec<DealRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    pub deals: u64,
    pub deals_in_error: u64,
    pub cumulative_size: PaddedPieceSize,
    pub cumulative_size_in_error: PaddedPieceSize,
}

/// Counts and piece-size sums over a set of deal records.
pub fn summarize<'a>(records: impl IntoIterator<Item = &'a DealRecord>) -> CheckpointStatus {
    records
        .into_iter()
        .fold(CheckpointStatus::default(), |mut acc, deal| {
            acc.deals += 1;
            acc.cumulative_size.0 += deal.piece_size.0;
            if deal.in_error() {
                acc.deals_in_error += 1;
                acc.cumulative_size_in_error.0 += deal.piece_size.0;
            }
            acc
        })
}

impl CheckpointStatus {
    fn merge(self, other: CheckpointStatus) -> CheckpointStatus {
        CheckpointStatus {
            deals: self.deals + other.deals,
            deals_in_error: self.deals_in_error + other.deals_in_error,
            cumulative_size: PaddedPieceSize(self.cumulative_size.0 + other.cumulative_size.0),
            cumulative_size_in_error: PaddedPieceSize(
                self.cumulative_size_in_error.0 + other.cumulative_size_in_error.0,
            ),
        }
    }
}

/// Status of the deals at `checkpoint` or past it.
pub async fn checkpoint_status(
    store: &dyn DealStore,
    checkpoint: Checkpoint,
) -> anyhow::Result<CheckpointStatus> {
    let mut status = CheckpointStatus::default();
    for c in Checkpoint::ALL.into_iter().filter(|c| *c >= checkpoint) {
        status = status.merge(summarize(&store.by_checkpoint(c).await?));
    }
    debug!(%checkpoint, deals = status.deals, in_error = status.deals_in_error, "checkpoint status");
    Ok(status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointEntry {
    pub checkpoint: Checkpoint,
    #[serde(flatten)]
    pub status: CheckpointStatus,
}

/// Status for every checkpoint in lifecycle order, one store read per checkpoint.
pub async fn lifecycle_status(store: &dyn DealStore) -> anyhow::Result<Vec<CheckpointEntry>> {
    let mut at = Vec::with_capacity(Checkpoint::ALL.len());
    for checkpoint in Checkpoint::ALL {
        at.push(summarize(&store.by_checkpoint(checkpoint).await?));
    }
    let mut passed = CheckpointStatus::default();
    let mut out: Vec<CheckpointEntry> = Checkpoint::ALL
        .into_iter()
        .zip(at)
        .rev()
        .map(|(checkpoint, status)| {
            passed = passed.merge(status);
            CheckpointEntry {
                checkpoint,
                status: passed,
            }
        })
        .collect();
    out.reverse();
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct MemStore(pub Vec<DealRecord>);

    #[async_trait]
    impl DealStore for MemStore {
        async fn by_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<Vec<DealRecord>> {
            Ok(self
                .0
                .iter()
                .filter(|d| d.checkpoint == checkpoint)
                .cloned()
                .collect())
        }
    }

    pub(crate) fn deal(
        checkpoint: Checkpoint,
        size: u64,
        error: Option<&str>,
        transfer_type: &str,
        is_offline: bool,
    ) -> DealRecord {
        DealRecord {
            deal_uuid: Uuid::new_v4(),
            checkpoint,
            piece_size: PaddedPieceSize(size),
            error: error.map(str::to_string),
            transfer_type: transfer_type.to_string(),
            is_offline,
        }
    }

    #[test]
    fn names_roundtrip_in_order() {
        for c in Checkpoint::ALL {
            assert_eq!(c.as_str().parse::<Checkpoint>(), Ok(c));
        }
        assert!(Checkpoint::Accepted < Checkpoint::Complete);
        assert!("Sealed".parse::<Checkpoint>().is_err());
    }

    #[tokio::test]
    async fn splits_errors_and_sums_sizes() {
        let store = MemStore(vec![
            deal(Checkpoint::Accepted, 128, None, "http", false),
            deal(Checkpoint::Accepted, 256, Some("x"), "http", false),
            deal(Checkpoint::Published, 1024, None, "", true),
        ]);
        let status = checkpoint_status(&store, Checkpoint::Accepted).await.unwrap();
        assert_eq!(
            status,
            CheckpointStatus {
                deals: 3,
                deals_in_error: 1,
                cumulative_size: PaddedPieceSize(1408),
                cumulative_size_in_error: PaddedPieceSize(256),
            }
        );

        // later checkpoints never count deals that have not reached them
        let published = checkpoint_status(&store, Checkpoint::Published).await.unwrap();
        assert_eq!(published.deals, 1);
        assert_eq!(published.deals_in_error, 0);
        assert_eq!(published.cumulative_size, PaddedPieceSize(1024));
    }

    #[tokio::test]
    async fn two_deals_one_in_error() {
        let store = MemStore(vec![
            deal(Checkpoint::Accepted, 128, None, "http", false),
            deal(Checkpoint::Accepted, 256, Some("x"), "http", false),
        ]);
        let status = checkpoint_status(&store, Checkpoint::Accepted).await.unwrap();
        assert_eq!(status.deals, 2);
        assert_eq!(status.deals_in_error, 1);
        assert_eq!(status.cumulative_size, PaddedPieceSize(384));
        assert_eq!(status.cumulative_size_in_error, PaddedPieceSize(256));
    }

    #[test]
    fn empty_error_text_is_not_an_error() {
        let d = deal(Checkpoint::Complete, 8, Some(""), "", true);
        assert!(!d.in_error());
    }

    #[tokio::test]
    async fn lifecycle_covers_every_checkpoint() {
        let store = MemStore(vec![deal(Checkpoint::AddedPiece, 2048, None, "", true)]);
        let all = lifecycle_status(&store).await.unwrap();
        assert_eq!(all.len(), Checkpoint::ALL.len());
        assert_eq!(all[0].checkpoint, Checkpoint::Accepted);
        assert_eq!(all[0].status.deals, 1);
        assert_eq!(all[6].checkpoint, Checkpoint::Complete);
        assert_eq!(all[6].status.deals, 0);
        let added = all
            .iter()
            .find(|e| e.checkpoint == Checkpoint::AddedPiece)
            .unwrap();
        assert_eq!(added.status.cumulative_size, PaddedPieceSize(2048));

        let json = serde_json::to_value(&all[4]).unwrap();
        assert_eq!(json["checkpoint"], "AddedPiece");
        assert_eq!(json["deals"], 1);
    }
}
