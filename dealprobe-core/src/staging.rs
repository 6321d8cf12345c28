//! Staging-area status: what is waiting to be transferred, sealed or published.
//!
//! Accepted deals are split by online transfer type; Transferred and Published are totals over
//! online and offline deals.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::checkpoint::{Checkpoint, DealRecord, DealStore};
use crate::units::PaddedPieceSize;

/// Online transfer types reported for accepted deals.
pub const TRANSFER_TYPES: [&str; 3] = ["http", "libp2p", "graphsync"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointState {
    pub deals: u64,
    pub cumulative_size: PaddedPieceSize,
}

impl CheckpointState {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a DealRecord>) -> Self {
        records
            .into_iter()
            .fold(CheckpointState::default(), |mut acc, d| {
                acc.deals += 1;
                acc.cumulative_size.0 += d.piece_size.0;
                acc
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StagingStatus {
    /// Keyed by transfer type.
    pub accepted: BTreeMap<String, CheckpointState>,
    pub transferred: CheckpointState,
    pub published: CheckpointState,
}

pub async fn staging_status(store: &dyn DealStore) -> anyhow::Result<StagingStatus> {
    let accepted_deals = store.by_checkpoint(Checkpoint::Accepted).await?;
    let accepted = TRANSFER_TYPES
        .iter()
        .map(|tt| {
            let state = CheckpointState::from_records(
                accepted_deals
                    .iter()
                    .filter(|d| !d.is_offline && d.transfer_type == *tt),
            );
            (tt.to_string(), state)
        })
        .collect();

    let transferred = store.by_checkpoint(Checkpoint::Transferred).await?;
    let published = store.by_checkpoint(Checkpoint::Published).await?;

    Ok(StagingStatus {
        accepted,
        transferred: CheckpointState::from_records(&transferred),
        published: CheckpointState::from_records(&published),
    })
}
