//! Read-only access to the deals SQLite database kept by the deal execution pipeline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use dealprobe_core::{Checkpoint, DealRecord, DealStore, PaddedPieceSize};
use rusqlite::{params, Connection, OpenFlags};
use uuid::Uuid;

const BY_CHECKPOINT: &str = "SELECT ID, Checkpoint, PieceSize, Error, TransferType, IsOffline \
                             FROM Deals WHERE Checkpoint = ?1";

pub struct SqliteDealStore {
    path: PathBuf,
}

impl SqliteDealStore {
    /// Fails if the database does not exist; it is never created here.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        open_read_only(path)?;
        Ok(SqliteDealStore {
            path: path.to_path_buf(),
        })
    }
}

fn open_read_only(path: &Path) -> anyhow::Result<Connection> {
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("opening deals database {}", path.display()))
}

fn query(path: &Path, checkpoint: Checkpoint) -> anyhow::Result<Vec<DealRecord>> {
    let conn = open_read_only(path)?;
    let mut stmt = conn.prepare(BY_CHECKPOINT).context("preparing deals query")?;
    let rows = stmt
        .query_map(params![checkpoint.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })
        .context("querying deals")?;

    let mut out = Vec::new();
    for row in rows {
        let (id, cp, size, error, transfer_type, is_offline) = row.context("reading deal row")?;
        out.push(DealRecord {
            deal_uuid: Uuid::parse_str(&id).with_context(|| format!("deal id {id:?}"))?,
            checkpoint: cp.parse()?,
            piece_size: PaddedPieceSize(
                u64::try_from(size).with_context(|| format!("deal {id}: piece size {size}"))?,
            ),
            error,
            transfer_type: transfer_type.unwrap_or_default(),
            is_offline,
        });
    }
    Ok(out)
}

#[async_trait]
impl DealStore for SqliteDealStore {
    async fn by_checkpoint(&self, checkpoint: Checkpoint) -> anyhow::Result<Vec<DealRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || query(&path, checkpoint))
            .await
            .context("deals query task")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealprobe_core::checkpoint::lifecycle_status;
    use dealprobe_core::staging::staging_status;

    fn fixture() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE Deals (
                ID TEXT PRIMARY KEY,
                Checkpoint TEXT,
                PieceSize INT,
                Error TEXT,
                TransferType TEXT,
                IsOffline BOOL
            );",
        )
        .unwrap();
        let rows: [(&str, u64, Option<&str>, &str, bool); 5] = [
            ("Accepted", 2048, None, "http", false),
            ("Accepted", 4096, None, "http", true),
            ("Transferred", 1024, Some(""), "graphsync", false),
            ("Published", 8192, Some("publish failed"), "http", false),
            ("Complete", 256, None, "libp2p", false),
        ];
        for (cp, size, error, tt, offline) in rows {
            conn.execute(
                "INSERT INTO Deals VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![Uuid::new_v4().to_string(), cp, size as i64, error, tt, offline],
            )
            .unwrap();
        }
        file
    }

    #[tokio::test]
    async fn reads_deals_at_checkpoint() {
        let db = fixture();
        let store = SqliteDealStore::open(db.path()).unwrap();

        let accepted = store.by_checkpoint(Checkpoint::Accepted).await.unwrap();
        assert_eq!(accepted.len(), 2);
        assert!(accepted.iter().all(|d| d.checkpoint == Checkpoint::Accepted));

        let transferred = store.by_checkpoint(Checkpoint::Transferred).await.unwrap();
        assert_eq!(transferred.len(), 1);
        assert!(!transferred[0].in_error());

        let lifecycle = lifecycle_status(&store).await.unwrap();
        let published = &lifecycle[2];
        assert_eq!(published.checkpoint, Checkpoint::Published);
        assert_eq!(published.status.deals_in_error, 1);
        assert_eq!(published.status.cumulative_size_in_error, PaddedPieceSize(8192));
    }

    #[tokio::test]
    async fn staging_from_sqlite() {
        let db = fixture();
        let store = SqliteDealStore::open(db.path()).unwrap();
        let staging = staging_status(&store).await.unwrap();
        assert_eq!(staging.accepted["http"].deals, 1);
        assert_eq!(staging.accepted["http"].cumulative_size, PaddedPieceSize(2048));
        assert_eq!(staging.transferred.deals, 1);
        assert_eq!(staging.published.cumulative_size, PaddedPieceSize(8192));
    }

    #[test]
    fn missing_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteDealStore::open(&dir.path().join("absent.db")).is_err());
    }
}
