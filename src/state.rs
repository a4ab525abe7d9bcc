#![forbid(unsafe_code)]

//! Durable sync state kept in a local libsql database.
//!
//! Three tables back the incremental sync:
//! - `sync_state`: per-channel cutoff, only ever moved forward;
//! - `completed_items`: every item that reached the destination, so restarts
//!   skip it even when the cutoff was not written;
//! - `retry_items`: terminal failures that `new` mode re-queues next run.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use std::{collections::HashSet, path::Path};

use crate::model::{ItemOutcome, OutcomeKind, VideoTask};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub channel_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub last_processed_id: Option<String>,
}

/// Newest succeeded item among `outcomes`, if it moves the cutoff past
/// `previous`. Failed and unverified items never move it.
pub fn next_cutoff(
    previous: Option<DateTime<Utc>>,
    outcomes: &[ItemOutcome],
) -> Option<(DateTime<Utc>, String)> {
    let newest = outcomes
        .iter()
        .filter(|outcome| outcome.kind == OutcomeKind::Succeeded)
        .filter_map(|outcome| {
            outcome
                .published_at
                .map(|published| (published, outcome.identifier().to_string()))
        })
        .max_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(&right.1)))?;
    match previous {
        Some(previous) if previous >= newest.0 => None,
        _ => Some(newest),
    }
}

fn encode_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            channel_id TEXT PRIMARY KEY,
            last_synced_at TEXT NOT NULL,
            last_processed_id TEXT
        );
        CREATE TABLE IF NOT EXISTS completed_items (
            video_id TEXT PRIMARY KEY,
            channel_id TEXT,
            handle TEXT,
            outcome TEXT NOT NULL,
            completed_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS retry_items (
            video_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            published_at TEXT,
            reason TEXT,
            attempts INTEGER NOT NULL DEFAULT 1,
            failed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_retry_items_channel ON retry_items(channel_id);
        "#,
    )
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening state DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn load(&self, channel_id: &str) -> Result<Option<SyncState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel_id, last_synced_at, last_processed_id FROM sync_state WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row_to_state(&row)?))
    }

    /// Moves the cutoff forward. A candidate at or before the stored value is
    /// ignored, so the stored cutoff never decreases.
    pub async fn advance(
        &self,
        channel_id: &str,
        synced_at: DateTime<Utc>,
        last_processed_id: &str,
    ) -> Result<SyncState> {
        self.conn
            .execute(
                r#"
                INSERT INTO sync_state (channel_id, last_synced_at, last_processed_id)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(channel_id) DO UPDATE SET
                    last_synced_at = excluded.last_synced_at,
                    last_processed_id = excluded.last_processed_id
                WHERE excluded.last_synced_at > sync_state.last_synced_at
                "#,
                params![channel_id, encode_time(synced_at), last_processed_id],
            )
            .await
            .with_context(|| format!("advancing sync state for {channel_id}"))?;
        self.load(channel_id)
            .await?
            .with_context(|| format!("sync state for {channel_id} vanished after write"))
    }

    /// Records one terminal outcome. Items that reached the destination join
    /// the completion ledger and leave the retry ledger; failures with a known
    /// channel are queued for retry.
    pub async fn record_outcome(&self, outcome: &ItemOutcome) -> Result<()> {
        let now = encode_time(Utc::now());
        let id = outcome.identifier();
        match outcome.kind {
            OutcomeKind::Succeeded | OutcomeKind::Unverified => {
                let tx = self.conn.transaction().await?;
                tx.execute(
                    r#"
                    INSERT INTO completed_items (video_id, channel_id, handle, outcome, completed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(video_id) DO UPDATE SET
                        handle = excluded.handle,
                        outcome = excluded.outcome,
                        completed_at = excluded.completed_at
                    "#,
                    params![
                        id,
                        outcome.task.channel_id.as_deref(),
                        outcome.handle.as_deref(),
                        outcome.kind.as_str(),
                        now.as_str(),
                    ],
                )
                .await?;
                tx.execute("DELETE FROM retry_items WHERE video_id = ?1", params![id])
                    .await?;
                tx.commit().await?;
            }
            OutcomeKind::Failed => {
                let Some(channel_id) = outcome.task.channel_id.as_deref() else {
                    return Ok(());
                };
                self.conn
                    .execute(
                        r#"
                        INSERT INTO retry_items (video_id, channel_id, published_at, reason, attempts, failed_at)
                        VALUES (?1, ?2, ?3, ?4, 1, ?5)
                        ON CONFLICT(video_id) DO UPDATE SET
                            reason = excluded.reason,
                            attempts = retry_items.attempts + 1,
                            failed_at = excluded.failed_at
                        "#,
                        params![
                            id,
                            channel_id,
                            outcome.published_at.map(encode_time),
                            outcome.reason.as_deref(),
                            now.as_str(),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn is_completed(&self, video_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM completed_items WHERE video_id = ?1",
                params![video_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Subset of `video_ids` already present in the completion ledger.
    pub async fn completed_among(&self, video_ids: &[String]) -> Result<HashSet<String>> {
        let mut done = HashSet::new();
        for id in video_ids {
            if self.is_completed(id).await? {
                done.insert(id.clone());
            }
        }
        Ok(done)
    }

    /// Failed items of a channel that have failed fewer than `max_attempts`
    /// times, oldest publication first.
    pub async fn pending_retries(
        &self,
        channel_id: &str,
        max_attempts: u32,
    ) -> Result<Vec<VideoTask>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, published_at FROM retry_items
                WHERE channel_id = ?1 AND attempts < ?2
                ORDER BY published_at IS NOT NULL, published_at, video_id
                "#,
                params![channel_id, i64::from(max_attempts)],
            )
            .await?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            let video_id: String = row.get(0)?;
            let published_at = row
                .get::<Option<String>>(1)?
                .map(|raw| decode_time(&raw))
                .transpose()?;
            tasks.push(VideoTask::new(
                video_id,
                Some(channel_id.to_string()),
                published_at,
            )?);
        }
        Ok(tasks)
    }

    #[cfg(test)]
    pub async fn retry_attempts(&self, video_id: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT attempts FROM retry_items WHERE video_id = ?1",
                params![video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

fn row_to_state(row: &Row) -> Result<SyncState> {
    let raw: String = row.get(1)?;
    Ok(SyncState {
        channel_id: row.get(0)?,
        last_synced_at: decode_time(&raw)?,
        last_processed_id: row.get(2)?,
    })
}
