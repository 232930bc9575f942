// 🗄️ Pipeline store - SQLite + WAL
// Append-only snapshot history, dataset version log, run records,
// experiment tracking and the audit event trail.

use crate::error::Result;
use crate::pipeline::{RunRecord, RunState};
use crate::snapshot::{RawSnapshot, SnapshotHistory};
use crate::tracking::TrackingRun;
use crate::version::DatasetVersion;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Event for the audit trail: every state transition of a run is an event.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id TEXT PRIMARY KEY,
            observed_at TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            base_currency TEXT NOT NULL,
            api_date TEXT NOT NULL,
            time_last_updated INTEGER,
            source_file TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS observations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id),
            target_currency TEXT NOT NULL,
            rate REAL,
            UNIQUE (snapshot_id, target_currency)
        );

        CREATE TABLE IF NOT EXISTS dataset_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            commit_id TEXT UNIQUE NOT NULL,
            committed_at TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            byte_size INTEGER NOT NULL,
            remote_location TEXT NOT NULL,
            pointer_path TEXT NOT NULL,
            message TEXT NOT NULL,
            uploaded INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            state TEXT NOT NULL,
            failed_stage TEXT,
            reason TEXT,
            content_hash TEXT
        );

        CREATE TABLE IF NOT EXISTS tracking_runs (
            run_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            params TEXT NOT NULL,
            metrics TEXT NOT NULL,
            artifacts TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_observed_at ON snapshots(observed_at);
        CREATE INDEX IF NOT EXISTS idx_versions_hash ON dataset_versions(content_hash);
        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// SNAPSHOT HISTORY
// ============================================================================

/// Append a snapshot to the history.
/// Returns false when a snapshot with the same `observed_at` already exists.
pub fn insert_snapshot(conn: &Connection, snapshot: &RawSnapshot, source_file: &str) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;

    let result = tx.execute(
        "INSERT INTO snapshots (
            snapshot_id, observed_at, timestamp, base_currency, api_date,
            time_last_updated, source_file
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snapshot.snapshot_id,
            ts(snapshot.observed_at),
            snapshot.timestamp,
            snapshot.base_currency,
            snapshot.api_date,
            snapshot.time_last_updated,
            source_file,
        ],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO observations (snapshot_id, target_currency, rate) VALUES (?1, ?2, ?3)",
        )?;
        for (target, rate) in &snapshot.rates {
            stmt.execute(params![snapshot.snapshot_id, target, rate])?;
        }
    }

    tx.commit()?;
    Ok(true)
}

/// Load the full snapshot history in observation order.
pub fn load_history(conn: &Connection) -> Result<SnapshotHistory> {
    let mut stmt = conn.prepare(
        "SELECT s.snapshot_id, s.observed_at, s.timestamp, s.base_currency, s.api_date,
                s.time_last_updated, o.target_currency, o.rate
         FROM snapshots s
         LEFT JOIN observations o ON o.snapshot_id = s.snapshot_id
         ORDER BY s.observed_at, o.target_currency",
    )?;

    let mut rows = stmt.query([])?;
    let mut snapshots: Vec<RawSnapshot> = Vec::new();

    while let Some(row) = rows.next()? {
        let snapshot_id: String = row.get(0)?;

        let is_new = snapshots
            .last()
            .map_or(true, |s| s.snapshot_id != snapshot_id);

        if is_new {
            let observed_raw: String = row.get(1)?;
            snapshots.push(RawSnapshot {
                snapshot_id,
                observed_at: parse_ts(1, &observed_raw)?,
                timestamp: row.get(2)?,
                base_currency: row.get(3)?,
                api_date: row.get(4)?,
                time_last_updated: row.get(5)?,
                rates: BTreeMap::new(),
            });
        }

        let target: Option<String> = row.get(6)?;
        let rate: Option<f64> = row.get(7)?;
        if let (Some(target), Some(current)) = (target, snapshots.last_mut()) {
            current.rates.insert(target, rate);
        }
    }

    SnapshotHistory::new(snapshots)
}

pub fn snapshot_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// DATASET VERSION LOG
// ============================================================================

pub fn insert_dataset_version(conn: &Connection, version: &DatasetVersion) -> Result<()> {
    conn.execute(
        "INSERT INTO dataset_versions (
            commit_id, committed_at, content_hash, row_count, byte_size,
            remote_location, pointer_path, message, uploaded
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            version.commit_id,
            ts(version.committed_at),
            version.content_hash,
            version.row_count as i64,
            version.byte_size as i64,
            version.remote_location,
            version.pointer_path,
            version.message,
            version.uploaded,
        ],
    )?;
    Ok(())
}

fn version_from_row(row: &Row) -> rusqlite::Result<DatasetVersion> {
    let committed_raw: String = row.get(1)?;
    let row_count: i64 = row.get(3)?;
    let byte_size: i64 = row.get(4)?;
    Ok(DatasetVersion {
        commit_id: row.get(0)?,
        committed_at: parse_ts(1, &committed_raw)?,
        content_hash: row.get(2)?,
        row_count: row_count.max(0) as usize,
        byte_size: byte_size.max(0) as u64,
        remote_location: row.get(5)?,
        pointer_path: row.get(6)?,
        message: row.get(7)?,
        uploaded: row.get(8)?,
    })
}

const VERSION_COLUMNS: &str = "commit_id, committed_at, content_hash, row_count, byte_size,
    remote_location, pointer_path, message, uploaded";

/// Full version log, oldest first.
pub fn get_dataset_versions(conn: &Connection) -> Result<Vec<DatasetVersion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM dataset_versions ORDER BY id ASC",
        VERSION_COLUMNS
    ))?;
    let versions = stmt
        .query_map([], version_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Latest commit whose hash or commit id starts with `reference`.
pub fn find_dataset_version(conn: &Connection, reference: &str) -> Result<Option<DatasetVersion>> {
    let prefix = reference.trim().replace(['%', '_'], "");
    if prefix.is_empty() {
        return Ok(None);
    }
    let pattern = format!("{}%", prefix);
    let version = conn
        .query_row(
            &format!(
                "SELECT {} FROM dataset_versions
                 WHERE content_hash LIKE ?1 OR commit_id LIKE ?1
                 ORDER BY id DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            params![pattern],
            version_from_row,
        )
        .optional()?;
    Ok(version)
}

pub fn latest_dataset_version(conn: &Connection) -> Result<Option<DatasetVersion>> {
    let version = conn
        .query_row(
            &format!(
                "SELECT {} FROM dataset_versions ORDER BY id DESC LIMIT 1",
                VERSION_COLUMNS
            ),
            [],
            version_from_row,
        )
        .optional()?;
    Ok(version)
}

// ============================================================================
// PIPELINE RUNS
// ============================================================================

/// Insert or replace the record of a run.
pub fn save_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO pipeline_runs (
            run_id, timestamp, started_at, finished_at, state, failed_stage, reason, content_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(run_id) DO UPDATE SET
            finished_at = excluded.finished_at,
            state = excluded.state,
            failed_stage = excluded.failed_stage,
            reason = excluded.reason,
            content_hash = excluded.content_hash",
        params![
            run.run_id,
            run.timestamp,
            ts(run.started_at),
            run.finished_at.map(ts),
            run.state.as_str(),
            run.failed_stage.map(|s| s.as_str()),
            run.reason,
            run.content_hash,
        ],
    )?;
    Ok(())
}

/// Most recent runs first.
pub fn get_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, timestamp, started_at, finished_at, state, failed_stage, reason, content_hash
         FROM pipeline_runs
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;

    let runs = stmt
        .query_map(params![limit as i64], |row| {
            let started_raw: String = row.get(2)?;
            let finished_raw: Option<String> = row.get(3)?;
            let state_raw: String = row.get(4)?;
            let stage_raw: Option<String> = row.get(5)?;

            let parse_state = |idx: usize, raw: &str| {
                RunState::parse(raw).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        Type::Text,
                        format!("unknown run state {}", raw).into(),
                    )
                })
            };

            Ok(RunRecord {
                run_id: row.get(0)?,
                timestamp: row.get(1)?,
                started_at: parse_ts(2, &started_raw)?,
                finished_at: finished_raw.map(|raw| parse_ts(3, &raw)).transpose()?,
                state: parse_state(4, &state_raw)?,
                failed_stage: stage_raw.map(|raw| parse_state(5, &raw)).transpose()?,
                reason: row.get(6)?,
                content_hash: row.get(7)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(runs)
}

// ============================================================================
// EXPERIMENT TRACKING
// ============================================================================

pub fn insert_tracking_run(conn: &Connection, run: &TrackingRun) -> Result<()> {
    conn.execute(
        "INSERT INTO tracking_runs (run_id, name, started_at, params, metrics, artifacts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run.run_id,
            run.name,
            ts(run.started_at),
            serde_json::to_string(&run.params)?,
            serde_json::to_string(&run.metrics)?,
            serde_json::to_string(&run.artifacts)?,
        ],
    )?;
    Ok(())
}

pub fn get_tracking_runs(conn: &Connection) -> Result<Vec<TrackingRun>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, name, started_at, params, metrics, artifacts
         FROM tracking_runs
         ORDER BY started_at ASC",
    )?;

    let runs = stmt
        .query_map([], |row| {
            let started_raw: String = row.get(2)?;
            let params_raw: String = row.get(3)?;
            let metrics_raw: String = row.get(4)?;
            let artifacts_raw: String = row.get(5)?;
            Ok(TrackingRun {
                run_id: row.get(0)?,
                name: row.get(1)?,
                started_at: parse_ts(2, &started_raw)?,
                params: parse_json(3, &params_raw)?,
                metrics: parse_json(4, &metrics_raw)?,
                artifacts: parse_json(5, &artifacts_raw)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(runs)
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            ts(event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for a specific entity, in insertion order
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_ts(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: parse_json(5, &data_json)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}
