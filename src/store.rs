//! Persistence behind a trait so the pipeline and ledger run the same
//! against sqlite in production and an in-memory map in tests. Records
//! are keyed by (portal, natural key); movements are append-only.

use crate::models::{
    ExternalRecord, InventoryItem, LineItem, MovementDirection, Portal, RecordKind, RecordStatus,
    StockMovement, SyncLog, SyncStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("record {natural_key} not found for {portal:?}")]
    RecordNotFound { portal: Portal, natural_key: String },
    #[error("sync log {0} not found")]
    LogNotFound(Uuid),
}

/// Outcome of a list-pass upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

pub trait Store: Send + Sync {
    /// Inserts or refreshes the list-visible fields of a record. Detail
    /// data and processing state on an existing row are preserved.
    fn upsert_record(&self, record: &ExternalRecord) -> Result<UpsertOutcome, StoreError>;

    /// Replaces line items and, when present, the authoritative total
    /// parsed from the detail page.
    fn attach_detail(
        &self,
        portal: Portal,
        natural_key: &str,
        lines: &[LineItem],
        total: Option<&str>,
    ) -> Result<(), StoreError>;

    fn get_record(&self, portal: Portal, natural_key: &str)
    -> Result<Option<ExternalRecord>, StoreError>;

    /// Unprocessed records that have at least one line item.
    fn pending_records(&self, portal: Option<Portal>) -> Result<Vec<ExternalRecord>, StoreError>;

    /// Sets the processed marker. An error message records a terminal
    /// failure without leaving the record eligible for reprocessing.
    fn mark_processed(
        &self,
        portal: Portal,
        natural_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    fn insert_movement(&self, movement: &StockMovement) -> Result<(), StoreError>;

    fn movements_for(&self, reference_key: &str) -> Result<Vec<StockMovement>, StoreError>;

    /// Applies a signed quantity change to the on-hand count, creating
    /// the item at zero if unseen. Inbound movements stamp the restock
    /// fields.
    fn adjust_inventory(
        &self,
        sku: &str,
        direction: MovementDirection,
        quantity: f64,
        restock_reference: Option<&str>,
    ) -> Result<(), StoreError>;

    fn get_inventory(&self, sku: &str) -> Result<Option<InventoryItem>, StoreError>;

    fn insert_sync_log(&self, log: &SyncLog) -> Result<(), StoreError>;

    fn update_sync_log(&self, log: &SyncLog) -> Result<(), StoreError>;

    fn sync_history(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError>;

    fn running_sync(&self) -> Result<Option<SyncLog>, StoreError>;

    /// Force-fails a stale RUNNING log entry. Returns the updated log.
    fn cancel_sync_log(&self, id: Uuid) -> Result<SyncLog, StoreError>;
}

fn merge_list_fields(existing: &mut ExternalRecord, incoming: &ExternalRecord) -> bool {
    let changed = existing.status != incoming.status
        || existing.record_date != incoming.record_date
        || existing.counterparty != incoming.counterparty
        || existing.total != incoming.total
        || existing.purchase_reference != incoming.purchase_reference
        || existing.detail_url != incoming.detail_url;
    existing.status = incoming.status;
    existing.record_date = incoming.record_date;
    existing.counterparty = incoming.counterparty.clone();
    existing.total = incoming.total.clone();
    existing.purchase_reference = incoming.purchase_reference.clone();
    existing.detail_url = incoming.detail_url.clone();
    existing.raw_capture = incoming.raw_capture.clone();
    existing.last_synced_at = incoming.last_synced_at;
    changed
}

// ---------------------------------------------------------------------
// In-memory store, used by tests and available as a throwaway backend.
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    records: HashMap<(Portal, String), ExternalRecord>,
    movements: Vec<StockMovement>,
    inventory: HashMap<String, InventoryItem>,
    logs: Vec<SyncLog>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn upsert_record(&self, record: &ExternalRecord) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (record.portal, record.natural_key.clone());
        match inner.records.get_mut(&key) {
            Some(existing) => {
                if merge_list_fields(existing, record) {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Ok(UpsertOutcome::Unchanged)
                }
            }
            None => {
                inner.records.insert(key, record.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    fn attach_detail(
        &self,
        portal: Portal,
        natural_key: &str,
        lines: &[LineItem],
        total: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&(portal, natural_key.to_string()))
            .ok_or_else(|| StoreError::RecordNotFound {
                portal,
                natural_key: natural_key.to_string(),
            })?;
        record.line_items = lines.to_vec();
        if let Some(total) = total {
            record.total = total.to_string();
        }
        Ok(())
    }

    fn get_record(
        &self,
        portal: Portal,
        natural_key: &str,
    ) -> Result<Option<ExternalRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.get(&(portal, natural_key.to_string())).cloned())
    }

    fn pending_records(&self, portal: Option<Portal>) -> Result<Vec<ExternalRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<ExternalRecord> = inner
            .records
            .values()
            .filter(|r| !r.processed && !r.line_items.is_empty())
            .filter(|r| portal.is_none_or(|p| r.portal == p))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(pending)
    }

    fn mark_processed(
        &self,
        portal: Portal,
        natural_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&(portal, natural_key.to_string()))
            .ok_or_else(|| StoreError::RecordNotFound {
                portal,
                natural_key: natural_key.to_string(),
            })?;
        record.processed = true;
        record.processed_at = Some(Utc::now());
        record.process_error = error.map(|e| e.to_string());
        Ok(())
    }

    fn insert_movement(&self, movement: &StockMovement) -> Result<(), StoreError> {
        self.inner.lock().unwrap().movements.push(movement.clone());
        Ok(())
    }

    fn movements_for(&self, reference_key: &str) -> Result<Vec<StockMovement>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .movements
            .iter()
            .filter(|m| m.reference_key == reference_key)
            .cloned()
            .collect())
    }

    fn adjust_inventory(
        &self,
        sku: &str,
        direction: MovementDirection,
        quantity: f64,
        restock_reference: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner
            .inventory
            .entry(sku.to_string())
            .or_insert_with(|| InventoryItem {
                sku: sku.to_string(),
                quantity: 0.0,
                last_restock_at: None,
                last_restock_reference: None,
            });
        match direction {
            MovementDirection::In => {
                item.quantity += quantity;
                item.last_restock_at = Some(Utc::now());
                item.last_restock_reference = restock_reference.map(|r| r.to_string());
            }
            MovementDirection::Out => item.quantity -= quantity,
        }
        Ok(())
    }

    fn get_inventory(&self, sku: &str) -> Result<Option<InventoryItem>, StoreError> {
        Ok(self.inner.lock().unwrap().inventory.get(sku).cloned())
    }

    fn insert_sync_log(&self, log: &SyncLog) -> Result<(), StoreError> {
        self.inner.lock().unwrap().logs.push(log.clone());
        Ok(())
    }

    fn update_sync_log(&self, log: &SyncLog) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.logs.iter_mut().find(|l| l.id == log.id) {
            Some(slot) => {
                *slot = log.clone();
                Ok(())
            }
            None => Err(StoreError::LogNotFound(log.id)),
        }
    }

    fn sync_history(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut logs = inner.logs.clone();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(limit);
        Ok(logs)
    }

    fn running_sync(&self) -> Result<Option<SyncLog>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .logs
            .iter()
            .find(|l| l.status == SyncStatus::Running)
            .cloned())
    }

    fn cancel_sync_log(&self, id: Uuid) -> Result<SyncLog, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner
            .logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StoreError::LogNotFound(id))?;
        log.status = SyncStatus::Failed;
        log.finished_at = Some(Utc::now());
        log.error = Some("cancelled by operator".to_string());
        Ok(log.clone())
    }
}

// ---------------------------------------------------------------------
// Sqlite store. One connection behind a mutex is plenty at this write
// volume; line items ride along as a JSON column.
// ---------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    portal TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    record_date TEXT,
    counterparty TEXT,
    total TEXT NOT NULL,
    purchase_reference TEXT,
    line_items TEXT NOT NULL DEFAULT '[]',
    detail_url TEXT,
    last_synced_at TEXT NOT NULL,
    raw_capture TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT,
    process_error TEXT,
    PRIMARY KEY (portal, natural_key)
);
CREATE TABLE IF NOT EXISTS movements (
    id TEXT PRIMARY KEY,
    sku TEXT NOT NULL,
    direction TEXT NOT NULL,
    quantity REAL NOT NULL,
    reference_kind TEXT NOT NULL,
    reference_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    note TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_movements_reference ON movements (reference_key);
CREATE TABLE IF NOT EXISTS inventory (
    sku TEXT PRIMARY KEY,
    quantity REAL NOT NULL DEFAULT 0,
    last_restock_at TEXT,
    last_restock_reference TEXT
);
CREATE TABLE IF NOT EXISTS sync_logs (
    id TEXT PRIMARY KEY,
    portal TEXT NOT NULL,
    status TEXT NOT NULL,
    found INTEGER NOT NULL DEFAULT 0,
    inserted INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error TEXT
);
";

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    // Enums serialize as JSON strings; strip the quotes for the column.
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_val<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(&format!("\"{text}\""))?)
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecordRow> {
        Ok(RawRecordRow {
            portal: row.get(0)?,
            natural_key: row.get(1)?,
            kind: row.get(2)?,
            status: row.get(3)?,
            record_date: row.get(4)?,
            counterparty: row.get(5)?,
            total: row.get(6)?,
            purchase_reference: row.get(7)?,
            line_items: row.get(8)?,
            detail_url: row.get(9)?,
            last_synced_at: row.get(10)?,
            raw_capture: row.get(11)?,
            processed: row.get(12)?,
            processed_at: row.get(13)?,
            process_error: row.get(14)?,
        })
    }
}

const RECORD_COLUMNS: &str = "portal, natural_key, kind, status, record_date, counterparty, \
     total, purchase_reference, line_items, detail_url, last_synced_at, raw_capture, \
     processed, processed_at, process_error";

struct RawRecordRow {
    portal: String,
    natural_key: String,
    kind: String,
    status: String,
    record_date: Option<String>,
    counterparty: Option<String>,
    total: String,
    purchase_reference: Option<String>,
    line_items: String,
    detail_url: Option<String>,
    last_synced_at: String,
    raw_capture: Option<String>,
    processed: bool,
    processed_at: Option<String>,
    process_error: Option<String>,
}

impl RawRecordRow {
    fn into_record(self) -> Result<ExternalRecord, StoreError> {
        Ok(ExternalRecord {
            portal: enum_val::<Portal>(&self.portal)?,
            kind: enum_val::<RecordKind>(&self.kind)?,
            natural_key: self.natural_key,
            status: enum_val::<RecordStatus>(&self.status)?,
            record_date: self.record_date.as_deref().and_then(parse_ts),
            counterparty: self.counterparty,
            total: self.total,
            purchase_reference: self.purchase_reference,
            line_items: serde_json::from_str(&self.line_items)?,
            detail_url: self.detail_url,
            last_synced_at: parse_ts(&self.last_synced_at).unwrap_or_else(Utc::now),
            raw_capture: self.raw_capture,
            processed: self.processed,
            processed_at: self.processed_at.as_deref().and_then(parse_ts),
            process_error: self.process_error,
        })
    }
}

impl Store for SqliteStore {
    fn upsert_record(&self, record: &ExternalRecord) -> Result<UpsertOutcome, StoreError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<RawRecordRow> = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE portal = ?1 AND natural_key = ?2"
                ),
                params![enum_str(&record.portal)?, record.natural_key],
                Self::row_to_record,
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    &format!(
                        "INSERT INTO records ({RECORD_COLUMNS}) VALUES \
                         (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                    ),
                    params![
                        enum_str(&record.portal)?,
                        record.natural_key,
                        enum_str(&record.kind)?,
                        enum_str(&record.status)?,
                        record.record_date.as_ref().map(ts),
                        record.counterparty,
                        record.total,
                        record.purchase_reference,
                        to_json(&record.line_items)?,
                        record.detail_url,
                        ts(&record.last_synced_at),
                        record.raw_capture,
                        record.processed,
                        record.processed_at.as_ref().map(ts),
                        record.process_error,
                    ],
                )?;
                Ok(UpsertOutcome::Created)
            }
            Some(row) => {
                let mut current = row.into_record()?;
                let changed = merge_list_fields(&mut current, record);
                conn.execute(
                    "UPDATE records SET status = ?3, record_date = ?4, counterparty = ?5, \
                     total = ?6, purchase_reference = ?7, detail_url = ?8, raw_capture = ?9, \
                     last_synced_at = ?10 WHERE portal = ?1 AND natural_key = ?2",
                    params![
                        enum_str(&current.portal)?,
                        current.natural_key,
                        enum_str(&current.status)?,
                        current.record_date.as_ref().map(ts),
                        current.counterparty,
                        current.total,
                        current.purchase_reference,
                        current.detail_url,
                        current.raw_capture,
                        ts(&current.last_synced_at),
                    ],
                )?;
                if changed {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Ok(UpsertOutcome::Unchanged)
                }
            }
        }
    }

    fn attach_detail(
        &self,
        portal: Portal,
        natural_key: &str,
        lines: &[LineItem],
        total: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = match total {
            Some(total) => conn.execute(
                "UPDATE records SET line_items = ?3, total = ?4 \
                 WHERE portal = ?1 AND natural_key = ?2",
                params![enum_str(&portal)?, natural_key, to_json(&lines)?, total],
            )?,
            None => conn.execute(
                "UPDATE records SET line_items = ?3 WHERE portal = ?1 AND natural_key = ?2",
                params![enum_str(&portal)?, natural_key, to_json(&lines)?],
            )?,
        };
        if updated == 0 {
            return Err(StoreError::RecordNotFound {
                portal,
                natural_key: natural_key.to_string(),
            });
        }
        Ok(())
    }

    fn get_record(
        &self,
        portal: Portal,
        natural_key: &str,
    ) -> Result<Option<ExternalRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE portal = ?1 AND natural_key = ?2"
                ),
                params![enum_str(&portal)?, natural_key],
                Self::row_to_record,
            )
            .optional()?;
        row.map(RawRecordRow::into_record).transpose()
    }

    fn pending_records(&self, portal: Option<Portal>) -> Result<Vec<ExternalRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let base = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE processed = 0 AND line_items != '[]'"
        );
        let rows: Vec<RawRecordRow> = match portal {
            Some(portal) => {
                let mut stmt =
                    conn.prepare(&format!("{base} AND portal = ?1 ORDER BY natural_key"))?;
                let mapped = stmt.query_map(params![enum_str(&portal)?], Self::row_to_record)?;
                mapped.collect::<Result<_, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{base} ORDER BY natural_key"))?;
                let mapped = stmt.query_map([], Self::row_to_record)?;
                mapped.collect::<Result<_, _>>()?
            }
        };
        rows.into_iter().map(RawRecordRow::into_record).collect()
    }

    fn mark_processed(
        &self,
        portal: Portal,
        natural_key: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE records SET processed = 1, processed_at = ?3, process_error = ?4 \
             WHERE portal = ?1 AND natural_key = ?2",
            params![enum_str(&portal)?, natural_key, ts(&Utc::now()), error],
        )?;
        if updated == 0 {
            return Err(StoreError::RecordNotFound {
                portal,
                natural_key: natural_key.to_string(),
            });
        }
        Ok(())
    }

    fn insert_movement(&self, movement: &StockMovement) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO movements (id, sku, direction, quantity, reference_kind, \
             reference_key, created_at, note) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                movement.id.to_string(),
                movement.sku,
                enum_str(&movement.direction)?,
                movement.quantity,
                enum_str(&movement.reference_kind)?,
                movement.reference_key,
                ts(&movement.created_at),
                movement.note,
            ],
        )?;
        Ok(())
    }

    fn movements_for(&self, reference_key: &str) -> Result<Vec<StockMovement>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, sku, direction, quantity, reference_kind, reference_key, \
             created_at, note FROM movements WHERE reference_key = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![reference_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut movements = Vec::new();
        for row in rows {
            let (id, sku, direction, quantity, kind, reference_key, created_at, note) = row?;
            movements.push(StockMovement {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                sku,
                direction: enum_val::<MovementDirection>(&direction)?,
                quantity,
                reference_kind: enum_val::<RecordKind>(&kind)?,
                reference_key,
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
                note,
            });
        }
        Ok(movements)
    }

    fn adjust_inventory(
        &self,
        sku: &str,
        direction: MovementDirection,
        quantity: f64,
        restock_reference: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let delta = match direction {
            MovementDirection::In => quantity,
            MovementDirection::Out => -quantity,
        };
        conn.execute(
            "INSERT INTO inventory (sku, quantity) VALUES (?1, ?2) \
             ON CONFLICT(sku) DO UPDATE SET quantity = quantity + ?2",
            params![sku, delta],
        )?;
        if direction == MovementDirection::In {
            conn.execute(
                "UPDATE inventory SET last_restock_at = ?2, last_restock_reference = ?3 \
                 WHERE sku = ?1",
                params![sku, ts(&Utc::now()), restock_reference],
            )?;
        }
        Ok(())
    }

    fn get_inventory(&self, sku: &str) -> Result<Option<InventoryItem>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT sku, quantity, last_restock_at, last_restock_reference \
                 FROM inventory WHERE sku = ?1",
                params![sku],
                |row| {
                    Ok(InventoryItem {
                        sku: row.get(0)?,
                        quantity: row.get(1)?,
                        last_restock_at: row
                            .get::<_, Option<String>>(2)?
                            .as_deref()
                            .and_then(parse_ts),
                        last_restock_reference: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }

    fn insert_sync_log(&self, log: &SyncLog) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_logs (id, portal, status, found, inserted, updated, failed, \
             started_at, finished_at, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                log.id.to_string(),
                enum_str(&log.portal)?,
                enum_str(&log.status)?,
                log.counts.found,
                log.counts.inserted,
                log.counts.updated,
                log.counts.failed,
                ts(&log.started_at),
                log.finished_at.as_ref().map(ts),
                log.error,
            ],
        )?;
        Ok(())
    }

    fn update_sync_log(&self, log: &SyncLog) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sync_logs SET status = ?2, found = ?3, inserted = ?4, updated = ?5, \
             failed = ?6, finished_at = ?7, error = ?8 WHERE id = ?1",
            params![
                log.id.to_string(),
                enum_str(&log.status)?,
                log.counts.found,
                log.counts.inserted,
                log.counts.updated,
                log.counts.failed,
                log.finished_at.as_ref().map(ts),
                log.error,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::LogNotFound(log.id));
        }
        Ok(())
    }

    fn sync_history(&self, limit: usize) -> Result<Vec<SyncLog>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, portal, status, found, inserted, updated, failed, started_at, \
             finished_at, error FROM sync_logs ORDER BY started_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_log)?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?.into_log()?);
        }
        Ok(logs)
    }

    fn running_sync(&self) -> Result<Option<SyncLog>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, portal, status, found, inserted, updated, failed, started_at, \
                 finished_at, error FROM sync_logs WHERE status = 'RUNNING' \
                 ORDER BY started_at DESC LIMIT 1",
                [],
                row_to_log,
            )
            .optional()?;
        row.map(RawLogRow::into_log).transpose()
    }

    fn cancel_sync_log(&self, id: Uuid) -> Result<SyncLog, StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            let updated = conn.execute(
                "UPDATE sync_logs SET status = 'FAILED', finished_at = ?2, error = ?3 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    ts(&Utc::now()),
                    "cancelled by operator",
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::LogNotFound(id));
            }
        }
        let conn = self.conn.lock().unwrap();
        let row = conn.query_row(
            "SELECT id, portal, status, found, inserted, updated, failed, started_at, \
             finished_at, error FROM sync_logs WHERE id = ?1",
            params![id.to_string()],
            row_to_log,
        )?;
        row.into_log()
    }
}

struct RawLogRow {
    id: String,
    portal: String,
    status: String,
    found: u32,
    inserted: u32,
    updated: u32,
    failed: u32,
    started_at: String,
    finished_at: Option<String>,
    error: Option<String>,
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawLogRow> {
    Ok(RawLogRow {
        id: row.get(0)?,
        portal: row.get(1)?,
        status: row.get(2)?,
        found: row.get(3)?,
        inserted: row.get(4)?,
        updated: row.get(5)?,
        failed: row.get(6)?,
        started_at: row.get(7)?,
        finished_at: row.get(8)?,
        error: row.get(9)?,
    })
}

impl RawLogRow {
    fn into_log(self) -> Result<SyncLog, StoreError> {
        Ok(SyncLog {
            id: Uuid::parse_str(&self.id).unwrap_or_else(|_| Uuid::nil()),
            portal: enum_val::<Portal>(&self.portal)?,
            status: enum_val::<SyncStatus>(&self.status)?,
            counts: crate::models::SyncCounts {
                found: self.found,
                inserted: self.inserted,
                updated: self.updated,
                failed: self.failed,
            },
            started_at: parse_ts(&self.started_at).unwrap_or_else(Utc::now),
            finished_at: self.finished_at.as_deref().and_then(parse_ts),
            error: self.error,
        })
    }
}
