//! Applies synced records to the stock ledger. At-most-once is enforced
//! with the per-record processed marker: a record produces movements on
//! exactly one pass, after which reruns skip it no matter how many times
//! the portals re-serve it.

use crate::models::{ExternalRecord, MovementDirection, Portal, RecordKind, StockMovement};
use crate::store::{Store, StoreError};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-run totals for a ledger pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub processed: u32,
    pub skipped: u32,
    pub errors: u32,
}

pub struct LedgerEngine<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> LedgerEngine<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Walks every unprocessed record with line items and applies it.
    /// Failures are isolated per record: the record is marked processed
    /// with the error captured, the walk continues.
    pub fn apply_pending(&self, portal: Option<Portal>) -> Result<LedgerSummary, StoreError> {
        let pending = self.store.pending_records(portal)?;
        let mut summary = LedgerSummary::default();

        for record in pending {
            match self.apply_record(&record) {
                Ok(applied) => {
                    if applied {
                        summary.processed += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        target = "stocksync.ledger",
                        natural_key = %record.natural_key,
                        error = %err,
                        "ledger apply failed, marking record with error"
                    );
                    self.store
                        .mark_processed(record.portal, &record.natural_key, Some(&err.to_string()))?;
                    summary.errors += 1;
                }
            }
        }

        info!(
            target = "stocksync.ledger",
            processed = summary.processed,
            skipped = summary.skipped,
            errors = summary.errors,
            "ledger pass complete"
        );
        Ok(summary)
    }

    /// Movements for one record. Zero and negative quantity lines carry
    /// no stock information and are skipped; a record whose lines all
    /// skip stays unprocessed so a corrected detail page can still land.
    fn apply_record(&self, record: &ExternalRecord) -> Result<bool, StoreError> {
        let direction = record.portal.direction();
        let movable: Vec<_> = record
            .line_items
            .iter()
            .filter(|line| line.quantity > 0.0)
            .collect();
        if movable.is_empty() {
            return Ok(false);
        }

        for line in &movable {
            let movement = StockMovement {
                id: Uuid::new_v4(),
                sku: line.sku.clone(),
                direction,
                quantity: line.quantity,
                reference_kind: record.kind,
                reference_key: record.natural_key.clone(),
                created_at: Utc::now(),
                note: note_for(record.kind, &record.natural_key, &line.name),
            };
            self.store.insert_movement(&movement)?;
            let restock_reference = match direction {
                MovementDirection::In => Some(record.natural_key.as_str()),
                MovementDirection::Out => None,
            };
            self.store
                .adjust_inventory(&line.sku, direction, line.quantity, restock_reference)?;
        }

        // Marked only after every line landed.
        self.store
            .mark_processed(record.portal, &record.natural_key, None)?;
        Ok(true)
    }
}

fn note_for(kind: RecordKind, natural_key: &str, line_name: &str) -> String {
    match kind {
        RecordKind::Order => format!("purchase order {natural_key}: {line_name}"),
        RecordKind::Invoice => format!("sales invoice {natural_key}: {line_name}"),
    }
}
