use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which external portal a record came from. Purchases feed stock in,
/// sales feed stock out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Portal {
    Purchases,
    Sales,
}

impl Portal {
    pub fn record_kind(&self) -> RecordKind {
        match self {
            Portal::Purchases => RecordKind::Order,
            Portal::Sales => RecordKind::Invoice,
        }
    }

    pub fn direction(&self) -> MovementDirection {
        match self {
            Portal::Purchases => MovementDirection::In,
            Portal::Sales => MovementDirection::Out,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Portal::Purchases => "purchases",
            Portal::Sales => "sales",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Order,
    Invoice,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Pending,
    Confirmed,
    Shipped,
    Completed,
    Cancelled,
    #[default]
    Unknown,
}

impl RecordStatus {
    /// Maps free-form portal status text onto the known set. Anything
    /// unrecognized collapses to `Unknown` rather than failing the row.
    pub fn parse(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "pending" | "awaiting" | "open" => RecordStatus::Pending,
            "confirmed" | "approved" | "accepted" => RecordStatus::Confirmed,
            "shipped" | "dispatched" | "in transit" => RecordStatus::Shipped,
            "completed" | "complete" | "delivered" | "paid" | "closed" => RecordStatus::Completed,
            "cancelled" | "canceled" | "void" | "voided" => RecordStatus::Cancelled,
            _ => RecordStatus::Unknown,
        }
    }
}

/// One order or invoice as captured from a portal. The natural key is the
/// portal-assigned number and never changes after the first upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub portal: Portal,
    pub kind: RecordKind,
    pub natural_key: String,
    pub status: RecordStatus,
    pub record_date: Option<DateTime<Utc>>,
    pub counterparty: Option<String>,
    /// Fixed-precision decimal kept as a string to avoid float drift.
    pub total: String,
    pub purchase_reference: Option<String>,
    pub line_items: Vec<LineItem>,
    pub detail_url: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    /// Raw list-row text kept for diagnostics.
    pub raw_capture: Option<String>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub process_error: Option<String>,
}

impl ExternalRecord {
    pub fn new(portal: Portal, natural_key: impl Into<String>) -> Self {
        Self {
            portal,
            kind: portal.record_kind(),
            natural_key: natural_key.into(),
            status: RecordStatus::Unknown,
            record_date: None,
            counterparty: None,
            total: "0".to_string(),
            purchase_reference: None,
            line_items: Vec::new(),
            detail_url: None,
            last_synced_at: Utc::now(),
            raw_capture: None,
            processed: false,
            processed_at: None,
            process_error: None,
        }
    }

    pub fn has_detail(&self) -> bool {
        !self.line_items.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: String,
    pub line_total: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementDirection {
    In,
    Out,
}

/// Append-only ledger entry. Corrections are compensating entries, never edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: Uuid,
    pub sku: String,
    pub direction: MovementDirection,
    pub quantity: f64,
    pub reference_kind: RecordKind,
    pub reference_key: String,
    pub created_at: DateTime<Utc>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sku: String,
    pub quantity: f64,
    pub last_restock_at: Option<DateTime<Utc>>,
    pub last_restock_reference: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Running,
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncCounts {
    pub found: u32,
    pub inserted: u32,
    pub updated: u32,
    pub failed: u32,
}

/// One pipeline invocation for one portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub portal: Portal,
    pub status: SyncStatus,
    pub counts: SyncCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncLog {
    pub fn start(portal: Portal) -> Self {
        Self {
            id: Uuid::new_v4(),
            portal,
            status: SyncStatus::Running,
            counts: SyncCounts::default(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }
}

/// Options accepted by `POST /sync/run-now` and by the scheduler.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RunOptions {
    /// Maximum number of list records to visit; `None` means unlimited.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Whether to invoke the ledger engine after the fetch passes.
    #[serde(default = "default_process_stock")]
    pub process_stock: bool,
}

fn default_process_stock() -> bool {
    true
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            process_stock: true,
        }
    }
}

/// Failure local to one record, accumulated instead of aborting the batch.
#[derive(Debug, Clone, Serialize)]
pub struct RecordError {
    pub natural_key: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub errors: Vec<RecordError>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_maps_to_direction_and_kind() {
        assert_eq!(Portal::Purchases.direction(), MovementDirection::In);
        assert_eq!(Portal::Sales.direction(), MovementDirection::Out);
        assert_eq!(Portal::Purchases.record_kind(), RecordKind::Order);
        assert_eq!(Portal::Sales.record_kind(), RecordKind::Invoice);
    }

    #[test]
    fn status_parse_collapses_unknown() {
        assert_eq!(RecordStatus::parse("Shipped"), RecordStatus::Shipped);
        assert_eq!(RecordStatus::parse(" PAID "), RecordStatus::Completed);
        assert_eq!(RecordStatus::parse("weird"), RecordStatus::Unknown);
        assert_eq!(RecordStatus::parse(""), RecordStatus::Unknown);
    }

    #[test]
    fn new_record_has_no_detail() {
        let record = ExternalRecord::new(Portal::Sales, "INV-1");
        assert!(!record.has_detail());
        assert!(!record.processed);
        assert_eq!(record.total, "0");
    }
}
