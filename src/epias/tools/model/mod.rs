use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Literal written to the manifest for meters whose export never arrived.
pub const NOT_FOUND_MARKER: &str = "not found";

/// Numeric meter identifier as used by the export endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ticket-granting ticket. Acquired once per run and shared read-only by every
/// download task.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthTicket(String);

impl AuthTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthTicket(..)")
    }
}

/// Single-use service ticket scoped to the export service.
///
/// Deliberately not `Clone`: a ticket moves into exactly one download task.
#[derive(PartialEq, Eq)]
pub struct ServiceTicket(String);

impl ServiceTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ServiceTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceTicket(..)")
    }
}

/// Fixed reporting-period parameters sent with every export request.
///
/// Read from configuration in snake_case and serialised in the camelCase shape
/// the export endpoint expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "camelCase"))]
pub struct ReportingPeriod {
    /// Start of the reporting month (RFC 3339).
    pub period: String,
    /// Settlement version timestamp (RFC 3339).
    pub version: String,
    pub is_retrospective: bool,
    /// Price region code.
    pub region: String,
    /// Organization id of the requesting market participant.
    pub organization: i64,
    pub is_last_version: bool,
    pub read_status: bool,
    /// Requested export format.
    pub export_type: String,
}

impl Default for ReportingPeriod {
    fn default() -> Self {
        Self {
            period: "2025-12-01T00:00:00+03:00".into(),
            version: "2025-12-01T00:00:00+03:00".into(),
            is_retrospective: false,
            region: "TR1".into(),
            organization: 6464,
            is_last_version: false,
            read_status: true,
            export_type: "XLSX".into(),
        }
    }
}

/// JSON payload for one export call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRequest {
    #[serde(flatten)]
    pub period: ReportingPeriod,
    #[serde(rename = "meterId")]
    pub entity_id: EntityId,
}

impl FetchRequest {
    pub fn new(entity_id: EntityId, period: ReportingPeriod) -> Self {
        Self { period, entity_id }
    }
}

/// Final state of one meter's download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The export was delivered and stored at the given path.
    Downloaded(PathBuf),
    /// Every attempt failed or the service never delivered a spreadsheet.
    NotFound,
}

/// Result slot for one submitted meter id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub entity_id: EntityId,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn downloaded(entity_id: EntityId, path: PathBuf) -> Self {
        Self {
            entity_id,
            outcome: FetchOutcome::Downloaded(path),
        }
    }

    pub fn not_found(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            outcome: FetchOutcome::NotFound,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Downloaded(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.outcome {
            FetchOutcome::Downloaded(path) => Some(path),
            FetchOutcome::NotFound => None,
        }
    }

    /// Text written into the manifest's file path column.
    pub fn manifest_cell(&self) -> String {
        match &self.outcome {
            FetchOutcome::Downloaded(path) => path.display().to_string(),
            FetchOutcome::NotFound => NOT_FOUND_MARKER.to_string(),
        }
    }
}

/// One record of the JSON manifest export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    pub entity_id: EntityId,
    pub success: bool,
    pub path: Option<PathBuf>,
}

/// Every attempted download with its outcome, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<FetchResult>,
}

impl Manifest {
    pub fn new(entries: Vec<FetchResult>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_success()).count()
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&FetchResult> {
        self.entries.iter().find(|entry| entry.entity_id == entity_id)
    }

    /// Paths of delivered exports, in manifest order.
    pub fn successful_paths(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter_map(|entry| entry.path().map(Path::to_path_buf))
            .collect()
    }

    pub fn records(&self) -> Vec<ManifestRecord> {
        self.entries
            .iter()
            .map(|entry| ManifestRecord {
                entity_id: entry.entity_id,
                success: entry.is_success(),
                path: entry.path().map(Path::to_path_buf),
            })
            .collect()
    }
}

/// One pivot column: a meter label and its converted hourly values.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotColumn {
    pub label: String,
    /// Values by time-axis row. Shorter exports leave trailing rows unset.
    pub cells: Vec<f64>,
}

/// Wide table keyed by the shared hourly axis.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    /// Header of the index column.
    pub index_header: String,
    pub columns: Vec<PivotColumn>,
}

impl PivotTable {
    /// Number of time-axis rows, i.e. the longest column.
    pub fn row_count(&self) -> usize {
        self.columns
            .iter()
            .map(|column| column.cells.len())
            .max()
            .unwrap_or(0)
    }

    pub fn cell(&self, row: usize, column: usize) -> Option<f64> {
        self.columns
            .get(column)
            .and_then(|column| column.cells.get(row))
            .copied()
    }
}
