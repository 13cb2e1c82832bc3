//! In-memory ticket authority and export client for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use epias_tools::testing::{ScriptedAuthority, ScriptedExporter, ScriptedReply};
//!
//! let authority = ScriptedAuthority::new();
//! let exporter = ScriptedExporter::delivering(fixtures::numeric_export("M1", &[1.0])?);
//! exporter.script(EntityId(1), vec![ScriptedReply::Status(503)]).await;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::epias::tools::auth::{Credentials, TicketAuthority};
use crate::epias::tools::error::{AuthError, TransportError};
use crate::epias::tools::model::{AuthTicket, EntityId, FetchRequest, ServiceTicket};
use crate::epias::tools::transport::{ExportClient, ExportResponse, SPREADSHEET_CONTENT_TYPE};

/// Ticket authority that hands out numbered tickets.
#[derive(Debug, Default)]
pub struct ScriptedAuthority {
    reject_login: AtomicBool,
    /// 1-based mint call numbers that fail.
    failing_mints: HashSet<usize>,
    login_calls: AtomicUsize,
    mint_calls: AtomicUsize,
    minted: AtomicUsize,
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the TGT request fail with a 401.
    pub fn rejecting_login() -> Self {
        let authority = Self::default();
        authority.reject_login.store(true, Ordering::SeqCst);
        authority
    }

    pub fn with_failing_mints(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_mints.extend(calls);
        self
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of service tickets successfully issued.
    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketAuthority for ScriptedAuthority {
    async fn acquire_auth_ticket(
        &self,
        credentials: &Credentials,
    ) -> Result<AuthTicket, AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected { status: 401 });
        }
        Ok(AuthTicket::new(format!("TGT-{}", credentials.username)))
    }

    async fn acquire_service_ticket(
        &self,
        _auth: &AuthTicket,
        _service: &str,
    ) -> Result<ServiceTicket, AuthError> {
        let call = self.mint_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_mints.contains(&call) {
            return Err(AuthError::Rejected { status: 500 });
        }
        self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(ServiceTicket::new(format!("ST-{call}")))
    }
}

/// One scripted answer of the export endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// 200 with an xlsx body.
    Spreadsheet(Vec<u8>),
    /// 200 with a JSON body.
    WrongContentType,
    /// Bare status without body.
    Status(u16),
    /// Connection-level failure.
    Fault,
}

/// Export client replaying scripted answers per meter.
///
/// Meters without a script (or whose script ran out) get the default body.
#[derive(Debug)]
pub struct ScriptedExporter {
    default_body: Vec<u8>,
    latency: Duration,
    scripts: RwLock<HashMap<EntityId, VecDeque<ScriptedReply>>>,
    calls: RwLock<HashMap<EntityId, usize>>,
    tickets: RwLock<HashSet<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedExporter {
    pub fn delivering(default_body: Vec<u8>) -> Self {
        Self {
            default_body,
            latency: Duration::ZERO,
            scripts: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            tickets: RwLock::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn script(&self, entity_id: EntityId, replies: Vec<ScriptedReply>) {
        self.scripts
            .write()
            .await
            .insert(entity_id, replies.into_iter().collect());
    }

    pub async fn calls_for(&self, entity_id: EntityId) -> usize {
        self.calls.read().await.get(&entity_id).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> usize {
        self.calls.read().await.values().sum()
    }

    pub async fn meters_called(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn distinct_tickets(&self) -> usize {
        self.tickets.read().await.len()
    }

    /// Highest number of concurrently running export calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn next_reply(&self, entity_id: EntityId) -> ScriptedReply {
        self.scripts
            .write()
            .await
            .get_mut(&entity_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ScriptedReply::Spreadsheet(self.default_body.clone()))
    }
}

#[async_trait]
impl ExportClient for ScriptedExporter {
    async fn export(
        &self,
        _auth: &AuthTicket,
        ticket: &ServiceTicket,
        request: &FetchRequest,
    ) -> Result<ExportResponse, TransportError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        *self
            .calls
            .write()
            .await
            .entry(request.entity_id)
            .or_insert(0) += 1;
        self.tickets
            .write()
            .await
            .insert(ticket.as_str().to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let reply = self.next_reply(request.entity_id).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            ScriptedReply::Spreadsheet(body) => Ok(ExportResponse {
                status: 200,
                content_type: SPREADSHEET_CONTENT_TYPE.to_string(),
                body,
            }),
            ScriptedReply::WrongContentType => Ok(ExportResponse {
                status: 200,
                content_type: "application/json".to_string(),
                body: br#"{"error":"no data"}"#.to_vec(),
            }),
            ScriptedReply::Status(status) => Ok(ExportResponse {
                status,
                content_type: String::new(),
                body: Vec::new(),
            }),
            ScriptedReply::Fault => Err(TransportError::Connect("connection reset".into())),
        }
    }
}

/// Builders for spreadsheets shaped like the service's hourly exports.
pub mod fixtures {
    use rust_xlsxwriter::{Workbook, XlsxError};

    /// One cell of the reading column.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Reading {
        Number(f64),
        Text(String),
        Blank,
    }

    /// Builds an export with `label` in C2 and the readings in column G from row 2.
    pub fn export_workbook(label: &str, readings: &[Reading]) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Date")?;
        sheet.write_string(0, 2, "Meter")?;
        sheet.write_string(0, 6, "Consumption (MWh)")?;

        for (offset, reading) in readings.iter().enumerate() {
            let row = offset as u32 + 1;
            sheet.write_number(row, 0, offset as f64)?;
            if row == 1 && !label.is_empty() {
                sheet.write_string(row, 2, label)?;
            }
            match reading {
                Reading::Number(value) => {
                    sheet.write_number(row, 6, *value)?;
                }
                Reading::Text(value) => {
                    sheet.write_string(row, 6, value)?;
                }
                Reading::Blank => {}
            }
        }

        workbook.save_to_buffer()
    }

    /// Shorthand for an all-numeric export.
    pub fn numeric_export(label: &str, readings: &[f64]) -> Result<Vec<u8>, XlsxError> {
        let readings: Vec<Reading> = readings.iter().copied().map(Reading::Number).collect();
        export_workbook(label, &readings)
    }

    /// Builds an input workbook with one id column under `header`.
    pub fn meter_list(header: &str, ids: &[i64]) -> Result<Vec<u8>, XlsxError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Meters")?;
        sheet.write_string(0, 0, "Name")?;
        sheet.write_string(0, 1, header)?;
        for (offset, id) in ids.iter().enumerate() {
            let row = offset as u32 + 1;
            sheet.write_string(row, 0, &format!("meter {id}"))?;
            sheet.write_number(row, 1, *id as f64)?;
        }
        workbook.save_to_buffer()
    }
}
