//! Concurrent per-meter export downloads.
//!
//! Service tickets are minted one at a time on the submitting path, each right
//! after a worker slot frees up, and then moved into the task that uses them.
//! Every task reports back with its input index so results land in a pre-sized
//! slot vector regardless of completion order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::epias::tools::auth::TicketAuthority;
use crate::epias::tools::config::RunConfig;
use crate::epias::tools::model::{
    AuthTicket, EntityId, FetchRequest, FetchResult, ReportingPeriod, ServiceTicket,
};
use crate::epias::tools::transport::ExportClient;

/// Operation-level retry policy for one meter.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Everything a download task needs besides the tickets.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub workers: usize,
    pub policy: FetchPolicy,
    /// Service identifier the service tickets are minted for.
    pub service: String,
    pub period: ReportingPeriod,
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl From<&RunConfig> for FetchSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            workers: config.fetch.workers,
            policy: FetchPolicy {
                max_attempts: config.fetch.max_attempts,
                retry_delay: Duration::from_millis(config.fetch.retry_delay_ms),
            },
            service: config.auth.service_url.clone(),
            period: config.report.clone(),
            output_dir: config.fetch.output_dir.clone(),
            file_prefix: config.fetch.file_prefix.clone(),
        }
    }
}

impl FetchSettings {
    /// Deterministic download location for one meter.
    pub fn target_path(&self, entity_id: EntityId) -> PathBuf {
        self.output_dir
            .join(format!("{}{}.xlsx", self.file_prefix, entity_id))
    }
}

/// Fans export downloads out over a bounded worker pool.
pub struct FetchOrchestrator {
    exporter: Arc<dyn ExportClient>,
    settings: FetchSettings,
}

impl FetchOrchestrator {
    pub fn new(exporter: Arc<dyn ExportClient>, settings: FetchSettings) -> Self {
        Self { exporter, settings }
    }

    /// Downloads every meter and returns exactly one result per id, in input
    /// order. Individual failures become [`FetchResult::not_found`].
    pub async fn fetch_all(
        &self,
        authority: &dyn TicketAuthority,
        auth: &AuthTicket,
        ids: &[EntityId],
    ) -> Vec<FetchResult> {
        let mut slots: Vec<Option<FetchResult>> = vec![None; ids.len()];
        let workers = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, &entity_id) in ids.iter().enumerate() {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                slots[index] = Some(FetchResult::not_found(entity_id));
                continue;
            };

            let ticket = match authority
                .acquire_service_ticket(auth, &self.settings.service)
                .await
            {
                Ok(ticket) => ticket,
                Err(error) => {
                    warn!(meter = %entity_id, %error, "could not mint service ticket");
                    slots[index] = Some(FetchResult::not_found(entity_id));
                    continue;
                }
            };

            let exporter = Arc::clone(&self.exporter);
            let auth = auth.clone();
            let request = FetchRequest::new(entity_id, self.settings.period.clone());
            let policy = self.settings.policy.clone();
            let target = self.settings.target_path(entity_id);
            let download = download(exporter, auth, ticket, request, policy, target);
            tasks.spawn(async move {
                let result = download.await;
                drop(permit);
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    debug!(meter = %result.entity_id, success = result.is_success(), "download finished");
                    slots[index] = Some(result);
                }
                Err(error) => warn!(%error, "download task aborted"),
            }
        }

        slots
            .into_iter()
            .zip(ids)
            .map(|(slot, &entity_id)| slot.unwrap_or_else(|| FetchResult::not_found(entity_id)))
            .collect()
    }
}

/// Runs the attempt loop for one meter with its own service ticket.
#[instrument(level = "debug", skip_all, fields(meter = %request.entity_id))]
async fn download(
    exporter: Arc<dyn ExportClient>,
    auth: AuthTicket,
    ticket: ServiceTicket,
    request: FetchRequest,
    policy: FetchPolicy,
    target: PathBuf,
) -> FetchResult {
    let entity_id = request.entity_id;

    for attempt in 1..=policy.max_attempts {
        match exporter.export(&auth, &ticket, &request).await {
            Ok(response) if response.is_spreadsheet() => {
                match persist(&target, &response.body).await {
                    Ok(()) => {
                        info!(meter = %entity_id, path = %target.display(), "export downloaded");
                        return FetchResult::downloaded(entity_id, target);
                    }
                    Err(error) => {
                        warn!(meter = %entity_id, attempt, %error, "could not store export")
                    }
                }
            }
            Ok(response) => warn!(
                meter = %entity_id,
                attempt,
                status = response.status,
                content_type = %response.content_type,
                "no spreadsheet in response"
            ),
            Err(error) => warn!(meter = %entity_id, attempt, %error, "export call failed"),
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    warn!(meter = %entity_id, attempts = policy.max_attempts, "export failed permanently");
    FetchResult::not_found(entity_id)
}

async fn persist(target: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, body).await
}
