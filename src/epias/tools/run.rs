use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::epias::tools::auth::{CasClient, Credentials, TicketAuthority};
use crate::epias::tools::config::RunConfig;
use crate::epias::tools::error::Result;
use crate::epias::tools::fetch::{FetchOrchestrator, FetchSettings};
use crate::epias::tools::io::{excel_read, excel_write};
use crate::epias::tools::model::{EntityId, Manifest};
use crate::epias::tools::pivot::{self, build_pivot};
use crate::epias::tools::transport::{ExportClient, HttpExportClient, RetryingTransport};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pivot_rows: usize,
    pub pivot_columns: usize,
    pub output: PathBuf,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} meters downloaded ({} not found); pivot {} rows x {} meters written to {}",
            self.succeeded,
            self.total,
            self.failed,
            self.pivot_rows,
            self.pivot_columns,
            self.output.display()
        )
    }
}

/// Runs an export against the live CAS and reporting endpoints.
pub async fn run(config: &RunConfig) -> Result<RunSummary> {
    let transport = RetryingTransport::from_config(&config.transport)?;
    let authority = CasClient::from_config(
        &config.auth,
        config.transport.request_timeout(),
        transport.clone(),
    )?;
    let exporter = Arc::new(HttpExportClient::new(
        transport,
        config.auth.service_url.clone(),
    ));
    execute(config, &authority, exporter).await
}

/// Sequences one run: input, authentication, downloads, manifest, pivot.
///
/// Everything before the downloads is fatal and leaves the workbook untouched.
/// Per-meter failures only show up as `not found` in the manifest.
#[instrument(
    level = "info",
    skip_all,
    fields(run_id = tracing::field::Empty, workbook = %config.workbook.path.display())
)]
pub async fn execute(
    config: &RunConfig,
    authority: &dyn TicketAuthority,
    exporter: Arc<dyn ExportClient>,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    tracing::Span::current().record("run_id", tracing::field::display(run_id));
    config.validate()?;

    let workbook_path = &config.workbook.path;
    let ids = unique_ids(excel_read::read_entity_ids(
        workbook_path,
        &config.workbook.id_headers,
    )?);
    let mut workbook = excel_read::read_workbook(workbook_path)?;
    info!(meter_count = ids.len(), "meter list loaded");

    let auth = authority
        .acquire_auth_ticket(&Credentials::from(&config.auth))
        .await?;
    info!(workers = config.fetch.workers, "authenticated, starting downloads");

    let orchestrator = FetchOrchestrator::new(exporter, FetchSettings::from(config));
    let manifest = Manifest::new(orchestrator.fetch_all(authority, &auth, &ids).await);
    info!(
        succeeded = manifest.succeeded(),
        failed = manifest.len() - manifest.succeeded(),
        "downloads finished"
    );

    let pivot_table = build_pivot(&manifest.successful_paths(), &config.workbook.index_header);
    workbook.upsert(pivot::manifest_sheet(
        &config.workbook.manifest_sheet,
        &manifest,
    ));
    workbook.upsert(pivot::pivot_sheet(
        &config.workbook.pivot_sheet,
        &pivot_table,
    ));
    excel_write::write_workbook(workbook_path, &workbook)?;

    if let Some(json_path) = &config.workbook.manifest_json {
        if let Err(error) = write_manifest_json(json_path, &manifest) {
            warn!(path = %json_path.display(), %error, "manifest json not written");
        }
    }

    let summary = RunSummary {
        run_id,
        total: manifest.len(),
        succeeded: manifest.succeeded(),
        failed: manifest.len() - manifest.succeeded(),
        pivot_rows: pivot_table.row_count(),
        pivot_columns: pivot_table.columns.len(),
        output: workbook_path.clone(),
    };
    info!(%summary, "run complete");
    Ok(summary)
}

/// Secondary copy of the manifest. The workbook is already written by the time
/// this runs, so callers only log a failure.
fn write_manifest_json(path: &Path, manifest: &Manifest) -> Result<()> {
    let json = serde_json::to_string_pretty(&manifest.records())?;
    fs::write(path, json)?;
    Ok(())
}

/// Drops repeated ids, keeping the first occurrence.
fn unique_ids(ids: Vec<EntityId>) -> Vec<EntityId> {
    let mut seen = HashSet::with_capacity(ids.len());
    let total = ids.len();
    let unique: Vec<EntityId> = ids.into_iter().filter(|id| seen.insert(*id)).collect();
    if unique.len() != total {
        warn!(
            duplicates = total - unique.len(),
            "duplicate meter ids ignored"
        );
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_keep_first_occurrence() {
        let ids = vec![EntityId(3), EntityId(1), EntityId(3), EntityId(2), EntityId(1)];
        assert_eq!(
            unique_ids(ids),
            vec![EntityId(3), EntityId(1), EntityId(2)]
        );
    }

    #[test]
    fn summary_reads_as_one_line() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            total: 3,
            succeeded: 2,
            failed: 1,
            pivot_rows: 744,
            pivot_columns: 2,
            output: PathBuf::from("main.xlsx"),
        };
        assert_eq!(
            summary.to_string(),
            "2 of 3 meters downloaded (1 not found); pivot 744 rows x 2 meters written to main.xlsx"
        );
    }
}
