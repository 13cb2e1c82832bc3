//! Run configuration.
//!
//! A [`RunConfig`] is assembled once at startup from built-in defaults, an
//! optional TOML file and `EPIAS_`-prefixed environment variables, then handed to
//! the run controller by reference.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::epias::tools::error::{Result, ToolError};
use crate::epias::tools::model::ReportingPeriod;

/// Prefix for environment overrides, e.g. `EPIAS_AUTH__PASSWORD`.
pub const ENV_PREFIX: &str = "EPIAS_";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub auth: AuthConfig,
    pub report: ReportingPeriod,
    pub transport: TransportConfig,
    pub fetch: FetchConfig,
    pub workbook: WorkbookConfig,
}

/// CAS endpoints and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base of the CAS REST API, without the `/tickets` suffix.
    pub cas_base_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Export endpoint. Doubles as the service identifier for service tickets.
    pub service_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cas_base_url: "https://cas.epias.com.tr/cas/v1".into(),
            username: String::new(),
            password: String::new(),
            service_url: "https://epys.epias.com.tr/pre-reconciliation/v1/meter-data/approved-meter-data/hourly/export".into(),
        }
    }
}

/// Wire-level retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    /// First backoff delay; doubles on every retry.
    pub backoff_base_ms: u64,
    pub retry_statuses: Vec<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            max_attempts: 5,
            backoff_base_ms: 1000,
            retry_statuses: vec![500, 502, 503, 504],
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-meter download settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Width of the download worker pool.
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Directory receiving one export file per meter.
    pub output_dir: PathBuf,
    pub file_prefix: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            max_attempts: 3,
            retry_delay_ms: 3000,
            output_dir: PathBuf::from("saatlik"),
            file_prefix: "meter_".into(),
        }
    }
}

/// Input/output workbook layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkbookConfig {
    /// Workbook holding the meter list; rewritten with the manifest and pivot.
    pub path: PathBuf,
    /// Accepted headers for the meter id column, in priority order.
    pub id_headers: Vec<String>,
    pub manifest_sheet: String,
    pub pivot_sheet: String,
    pub index_header: String,
    pub manifest_json: Option<PathBuf>,
}

impl Default for WorkbookConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("main.xlsx"),
            id_headers: vec!["Meter ID".into(), "SayacID".into()],
            manifest_sheet: "ControlFile".into(),
            pivot_sheet: "HourlyPivot".into(),
            index_header: "Hour".into(),
            manifest_json: None,
        }
    }
}

impl RunConfig {
    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.auth.username.trim().is_empty() {
            return Err(ToolError::Config("auth.username must be set".into()));
        }
        if self.fetch.workers == 0 {
            return Err(ToolError::Config("fetch.workers cannot be 0".into()));
        }
        if self.fetch.workers > Semaphore::MAX_PERMITS {
            return Err(ToolError::Config(format!(
                "fetch.workers cannot exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.fetch.max_attempts == 0 || self.transport.max_attempts == 0 {
            return Err(ToolError::Config("max_attempts cannot be 0".into()));
        }
        if self.workbook.id_headers.is_empty() {
            return Err(ToolError::Config(
                "workbook.id_headers needs at least one header".into(),
            ));
        }
        if self.workbook.manifest_sheet == self.workbook.pivot_sheet {
            return Err(ToolError::Config(
                "manifest and pivot sheets must have different names".into(),
            ));
        }
        Ok(())
    }
}

fn base_figment() -> Figment {
    Figment::from(Serialized::defaults(RunConfig::default()))
}

/// Loads configuration from defaults, an optional TOML file and the environment.
pub fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let mut figment = base_figment();
    if let Some(path) = path {
        if !path.exists() {
            return Err(ToolError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ToolError::Config(e.to_string()))
}

/// Loads configuration from a TOML string on top of the defaults.
pub fn load_config_from_str(toml: &str) -> Result<RunConfig> {
    base_figment()
        .merge(Toml::string(toml))
        .extract()
        .map_err(|e| ToolError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_production_endpoints() {
        let config = RunConfig::default();
        assert_eq!(config.fetch.workers, 20);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.transport.max_attempts, 5);
        assert_eq!(config.transport.retry_statuses, vec![500, 502, 503, 504]);
        assert!(config.auth.cas_base_url.ends_with("/cas/v1"));
    }

    #[test]
    fn toml_overrides_merge_over_defaults() {
        let config = load_config_from_str(
            r#"
[auth]
username = "alice"
password = "secret"

[fetch]
workers = 4

[report]
organization = 1234
period = "2026-01-01T00:00:00+03:00"
"#,
        )
        .expect("config parsed");

        assert_eq!(config.auth.username, "alice");
        assert_eq!(config.auth.password, "secret");
        assert_eq!(config.fetch.workers, 4);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.report.organization, 1234);
        assert_eq!(config.report.region, "TR1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/epias.toml")));
        assert!(matches!(result, Err(ToolError::Config(_))));
    }

    #[test]
    fn config_file_is_loaded() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[auth]
username = "bob"

[workbook]
path = "meters.xlsx"
"#
        )
        .expect("written");

        let config = load_config(Some(file.path())).expect("config loaded");
        assert_eq!(config.auth.username, "bob");
        assert_eq!(config.workbook.path, PathBuf::from("meters.xlsx"));
    }

    #[test]
    fn validation_rejects_zero_workers() {
        let mut config = RunConfig::default();
        config.auth.username = "alice".into();
        config.fetch.workers = 0;
        assert!(matches!(config.validate(), Err(ToolError::Config(_))));
    }

    #[test]
    fn validation_rejects_more_workers_than_permits() {
        let mut config = RunConfig::default();
        config.auth.username = "alice".into();
        config.fetch.workers = usize::MAX;
        assert!(matches!(config.validate(), Err(ToolError::Config(_))));

        config.fetch.workers = Semaphore::MAX_PERMITS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_requires_username() {
        assert!(matches!(
            RunConfig::default().validate(),
            Err(ToolError::Config(_))
        ));
    }
}
