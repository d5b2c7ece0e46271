#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use staffing_kernel_contracts::reconcile::{
    DefectCategory, MonthFilter, ReconcileChange, ReconcileRequest, ReconciliationReport,
    RECONCILE_MAX_TIMEOUT_MS,
};
use staffing_kernel_contracts::{ContractViolation, CorrelationId, MonotonicTimeNs};
use staffing_os::reconcile::{ReconcileError, ReconcileRuntime, ReconcileRuntimeConfig};
use staffing_storage::repo::StaffingRepo;
use staffing_storage::sqlite::SqliteStaffingStore;
use staffing_storage::store::StaffingStore;
use tracing::info;

pub const ENV_HTTP_BIND: &str = "STAFFING_HTTP_BIND";
pub const ENV_STORE_PATH: &str = "STAFFING_STORE_PATH";
pub const ENV_RECONCILE_TIMEOUT_MS: &str = "STAFFING_RECONCILE_TIMEOUT_MS";
pub const ENV_SQLITE_BUSY_TIMEOUT_MS: &str = "STAFFING_SQLITE_BUSY_TIMEOUT_MS";
pub const ENV_LOG: &str = "STAFFING_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub http_bind: String,
    /// SQLite file; `None` keeps the tables in memory.
    pub store_path: Option<PathBuf>,
    pub reconcile_timeout_ms: u32,
    pub sqlite_busy_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:8080".to_string(),
            store_path: None,
            reconcile_timeout_ms: 30_000,
            sqlite_busy_timeout_ms: 5_000,
        }
    }
}

impl AdapterConfig {
    /// Out-of-range or unparsable values fall back to the defaults.
    pub fn from_env_var_map<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let trimmed = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            http_bind: trimmed(ENV_HTTP_BIND).unwrap_or(defaults.http_bind),
            store_path: trimmed(ENV_STORE_PATH).map(PathBuf::from),
            reconcile_timeout_ms: trimmed(ENV_RECONCILE_TIMEOUT_MS)
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| (100..=RECONCILE_MAX_TIMEOUT_MS).contains(v))
                .unwrap_or(defaults.reconcile_timeout_ms),
            sqlite_busy_timeout_ms: trimmed(ENV_SQLITE_BUSY_TIMEOUT_MS)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| (0..=60_000).contains(v))
                .unwrap_or(defaults.sqlite_busy_timeout_ms),
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePositionsRequest {
    #[serde(default)]
    pub month_years: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Per-request deadline; the configured default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateAllocationsRequest {
    #[serde(default)]
    pub month_years: Option<Vec<String>>,
    #[serde(default)]
    pub all_months: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Per-request deadline; the configured default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileChangeDto {
    pub category: DefectCategory,
    pub position_id: String,
    pub position_name: Option<String>,
    pub allocation_id: Option<String>,
    pub detail: String,
}

impl From<&ReconcileChange> for ReconcileChangeDto {
    fn from(c: &ReconcileChange) -> Self {
        Self {
            category: c.category,
            position_id: c.position_id.as_str().to_string(),
            position_name: c.position_name.clone(),
            allocation_id: c.allocation_id.as_ref().map(|a| a.as_str().to_string()),
            detail: c.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub success: bool,
    pub total_positions: u32,
    pub total_allocations: u32,
    pub changes_count: u32,
    pub changes: Vec<ReconcileChangeDto>,
    pub applied: bool,
    pub snapshot_digest: String,
}

impl From<&ReconciliationReport> for ReconcileResponse {
    fn from(r: &ReconciliationReport) -> Self {
        Self {
            success: true,
            total_positions: r.total_positions,
            total_allocations: r.total_allocations,
            changes_count: r.changes_count,
            changes: r.changes.iter().map(ReconcileChangeDto::from).collect(),
            applied: r.applied,
            snapshot_digest: r.snapshot_digest.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorBody,
}

impl From<&ReconcileError> for ErrorResponse {
    fn from(err: &ReconcileError) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
                retryable: err.retryable(),
            },
        }
    }
}

pub fn http_status_for(err: &ReconcileError) -> u16 {
    match err {
        ReconcileError::InvalidArgument(_) => 400,
        ReconcileError::ConcurrentModification { .. } => 409,
        ReconcileError::PartialFailure { .. } => 500,
        ReconcileError::StoreUnavailable { .. } => 503,
        ReconcileError::Timeout { .. } => 504,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub store: String,
    pub reason: Option<String>,
}

pub struct AdapterRuntime {
    repo: Box<dyn StaffingRepo>,
    store_kind: &'static str,
    reconcile: ReconcileRuntime,
    config: AdapterConfig,
    started: Instant,
    next_correlation_id: u64,
}

impl std::fmt::Debug for AdapterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRuntime")
            .field("store_kind", &self.store_kind)
            .field("config", &self.config)
            .finish()
    }
}

impl AdapterRuntime {
    pub fn new(repo: Box<dyn StaffingRepo>, store_kind: &'static str, config: AdapterConfig) -> Self {
        let reconcile = ReconcileRuntime::new(ReconcileRuntimeConfig {
            default_timeout_ms: config.reconcile_timeout_ms,
            ..ReconcileRuntimeConfig::mvp_v1()
        });
        Self {
            repo,
            store_kind,
            reconcile,
            config,
            started: Instant::now(),
            next_correlation_id: 1,
        }
    }

    pub fn in_memory(config: AdapterConfig) -> Self {
        Self::new(Box::new(StaffingStore::new_in_memory()), "memory", config)
    }

    pub fn from_config(config: AdapterConfig) -> Result<Self, String> {
        match &config.store_path {
            Some(path) => {
                let store = SqliteStaffingStore::open(
                    path,
                    Duration::from_millis(config.sqlite_busy_timeout_ms),
                )
                .map_err(|err| {
                    format!("failed to open staffing store '{}': {err}", path.display())
                })?;
                info!(path = %path.display(), "staffing store opened");
                Ok(Self::new(Box::new(store), "sqlite", config))
            }
            None => {
                info!("staffing store running in memory");
                Ok(Self::in_memory(config))
            }
        }
    }

    pub fn default_from_env() -> Result<Self, String> {
        Self::from_config(AdapterConfig::from_env())
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Direct table access for seeding and ordinary write paths.
    pub fn repo_mut(&mut self) -> &mut dyn StaffingRepo {
        self.repo.as_mut()
    }

    pub fn repo(&self) -> &dyn StaffingRepo {
        self.repo.as_ref()
    }

    /// `POST /allocations/validate-positions`: an explicit, non-empty month list.
    pub fn validate_positions(
        &mut self,
        request: ValidatePositionsRequest,
    ) -> Result<ReconcileResponse, ReconcileError> {
        let filter = MonthFilter::parse_months(&request.month_years)
            .map_err(ReconcileError::InvalidArgument)?;
        self.run_reconcile(filter, request.dry_run, request.timeout_ms)
    }

    /// `POST /positions/validate-allocations`: either a month list or an
    /// explicit `allMonths`, never both and never neither.
    pub fn validate_allocations(
        &mut self,
        request: ValidateAllocationsRequest,
    ) -> Result<ReconcileResponse, ReconcileError> {
        let filter = match (request.month_years, request.all_months) {
            (Some(months), false) => {
                MonthFilter::parse_months(&months).map_err(ReconcileError::InvalidArgument)?
            }
            (None, true) => MonthFilter::AllMonths,
            (Some(_), true) => {
                return Err(ReconcileError::InvalidArgument(
                    ContractViolation::InvalidValue {
                        field: "validate_allocations.scope",
                        reason: "give monthYears or allMonths, not both",
                    },
                ))
            }
            (None, false) => {
                return Err(ReconcileError::InvalidArgument(
                    ContractViolation::InvalidValue {
                        field: "validate_allocations.scope",
                        reason: "monthYears or allMonths=true is required",
                    },
                ))
            }
        };
        self.run_reconcile(filter, request.dry_run, request.timeout_ms)
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, String> {
        self.repo
            .store_health_row()
            .map_err(|err| format!("{} store unreachable: {err}", self.store_kind))?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            store: self.store_kind.to_string(),
            reason: None,
        })
    }

    fn run_reconcile(
        &mut self,
        filter: MonthFilter,
        dry_run: bool,
        timeout_ms: Option<u32>,
    ) -> Result<ReconcileResponse, ReconcileError> {
        let correlation_id = CorrelationId(self.next_correlation_id);
        self.next_correlation_id += 1;
        let now = MonotonicTimeNs(
            u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX),
        );
        let request = ReconcileRequest::v1(correlation_id, now, filter, dry_run, timeout_ms)
            .map_err(ReconcileError::InvalidArgument)?;
        let report = self.reconcile.run(self.repo.as_mut(), &request)?;
        Ok(ReconcileResponse::from(&report))
    }
}
