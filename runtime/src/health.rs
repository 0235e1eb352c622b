//! Per-SKU worker health.
//!
//! Each SKU worker reports a [`WorkerState`] to a shared [`HealthBoard`]; the
//! board folds them into a [`HealthReport`] whose status is the worst of its
//! checks.

use chrono::{DateTime, Utc};
use flashsale_core::types::SkuId;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Health level, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Taking requests normally
    Healthy,
    /// Taking no batches for now (circuit open); recovers on its own
    Degraded,
    /// Stopped until an operator intervenes
    Unhealthy,
}

impl HealthStatus {
    /// Whether the status is `Healthy`
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Whether the status is `Degraded`
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Whether the status is `Unhealthy`
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The worse of two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    /// Lowercase label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one component (one SKU worker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Component name, `sku:{id}` for workers
    pub component: String,
    /// Current level
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    /// Extra key/value details
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    fn with_status(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            metadata: Vec::new(),
        }
    }

    /// Healthy check
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Healthy, None)
    }

    /// Degraded check with a reason
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Degraded, Some(message.into()))
    }

    /// Unhealthy check with a reason
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a detail
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Checks of every SKU worker, with the overall (worst) status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status among `checks`; `Healthy` when there are none
    pub status: HealthStatus,
    /// One check per SKU
    pub checks: Vec<HealthCheck>,
    /// When the report was built
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Aggregate `checks`
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);
        Self {
            status,
            checks,
            timestamp: Utc::now(),
        }
    }

    /// Whether every check is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Whether the worst check is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Whether any check is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// Check for one component, if present
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.component == component)
    }
}

/// Lifecycle of one SKU worker as seen by health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Taking batches
    Running,
    /// Breaker open or ledger unavailable; submits are refused
    Degraded(String),
    /// Stopped on an invariant violation or exhausted restarts
    Halted(String),
    /// Stopped by shutdown
    Stopped,
}

/// Shared map of worker states.
#[derive(Debug, Clone, Default)]
pub struct HealthBoard {
    workers: Arc<RwLock<BTreeMap<SkuId, WorkerState>>>,
}

impl HealthBoard {
    /// Create an empty board
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state of a SKU's worker
    pub fn set(&self, sku_id: &SkuId, state: WorkerState) {
        if let Ok(mut workers) = self.workers.write() {
            let previous = workers.insert(sku_id.clone(), state.clone());
            if previous.as_ref() != Some(&state) {
                tracing::debug!(sku = %sku_id, state = ?state, "Worker state changed");
            }
        }
    }

    /// State of a SKU's worker, `None` if no worker was ever started
    #[must_use]
    pub fn get(&self, sku_id: &SkuId) -> Option<WorkerState> {
        self.workers
            .read()
            .ok()
            .and_then(|workers| workers.get(sku_id).cloned())
    }

    /// One check per SKU, aggregated
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let checks = self.workers.read().map_or_else(
            |_| vec![HealthCheck::unhealthy("workers", "health board poisoned")],
            |workers| {
                workers
                    .iter()
                    .map(|(sku_id, state)| {
                        let component = format!("sku:{sku_id}");
                        match state {
                            WorkerState::Running | WorkerState::Stopped => {
                                HealthCheck::healthy(component)
                            }
                            WorkerState::Degraded(reason) => {
                                HealthCheck::degraded(component, reason.clone())
                            }
                            WorkerState::Halted(reason) => {
                                HealthCheck::unhealthy(component, reason.clone())
                            }
                        }
                        .with_metadata("state", state_label(state))
                    })
                    .collect()
            },
        );
        HealthReport::new(checks)
    }
}

const fn state_label(state: &WorkerState) -> &'static str {
    match state {
        WorkerState::Running => "running",
        WorkerState::Degraded(_) => "degraded",
        WorkerState::Halted(_) => "halted",
        WorkerState::Stopped => "stopped",
    }
}
