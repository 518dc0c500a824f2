//! SLQ solver settings with TOML loading and validation.
//!
//! Every field can be supplied from an external configuration map (TOML
//! table) whose keys match the field names; unspecified fields keep their
//! defaults. `validate()` runs the settings-local configuration checks
//! before any iteration starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OcxError, OcxResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlqSettings {
    /// Absolute/relative tolerance of the rollout and Riccati integrators.
    pub integrator_tol: f64,
    /// Step-acceptance tolerance of the Riccati sweep (reserved for looser
    /// backward tolerance than the rollout).
    pub riccati_tol: f64,
    /// Iteration cap; 0 runs initialization only.
    pub max_iterations: usize,
    /// Relative cost-change convergence threshold.
    pub min_rel_cost_improvement: f64,
    /// Both constraint ISE norms must fall below this for convergence.
    pub constraint_ise_tolerance: f64,
    /// Backtracking contraction factor, in (0, 1).
    pub line_search_contraction: f64,
    /// Smallest line-search step tested.
    pub min_step_size: f64,
    /// Largest line-search step tested.
    pub max_step_size: f64,
    /// Type-1 constraint correction step, in (0, 1].
    pub constraint_step_size: f64,
    /// Eigenvalues of the projected state cost below this floor are clipped.
    pub psd_eigenvalue_floor: f64,
    /// Solve partition Riccati equations concurrently, seeded from the
    /// previous iteration's boundary values.
    pub use_parallel_riccati: bool,
    /// Integrate Riccati equations on per-partition normalized time.
    pub use_normalized_time: bool,
    /// Worker threads for partition-level parallelism; 1 = sequential.
    pub num_workers: usize,
    /// Armijo sufficient-decrease coefficient, in (0, 1).
    pub armijo_coefficient: f64,
    /// Quadratic penalty weight on state-only constraints.
    pub state_constraint_penalty: f64,
    /// Relative singular-value cutoff of the constraint pseudo-inverse.
    pub rank_tolerance: f64,
    /// Hard cap on integrator steps per rollout leg.
    pub max_integrator_steps: usize,
    /// Optional per-iteration wall-clock budget [s]; overrun returns
    /// best-so-far with a non-convergence flag.
    pub iteration_time_budget: Option<f64>,
}

impl Default for SlqSettings {
    fn default() -> Self {
        Self {
            integrator_tol: 1e-9,
            riccati_tol: 1e-9,
            max_iterations: 15,
            min_rel_cost_improvement: 1e-4,
            constraint_ise_tolerance: 1e-6,
            line_search_contraction: 0.5,
            min_step_size: 0.05,
            max_step_size: 1.0,
            constraint_step_size: 1.0,
            psd_eigenvalue_floor: 0.0,
            use_parallel_riccati: false,
            use_normalized_time: true,
            num_workers: 1,
            armijo_coefficient: 1e-4,
            state_constraint_penalty: 100.0,
            rank_tolerance: 1e-9,
            max_integrator_steps: 100_000,
            iteration_time_budget: None,
        }
    }
}

impl SlqSettings {
    /// Parse settings from a TOML configuration map.
    pub fn from_toml_str(text: &str) -> OcxResult<Self> {
        let settings: Self = toml::from_str(text)
            .map_err(|e| OcxError::config(format!("settings parse error: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> OcxResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OcxError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> OcxResult<()> {
        if !(self.integrator_tol > 0.0) || !(self.riccati_tol > 0.0) {
            return Err(OcxError::config("integrator tolerances must be positive"));
        }
        if !(0.0 < self.line_search_contraction && self.line_search_contraction < 1.0) {
            return Err(OcxError::config("line_search_contraction must lie in (0, 1)"));
        }
        if !(self.min_step_size > 0.0) || self.min_step_size > self.max_step_size {
            return Err(OcxError::config(
                "step sizes must satisfy 0 < min_step_size <= max_step_size",
            ));
        }
        if !(0.0 < self.constraint_step_size && self.constraint_step_size <= 1.0) {
            return Err(OcxError::config("constraint_step_size must lie in (0, 1]"));
        }
        if !(0.0 < self.armijo_coefficient && self.armijo_coefficient < 1.0) {
            return Err(OcxError::config("armijo_coefficient must lie in (0, 1)"));
        }
        if self.num_workers == 0 {
            return Err(OcxError::config("num_workers must be at least 1"));
        }
        if self.state_constraint_penalty < 0.0 {
            return Err(OcxError::config("state_constraint_penalty must be non-negative"));
        }
        if !(self.rank_tolerance > 0.0) {
            return Err(OcxError::config("rank_tolerance must be positive"));
        }
        if !(self.constraint_ise_tolerance > 0.0) {
            return Err(OcxError::config("constraint_ise_tolerance must be positive"));
        }
        if let Some(budget) = self.iteration_time_budget {
            if !(budget > 0.0) {
                return Err(OcxError::config("iteration_time_budget must be positive"));
            }
        }
        Ok(())
    }
}
