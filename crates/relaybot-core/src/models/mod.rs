//! Model catalog and health tracking.
//!
//! The catalog is built once at startup from configuration. Each model keeps
//! its own health record behind a mutex so the read-decide-write step of
//! one attempt is never interleaved with another attempt on the same model.
//!
//! State machine per model:
//!
//! ```text
//! AVAILABLE ⇄ RATE_LIMITED   (automatic, time bounded)
//! AVAILABLE ⇄ ERROR          (automatic, count bounded)
//! any       → DISABLED       (administrative only, left only administratively)
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::provider::ErrorKind;

/// Consecutive failures after which a model stops being a candidate.
pub const ERROR_THRESHOLD: u32 = 5;

/// Fixed cooldown applied after a rate-limit response.
pub const RATE_LIMIT_BACKOFF_SECS: i64 = 300;

/// Static description of a model, as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub context_length: u32,
}

impl ModelSpec {
    pub fn new(id: &str, name: &str, supports_tools: bool, is_free: bool, priority: i32, context_length: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            supports_tools,
            is_free,
            priority,
            context_length,
        }
    }
}

/// Built-in OpenRouter catalog.
pub fn default_models() -> Vec<ModelSpec> {
    vec![
        // Tool-capable models first.
        ModelSpec::new("moonshotai/kimi-k2:free", "Moonshot Kimi K2", true, true, 0, 65_536),
        ModelSpec::new("deepseek/deepseek-chat-v3-0324:free", "DeepSeek Chat V3", true, true, 1, 32_768),
        ModelSpec::new("google/gemini-flash-1.5-8b", "Gemini Flash 1.5 8B", true, true, 2, 1_000_000),
        ModelSpec::new("openai/gpt-3.5-turbo", "GPT-3.5 Turbo", true, false, 10, 16_385),
        // Text-only fallbacks.
        ModelSpec::new("meta-llama/llama-3.3-70b-instruct:free", "Llama 3.3 70B", false, true, 3, 8_192),
        ModelSpec::new("qwen/qwen3-235b-a22b-07-25:free", "Qwen3 235B", false, true, 4, 262_144),
        ModelSpec::new("tngtech/deepseek-r1t2-chimera:free", "DeepSeek R1T2 Chimera", false, true, 5, 32_768),
    ]
}

/// Health status of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Available,
    RateLimited,
    Error,
    Disabled,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

/// Point-in-time view of a model and its health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub supports_tools: bool,
    pub is_free: bool,
    pub priority: i32,
    pub context_length: u32,
    pub status: ModelStatus,
    pub consecutive_errors: u32,
    pub rate_limited_until: Option<DateTime<Utc>>,
}

/// Operational override accepted by the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Enable,
    Disable,
    Reset,
}

impl FromStr for AdminAction {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            "reset" => Ok(Self::Reset),
            _ => Err(CatalogError::InvalidAction(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("duplicate model id in catalog: {0}")]
    DuplicateModel(String),

    #[error("invalid action '{0}', expected enable, disable or reset")]
    InvalidAction(String),
}

#[derive(Debug, Clone)]
struct Health {
    status: ModelStatus,
    consecutive_errors: u32,
    rate_limited_until: Option<DateTime<Utc>>,
}

impl Health {
    fn fresh() -> Self {
        Self {
            status: ModelStatus::Available,
            consecutive_errors: 0,
            rate_limited_until: None,
        }
    }
}

struct ModelEntry {
    spec: ModelSpec,
    health: Mutex<Health>,
}

impl ModelEntry {
    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn describe(&self) -> ModelDescriptor {
        let health = self.health().clone();
        ModelDescriptor {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            supports_tools: self.spec.supports_tools,
            is_free: self.spec.is_free,
            priority: self.spec.priority,
            context_length: self.spec.context_length,
            status: health.status,
            consecutive_errors: health.consecutive_errors,
            rate_limited_until: health.rate_limited_until,
        }
    }

    fn is_candidate(&self, require_tools: bool, free_only: bool, now: DateTime<Utc>) -> bool {
        if require_tools && !self.spec.supports_tools {
            return false;
        }
        if free_only && !self.spec.is_free {
            return false;
        }
        let health = self.health();
        health.status != ModelStatus::Disabled
            && health.rate_limited_until.map_or(true, |until| until <= now)
            && health.consecutive_errors < ERROR_THRESHOLD
    }
}

/// Registry of models with their mutable health state.
pub struct ModelCatalog {
    /// Insertion order; ties in priority keep this order.
    entries: Vec<ModelEntry>,
    index: HashMap<String, usize>,
}

impl ModelCatalog {
    /// Build a catalog. Duplicate ids are rejected.
    pub fn new(specs: Vec<ModelSpec>) -> Result<Self, CatalogError> {
        let mut entries = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            if index.insert(spec.id.clone(), entries.len()).is_some() {
                return Err(CatalogError::DuplicateModel(spec.id));
            }
            entries.push(ModelEntry {
                spec,
                health: Mutex::new(Health::fresh()),
            });
        }
        Ok(Self { entries, index })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, model_id: &str) -> Result<&ModelEntry, CatalogError> {
        self.index
            .get(model_id)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| CatalogError::UnknownModel(model_id.to_string()))
    }

    fn by_priority<'a>(&'a self, entries: impl Iterator<Item = &'a ModelEntry>) -> Vec<ModelDescriptor> {
        let mut selected: Vec<&ModelEntry> = entries.collect();
        // Stable: equal priorities keep insertion order.
        selected.sort_by_key(|e| e.spec.priority);
        selected.into_iter().map(ModelEntry::describe).collect()
    }

    /// Models that may be tried right now, best first. An empty list is terminal.
    pub fn list_candidates(&self, require_tools: bool, free_only: bool) -> Vec<ModelDescriptor> {
        self.list_candidates_at(require_tools, free_only, Utc::now())
    }

    pub fn list_candidates_at(&self, require_tools: bool, free_only: bool, now: DateTime<Utc>) -> Vec<ModelDescriptor> {
        self.by_priority(
            self.entries
                .iter()
                .filter(|e| e.is_candidate(require_tools, free_only, now)),
        )
    }

    /// First candidate, preferring a free model when `prefer_free` is set.
    pub fn best_model(&self, require_tools: bool, prefer_free: bool) -> Option<ModelDescriptor> {
        let candidates = self.list_candidates(require_tools, false);
        if prefer_free {
            if let Some(free) = candidates.iter().find(|m| m.is_free) {
                return Some(free.clone());
            }
        }
        candidates.into_iter().next()
    }

    /// Every model with its health state, ordered by priority.
    pub fn snapshot(&self) -> Vec<ModelDescriptor> {
        self.by_priority(self.entries.iter())
    }

    pub fn get(&self, model_id: &str) -> Result<ModelDescriptor, CatalogError> {
        self.entry(model_id).map(ModelEntry::describe)
    }

    /// Clear the error count and any cooldown. A disabled model stays disabled.
    pub fn record_success(&self, model_id: &str) {
        let Ok(entry) = self.entry(model_id) else {
            warn!(model = %model_id, "record_success for unknown model");
            return;
        };
        let mut health = entry.health();
        let recovered = health.status != ModelStatus::Available;
        health.consecutive_errors = 0;
        health.rate_limited_until = None;
        if health.status != ModelStatus::Disabled {
            health.status = ModelStatus::Available;
        }
        if recovered && health.status == ModelStatus::Available {
            info!(model = %model_id, "Model recovered");
        }
    }

    pub fn record_failure(&self, model_id: &str, kind: ErrorKind) {
        self.record_failure_at(model_id, kind, Utc::now());
    }

    /// Count a failed attempt made at `now`.
    pub fn record_failure_at(&self, model_id: &str, kind: ErrorKind, now: DateTime<Utc>) {
        let Ok(entry) = self.entry(model_id) else {
            warn!(model = %model_id, "record_failure for unknown model");
            return;
        };
        let mut health = entry.health();
        health.consecutive_errors += 1;
        let disabled = health.status == ModelStatus::Disabled;

        if kind == ErrorKind::RateLimit {
            let until = now + Duration::seconds(RATE_LIMIT_BACKOFF_SECS);
            health.rate_limited_until = Some(until);
            if !disabled {
                health.status = ModelStatus::RateLimited;
            }
            warn!(model = %model_id, until = %until, "Model rate limited, cooling down");
        } else if health.consecutive_errors >= ERROR_THRESHOLD {
            if !disabled {
                health.status = ModelStatus::Error;
            }
            warn!(
                model = %model_id,
                errors = health.consecutive_errors,
                "Model marked as error after repeated failures"
            );
        }
    }

    /// Back to a fresh AVAILABLE state, whatever the current state.
    pub fn administrative_reset(&self, model_id: &str) -> Result<(), CatalogError> {
        let entry = self.entry(model_id)?;
        *entry.health() = Health::fresh();
        info!(model = %model_id, "Model status reset");
        Ok(())
    }

    pub fn administrative_disable(&self, model_id: &str) -> Result<(), CatalogError> {
        let entry = self.entry(model_id)?;
        entry.health().status = ModelStatus::Disabled;
        info!(model = %model_id, "Model disabled");
        Ok(())
    }

    /// Leave DISABLED. Error count and cooldown are left untouched.
    pub fn administrative_enable(&self, model_id: &str) -> Result<(), CatalogError> {
        let entry = self.entry(model_id)?;
        let mut health = entry.health();
        if health.status == ModelStatus::Disabled {
            health.status = if health.consecutive_errors >= ERROR_THRESHOLD {
                ModelStatus::Error
            } else if health.rate_limited_until.is_some_and(|until| until > Utc::now()) {
                ModelStatus::RateLimited
            } else {
                ModelStatus::Available
            };
        }
        info!(model = %model_id, status = health.status.as_str(), "Model enabled");
        Ok(())
    }

    pub fn apply_admin_action(&self, model_id: &str, action: AdminAction) -> Result<ModelDescriptor, CatalogError> {
        match action {
            AdminAction::Enable => self.administrative_enable(model_id)?,
            AdminAction::Disable => self.administrative_disable(model_id)?,
            AdminAction::Reset => self.administrative_reset(model_id)?,
        }
        self.get(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_models() -> ModelCatalog {
        ModelCatalog::new(vec![
            ModelSpec::new("c", "C", false, true, 2, 8_192),
            ModelSpec::new("a", "A", true, true, 0, 8_192),
            ModelSpec::new("b", "B", true, true, 1, 8_192),
        ])
        .unwrap()
    }

    fn ids(models: &[ModelDescriptor]) -> Vec<&str> {
        models.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_candidates_sorted_and_filtered_by_tools() {
        let catalog = three_models();
        assert_eq!(ids(&catalog.list_candidates(false, false)), vec!["a", "b", "c"]);
        assert_eq!(ids(&catalog.list_candidates(true, true)), vec!["a", "b"]);
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let catalog = ModelCatalog::new(vec![
            ModelSpec::new("second", "", true, true, 1, 0),
            ModelSpec::new("first", "", true, true, 0, 0),
            ModelSpec::new("third", "", true, true, 1, 0),
        ])
        .unwrap();
        assert_eq!(ids(&catalog.list_candidates(false, false)), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_free_only_excludes_paid_models() {
        let catalog = ModelCatalog::new(default_models()).unwrap();
        let free = catalog.list_candidates(true, true);
        assert!(free.iter().all(|m| m.is_free && m.supports_tools));
        assert!(!ids(&free).contains(&"openai/gpt-3.5-turbo"));

        let any = catalog.list_candidates(true, false);
        assert_eq!(any.last().unwrap().id, "openai/gpt-3.5-turbo");
    }

    #[test]
    fn test_rate_limit_cooldown_expires() {
        let catalog = three_models();
        let t = Utc::now();
        catalog.record_failure_at("a", ErrorKind::RateLimit, t);
        assert_eq!(catalog.get("a").unwrap().status, ModelStatus::RateLimited);

        let at_4 = catalog.list_candidates_at(true, true, t + Duration::minutes(4));
        assert_eq!(ids(&at_4), vec!["b"]);

        let at_6 = catalog.list_candidates_at(true, true, t + Duration::minutes(6));
        assert_eq!(ids(&at_6), vec!["a", "b"]);
    }

    #[test]
    fn test_error_threshold_boundary() {
        let catalog = three_models();
        for _ in 0..ERROR_THRESHOLD - 1 {
            catalog.record_failure("a", ErrorKind::Other);
        }
        let a = catalog.get("a").unwrap();
        assert_eq!(a.status, ModelStatus::Available);
        assert!(ids(&catalog.list_candidates(true, true)).contains(&"a"));

        catalog.record_failure("a", ErrorKind::Other);
        assert_eq!(catalog.get("a").unwrap().status, ModelStatus::Error);
        assert_eq!(ids(&catalog.list_candidates(true, true)), vec!["b"]);
    }

    #[test]
    fn test_record_success_is_idempotent() {
        let catalog = three_models();
        catalog.record_failure("a", ErrorKind::RateLimit);
        catalog.record_success("a");
        let once = catalog.get("a").unwrap();
        catalog.record_success("a");
        let twice = catalog.get("a").unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.status, ModelStatus::Available);
        assert_eq!(twice.consecutive_errors, 0);
        assert!(twice.rate_limited_until.is_none());
    }

    #[test]
    fn test_disabled_is_left_only_administratively() {
        let catalog = three_models();
        catalog.administrative_disable("a").unwrap();
        catalog.record_success("a");
        catalog.record_failure("a", ErrorKind::RateLimit);
        assert_eq!(catalog.get("a").unwrap().status, ModelStatus::Disabled);
        assert_eq!(ids(&catalog.list_candidates(false, false)), vec!["b", "c"]);

        catalog.administrative_reset("a").unwrap();
        let a = catalog.get("a").unwrap();
        assert_eq!(a.status, ModelStatus::Available);
        assert_eq!(a.consecutive_errors, 0);
    }

    #[test]
    fn test_enable_restores_available() {
        let catalog = three_models();
        catalog
            .apply_admin_action("b", "disable".parse().unwrap())
            .unwrap();
        let b = catalog.apply_admin_action("b", AdminAction::Enable).unwrap();
        assert_eq!(b.status, ModelStatus::Available);
    }

    #[test]
    fn test_admin_errors() {
        let catalog = three_models();
        assert_eq!(
            catalog.administrative_reset("missing"),
            Err(CatalogError::UnknownModel("missing".into()))
        );
        assert!(matches!("pause".parse::<AdminAction>(), Err(CatalogError::InvalidAction(_))));
        assert_eq!(" Reset ".parse::<AdminAction>(), Ok(AdminAction::Reset));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = ModelCatalog::new(vec![
            ModelSpec::new("x", "", true, true, 0, 0),
            ModelSpec::new("x", "", true, true, 1, 0),
        ]);
        assert!(matches!(result, Err(CatalogError::DuplicateModel(id)) if id == "x"));
    }

    #[test]
    fn test_best_model_prefers_free() {
        let catalog = ModelCatalog::new(vec![
            ModelSpec::new("paid", "", true, false, 0, 0),
            ModelSpec::new("free", "", true, true, 1, 0),
        ])
        .unwrap();
        assert_eq!(catalog.best_model(true, true).unwrap().id, "free");
        assert_eq!(catalog.best_model(true, false).unwrap().id, "paid");

        catalog.administrative_disable("paid").unwrap();
        catalog.administrative_disable("free").unwrap();
        assert!(catalog.best_model(true, true).is_none());
    }

    #[test]
    fn test_snapshot_includes_unhealthy_models() {
        let catalog = three_models();
        catalog.administrative_disable("c").unwrap();
        let all = catalog.snapshot();
        assert_eq!(ids(&all), vec!["a", "b", "c"]);
        assert_eq!(all[2].status, ModelStatus::Disabled);
        let json = serde_json::to_value(&all[2]).unwrap();
        assert_eq!(json["status"], "disabled");
    }
}
