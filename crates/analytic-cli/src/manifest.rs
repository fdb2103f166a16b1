//! YAML analytics manifest and the registry that watches it.
//!
//! ```yaml
//! contexts:
//!   - id: plant-a
//!     name: Plant A
//!     analytics:
//!       - id: cooling-efficiency
//!         name: Cooling efficiency
//!         active: true
//!         fire_immediately: false
//!         triggers:
//!           - { type: interval, period_ms: 60000 }
//!           - { type: cov_threshold, input_index: 0, threshold: 2.5 }
//!         followed:
//!           - { id: chiller-1, name: Chiller 1 }
//! entities:
//!   chiller-1: [42.0, "running"]
//! ```
//!
//! `entities` lists each entity's inputs by index. The file is re-read on
//! every reconciliation: activation flags and input values take effect on the
//! next pass.

use analytic_core::trigger;
use analytic_core::{
    AnalyticDescriptor, AnalyticId, AnalyticRef, ContextRef, EngineError, Entity,
    MemoryRegistry, MemoryResolver, Registry, Result, TriggerConfig, TriggerSettings, Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    contexts: Vec<ContextEntry>,
    #[serde(default)]
    entities: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    analytics: Vec<AnalyticEntry>,
}

#[derive(Debug, Deserialize)]
struct AnalyticEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    fire_immediately: bool,
    /// Kept raw so one bad entry does not reject the whole file.
    #[serde(default)]
    triggers: Vec<serde_yaml::Value>,
    #[serde(default)]
    followed: Vec<Entity>,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A problem found while loading or checking the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestIssue {
    pub severity: Severity,
    pub analytic: String,
    pub message: String,
}

impl ManifestIssue {
    fn error(analytic: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            analytic: analytic.to_string(),
            message: message.into(),
        }
    }

    fn warning(analytic: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            analytic: analytic.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub catalogue: Vec<(ContextRef, Vec<AnalyticDescriptor>)>,
    pub inputs: BTreeMap<String, Vec<Value>>,
    /// Trigger entries that could not be parsed and were dropped.
    pub issues: Vec<ManifestIssue>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        let file: ManifestFile = serde_yaml::from_str(text)?;
        let mut issues = Vec::new();

        let catalogue = file
            .contexts
            .into_iter()
            .map(|context| {
                let context_ref = ContextRef {
                    name: context.name.unwrap_or_else(|| context.id.clone()),
                    id: context.id,
                };
                let analytics = context
                    .analytics
                    .into_iter()
                    .map(|entry| descriptor(entry, &mut issues))
                    .collect();
                (context_ref, analytics)
            })
            .collect();

        Ok(Self {
            catalogue,
            inputs: file.entities,
            issues,
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    pub fn analytics(&self) -> impl Iterator<Item = &AnalyticDescriptor> {
        self.catalogue.iter().flat_map(|(_, analytics)| analytics)
    }

    /// Parse issues plus semantic checks: trigger validity, duplicate ids,
    /// and change-of-value inputs missing from `entities`.
    pub fn check(&self) -> Vec<ManifestIssue> {
        let mut issues = self.issues.clone();
        let mut seen = BTreeSet::new();

        for analytic in self.analytics() {
            let id = analytic.id.as_str();
            if !seen.insert(id) {
                issues.push(ManifestIssue::error(id, "duplicate analytic id"));
            }
            for config in &analytic.triggers {
                if let Err(e) = trigger::validate(config) {
                    issues.push(ManifestIssue::error(id, format!("{config}: {e}")));
                    continue;
                }
                let input_index = match config {
                    TriggerConfig::ChangeOfValue { input_index }
                    | TriggerConfig::ChangeOfValueWithThreshold { input_index, .. } => {
                        *input_index
                    }
                    _ => continue,
                };
                for entity in &analytic.followed {
                    if self.input(&entity.id, input_index).is_none() {
                        issues.push(ManifestIssue::warning(
                            id,
                            format!("entity {} has no input {input_index}", entity.id),
                        ));
                    }
                }
            }
        }
        issues
    }

    fn input(&self, entity: &str, index: usize) -> Option<&Value> {
        self.inputs.get(entity).and_then(|inputs| inputs.get(index))
    }
}

fn descriptor(entry: AnalyticEntry, issues: &mut Vec<ManifestIssue>) -> AnalyticDescriptor {
    let mut triggers = Vec::with_capacity(entry.triggers.len());
    for raw in entry.triggers {
        match serde_yaml::from_value::<TriggerConfig>(raw) {
            Ok(config) => triggers.push(config),
            Err(e) => issues.push(ManifestIssue::error(
                &entry.id,
                format!("unrecognised trigger: {e}"),
            )),
        }
    }
    let analytic = AnalyticRef {
        name: entry.name.unwrap_or_else(|| entry.id.clone()),
        id: AnalyticId::new(entry.id),
    };
    let settings = TriggerSettings {
        active: entry.active,
        fire_immediately: entry.fire_immediately,
        triggers,
    };
    AnalyticDescriptor::from_parts(analytic, settings, entry.followed)
}

// ---------------------------------------------------------------------------
// FileRegistry
// ---------------------------------------------------------------------------

/// Registry backed by a manifest file.
///
/// Every `list_contexts` call re-reads the file. When its contents changed,
/// the catalogue is replaced and input values are pushed into the resolver,
/// which notifies any bound change-of-value triggers.
pub struct FileRegistry {
    path: PathBuf,
    store: MemoryRegistry,
    resolver: Arc<MemoryResolver>,
    last_text: Mutex<Option<String>>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, resolver: Arc<MemoryResolver>) -> Self {
        Self {
            path: path.into(),
            store: MemoryRegistry::new(),
            resolver,
            last_text: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the manifest. Returns true when it changed since the last call.
    pub async fn reload(&self) -> Result<bool> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::Registry(format!("failed to read {}: {e}", self.path.display()))
        })?;
        {
            let last = self.last_text.lock().unwrap_or_else(PoisonError::into_inner);
            if last.as_deref() == Some(text.as_str()) {
                return Ok(false);
            }
        }

        let manifest = Manifest::parse(&text)?;
        for issue in &manifest.issues {
            warn!(analytic = %issue.analytic, "{}", issue.message);
        }

        let mut notified = 0;
        for (entity, inputs) in &manifest.inputs {
            for (index, value) in inputs.iter().enumerate() {
                if self.resolver.set_value(entity, index, value.clone()) {
                    notified += 1;
                }
            }
        }

        let analytics = manifest.analytics().count();
        self.store.replace(manifest.catalogue);
        *self.last_text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);

        info!(
            path = %self.path.display(),
            analytics,
            inputs_changed = notified,
            "manifest loaded"
        );
        Ok(true)
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn list_contexts(&self) -> Result<Vec<ContextRef>> {
        if !self.reload().await? {
            debug!(path = %self.path.display(), "manifest unchanged");
        }
        self.store.list_contexts().await
    }

    async fn list_analytics(&self, context_id: &str) -> Result<Vec<AnalyticRef>> {
        self.store.list_analytics(context_id).await
    }

    async fn trigger_config(&self, analytic: &AnalyticId) -> Result<TriggerSettings> {
        self.store.trigger_config(analytic).await
    }

    async fn followed_entities(&self, analytic: &AnalyticId) -> Result<Vec<Entity>> {
        self.store.followed_entities(analytic).await
    }
}
