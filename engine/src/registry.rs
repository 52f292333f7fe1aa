//! Service/Metric registry
//!
//! Read-mostly: readers take a cheap `Arc` clone of the current snapshot and
//! never block writers. Writers (the discovery crawler, the seed loader)
//! build a new snapshot and swap it in. Removing a service removes its metrics.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub metric_names: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a registry lookup by name
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryItem {
    Service(Service),
    Metric(Metric),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service {namespace}/{name} not found")]
    UnknownService { namespace: String, name: String },

    #[error("metric {metric} already registered for service {service}")]
    DuplicateMetric { service: String, metric: String },
}

/// Read side of the registry as seen by the translation pipeline
pub trait ServiceRegistry: Send + Sync {
    /// Find a service by name, falling back to a metric by name
    fn lookup(&self, name: &str) -> Option<RegistryItem>;

    fn list_services(&self) -> Vec<Service>;

    /// Metrics owned by a service
    fn metrics_for(&self, service_id: Uuid) -> Vec<Metric>;
}

/// Immutable registry contents
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    services: HashMap<Uuid, Service>,
    metrics: HashMap<Uuid, Metric>,
}

impl RegistrySnapshot {
    fn service_by_key(&self, namespace: &str, name: &str) -> Option<&Service> {
        self.services
            .values()
            .find(|s| s.name == name && s.namespace == namespace)
    }

    /// Services sorted by (namespace, name) for deterministic output
    fn sorted_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.values().cloned().collect();
        services.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }
}

/// Service as declared in a seed file or by the discovery crawler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSeed {
    pub name: String,
    pub namespace: String,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    pub metrics: Vec<MetricSeed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeed {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SeedFile {
    #[serde(default)]
    services: Vec<ServiceSeed>,
}

#[derive(Default)]
pub struct InMemoryRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load services and metrics from a YAML seed file
    pub fn from_seed_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading registry seed {}", path.display()))?;
        let seed: SeedFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing registry seed {}", path.display()))?;

        let registry = Self::new();
        for service in seed.services {
            registry.upsert_service(service)?;
        }
        let snapshot = registry.snapshot();
        info!(
            path = %path.display(),
            services = snapshot.len(),
            metrics = snapshot.metric_count(),
            "loaded registry seed"
        );
        Ok(registry)
    }

    /// Current snapshot; stays valid even if a writer swaps in a new one
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> T) -> T {
        let mut current = self.current.write();
        let mut next = RegistrySnapshot::clone(&current);
        let out = f(&mut next);
        *current = Arc::new(next);
        out
    }

    /// Insert or replace a service (keyed by namespace + name) with its metrics.
    ///
    /// Replacing a service drops metrics no longer declared.
    pub fn upsert_service(&self, seed: ServiceSeed) -> Result<Uuid, RegistryError> {
        let mut seen = BTreeSet::new();
        for metric in &seed.metrics {
            if !seen.insert(metric.name.clone()) {
                return Err(RegistryError::DuplicateMetric {
                    service: seed.name.clone(),
                    metric: metric.name.clone(),
                });
            }
        }

        Ok(self.modify(|snap| {
            let now = Utc::now();
            let (id, created_at) = match snap.service_by_key(&seed.namespace, &seed.name) {
                Some(existing) => (existing.id, existing.created_at),
                None => (Uuid::new_v4(), now),
            };
            snap.metrics.retain(|_, m| m.service_id != id);

            for metric in &seed.metrics {
                let metric_id = Uuid::new_v4();
                snap.metrics.insert(
                    metric_id,
                    Metric {
                        id: metric_id,
                        service_id: id,
                        name: metric.name.clone(),
                        metric_type: metric.metric_type,
                        description: metric.description.clone(),
                        labels: metric.labels.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }

            snap.services.insert(
                id,
                Service {
                    id,
                    name: seed.name,
                    namespace: seed.namespace,
                    description: seed.description,
                    labels: seed.labels,
                    metric_names: seen,
                    created_at,
                    updated_at: now,
                },
            );
            id
        }))
    }

    /// Add one metric to an existing service
    pub fn add_metric(
        &self,
        namespace: &str,
        service: &str,
        seed: MetricSeed,
    ) -> Result<Uuid, RegistryError> {
        self.modify(|snap| {
            let service_id = snap
                .service_by_key(namespace, service)
                .map(|s| s.id)
                .ok_or_else(|| RegistryError::UnknownService {
                    namespace: namespace.to_string(),
                    name: service.to_string(),
                })?;
            if snap
                .metrics
                .values()
                .any(|m| m.service_id == service_id && m.name == seed.name)
            {
                return Err(RegistryError::DuplicateMetric {
                    service: service.to_string(),
                    metric: seed.name,
                });
            }

            let now = Utc::now();
            let id = Uuid::new_v4();
            if let Some(owner) = snap.services.get_mut(&service_id) {
                owner.metric_names.insert(seed.name.clone());
                owner.updated_at = now;
            }
            snap.metrics.insert(
                id,
                Metric {
                    id,
                    service_id,
                    name: seed.name,
                    metric_type: seed.metric_type,
                    description: seed.description,
                    labels: seed.labels,
                    created_at: now,
                    updated_at: now,
                },
            );
            Ok(id)
        })
    }

    /// Remove a service and every metric it owns. Returns false if absent.
    pub fn remove_service(&self, namespace: &str, name: &str) -> bool {
        self.modify(|snap| {
            let Some(id) = snap.service_by_key(namespace, name).map(|s| s.id) else {
                return false;
            };
            snap.services.remove(&id);
            snap.metrics.retain(|_, m| m.service_id != id);
            true
        })
    }
}

impl ServiceRegistry for InMemoryRegistry {
    fn lookup(&self, name: &str) -> Option<RegistryItem> {
        let snap = self.snapshot();
        if let Some(service) = snap.sorted_services().into_iter().find(|s| s.name == name) {
            return Some(RegistryItem::Service(service));
        }
        let mut metrics: Vec<&Metric> = snap.metrics.values().filter(|m| m.name == name).collect();
        metrics.sort_by_key(|m| m.created_at);
        metrics
            .first()
            .map(|m| RegistryItem::Metric((*m).clone()))
    }

    fn list_services(&self) -> Vec<Service> {
        self.snapshot().sorted_services()
    }

    fn metrics_for(&self, service_id: Uuid) -> Vec<Metric> {
        let snap = self.snapshot();
        let mut metrics: Vec<Metric> = snap
            .metrics
            .values()
            .filter(|m| m.service_id == service_id)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

/// Compact registry view handed to the Generator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryContext {
    pub services: Vec<ServiceContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceContext {
    pub name: String,
    pub namespace: String,
    pub metrics: Vec<(String, MetricType)>,
}

impl RegistryContext {
    /// Up to `max_services` services; those named in `query` come first
    pub fn build(registry: &dyn ServiceRegistry, query: &str, max_services: usize) -> Self {
        let lowered = query.to_lowercase();
        let (mut mentioned, others): (Vec<Service>, Vec<Service>) = registry
            .list_services()
            .into_iter()
            .partition(|s| lowered.contains(&s.name.to_lowercase()));
        mentioned.extend(others);
        mentioned.truncate(max_services);

        let services = mentioned
            .into_iter()
            .map(|s| ServiceContext {
                metrics: registry
                    .metrics_for(s.id)
                    .into_iter()
                    .map(|m| (m.name, m.metric_type))
                    .collect(),
                name: s.name,
                namespace: s.namespace,
            })
            .collect();
        Self { services }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Plain-text rendering for prompt construction
    pub fn render(&self) -> String {
        let mut out = String::new();
        for service in &self.services {
            out.push_str(&format!("service {} (namespace {})\n", service.name, service.namespace));
            for (metric, kind) in &service.metrics {
                out.push_str(&format!("  {metric} [{}]\n", kind.as_str()));
            }
        }
        out
    }
}
