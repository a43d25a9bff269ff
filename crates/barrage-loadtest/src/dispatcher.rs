//! Weighted workload dispatch
//!
//! The traffic mix is a cumulative-weight table of
//! `(upper_bound, workload)` pairs partitioning `[0, 1)`. A uniform draw
//! selects the first entry whose upper bound exceeds it.

use crate::context::IterationContext;
use async_trait::async_trait;
use barrage_core::config::{validate_weights, WorkloadWeight};
use barrage_core::{ConfigError, MetricKind, MetricSink, MetricsError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One kind of iteration a VU can perform
#[async_trait]
pub trait Workload: Send + Sync {
    /// Workload name, as referenced by the traffic mix
    fn name(&self) -> &str;

    /// Custom metrics the workload records, declared before the run so
    /// thresholds may reference them
    fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
        Vec::new()
    }

    /// Run one iteration to completion.
    ///
    /// Failures are reported through checks and metrics, never returned.
    async fn execute(&self, ctx: &IterationContext);
}

struct MixEntry {
    upper_bound: f64,
    workload: Arc<dyn Workload>,
}

/// Cumulative-weight table of workloads
pub struct WorkloadMix {
    entries: Vec<MixEntry>,
}

impl fmt::Debug for WorkloadMix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (e.workload.name().to_string(), e.upper_bound)),
            )
            .finish()
    }
}

impl WorkloadMix {
    /// Build from `(weight, workload)` pairs in table order.
    ///
    /// Weights must be positive and sum to 1.
    pub fn new(weighted: Vec<(f64, Arc<dyn Workload>)>) -> Result<Self, ConfigError> {
        let weights: Vec<f64> = weighted.iter().map(|(w, _)| *w).collect();
        validate_weights(&weights)?;

        let last = weighted.len() - 1;
        let mut cumulative = 0.0;
        let entries = weighted
            .into_iter()
            .enumerate()
            .map(|(i, (weight, workload))| {
                cumulative += weight;
                // Pin the final bound so float error cannot leave a gap below 1.0
                let upper_bound = if i == last { 1.0 } else { cumulative };
                MixEntry {
                    upper_bound,
                    workload,
                }
            })
            .collect();
        Ok(Self { entries })
    }

    /// Mix that always runs one workload
    pub fn single(workload: Arc<dyn Workload>) -> Self {
        Self {
            entries: vec![MixEntry {
                upper_bound: 1.0,
                workload,
            }],
        }
    }

    /// Workload selected by a draw in `[0, 1)`
    pub fn select(&self, draw: f64) -> &Arc<dyn Workload> {
        let idx = self
            .entries
            .partition_point(|e| e.upper_bound <= draw)
            .min(self.entries.len() - 1);
        &self.entries[idx].workload
    }

    /// Select by `draw` and run the workload to completion.
    ///
    /// Returns the name of the workload that ran.
    pub async fn dispatch(&self, draw: f64, ctx: &IterationContext) -> &str {
        let workload = self.select(draw);
        workload.execute(ctx).await;
        workload.name()
    }

    /// Declare every workload's custom metrics in the sink
    pub fn declare_metrics(&self, sink: &MetricSink) -> Result<(), MetricsError> {
        for entry in &self.entries {
            for (name, kind) in entry.workload.metrics() {
                sink.declare(name, kind)?;
            }
        }
        Ok(())
    }

    /// `(name, upper_bound)` pairs in table order
    pub fn table(&self) -> Vec<(&str, f64)> {
        self.entries
            .iter()
            .map(|e| (e.workload.name(), e.upper_bound))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Named workloads available to a traffic mix
#[derive(Default, Clone)]
pub struct WorkloadRegistry {
    workloads: BTreeMap<String, Arc<dyn Workload>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workload + 'static>(&mut self, workload: W) {
        self.workloads
            .insert(workload.name().to_string(), Arc::new(workload));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workload>> {
        self.workloads.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.workloads.keys().map(String::as_str).collect()
    }

    /// Resolve configured weights into a mix
    pub fn mix(&self, weights: &[WorkloadWeight]) -> Result<WorkloadMix, ConfigError> {
        let weighted = weights
            .iter()
            .map(|w| {
                self.get(&w.name)
                    .map(|workload| (w.weight, workload))
                    .ok_or_else(|| ConfigError::UnknownWorkload(w.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        WorkloadMix::new(weighted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Named(&'static str);

    #[async_trait]
    impl Workload for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn metrics(&self) -> Vec<(&'static str, MetricKind)> {
            vec![("errors", MetricKind::Rate)]
        }

        async fn execute(&self, _ctx: &IterationContext) {}
    }

    fn registry() -> WorkloadRegistry {
        let mut registry = WorkloadRegistry::new();
        for name in ["read", "write", "crud", "errors"] {
            registry.register(Named(name));
        }
        registry
    }

    fn reference_mix() -> WorkloadMix {
        registry()
            .mix(&[
                WorkloadWeight::new("read", 0.30),
                WorkloadWeight::new("write", 0.30),
                WorkloadWeight::new("crud", 0.25),
                WorkloadWeight::new("errors", 0.15),
            ])
            .unwrap()
    }

    #[test]
    fn test_select_boundaries() {
        let mix = reference_mix();
        assert_eq!(mix.select(0.0).name(), "read");
        assert_eq!(mix.select(0.2999).name(), "read");
        assert_eq!(mix.select(0.30).name(), "write");
        assert_eq!(mix.select(0.5999).name(), "write");
        assert_eq!(mix.select(0.6001).name(), "crud");
        assert_eq!(mix.select(0.8499).name(), "crud");
        assert_eq!(mix.select(0.8501).name(), "errors");
        assert_eq!(mix.select(0.999_999).name(), "errors");
    }

    #[test]
    fn test_last_bound_pinned_to_one() {
        let mix = reference_mix();
        let table = mix.table();
        assert_eq!(table.last().map(|(_, b)| *b), Some(1.0));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_frequencies_converge_to_weights() {
        let mix = reference_mix();
        let weights = [("read", 0.30), ("write", 0.30), ("crud", 0.25), ("errors", 0.15)];
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let draws = 100_000;

        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for _ in 0..draws {
            *counts.entry(mix.select(rng.gen::<f64>()).name()).or_default() += 1;
        }

        for (name, weight) in weights {
            let observed = f64::from(counts[name]) / f64::from(draws);
            assert!(
                (observed - weight).abs() < 0.01,
                "{name}: observed {observed}, expected {weight}"
            );
        }
    }

    #[test]
    fn test_invalid_mixes() {
        let registry = registry();
        assert!(matches!(
            registry.mix(&[WorkloadWeight::new("read", 0.5), WorkloadWeight::new("write", 0.4)]),
            Err(ConfigError::InvalidWeights(_))
        ));
        assert_eq!(
            registry.mix(&[WorkloadWeight::new("browse", 1.0)]).unwrap_err(),
            ConfigError::UnknownWorkload("browse".to_string())
        );
        assert!(matches!(registry.mix(&[]), Err(ConfigError::InvalidWeights(_))));
    }

    #[test]
    fn test_declare_metrics() {
        let sink = MetricSink::new();
        reference_mix().declare_metrics(&sink).unwrap();
        assert_eq!(sink.kind_of("errors"), Some(MetricKind::Rate));
    }
}
