//! Load test configuration
//!
//! Read once from TOML at process start, validated as a whole, then turned
//! into immutable [`ScenarioSpec`]s and [`ThresholdSpec`]s. Durations are
//! written the human way (`"30s"`, `"2m30s"`).

use crate::error::{ConfigError, Result};
use crate::threshold::ThresholdSpec;
use crate::types::{ExecutorKind, RunStage, ScenarioSpec, Tags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Tolerance on the sum of workload weights
pub const WEIGHT_EPSILON: f64 = 1e-9;

// ============================================================================
// DURATIONS
// ============================================================================

/// Duration parsed from a human string, or from a bare integer of seconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl std::str::FromStr for HumanDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        humantime::parse_duration(s.trim())
            .map(Self)
            .map_err(|e| ConfigError::InvalidDuration {
                value: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = HumanDuration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string (e.g. \"2m30s\") or integer seconds")
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(HumanDuration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(HumanDuration::from_secs)
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Target system settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL every request path is joined to
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout enforced by the transport
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,

    /// Path requested by the setup hook
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
            health_path: default_health_path(),
        }
    }
}

/// Uniform think-time interval between VU iterations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThinkTime {
    pub min: HumanDuration,
    pub max: HumanDuration,
}

impl ThinkTime {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Zero think time
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Same delay every iteration
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min.get() > self.max.get() {
            return Err(ConfigError::InvalidThinkTime {
                min_ms: self.min.get().as_millis() as u64,
                max_ms: self.max.get().as_millis() as u64,
            });
        }
        Ok(())
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(2000))
    }
}

/// Engine pacing settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often a ramping executor re-evaluates its target mid-stage
    #[serde(default = "default_tick")]
    pub ramp_tick: HumanDuration,

    /// How often the orchestrator logs progress and interim thresholds
    #[serde(default = "default_progress_interval")]
    pub progress_interval: HumanDuration,
}

fn default_tick() -> HumanDuration {
    HumanDuration::from_secs(1)
}

fn default_progress_interval() -> HumanDuration {
    HumanDuration::from_secs(10)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ramp_tick: default_tick(),
            progress_interval: default_progress_interval(),
        }
    }
}

/// One ramping stage as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub duration: HumanDuration,
    pub target: u32,
}

/// One scenario as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// `constant-vus` or `ramping-vus`
    pub executor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vus: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<HumanDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_vus: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageConfig>,

    /// Offset from run start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<HumanDuration>,

    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
}

impl ScenarioConfig {
    /// Convert into an immutable scenario definition
    pub fn to_spec(&self, name: &str) -> Result<ScenarioSpec> {
        let missing = |field| ConfigError::MissingField {
            scenario: name.to_string(),
            field,
        };

        let spec = match self.executor.parse::<ExecutorKind>()? {
            ExecutorKind::Constant => {
                let vus = self.vus.ok_or_else(|| missing("vus"))?;
                let duration = self.duration.ok_or_else(|| missing("duration"))?;
                ScenarioSpec::constant(name, vus, duration.get())
            }
            ExecutorKind::Ramping => {
                let stages = self
                    .stages
                    .iter()
                    .map(|s| RunStage::new(s.duration.get(), s.target))
                    .collect();
                ScenarioSpec::ramping(name, self.start_vus.unwrap_or(0), stages)
            }
        };

        let mut spec = spec.with_start_offset(self.start_time.map(HumanDuration::get).unwrap_or_default());
        spec.tags = self.tags.clone();
        spec.validate()?;
        Ok(spec)
    }
}

/// Threshold expressions for one metric key: a single string or a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdExprs {
    One(String),
    Many(Vec<String>),
}

impl ThresholdExprs {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(s) => std::slice::from_ref(s),
            Self::Many(v) => v,
        }
    }
}

/// Share of iterations routed to one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadWeight {
    pub name: String,
    pub weight: f64,
}

impl WorkloadWeight {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Check that weights are positive and sum to one
pub fn validate_weights(weights: &[f64]) -> Result<()> {
    if weights.is_empty() {
        return Err(ConfigError::InvalidWeights("no workloads".to_string()));
    }
    if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w <= 0.0) {
        return Err(ConfigError::InvalidWeights(format!(
            "weight {} is not positive",
            w
        )));
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > WEIGHT_EPSILON {
        return Err(ConfigError::InvalidWeights(format!(
            "weights sum to {}, expected 1.0",
            total
        )));
    }
    Ok(())
}

// ============================================================================
// ROOT
// ============================================================================

/// Complete load test configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestConfig {
    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub think_time: ThinkTime,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Traffic mix, in table order
    #[serde(default = "default_workloads")]
    pub workloads: Vec<WorkloadWeight>,

    /// Scenarios keyed by name
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,

    /// Threshold expressions keyed by metric key
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdExprs>,
}

fn default_workloads() -> Vec<WorkloadWeight> {
    vec![
        WorkloadWeight::new("read", 0.30),
        WorkloadWeight::new("write", 0.30),
        WorkloadWeight::new("crud", 0.25),
        WorkloadWeight::new("errors", 0.15),
    ]
}

impl Default for LoadTestConfig {
    /// Smoke, load, stress and spike scenarios against a local user API
    fn default() -> Self {
        let stage = |secs, target| StageConfig {
            duration: HumanDuration::from_secs(secs),
            target,
        };
        let tags = |test_type: &str| {
            let mut t = Tags::new();
            t.insert("test_type".to_string(), test_type.to_string());
            t
        };

        let mut scenarios = BTreeMap::new();
        scenarios.insert(
            "smoke_test".to_string(),
            ScenarioConfig {
                executor: ExecutorKind::Constant.to_string(),
                vus: Some(1),
                duration: Some(HumanDuration::from_secs(30)),
                start_vus: None,
                stages: Vec::new(),
                start_time: None,
                tags: tags("smoke"),
            },
        );
        scenarios.insert(
            "load_test".to_string(),
            ScenarioConfig {
                executor: ExecutorKind::Constant.to_string(),
                vus: Some(10),
                duration: Some(HumanDuration::from_secs(120)),
                start_vus: None,
                stages: Vec::new(),
                start_time: Some(HumanDuration::from_secs(30)),
                tags: tags("load"),
            },
        );
        scenarios.insert(
            "stress_test".to_string(),
            ScenarioConfig {
                executor: ExecutorKind::Ramping.to_string(),
                vus: None,
                duration: None,
                start_vus: Some(10),
                stages: vec![
                    stage(60, 50),
                    stage(120, 100),
                    stage(60, 150),
                    stage(120, 200),
                    stage(60, 0),
                ],
                start_time: Some(HumanDuration::from_secs(150)),
                tags: tags("stress"),
            },
        );
        scenarios.insert(
            "spike_test".to_string(),
            ScenarioConfig {
                executor: ExecutorKind::Ramping.to_string(),
                vus: None,
                duration: None,
                start_vus: Some(0),
                stages: vec![stage(30, 20), stage(30, 300), stage(60, 20), stage(30, 0)],
                start_time: Some(HumanDuration::from_secs(570)),
                tags: tags("spike"),
            },
        );

        let mut thresholds = BTreeMap::new();
        let one = |s: &str| ThresholdExprs::One(s.to_string());
        thresholds.insert("http_req_duration".to_string(), one("p(95)<1000"));
        thresholds.insert("http_req_failed".to_string(), one("rate<0.2"));
        thresholds.insert("errors".to_string(), one("rate<0.1"));
        thresholds.insert("api_latency".to_string(), one("p(95)<1500"));

        Self {
            target: TargetConfig::default(),
            think_time: ThinkTime::default(),
            engine: EngineConfig::default(),
            workloads: default_workloads(),
            scenarios,
            thresholds,
        }
    }
}

impl LoadTestConfig {
    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate everything that can be checked without the workload registry
    pub fn validate(&self) -> Result<()> {
        let url = self.target.base_url.trim();
        let has_host = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .is_some_and(|rest| !rest.is_empty());
        if !has_host {
            return Err(ConfigError::InvalidTarget(self.target.base_url.clone()));
        }

        self.think_time.validate()?;
        self.scenario_specs()?;
        self.threshold_specs()?;

        let mut seen = HashSet::new();
        for w in &self.workloads {
            if !seen.insert(w.name.as_str()) {
                return Err(ConfigError::InvalidWeights(format!(
                    "workload '{}' listed twice",
                    w.name
                )));
            }
        }
        let weights: Vec<f64> = self.workloads.iter().map(|w| w.weight).collect();
        validate_weights(&weights)
    }

    /// Scenario definitions, ordered by start offset then name
    pub fn scenario_specs(&self) -> Result<Vec<ScenarioSpec>> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        let mut specs = self
            .scenarios
            .iter()
            .map(|(name, scenario)| scenario.to_spec(name))
            .collect::<Result<Vec<_>>>()?;
        specs.sort_by(|a, b| a.start_offset.cmp(&b.start_offset).then(a.name.cmp(&b.name)));
        Ok(specs)
    }

    /// Threshold definitions, one per expression
    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>> {
        self.thresholds
            .iter()
            .flat_map(|(key, exprs)| {
                exprs
                    .as_slice()
                    .iter()
                    .map(move |expr| ThresholdSpec::parse(key, expr))
            })
            .collect()
    }
}
