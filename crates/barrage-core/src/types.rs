//! Scenario model shared by the configuration layer and the execution engine

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Tag set attached to samples and scenarios.
///
/// Ordered so that identical tag sets hash and compare identically
/// regardless of insertion order.
pub type Tags = BTreeMap<String, String>;

/// Concurrency-profile algorithm of a scenario
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorKind {
    /// Fixed number of VUs for a fixed duration
    #[serde(rename = "constant-vus")]
    Constant,
    /// Staged target changes
    #[serde(rename = "ramping-vus")]
    Ramping,
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "constant-vus" | "constant" => Ok(Self::Constant),
            "ramping-vus" | "ramping" => Ok(Self::Ramping),
            other => Err(ConfigError::UnknownExecutor(other.to_string())),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => write!(f, "constant-vus"),
            Self::Ramping => write!(f, "ramping-vus"),
        }
    }
}

/// One `(duration, target)` step of a ramping profile.
///
/// `target` is the number of VUs active when the stage ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStage {
    /// Time allotted to reach the target
    pub duration: Duration,
    /// VUs active at the end of the stage
    pub target: u32,
}

impl RunStage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Concurrency profile of a scenario
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    /// `vus` VUs for `duration`
    Constant { vus: u32, duration: Duration },
    /// Start at `initial_vus`, then walk the stages in order
    Ramping {
        initial_vus: u32,
        stages: Vec<RunStage>,
    },
}

/// Immutable definition of one scenario
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Unique scenario name, also emitted as the `scenario` tag
    pub name: String,

    /// Offset from run start at which the scenario begins
    pub start_offset: Duration,

    /// Concurrency profile
    pub profile: Profile,

    /// Tags attached to every sample the scenario produces
    pub tags: Tags,
}

impl ScenarioSpec {
    /// Constant-VU scenario starting at run start
    pub fn constant(name: impl Into<String>, vus: u32, duration: Duration) -> Self {
        Self {
            name: name.into(),
            start_offset: Duration::ZERO,
            profile: Profile::Constant { vus, duration },
            tags: Tags::new(),
        }
    }

    /// Ramping-VU scenario starting at run start
    pub fn ramping(name: impl Into<String>, initial_vus: u32, stages: Vec<RunStage>) -> Self {
        Self {
            name: name.into(),
            start_offset: Duration::ZERO,
            profile: Profile::Ramping {
                initial_vus,
                stages,
            },
            tags: Tags::new(),
        }
    }

    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        match self.profile {
            Profile::Constant { .. } => ExecutorKind::Constant,
            Profile::Ramping { .. } => ExecutorKind::Ramping,
        }
    }

    /// VU count at the instant the scenario starts
    pub fn initial_vus(&self) -> u32 {
        match &self.profile {
            Profile::Constant { vus, .. } => *vus,
            Profile::Ramping { initial_vus, .. } => *initial_vus,
        }
    }

    /// The profile expressed as stages.
    ///
    /// A constant profile is a single stage whose target equals its start.
    pub fn stages(&self) -> Vec<RunStage> {
        match &self.profile {
            Profile::Constant { vus, duration } => vec![RunStage::new(*duration, *vus)],
            Profile::Ramping { stages, .. } => stages.clone(),
        }
    }

    /// Length of the active window
    pub fn total_duration(&self) -> Duration {
        match &self.profile {
            Profile::Constant { duration, .. } => *duration,
            Profile::Ramping { stages, .. } => stages.iter().map(|s| s.duration).sum(),
        }
    }

    /// Offset from run start at which the active window closes
    pub fn end_offset(&self) -> Duration {
        self.start_offset + self.total_duration()
    }

    /// Largest VU count the profile ever asks for
    pub fn peak_vus(&self) -> u32 {
        self.stages()
            .iter()
            .map(|s| s.target)
            .fold(self.initial_vus(), u32::max)
    }

    /// Validate the scenario in isolation
    pub fn validate(&self) -> Result<()> {
        validate_scenario_name(&self.name)?;
        if let Profile::Ramping { stages, .. } = &self.profile {
            if stages.is_empty() {
                return Err(ConfigError::EmptyStages(self.name.clone()));
            }
        }
        Ok(())
    }
}

/// Scenario names become tag values and log fields.
fn validate_scenario_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidScenarioName(name.to_string()))
    }
}

/// Lifecycle state of a virtual user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VuState {
    /// Spawned, first iteration not yet begun
    Starting,
    /// Iterating
    Running,
    /// Stop signalled, finishing its current iteration
    Stopping,
    /// Exited
    Stopped,
}

impl fmt::Display for VuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stress_stages() -> Vec<RunStage> {
        vec![
            RunStage::new(Duration::from_secs(60), 50),
            RunStage::new(Duration::from_secs(120), 100),
            RunStage::new(Duration::from_secs(60), 150),
            RunStage::new(Duration::from_secs(120), 200),
            RunStage::new(Duration::from_secs(60), 0),
        ]
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("constant-vus".parse::<ExecutorKind>().unwrap(), ExecutorKind::Constant);
        assert_eq!("ramping".parse::<ExecutorKind>().unwrap(), ExecutorKind::Ramping);
        assert_eq!(
            "per-vu-iterations".parse::<ExecutorKind>(),
            Err(ConfigError::UnknownExecutor("per-vu-iterations".to_string()))
        );
    }

    #[test]
    fn test_ramping_durations() {
        let spec = ScenarioSpec::ramping("stress_test", 10, stress_stages())
            .with_start_offset(Duration::from_secs(150));

        assert_eq!(spec.executor_kind(), ExecutorKind::Ramping);
        assert_eq!(spec.total_duration(), Duration::from_secs(420));
        assert_eq!(spec.end_offset(), Duration::from_secs(570));
        assert_eq!(spec.peak_vus(), 200);
        assert_eq!(spec.initial_vus(), 10);
    }

    #[test]
    fn test_constant_as_single_stage() {
        let spec = ScenarioSpec::constant("load_test", 10, Duration::from_secs(120));
        assert_eq!(spec.stages(), vec![RunStage::new(Duration::from_secs(120), 10)]);
        assert_eq!(spec.peak_vus(), 10);
    }

    #[test]
    fn test_validate() {
        assert!(ScenarioSpec::constant("smoke_test", 1, Duration::from_secs(30))
            .validate()
            .is_ok());
        assert_eq!(
            ScenarioSpec::ramping("spike", 0, vec![]).validate(),
            Err(ConfigError::EmptyStages("spike".to_string()))
        );
        assert!(ScenarioSpec::constant("bad name", 1, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(ScenarioSpec::constant("", 1, Duration::from_secs(1))
            .validate()
            .is_err());
    }
}
