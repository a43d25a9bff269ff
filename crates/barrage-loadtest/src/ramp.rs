//! Ramp controller
//!
//! Finite-state controller over a scenario's stages. It is driven by the
//! scenario clock: each call to [`RampController::advance`] moves past
//! completed stages and returns the target VU count for that instant.
//! Targets are interpolated linearly within a stage and equal the stage
//! target exactly at its end.

use barrage_core::{RunStage, ScenarioSpec};
use std::time::Duration;

/// Controller output for one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStep {
    /// Active VUs wanted now
    Target(u32),
    /// Every stage has elapsed
    Finished,
}

/// Stage-walking target calculator
#[derive(Debug, Clone)]
pub struct RampController {
    stages: Vec<RunStage>,
    /// Index of the stage in progress
    stage_index: usize,
    /// Scenario-relative instant the current stage began
    stage_start: Duration,
    /// Target in force when the current stage began
    stage_from: u32,
    tick: Duration,
}

impl RampController {
    pub fn new(initial_vus: u32, stages: Vec<RunStage>, tick: Duration) -> Self {
        Self {
            stages,
            stage_index: 0,
            stage_start: Duration::ZERO,
            stage_from: initial_vus,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// Controller for a scenario's profile.
    ///
    /// A constant profile is one flat stage.
    pub fn for_scenario(spec: &ScenarioSpec, tick: Duration) -> Self {
        Self::new(spec.initial_vus(), spec.stages(), tick)
    }

    /// Index of the stage in progress, `None` once finished
    pub fn stage_index(&self) -> Option<usize> {
        (self.stage_index < self.stages.len()).then_some(self.stage_index)
    }

    /// Target at scenario-relative time `elapsed`.
    ///
    /// `elapsed` must not decrease between calls.
    pub fn advance(&mut self, elapsed: Duration) -> RampStep {
        while let Some(stage) = self.stages.get(self.stage_index).copied() {
            let stage_end = self.stage_start + stage.duration;
            if elapsed < stage_end {
                return RampStep::Target(self.interpolate(&stage, elapsed - self.stage_start));
            }
            self.stage_from = stage.target;
            self.stage_start = stage_end;
            self.stage_index += 1;
        }
        RampStep::Finished
    }

    /// Next scenario-relative instant at which the target may change.
    ///
    /// Flat stages sleep to their boundary; sloped stages wake every tick
    /// and always at the boundary.
    pub fn next_wake(&self, elapsed: Duration) -> Duration {
        match self.stages.get(self.stage_index) {
            Some(stage) => {
                let stage_end = self.stage_start + stage.duration;
                if stage.target == self.stage_from {
                    stage_end
                } else {
                    (elapsed + self.tick).min(stage_end)
                }
            }
            None => elapsed,
        }
    }

    fn interpolate(&self, stage: &RunStage, into_stage: Duration) -> u32 {
        if stage.target == self.stage_from || stage.duration.is_zero() {
            return stage.target;
        }
        let fraction = into_stage.as_secs_f64() / stage.duration.as_secs_f64();
        let from = f64::from(self.stage_from);
        let to = f64::from(stage.target);
        (from + (to - from) * fraction).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn stress() -> RampController {
        RampController::new(
            10,
            vec![
                RunStage::new(secs(60), 50),
                RunStage::new(secs(120), 100),
                RunStage::new(secs(60), 150),
                RunStage::new(secs(120), 200),
                RunStage::new(secs(60), 0),
            ],
            secs(1),
        )
    }

    #[test]
    fn test_starts_at_initial_vus() {
        assert_eq!(stress().advance(Duration::ZERO), RampStep::Target(10));
    }

    #[test]
    fn test_exact_targets_at_boundaries() {
        let mut ramp = stress();
        assert_eq!(ramp.advance(secs(60)), RampStep::Target(50));
        assert_eq!(ramp.advance(secs(180)), RampStep::Target(100));
        assert_eq!(ramp.advance(secs(240)), RampStep::Target(150));
        assert_eq!(ramp.advance(secs(360)), RampStep::Target(200));
        assert_eq!(ramp.advance(secs(420)), RampStep::Finished);
        assert_eq!(ramp.stage_index(), None);
    }

    #[test]
    fn test_linear_interpolation() {
        let mut ramp = stress();
        assert_eq!(ramp.advance(secs(30)), RampStep::Target(30));
        assert_eq!(ramp.advance(secs(120)), RampStep::Target(75));
        assert_eq!(ramp.advance(secs(390)), RampStep::Target(100));
    }

    #[test]
    fn test_jumping_over_stages() {
        let mut ramp = stress();
        assert_eq!(ramp.advance(secs(250)), RampStep::Target(154));
        assert_eq!(ramp.stage_index(), Some(3));
    }

    #[test]
    fn test_next_wake() {
        let mut ramp = stress();
        ramp.advance(secs(59));
        assert_eq!(ramp.next_wake(Duration::from_millis(59_500)), secs(60));
        ramp.advance(secs(61));
        assert_eq!(ramp.next_wake(secs(61)), secs(62));
    }

    #[test]
    fn test_flat_stage_sleeps_to_boundary() {
        let spec = ScenarioSpec::constant("load_test", 10, secs(120));
        let mut ramp = RampController::for_scenario(&spec, secs(1));
        assert_eq!(ramp.advance(Duration::ZERO), RampStep::Target(10));
        assert_eq!(ramp.next_wake(Duration::ZERO), secs(120));
        assert_eq!(ramp.advance(secs(120)), RampStep::Finished);
    }

    #[test]
    fn test_zero_duration_stage_is_a_jump() {
        let mut ramp = RampController::new(
            0,
            vec![RunStage::new(Duration::ZERO, 20), RunStage::new(secs(10), 20)],
            secs(1),
        );
        assert_eq!(ramp.advance(Duration::ZERO), RampStep::Target(20));
        assert_eq!(ramp.stage_index(), Some(1));
    }

    #[test]
    fn test_ramp_to_zero_then_finish() {
        let mut ramp = RampController::new(5, vec![RunStage::new(secs(10), 0)], secs(1));
        assert_eq!(ramp.advance(secs(8)), RampStep::Target(1));
        assert_eq!(ramp.advance(secs(10)), RampStep::Finished);
    }
}
