// Copyright 2019 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::AuxQaError;
use tracing::debug;

/// # Decay schedule of the masked language model loss weight
/// Ordered gamma coefficients and a cursor. The cursor starts at 0, moves forward by one on
/// each training step flagged by the caller, and reads past the end of the schedule return the
/// last coefficient. The default schedule `[0.0]` disables the auxiliary loss.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaSchedule {
    gammas: Vec<f64>,
    cursor: usize,
}

impl Default for GammaSchedule {
    fn default() -> Self {
        GammaSchedule {
            gammas: vec![0.0],
            cursor: 0,
        }
    }
}

impl GammaSchedule {
    pub fn new(gammas: Vec<f64>) -> Result<GammaSchedule, AuxQaError> {
        let mut schedule = GammaSchedule::default();
        schedule.reset(gammas)?;
        Ok(schedule)
    }

    /// Coefficient at the cursor, or the last coefficient once the cursor moved past the end.
    pub fn current(&self) -> f64 {
        self.gammas
            .get(self.cursor)
            .or_else(|| self.gammas.last())
            .copied()
            .unwrap_or(0.0)
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor == self.gammas.len() {
            debug!(
                gamma = self.current(),
                "gamma schedule exhausted, holding last value"
            );
        }
    }

    /// Replaces the coefficients and moves the cursor back to the start.
    pub fn reset(&mut self, gammas: Vec<f64>) -> Result<(), AuxQaError> {
        if gammas.is_empty() {
            return Err(AuxQaError::ValueError(
                "gamma schedule requires at least one coefficient".into(),
            ));
        }
        self.gammas = gammas;
        self.cursor = 0;
        Ok(())
    }

    /// Reads the current coefficient, then advances the cursor if `advance` is set.
    pub fn step(&mut self, advance: bool) -> f64 {
        let gamma = self.current();
        if advance {
            self.advance();
        }
        gamma
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn gammas(&self) -> &[f64] {
        &self.gammas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_disables_auxiliary_loss() {
        let mut schedule = GammaSchedule::default();
        assert_eq!(schedule.current(), 0.0);
        schedule.advance();
        assert_eq!(schedule.current(), 0.0);
    }

    #[test]
    fn schedule_holds_last_value() {
        let mut schedule = GammaSchedule::new(vec![0.1, 0.3, 0.5]).unwrap();
        let mut observed = vec![schedule.current()];
        for _ in 0..4 {
            schedule.advance();
            observed.push(schedule.current());
        }
        assert_eq!(observed, vec![0.1, 0.3, 0.5, 0.5, 0.5]);
        assert_eq!(schedule.cursor(), 4);
    }

    #[test]
    fn step_reads_before_advancing() {
        let mut schedule = GammaSchedule::new(vec![1.0, 0.5]).unwrap();
        assert_eq!(schedule.step(false), 1.0);
        assert_eq!(schedule.step(true), 1.0);
        assert_eq!(schedule.step(true), 0.5);
        assert_eq!(schedule.step(false), 0.5);
    }

    #[test]
    fn reset_rewinds_cursor() {
        let mut schedule = GammaSchedule::new(vec![0.2, 0.4]).unwrap();
        schedule.advance();
        schedule.advance();
        schedule.reset(vec![0.9, 0.8]).unwrap();
        assert_eq!(schedule.cursor(), 0);
        assert_eq!(schedule.current(), 0.9);
        assert_eq!(schedule.gammas(), &[0.9, 0.8]);
    }

    #[test]
    fn empty_schedule_is_rejected() {
        assert!(matches!(
            GammaSchedule::new(vec![]),
            Err(AuxQaError::ValueError(_))
        ));
        let mut schedule = GammaSchedule::new(vec![0.3]).unwrap();
        assert!(schedule.reset(vec![]).is_err());
        assert_eq!(schedule.current(), 0.3);
    }
}
