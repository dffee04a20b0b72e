//! Runtime tank state and the registry that owns it.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::alarm::{self, AlarmKind, AlarmSet, AlarmState};
use crate::config::{TankConfig, TankKind};
use crate::types::{ShutoffReason, ShutoffRequest};

/// Sonar distances beyond this are treated as noise, cm.
pub const MAX_PING_DISTANCE: f32 = 400.0;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("no tank at index {0}")]
    UnknownTank(usize),
    #[error("expected {expected} levels, got {got}")]
    LevelCount { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Accepted { alarm_changed: bool },
    Discarded,
}

impl SampleOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SampleOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TankState {
    pub liquid_depth: f32,
    pub liquid_depth_avg: f32,
    pub liquid_volume: f32,
    pub liquid_volume_avg: f32,
    pub percent_full: f32,
    pub alarms: AlarmState,
    pub last_msg_time: Option<Instant>,
    pub ping_count: u32,
    window: VecDeque<f32>,
}

impl TankState {
    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

#[derive(Debug, Clone)]
pub struct Tank {
    pub config: TankConfig,
    pub state: TankState,
}

impl Tank {
    fn new(config: TankConfig) -> Self {
        Self {
            config,
            state: TankState::default(),
        }
    }

    /// Converts a sonar distance into a liquid depth; `None` when the
    /// distance is out of range.
    pub fn depth_from_distance(&self, distance_cm: f32) -> Option<f32> {
        if !distance_cm.is_finite() || distance_cm <= 0.0 || distance_cm > MAX_PING_DISTANCE {
            return None;
        }
        Some((self.config.depth - (distance_cm - self.config.sensor_offset)).max(0.0))
    }

    /// Level that persistence and the fill percentage work from.
    pub fn effective_depth(&self) -> f32 {
        self.state.liquid_depth_avg
    }

    fn record(&mut self, liquid_depth: f32, window: usize) {
        let s = &mut self.state;
        s.liquid_depth = liquid_depth;
        s.window.push_back(liquid_depth);
        while s.window.len() > window {
            s.window.pop_front();
        }
        s.liquid_depth_avg = s.window.iter().sum::<f32>() / s.window.len() as f32;
        self.recompute();
    }

    fn recompute(&mut self) {
        let vcm = self.config.vcm;
        let s = &mut self.state;
        s.liquid_volume = vcm * s.liquid_depth;
        s.liquid_volume_avg = vcm * s.liquid_depth_avg;
        s.percent_full = percent_full(&self.config.kind, s.liquid_depth_avg, self.config.depth);
    }

    fn evaluate(&self) -> AlarmSet {
        if self.config.ignore {
            return AlarmSet::CLEAR;
        }
        alarm::evaluate(
            self.state.liquid_depth,
            self.config.lo_alarm,
            self.config.hi_alarm,
            self.config.depth,
        )
    }
}

/// Fill percentage. Propane tanks are horizontal cylinders whose diameter is
/// the configured depth; everything else is linear.
pub fn percent_full(kind: &TankKind, liquid_depth: f32, depth: f32) -> f32 {
    if depth <= 0.0 {
        return 0.0;
    }
    let h = liquid_depth.clamp(0.0, depth);
    match kind {
        TankKind::Propane => {
            let r = depth / 2.0;
            let segment = r * r * ((r - h) / r).clamp(-1.0, 1.0).acos()
                - (r - h) * (2.0 * r * h - h * h).max(0.0).sqrt();
            100.0 * segment / (PI * r * r)
        }
        _ => 100.0 * h / depth,
    }
}

/// Owns every tank's runtime state for the life of the process.
#[derive(Debug)]
pub struct TankRegistry {
    tanks: Vec<Tank>,
    starting_tank: u32,
    window: usize,
    booted_at: Instant,
    alarm_changed: bool,
}

impl TankRegistry {
    /// `window` is the moving-average length; 1 disables averaging.
    pub fn new(configs: Vec<TankConfig>, starting_tank: u32, window: usize, booted_at: Instant) -> Self {
        Self {
            tanks: configs.into_iter().map(Tank::new).collect(),
            starting_tank,
            window: window.max(1),
            booted_at,
            alarm_changed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.tanks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tanks.is_empty()
    }

    pub fn tanks(&self) -> &[Tank] {
        &self.tanks
    }

    pub fn get(&self, index: usize) -> Option<&Tank> {
        self.tanks.get(index)
    }

    /// Site-wide tank number for a local index.
    pub fn tank_number(&self, index: usize) -> u32 {
        self.starting_tank + index as u32
    }

    /// Local index for a site-wide tank number, if this node owns it.
    pub fn local_index(&self, tank_number: u32) -> Option<usize> {
        let index = tank_number.checked_sub(self.starting_tank)? as usize;
        (index < self.tanks.len()).then_some(index)
    }

    /// Seeds levels recovered from the persist store. Must run before the
    /// first sample; does not count as sensor activity.
    pub fn seed_levels(&mut self, levels: &[f32]) -> Result<(), RegistryError> {
        if levels.len() != self.tanks.len() {
            return Err(RegistryError::LevelCount {
                expected: self.tanks.len(),
                got: levels.len(),
            });
        }
        for (tank, &level) in self.tanks.iter_mut().zip(levels) {
            let level = if level.is_finite() { level.max(0.0) } else { 0.0 };
            tank.state.window.clear();
            tank.record(level, self.window);
            let set = tank.evaluate();
            tank.state.alarms.seed(set);
        }
        info!(tanks = levels.len(), "seeded tank levels from persist record");
        Ok(())
    }

    /// Applies one raw sonar distance.
    pub fn apply_distance(
        &mut self,
        index: usize,
        distance_cm: f32,
        now: Instant,
    ) -> Result<SampleOutcome, RegistryError> {
        let tank = self.tanks.get_mut(index).ok_or(RegistryError::UnknownTank(index))?;
        tank.state.ping_count = tank.state.ping_count.wrapping_add(1);
        match tank.depth_from_distance(distance_cm) {
            Some(depth) => self.apply_level(index, depth, now),
            None => {
                debug!(tank = index, distance_cm, "discarded out of range ping");
                Ok(SampleOutcome::Discarded)
            }
        }
    }

    /// Applies a liquid depth, from a local conversion or a remote report.
    pub fn apply_level(
        &mut self,
        index: usize,
        liquid_depth: f32,
        now: Instant,
    ) -> Result<SampleOutcome, RegistryError> {
        let window = self.window;
        let tank = self.tanks.get_mut(index).ok_or(RegistryError::UnknownTank(index))?;
        if !liquid_depth.is_finite() || liquid_depth < 0.0 {
            debug!(tank = index, liquid_depth, "discarded invalid level");
            return Ok(SampleOutcome::Discarded);
        }

        tank.record(liquid_depth, window);
        tank.state.last_msg_time = Some(now);

        let next = tank.evaluate();
        let changed = tank.state.alarms.update(next);
        if changed {
            info!(
                tank = index,
                alarms = %next,
                previous = %tank.state.alarms.previous,
                "alarm state changed"
            );
            self.alarm_changed = true;
        }
        Ok(SampleOutcome::Accepted {
            alarm_changed: changed,
        })
    }

    /// Returns and clears the site-wide alarm-changed flag.
    pub fn take_alarm_changed(&mut self) -> bool {
        std::mem::take(&mut self.alarm_changed)
    }

    pub fn alarm_changed(&self) -> bool {
        self.alarm_changed
    }

    /// Levels to persist, in tank order.
    pub fn levels(&self) -> Vec<f32> {
        self.tanks.iter().map(Tank::effective_depth).collect()
    }

    pub fn is_inactive(&self, index: usize, now: Instant) -> Result<bool, RegistryError> {
        let tank = self.tanks.get(index).ok_or(RegistryError::UnknownTank(index))?;
        Ok(self.silence(tank, now) > tank.config.timeout)
    }

    /// Indices of tanks that have not reported within their timeout.
    pub fn inactive_tanks(&self, now: Instant) -> Vec<usize> {
        self.tanks
            .iter()
            .enumerate()
            .filter(|(_, tank)| self.silence(tank, now) > tank.config.timeout)
            .map(|(i, _)| i)
            .collect()
    }

    /// Pump shutoffs owed to tanks that are low or have gone silent.
    /// Ignored tanks and tanks without a pump node never ask.
    pub fn shutoff_requests(&self, now: Instant) -> Vec<ShutoffRequest> {
        self.tanks
            .iter()
            .enumerate()
            .filter(|(_, tank)| !tank.config.ignore && tank.config.pump_node != 0)
            .filter_map(|(i, tank)| {
                let reason = if tank.state.alarms.current.contains(AlarmKind::Low) {
                    ShutoffReason::LowWater
                } else if self.silence(tank, now) > tank.config.timeout {
                    ShutoffReason::Inactive
                } else {
                    return None;
                };
                Some(ShutoffRequest {
                    pump_node: tank.config.pump_node,
                    pump_number: tank.config.pump_number,
                    tank: self.tank_number(i),
                    reason,
                })
            })
            .collect()
    }

    fn silence(&self, tank: &Tank, now: Instant) -> Duration {
        now.saturating_duration_since(tank.state.last_msg_time.unwrap_or(self.booted_at))
    }
}
