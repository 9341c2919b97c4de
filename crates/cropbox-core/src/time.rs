//! Time system for tick-based simulation
//!
//! - `Tick` - Logical time unit
//! - `Clock` - Tick counter, the time each tick stands for, and an optional
//!   wall-clock mapping

use crate::{Error, Quantity, Result, Unit};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A discrete tick identifier (logical time unit)
pub type Tick = u64;

/// Simulation clock state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    /// Current tick number
    pub tick: Tick,
    /// Simulation time at tick zero
    pub start: f64,
    /// Simulation time elapsed per tick
    pub interval: f64,
    /// Unit of `start` and `interval`, if any
    pub unit: Option<Unit>,
    /// Wall-clock datetime at tick zero; each tick advances it by
    /// `interval` days
    pub datetime: Option<NaiveDateTime>,
}

impl Clock {
    /// Create a new clock starting at time 0 with unit interval
    pub fn new() -> Self {
        Self {
            tick: 0,
            start: 0.0,
            interval: 1.0,
            unit: None,
            datetime: None,
        }
    }

    pub fn with_interval(mut self, start: f64, interval: f64) -> Self {
        self.start = start;
        self.interval = interval;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_datetime(mut self, datetime: NaiveDateTime) -> Self {
        self.datetime = Some(datetime);
        self
    }

    /// Advance to the next tick
    pub fn advance(&mut self) {
        self.tick += 1;
    }

    /// Simulation time of the current tick
    pub fn time(&self) -> Quantity {
        Quantity::new(self.start + self.tick as f64 * self.interval, self.unit)
    }

    /// Wall-clock datetime of the current tick
    pub fn current_datetime(&self) -> Option<NaiveDateTime> {
        let seconds = (self.tick as f64 * self.interval * 86400.0).round() as i64;
        self.datetime.map(|start| start + Duration::seconds(seconds))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`
pub fn parse_datetime(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::InvalidConfig(format!("not a datetime: {text:?}")))
}
