//! Per-instance state of a rule
//!
//! A track holds the last stored value of one rule on one entity, together
//! with the timestamp and regime it was computed for. Its strategy decides
//! how a freshly computed result turns into the value readers see:
//!
//! - `Plain` - the result is the value
//! - `Accumulate` - the result is a rate, integrated over time
//! - `Difference` - the result is a rate, times the last interval only
//! - `Flip` - the result on ticks where it changed, a zero otherwise
//! - `Preserve` - the first result, kept forever

use crate::rule::Strategy;
use crate::{Error, Quantity, Result, Value};

/// Rates committed by an integrating track, keyed by the time they apply from
#[derive(Debug, Clone)]
struct RateHistory {
    /// Accumulated value at the time of the oldest retained entry
    origin: Quantity,
    entries: Vec<(Quantity, Quantity)>,
}

impl RateHistory {
    fn new(origin: Quantity) -> Self {
        Self {
            origin,
            entries: Vec::new(),
        }
    }

    /// Rate times elapsed time; an untagged rate integrates over the bare
    /// magnitude of the interval.
    fn increment(rate: &Quantity, from: &Quantity, to: &Quantity) -> Result<Quantity> {
        let dt = to.checked_sub(from)?;
        if rate.is_tagged() {
            rate.checked_mul(&dt)
        } else {
            Ok(*rate * dt.magnitude())
        }
    }

    fn value_at(&self, t: &Quantity) -> Result<Quantity> {
        let mut value = self.origin;
        for (i, (start, rate)) in self.entries.iter().enumerate() {
            if start >= t {
                break;
            }
            let end = match self.entries.get(i + 1) {
                Some((next, _)) if next < t => next,
                _ => t,
            };
            value = value.checked_add(&Self::increment(rate, start, end)?)?;
        }
        Ok(value)
    }

    /// The contribution of the latest interval ending at `t`
    fn last_interval_at(&self, t: &Quantity) -> Result<Option<Quantity>> {
        let Some((start, rate)) = self.entries.iter().rev().find(|(s, _)| s < t) else {
            return Ok(None);
        };
        let step = Self::increment(rate, start, t)?;
        self.origin.zero_like().checked_add(&step).map(Some)
    }

    /// Record a rate from `t` on. A second rate at the same time replaces
    /// the first. Intervals closed by the new entry fold into the origin.
    fn record(&mut self, t: Quantity, rate: Quantity) -> Result<()> {
        match self.entries.last_mut() {
            Some((last, r)) if *last == t => *r = rate,
            _ => self.entries.push((t, rate)),
        }
        while self.entries.len() > 1 {
            let (start, rate) = self.entries.remove(0);
            let end = self.entries[0].0;
            self.origin = self
                .origin
                .checked_add(&Self::increment(&rate, &start, &end)?)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum State {
    Plain,
    Accumulate(RateHistory),
    Difference(RateHistory),
    Flip { changed: bool },
    Preserve { stored: bool },
}

/// Stored state of one rule on one entity
#[derive(Debug, Clone)]
pub struct Track {
    state: State,
    value: Value,
    initialized: bool,
    stamp: Option<(Quantity, u64)>,
}

impl Track {
    pub fn new(strategy: Strategy) -> Self {
        let state = match strategy {
            Strategy::Plain => State::Plain,
            Strategy::Accumulate => State::Accumulate(RateHistory::new(Quantity::plain(0.0))),
            Strategy::Difference => State::Difference(RateHistory::new(Quantity::plain(0.0))),
            Strategy::Flip => State::Flip { changed: false },
            Strategy::Preserve => State::Preserve { stored: false },
        };
        Self {
            state,
            value: Value::Null,
            initialized: false,
            stamp: None,
        }
    }

    /// A track fixed to `value`: it is never recomputed
    pub fn pinned(value: Value) -> Self {
        Self {
            state: State::Preserve { stored: true },
            value,
            initialized: true,
            stamp: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set the value the track starts from. Integrating tracks require a
    /// number.
    pub fn initialize(&mut self, initial: Value) -> Result<()> {
        match &mut self.state {
            State::Accumulate(history) | State::Difference(history) => {
                *history = RateHistory::new(initial.quantity()?);
            }
            _ => {}
        }
        self.value = initial;
        self.initialized = true;
        Ok(())
    }

    /// Whether a read at time `t` in `regime` must recompute
    pub fn is_due(&self, t: &Quantity, regime: u64) -> bool {
        if let State::Preserve { stored: true } = self.state {
            return false;
        }
        match &self.stamp {
            None => true,
            Some((last, r)) => *r != regime || t > last,
        }
    }

    /// Bring an integrating track's value up to time `t` from its rate
    /// history. Other strategies are unaffected.
    pub fn advance(&mut self, t: &Quantity) -> Result<()> {
        match &self.state {
            State::Accumulate(history) => {
                self.value = history.value_at(t)?.into();
            }
            State::Difference(history) => {
                if let Some(step) = history.last_interval_at(t)? {
                    self.value = step.into();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Take a freshly computed result for time `t`.
    ///
    /// Integrating tracks return the result as a rate to be committed once
    /// every reader of this tick has seen the current value.
    pub fn store(&mut self, t: &Quantity, regime: u64, raw: Value) -> Result<Option<Quantity>> {
        self.stamp = Some((*t, regime));
        match &mut self.state {
            State::Plain => {
                self.value = raw;
                Ok(None)
            }
            State::Accumulate(_) | State::Difference(_) => match raw {
                Value::Number(rate) => Ok(Some(rate)),
                other => Err(Error::type_error("rate", other.type_name())),
            },
            State::Flip { changed } => {
                *changed = raw != self.value;
                self.value = raw;
                Ok(None)
            }
            State::Preserve { stored } => {
                if !*stored {
                    self.value = raw;
                    *stored = true;
                }
                Ok(None)
            }
        }
    }

    /// Commit a rate effective from time `t`
    pub fn commit(&mut self, t: Quantity, rate: Quantity) -> Result<()> {
        match &mut self.state {
            State::Accumulate(history) | State::Difference(history) => history.record(t, rate),
            _ => Ok(()),
        }
    }

    /// Overwrite the value in place, e.g. with a solver trial
    pub fn force(&mut self, value: Value) {
        self.value = value;
    }

    /// The value readers see
    pub fn value(&self) -> Value {
        match self.state {
            State::Flip { changed: false } => self.value.zero_like(),
            _ => self.value.clone(),
        }
    }
}
