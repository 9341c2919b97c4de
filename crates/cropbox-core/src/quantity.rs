//! Numbers optionally tagged with a unit
//!
//! An untagged quantity is a plain number: multiplying by it scales, and
//! adding it to a tagged quantity adopts the partner's unit. Rules that
//! never mention units therefore behave as ordinary arithmetic.

use crate::{Error, Result, Unit};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Div, Mul, Neg};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quantity {
    magnitude: f64,
    unit: Option<Unit>,
}

impl Quantity {
    pub fn new(magnitude: f64, unit: Option<Unit>) -> Self {
        Self { magnitude, unit }
    }

    /// An untagged number
    pub fn plain(magnitude: f64) -> Self {
        Self::new(magnitude, None)
    }

    pub fn tagged(magnitude: f64, unit: Unit) -> Self {
        Self::new(magnitude, Some(unit))
    }

    /// Parse `"<number>"` or `"<number> <unit>"`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (number, unit) = match text.split_once(char::is_whitespace) {
            Some((n, u)) => (n, Some(u)),
            None => (text, None),
        };
        let magnitude = number
            .parse::<f64>()
            .map_err(|_| Error::type_error("quantity", format!("{text:?}")))?;
        let unit = unit.map(Unit::parse).transpose()?;
        Ok(Self::new(magnitude, unit))
    }

    /// The raw magnitude in this quantity's own unit
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn unit(&self) -> Option<&Unit> {
        self.unit.as_ref()
    }

    pub fn is_tagged(&self) -> bool {
        self.unit.is_some()
    }

    /// Express this quantity in `target`.
    ///
    /// An untagged quantity is taken to already be in `target`.
    pub fn to(&self, target: &Unit) -> Result<Quantity> {
        match &self.unit {
            None => Ok(Quantity::tagged(self.magnitude, *target)),
            Some(unit) => Ok(Quantity::tagged(
                unit.convert(self.magnitude, target)?,
                *target,
            )),
        }
    }

    /// Magnitude expressed in `target`
    pub fn magnitude_in(&self, target: &Unit) -> Result<f64> {
        self.to(target).map(|q| q.magnitude)
    }

    /// A zero carrying the same unit
    pub fn zero_like(&self) -> Quantity {
        Quantity::new(0.0, self.unit)
    }

    fn is_affine(&self) -> bool {
        self.unit.is_some_and(|u| u.is_affine())
    }

    /// `rhs` in `self`'s unit. Unless `absolute`, only the step size is
    /// converted, as for a temperature difference.
    fn align(&self, rhs: &Quantity, absolute: bool) -> Result<(f64, Option<Unit>)> {
        match (&self.unit, &rhs.unit) {
            (Some(unit), Some(other)) if absolute => {
                Ok((other.convert(rhs.magnitude, unit)?, Some(*unit)))
            }
            (Some(unit), Some(other)) => Ok((rhs.magnitude * other.factor_to(unit)?, Some(*unit))),
            (Some(unit), None) => Ok((rhs.magnitude, Some(*unit))),
            (None, unit) => Ok((rhs.magnitude, *unit)),
        }
    }

    /// Sum in `self`'s unit. Two absolute temperatures cannot be added.
    pub fn checked_add(&self, rhs: &Quantity) -> Result<Quantity> {
        if self.is_affine() && rhs.is_affine() {
            return Err(Error::IncompatibleUnit {
                from: rhs.to_string(),
                to: self.to_string(),
            });
        }
        let (m, unit) = self.align(rhs, false)?;
        Ok(Quantity::new(self.magnitude + m, unit))
    }

    /// Difference in `self`'s unit; two absolute temperatures give a
    /// temperature difference.
    pub fn checked_sub(&self, rhs: &Quantity) -> Result<Quantity> {
        let absolute = self.is_affine() && rhs.is_affine();
        let (m, unit) = self.align(rhs, absolute)?;
        let unit = if absolute { unit.map(|u| u.delta()) } else { unit };
        Ok(Quantity::new(self.magnitude - m, unit))
    }

    /// Product of two quantities; the units multiply
    pub fn checked_mul(&self, rhs: &Quantity) -> Result<Quantity> {
        let unit = match (self.unit, rhs.unit) {
            (Some(a), Some(b)) => Some(a.multiply(&b)?),
            (a, None) => a,
            (None, b) => b,
        };
        Ok(Quantity::new(self.magnitude * rhs.magnitude, unit))
    }

    pub fn checked_div(&self, rhs: &Quantity) -> Result<Quantity> {
        let unit = match (self.unit, rhs.unit) {
            (Some(a), Some(b)) => Some(a.divide(&b)?),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(Unit::ONE.divide(&b)?),
            (None, None) => None,
        };
        Ok(Quantity::new(self.magnitude / rhs.magnitude, unit))
    }

    /// Order two quantities after converting `rhs` into `self`'s unit
    pub fn compare(&self, rhs: &Quantity) -> Result<Ordering> {
        let (m, _) = self.align(rhs, true)?;
        self.magnitude
            .partial_cmp(&m)
            .ok_or_else(|| Error::type_error("comparable number", "NaN"))
    }
}

impl From<f64> for Quantity {
    fn from(m: f64) -> Self {
        Quantity::plain(m)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl Mul<f64> for Quantity {
    type Output = Quantity;

    fn mul(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude * rhs, self.unit)
    }
}

impl Div<f64> for Quantity {
    type Output = Quantity;

    fn div(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude / rhs, self.unit)
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity::new(-self.magnitude, self.unit)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) if *unit != Unit::ONE => write!(f, "{} {}", self.magnitude, unit),
            _ => write!(f, "{}", self.magnitude),
        }
    }
}
