//! Physical units as dimension exponents plus a scale factor
//!
//! A [`Unit`] is the pair of its SI base-dimension exponents and the factor
//! that converts one of it into the coherent SI unit of the same
//! dimension (`km` has scale 1000, `d` has scale 86400). Two units convert
//! into each other iff their dimensions match.
//!
//! Temperature scales with a shifted zero (`degC`, `degF`) are affine: they
//! carry an offset applied on conversion. Inside a compound unit such as
//! `J/mol/degC` the offset is dropped and the temperature is a difference.
//!
//! Unit strings are parsed against a small symbol table:
//!
//! ```
//! # use cropbox_core::Unit;
//! let speed = Unit::parse("km/h").unwrap();
//! assert!(speed.is_compatible(&Unit::parse("m/s").unwrap()));
//! assert!(!speed.is_compatible(&Unit::parse("m").unwrap()));
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SI base-dimension exponents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub length: i8,
    pub mass: i8,
    pub time: i8,
    pub temperature: i8,
    pub current: i8,
    pub amount: i8,
    pub luminosity: i8,
}

impl Dimensions {
    pub const NONE: Dimensions = Dimensions {
        length: 0,
        mass: 0,
        time: 0,
        temperature: 0,
        current: 0,
        amount: 0,
        luminosity: 0,
    };

    const SYMBOLS: [&'static str; 7] = ["m", "kg", "s", "K", "A", "mol", "cd"];

    fn exponents(&self) -> [i8; 7] {
        [
            self.length,
            self.mass,
            self.time,
            self.temperature,
            self.current,
            self.amount,
            self.luminosity,
        ]
    }

    fn from_exponents(e: [i8; 7]) -> Self {
        Self {
            length: e[0],
            mass: e[1],
            time: e[2],
            temperature: e[3],
            current: e[4],
            amount: e[5],
            luminosity: e[6],
        }
    }

    /// `None` when an exponent leaves the `i8` range
    fn combine(&self, other: &Dimensions, sign: i8) -> Option<Dimensions> {
        let mut e = self.exponents();
        for (x, y) in e.iter_mut().zip(other.exponents()) {
            *x = x.checked_add(y.checked_mul(sign)?)?;
        }
        Some(Self::from_exponents(e))
    }

    fn scaled(&self, power: i8) -> Option<Dimensions> {
        let mut e = self.exponents();
        for x in e.iter_mut() {
            *x = x.checked_mul(power)?;
        }
        Some(Self::from_exponents(e))
    }

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::NONE
    }
}

/// A unit of measure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    dims: Dimensions,
    scale: f64,
    /// Distance of this scale's zero from the absolute zero, in its own
    /// steps (273.15 for `degC`)
    #[serde(default)]
    offset: f64,
}

impl Unit {
    /// The dimensionless unit with scale 1
    pub const ONE: Unit = Unit {
        dims: Dimensions::NONE,
        scale: 1.0,
        offset: 0.0,
    };

    pub const fn new(dims: Dimensions, scale: f64) -> Self {
        Self {
            dims,
            scale,
            offset: 0.0,
        }
    }

    /// A unit whose zero sits `offset` steps above the absolute zero
    pub const fn affine(dims: Dimensions, scale: f64, offset: f64) -> Self {
        Self {
            dims,
            scale,
            offset,
        }
    }

    pub fn dims(&self) -> &Dimensions {
        &self.dims
    }

    /// Factor converting a magnitude in this unit into the coherent SI unit
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_dimensionless()
    }

    pub fn is_affine(&self) -> bool {
        self.offset != 0.0
    }

    /// The same steps without the shifted zero, for differences
    pub fn delta(&self) -> Unit {
        Unit::new(self.dims, self.scale)
    }

    /// Whether magnitudes in `self` can be converted into `other`
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dims == other.dims
    }

    pub fn multiply(&self, other: &Unit) -> Result<Unit> {
        if *self == Unit::ONE {
            return Ok(*other);
        }
        if *other == Unit::ONE {
            return Ok(*self);
        }
        let dims = self
            .dims
            .combine(&other.dims, 1)
            .ok_or_else(|| Error::UnknownUnit(format!("({self})*({other})")))?;
        Ok(Unit::new(dims, self.scale * other.scale))
    }

    pub fn divide(&self, other: &Unit) -> Result<Unit> {
        if *other == Unit::ONE {
            return Ok(*self);
        }
        let dims = self
            .dims
            .combine(&other.dims, -1)
            .ok_or_else(|| Error::UnknownUnit(format!("({self})/({other})")))?;
        Ok(Unit::new(dims, self.scale / other.scale))
    }

    pub fn powi(&self, power: i8) -> Result<Unit> {
        if power == 1 {
            return Ok(*self);
        }
        let dims = self
            .dims
            .scaled(power)
            .ok_or_else(|| Error::UnknownUnit(format!("({self})^{power}")))?;
        Ok(Unit::new(dims, self.scale.powi(power as i32)))
    }

    /// Factor to multiply a magnitude in `self` by to express it in `target`
    pub fn factor_to(&self, target: &Unit) -> Result<f64> {
        if !self.is_compatible(target) {
            return Err(Error::IncompatibleUnit {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        Ok(self.scale / target.scale)
    }

    /// Express `magnitude` of this unit in `target`, shifting zeros of
    /// affine scales
    pub fn convert(&self, magnitude: f64, target: &Unit) -> Result<f64> {
        if self == target {
            return Ok(magnitude);
        }
        let factor = self.factor_to(target)?;
        Ok((magnitude + self.offset) * factor - target.offset)
    }

    /// Parse a unit string such as `"m"`, `"g/m^2/d"` or `"kg*m/s^2"`.
    ///
    /// The first `/`-separated segment is the numerator, every following
    /// segment divides. Factors within a segment are joined by `*`, `.` or
    /// spaces and may carry an integer exponent after `^`.
    pub fn parse(text: &str) -> Result<Unit> {
        let text = text.trim();
        if text.is_empty() || text == "1" {
            return Ok(Unit::ONE);
        }
        let mut unit = Unit::ONE;
        for (i, segment) in text.split('/').enumerate() {
            let mut part = Unit::ONE;
            for factor in segment
                .split(|c: char| c == '*' || c == '.' || c.is_whitespace())
                .filter(|f| !f.is_empty())
            {
                part = part.multiply(&parse_factor(factor)?)?;
            }
            unit = if i == 0 {
                part
            } else {
                unit.divide(&part)?
            };
        }
        Ok(unit)
    }
}

fn parse_factor(factor: &str) -> Result<Unit> {
    let (symbol, power) = match factor.split_once('^') {
        Some((s, p)) => {
            let p = p
                .parse::<i8>()
                .map_err(|_| Error::UnknownUnit(factor.to_string()))?;
            (s, p)
        }
        None => (factor, 1),
    };
    if symbol == "1" {
        return Ok(Unit::ONE);
    }
    lookup(symbol)
        .ok_or_else(|| Error::UnknownUnit(factor.to_string()))?
        .powi(power)
}

fn dims(e: [i8; 7]) -> Dimensions {
    Dimensions::from_exponents(e)
}

fn lookup(symbol: &str) -> Option<Unit> {
    const L: [i8; 7] = [1, 0, 0, 0, 0, 0, 0];
    const M: [i8; 7] = [0, 1, 0, 0, 0, 0, 0];
    const T: [i8; 7] = [0, 0, 1, 0, 0, 0, 0];
    const K: [i8; 7] = [0, 0, 0, 1, 0, 0, 0];
    const I: [i8; 7] = [0, 0, 0, 0, 1, 0, 0];
    const N: [i8; 7] = [0, 0, 0, 0, 0, 1, 0];
    const J: [i8; 7] = [0, 0, 0, 0, 0, 0, 1];
    const PRESSURE: [i8; 7] = [-1, 1, -2, 0, 0, 0, 0];
    const ENERGY: [i8; 7] = [2, 1, -2, 0, 0, 0, 0];
    const POWER: [i8; 7] = [2, 1, -3, 0, 0, 0, 0];

    match symbol {
        "degC" | "celsius" => return Some(Unit::affine(dims(K), 1.0, 273.15)),
        "degF" | "fahrenheit" => return Some(Unit::affine(dims(K), 5.0 / 9.0, 459.67)),
        _ => {}
    }
    let (e, scale) = match symbol {
        "percent" | "%" => ([0; 7], 0.01),
        "count" => ([0; 7], 1.0),
        "m" => (L, 1.0),
        "km" => (L, 1e3),
        "cm" => (L, 1e-2),
        "mm" => (L, 1e-3),
        "um" => (L, 1e-6),
        "ha" => ([2, 0, 0, 0, 0, 0, 0], 1e4),
        "kg" => (M, 1.0),
        "g" => (M, 1e-3),
        "mg" => (M, 1e-6),
        "t" => (M, 1e3),
        "s" => (T, 1.0),
        "min" => (T, 60.0),
        "h" | "hr" | "hour" => (T, 3600.0),
        "d" | "day" => (T, 86400.0),
        "wk" | "week" => (T, 604800.0),
        "yr" | "year" => (T, 31_557_600.0),
        "K" | "delta_degC" => (K, 1.0),
        "delta_degF" => (K, 5.0 / 9.0),
        "A" => (I, 1.0),
        "mol" => (N, 1.0),
        "mmol" => (N, 1e-3),
        "umol" => (N, 1e-6),
        "cd" => (J, 1.0),
        "Pa" => (PRESSURE, 1.0),
        "kPa" => (PRESSURE, 1e3),
        "J" => (ENERGY, 1.0),
        "kJ" => (ENERGY, 1e3),
        "MJ" => (ENERGY, 1e6),
        "W" => (POWER, 1.0),
        _ => return None,
    };
    Some(Unit::new(dims(e), scale))
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.dims.exponents();
        let render = |positive: bool| -> Vec<String> {
            e.iter()
                .zip(Dimensions::SYMBOLS)
                .filter(|(p, _)| if positive { **p > 0 } else { **p < 0 })
                .map(|(p, s)| match p.unsigned_abs() {
                    1 => s.to_string(),
                    n => format!("{s}^{n}"),
                })
                .collect()
        };
        let num = render(true);
        let den = render(false);
        if self.scale != 1.0 {
            write!(f, "{} ", self.scale)?;
        }
        if num.is_empty() && den.is_empty() {
            return write!(f, "1");
        }
        if num.is_empty() {
            write!(f, "1")?;
        } else {
            write!(f, "{}", num.join("*"))?;
        }
        for d in den {
            write!(f, "/{d}")?;
        }
        if self.is_affine() {
            write!(f, "+{}", self.offset)?;
        }
        Ok(())
    }
}
