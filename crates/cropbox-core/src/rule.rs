//! Variable rules: immutable definitions of computed quantities
//!
//! A rule belongs to an entity type and is shared by every instance of it.
//! It names its dependencies up front; the compute function pulls them
//! through a [`Scope`] which resolves each name against the owning entity.
//!
//! ```
//! # use cropbox_core::{Rule, Value};
//! let c = Rule::derive("c", |s| Ok((s.number("a")? + s.number("b")?).into())).deps(["a", "b"]);
//! let d = Rule::accumulate("d", |s| Ok((s.number("a")? + 1.0).into())).deps(["a"]).init(0.0);
//! # let _ = (c, d, Value::Null);
//! ```

use crate::effect::DEFAULT_PRIORITY;
use crate::entity::Spawn;
use crate::{Quantity, Result, Scope, Unit, Value};
use std::fmt;
use std::sync::Arc;

/// Compute function of an ordinary rule
pub type ComputeFn = Arc<dyn Fn(&mut Scope<'_>) -> Result<Value>>;

/// Compute function of a `produce` rule
pub type SpawnFn = Arc<dyn Fn(&mut Scope<'_>) -> Result<Vec<Spawn>>>;

/// Default solver tolerance on the free variable of `optimize`
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Default solver iteration budget of `optimize`
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// A literal value or a dotted path resolved against the owning entity
#[derive(Debug, Clone, PartialEq)]
pub enum Ref {
    Literal(Value),
    Path(String),
}

impl From<Value> for Ref {
    fn from(v: Value) -> Self {
        Ref::Literal(v)
    }
}

impl From<f64> for Ref {
    fn from(v: f64) -> Self {
        Ref::Literal(v.into())
    }
}

impl From<i32> for Ref {
    fn from(v: i32) -> Self {
        Ref::Literal(v.into())
    }
}

impl From<bool> for Ref {
    fn from(v: bool) -> Self {
        Ref::Literal(v.into())
    }
}

impl From<Quantity> for Ref {
    fn from(v: Quantity) -> Self {
        Ref::Literal(v.into())
    }
}

/// Strings name things; literal text goes through `Ref::Literal`.
impl From<&str> for Ref {
    fn from(path: &str) -> Self {
        Ref::Path(path.to_string())
    }
}

/// A named dependency of a rule
#[derive(Debug, Clone, PartialEq)]
pub struct Dep {
    pub name: String,
    /// Explicit binding; wins over configuration
    pub bind: Option<Ref>,
    /// Used when neither a binding nor configuration supplies a value
    pub default: Option<Ref>,
}

impl Dep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind: None,
            default: None,
        }
    }

    pub fn bind(mut self, to: impl Into<Ref>) -> Self {
        self.bind = Some(to.into());
        self
    }

    pub fn or(mut self, default: impl Into<Ref>) -> Self {
        self.default = Some(default.into());
        self
    }
}

impl From<&str> for Dep {
    fn from(name: &str) -> Self {
        Dep::new(name)
    }
}

/// Where a rule reads the timestamp it is kept up to date against
#[derive(Debug, Clone, PartialEq)]
pub enum TimeSource {
    /// The context clock's current time
    Clock,
    /// Never advances past zero: the rule is computed once
    Fixed,
    /// Another rule, e.g. a physiological age
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitSpec {
    None,
    Fixed(Unit),
    /// Take the unit of another rule's current value
    Var(String),
}

/// Temporal-tracking strategy of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Plain,
    Accumulate,
    Difference,
    Flip,
    Preserve,
}

impl Strategy {
    /// Strategies whose computed result is a rate committed after the tick
    pub fn is_rate(&self) -> bool {
        matches!(self, Strategy::Accumulate | Strategy::Difference)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Derive,
    Accumulate,
    Difference,
    Flip,
    Preserve,
    Parameter,
    Drive {
        key: Option<String>,
    },
    Flag {
        prob: Ref,
    },
    Produce {
        target: String,
    },
    Optimize {
        lower: Option<Ref>,
        upper: Option<Ref>,
        tolerance: f64,
        max_iterations: usize,
    },
}

impl Kind {
    pub fn strategy(&self) -> Strategy {
        match self {
            Kind::Accumulate => Strategy::Accumulate,
            Kind::Difference => Strategy::Difference,
            Kind::Flip => Strategy::Flip,
            Kind::Preserve => Strategy::Preserve,
            _ => Strategy::Plain,
        }
    }

    fn tolerates_reentry(&self) -> bool {
        matches!(
            self,
            Kind::Accumulate
                | Kind::Difference
                | Kind::Flag { .. }
                | Kind::Produce { .. }
                | Kind::Optimize { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::Derive => "derive",
            Kind::Accumulate => "accumulate",
            Kind::Difference => "difference",
            Kind::Flip => "flip",
            Kind::Preserve => "preserve",
            Kind::Parameter => "parameter",
            Kind::Drive { .. } => "drive",
            Kind::Flag { .. } => "flag",
            Kind::Produce { .. } => "produce",
            Kind::Optimize { .. } => "optimize",
        }
    }
}

#[derive(Clone)]
pub enum Formula {
    Value(ComputeFn),
    Spawn(SpawnFn),
}

/// Definition of one computed quantity of an entity type
#[derive(Clone)]
pub struct Rule {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) kind: Kind,
    pub(crate) formula: Formula,
    pub(crate) deps: Vec<Dep>,
    pub(crate) init: Ref,
    pub(crate) unit: UnitSpec,
    pub(crate) priority: i32,
    pub(crate) reentrant: bool,
    pub(crate) time: TimeSource,
}

impl Rule {
    fn with_kind(name: impl Into<String>, kind: Kind, formula: Formula) -> Self {
        let time = match kind {
            Kind::Parameter => TimeSource::Fixed,
            _ => TimeSource::Clock,
        };
        Self {
            name: name.into(),
            aliases: Vec::new(),
            reentrant: kind.tolerates_reentry(),
            kind,
            formula,
            deps: Vec::new(),
            init: Ref::Literal(Value::from(0.0)),
            unit: UnitSpec::None,
            priority: DEFAULT_PRIORITY,
            time,
        }
    }

    fn value_rule<F>(name: impl Into<String>, kind: Kind, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::with_kind(name, kind, Formula::Value(Arc::new(f)))
    }

    /// Recomputed from its dependencies every tick
    pub fn derive<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Derive, f)
    }

    /// Integrates the computed rate over time
    pub fn accumulate<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Accumulate, f)
    }

    /// The computed rate times the last interval only
    pub fn difference<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Difference, f)
    }

    /// The computed value on ticks where it changed, zero otherwise
    pub fn flip<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Flip, f)
    }

    /// Computed once, on first access
    pub fn preserve<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Preserve, f)
    }

    /// Overridable from configuration; never advances with time
    pub fn parameter<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Parameter, f)
    }

    /// Picks its own entry out of the map the formula returns
    pub fn drive<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(name, Kind::Drive { key: None }, f)
    }

    /// Boolean that only evaluates its formula when a probability draw
    /// succeeds
    pub fn flag<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(
            name,
            Kind::Flag {
                prob: Ref::Literal(Value::from(1.0)),
            },
            f,
        )
    }

    /// Spawns the returned entities into `target` at the start of the next
    /// tick
    pub fn produce<F>(name: impl Into<String>, target: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Vec<Spawn>> + 'static,
    {
        Self::with_kind(
            name,
            Kind::Produce {
                target: target.into(),
            },
            Formula::Spawn(Arc::new(f)),
        )
    }

    /// Solves for the value of this rule that drives the formula's result
    /// to zero (with bounds) or to its minimum (without)
    pub fn optimize<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_>) -> Result<Value> + 'static,
    {
        Self::value_rule(
            name,
            Kind::Optimize {
                lower: None,
                upper: None,
                tolerance: DEFAULT_TOLERANCE,
                max_iterations: DEFAULT_MAX_ITERATIONS,
            },
            f,
        )
    }

    pub fn deps<I, D>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dep>,
    {
        self.deps.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn dep(mut self, dep: Dep) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn init(mut self, init: impl Into<Ref>) -> Self {
        self.init = init.into();
        self
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = UnitSpec::Fixed(unit);
        self
    }

    pub fn unit_from(mut self, path: impl Into<String>) -> Self {
        self.unit = UnitSpec::Var(path.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub fn time_from(mut self, path: impl Into<String>) -> Self {
        self.time = TimeSource::Var(path.into());
        self
    }

    pub fn time(mut self, source: TimeSource) -> Self {
        self.time = source;
        self
    }

    /// Key looked up by a `drive` rule instead of its own name
    pub fn key(mut self, key: impl Into<String>) -> Self {
        if let Kind::Drive { key: k } = &mut self.kind {
            *k = Some(key.into());
        }
        self
    }

    /// Probability of occurrence of a `flag` rule
    pub fn prob(mut self, prob: impl Into<Ref>) -> Self {
        if let Kind::Flag { prob: p } = &mut self.kind {
            *p = prob.into();
        }
        self
    }

    /// Bracket of an `optimize` rule; switches it from minimization to
    /// root finding
    pub fn bounds(mut self, lower: impl Into<Ref>, upper: impl Into<Ref>) -> Self {
        if let Kind::Optimize {
            lower: l, upper: u, ..
        } = &mut self.kind
        {
            *l = Some(lower.into());
            *u = Some(upper.into());
        }
        self
    }

    pub fn tolerance(mut self, tol: f64) -> Self {
        if let Kind::Optimize { tolerance, .. } = &mut self.kind {
            *tolerance = tol;
        }
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        if let Kind::Optimize { max_iterations, .. } = &mut self.kind {
            *max_iterations = n;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Declared name followed by aliases
    pub fn names(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(self.aliases.iter().cloned())
            .collect()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn strategy(&self) -> Strategy {
        self.kind.strategy()
    }

    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    pub fn dep_named(&self, name: &str) -> Option<&Dep> {
        self.deps.iter().find(|d| d.name == name)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("kind", &self.kind.name())
            .field("aliases", &self.aliases)
            .field("deps", &self.deps.iter().map(|d| &d.name).collect::<Vec<_>>())
            .field("priority", &self.priority)
            .finish()
    }
}
