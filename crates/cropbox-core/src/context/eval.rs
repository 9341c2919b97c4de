//! Rule evaluation: the evaluation stack, dependency resolution, strategy
//! dispatch and the `optimize` solver loop

use super::{Context, CONTEXT};
use crate::effect::{Effect, SPAWN_PRIORITY};
use crate::rule::{ComputeFn, Formula, Kind, Ref, TimeSource, UnitSpec};
use crate::solve::{self, SolveError};
use crate::trace::{Frame, BASE_REGIME};
use crate::track::Track;
use crate::{EntityId, Error, Quantity, Result, Rule, RuleId, Scope, Unit, Value};
use std::sync::Arc;
use tracing::{debug, trace};

/// Configuration text such as `"2 m/d"` becomes a quantity; anything else
/// is taken as written.
pub(super) fn config_value(value: Value) -> Value {
    match value {
        Value::Text(text) => match Quantity::parse(&text) {
            Ok(q) => Value::Number(q),
            Err(_) => Value::Text(text),
        },
        other => other,
    }
}

/// Express a number in the rule's declared unit, tagging it if untagged
pub(super) fn fixed_unit(rule: &Rule, value: Value) -> Result<Value> {
    match (&rule.unit, value) {
        (UnitSpec::Fixed(unit), Value::Number(q)) => Ok(q.to(unit)?.into()),
        (_, value) => Ok(value),
    }
}

/// One step of a dotted path
enum Step {
    Entity(EntityId),
    Rule(RuleId),
    Collection(Vec<EntityId>),
}

impl Context {
    /// Read `path` relative to `entity`.
    ///
    /// Segments are rule names or aliases, collection names, or one of
    /// `self`, `parent` and `context`. Every segment but the last must
    /// yield an entity.
    pub fn value(&mut self, entity: EntityId, path: &str) -> Result<Value> {
        let mut current = entity;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let value = match self.step(current, segment)? {
                Step::Entity(id) => Value::Entity(id),
                Step::Rule(rid) => self.evaluate(current, rid)?,
                Step::Collection(ids) => Value::List(ids.into_iter().map(Value::Entity).collect()),
            };
            if segments.peek().is_none() {
                return Ok(value);
            }
            current = value
                .as_entity()
                .ok_or_else(|| Error::type_error("entity", value.type_name()))?;
        }
        Err(Error::UnknownRule {
            entity: self.describe(entity),
            name: path.to_string(),
        })
    }

    fn step(&self, current: EntityId, segment: &str) -> Result<Step> {
        let node = self.node(current)?;
        let unknown = || Error::UnknownRule {
            entity: node.describe(),
            name: segment.to_string(),
        };
        match segment {
            "self" => Ok(Step::Entity(current)),
            "context" => Ok(Step::Entity(CONTEXT)),
            "parent" => node.parent().map(Step::Entity).ok_or_else(unknown),
            name => {
                if let Some(rid) = node.entity_type().lookup(name) {
                    Ok(Step::Rule(rid))
                } else if let Some(ids) = node.children(name) {
                    Ok(Step::Collection(ids.to_vec()))
                } else {
                    Err(unknown())
                }
            }
        }
    }

    /// Whether the first segment of `path` names something on `entity`
    fn is_addressable(&self, entity: EntityId, path: &str) -> bool {
        let head = path.split('.').next().unwrap_or_default();
        self.step(entity, head).is_ok()
    }

    pub(crate) fn resolve_ref(&mut self, entity: EntityId, r: &Ref) -> Result<Value> {
        match r {
            Ref::Literal(v) => Ok(v.clone()),
            Ref::Path(path) => self.value(entity, path),
        }
    }

    pub(crate) fn resolve_dep(&mut self, entity: EntityId, rule: &Rule, name: &str) -> Result<Value> {
        let unresolved = |ctx: &Context| Error::UnresolvedDependency {
            rule: rule.name().to_string(),
            entity: ctx.describe(entity),
            name: name.to_string(),
        };
        let Some(dep) = rule.dep_named(name) else {
            return Err(unresolved(self));
        };
        if let Some(bind) = &dep.bind {
            return self.resolve_ref(entity, bind);
        }
        let tags = self.node(entity)?.entity_type().tags().to_vec();
        let levels = [tags, rule.names(), vec![name.to_string()]];
        if let Some(v) = self.config.resolve(&levels) {
            return Ok(config_value(v.clone()));
        }
        if let Some(default) = &dep.default {
            return self.resolve_ref(entity, default);
        }
        if self.is_addressable(entity, name) {
            return self.value(entity, name);
        }
        Err(unresolved(self))
    }

    fn rule_of(&self, entity: EntityId, id: RuleId) -> Result<Arc<Rule>> {
        let node = self.node(entity)?;
        node.entity_type()
            .rule(id)
            .cloned()
            .ok_or_else(|| Error::UnknownRule {
                entity: node.describe(),
                name: id.to_string(),
            })
    }

    pub(super) fn track(&self, entity: EntityId, id: RuleId) -> Result<&Track> {
        let node = self.node(entity)?;
        node.tracks.get(id.index()).ok_or_else(|| Error::UnknownRule {
            entity: node.describe(),
            name: id.to_string(),
        })
    }

    pub(super) fn track_mut(&mut self, entity: EntityId, id: RuleId) -> Result<&mut Track> {
        self.track(entity, id)?;
        self.node_mut(entity)?
            .tracks
            .get_mut(id.index())
            .ok_or(Error::EntityNotFound(entity))
    }

    /// Evaluate one rule of one entity, returning its current value.
    ///
    /// Re-entering a rule already on the innermost regime's stack returns
    /// its stored value if the rule tolerates reentry and fails otherwise.
    pub(crate) fn evaluate(&mut self, entity: EntityId, id: RuleId) -> Result<Value> {
        let rule = self.rule_of(entity, id)?;
        let frame = Frame::new(entity, id);
        if self.trace.is_reentrant(&frame) {
            if rule.is_reentrant() {
                return Ok(self.track(entity, id)?.value());
            }
            return Err(Error::CyclicDependency {
                rule: rule.name().to_string(),
                entity: self.describe(entity),
            });
        }

        self.trace.push(frame);
        let result = self.update(entity, id, &rule);
        self.trace.pop();
        result.map_err(|e| e.within(rule.name(), &self.describe(entity)))
    }

    fn update(&mut self, entity: EntityId, id: RuleId, rule: &Rule) -> Result<Value> {
        if self.trace.regime() != BASE_REGIME {
            self.save(entity, id)?;
        }
        if !self.track(entity, id)?.is_initialized() {
            let init = self.resolve_ref(entity, &rule.init)?;
            let init = fixed_unit(rule, config_value(init))?;
            self.track_mut(entity, id)?.initialize(init)?;
        }

        let t = self.timestamp(entity, rule)?;
        let regime = self.trace.regime();
        if !self.track(entity, id)?.is_due(&t, regime) {
            return Ok(self.track(entity, id)?.value());
        }

        self.track_mut(entity, id)?.advance(&t)?;
        let raw = self.compute(entity, id, rule)?;
        let raw = if rule.strategy().is_rate() {
            raw
        } else {
            self.coerce_unit(entity, rule, raw)?
        };
        if let Some(rate) = self.track_mut(entity, id)?.store(&t, regime, raw)? {
            self.submit(
                rule.priority,
                Effect::CommitRate {
                    entity,
                    rule: id,
                    time: t,
                    rate,
                },
            );
        }
        Ok(self.track(entity, id)?.value())
    }

    fn timestamp(&mut self, entity: EntityId, rule: &Rule) -> Result<Quantity> {
        match &rule.time {
            TimeSource::Clock => Ok(self.clock.time()),
            TimeSource::Fixed => Ok(Quantity::plain(0.0)),
            TimeSource::Var(path) => self.value(entity, path)?.quantity(),
        }
    }

    fn rule_unit(&mut self, entity: EntityId, rule: &Rule) -> Result<Option<Unit>> {
        match &rule.unit {
            UnitSpec::None => Ok(None),
            UnitSpec::Fixed(unit) => Ok(Some(*unit)),
            UnitSpec::Var(path) => Ok(self
                .value(entity, path)?
                .as_quantity()
                .and_then(|q| q.unit().copied())),
        }
    }

    fn coerce_unit(&mut self, entity: EntityId, rule: &Rule, value: Value) -> Result<Value> {
        match (self.rule_unit(entity, rule)?, value) {
            (Some(unit), Value::Number(q)) => Ok(q.to(&unit)?.into()),
            (_, value) => Ok(value),
        }
    }

    fn call(&mut self, entity: EntityId, rule: &Rule, f: &ComputeFn) -> Result<Value> {
        let mut scope = Scope::new(self, entity, rule);
        f(&mut scope)
    }

    fn compute(&mut self, entity: EntityId, id: RuleId, rule: &Rule) -> Result<Value> {
        let f = match &rule.formula {
            Formula::Value(f) => f,
            Formula::Spawn(f) => {
                let target = match &rule.kind {
                    Kind::Produce { target } => target.clone(),
                    _ => crate::entity::CHILDREN.to_string(),
                };
                let spawns = {
                    let mut scope = Scope::new(self, entity, rule);
                    f(&mut scope)?
                };
                let count = spawns.len();
                for spawn in spawns {
                    self.submit(
                        SPAWN_PRIORITY,
                        Effect::Spawn {
                            parent: entity,
                            collection: target.clone(),
                            spawn,
                        },
                    );
                }
                return Ok(Value::from(count as f64));
            }
        };

        match &rule.kind {
            Kind::Parameter => {
                let tags = self.node(entity)?.entity_type().tags().to_vec();
                match self.config.resolve(&[tags, rule.names()]) {
                    Some(v) => Ok(config_value(v.clone())),
                    None => self.call(entity, rule, f),
                }
            }
            Kind::Drive { key } => {
                let key = key.as_deref().unwrap_or(rule.name());
                match self.call(entity, rule, f)? {
                    Value::Map(mut map) => {
                        map.shift_remove(key)
                            .ok_or_else(|| Error::UnresolvedDependency {
                                rule: rule.name().to_string(),
                                entity: self.describe(entity),
                                name: key.to_string(),
                            })
                    }
                    other => Err(Error::type_error("map", other.type_name())),
                }
            }
            Kind::Flag { prob } => {
                let p = self.resolve_ref(entity, prob)?.quantity()?.magnitude();
                if !self.rng.chance(p) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.call(entity, rule, f)?.is_truthy()))
            }
            Kind::Optimize {
                lower,
                upper,
                tolerance,
                max_iterations,
            } => {
                let unit = self.rule_unit(entity, rule)?;
                let bounds = match (lower, upper) {
                    (Some(lo), Some(hi)) => Some((
                        self.magnitude_of(entity, lo, unit)?,
                        self.magnitude_of(entity, hi, unit)?,
                    )),
                    _ => None,
                };
                let guess = self.track(entity, id)?.value().as_number().unwrap_or(0.0);

                let mut cost = |x: f64| self.trial(entity, id, rule, f, Quantity::new(x, unit));
                let solved = match bounds {
                    Some((lo, hi)) => solve::brent_root(&mut cost, lo, hi, *tolerance, *max_iterations),
                    None => solve::minimize(&mut cost, guess, *tolerance, *max_iterations),
                };
                let x = match solved {
                    Ok(x) => x,
                    Err(SolveError::Objective(e)) => return Err(e),
                    Err(e) => {
                        let iterations = match e {
                            SolveError::MaxIterations(n) => n,
                            _ => 0,
                        };
                        return Err(Error::Convergence {
                            rule: rule.name().to_string(),
                            iterations,
                            reason: e.to_string(),
                        });
                    }
                };
                debug!(rule = rule.name(), entity = %entity, x, "optimize converged");
                Ok(Quantity::new(x, unit).into())
            }
            _ => self.call(entity, rule, f),
        }
    }

    fn magnitude_of(&mut self, entity: EntityId, r: &Ref, unit: Option<Unit>) -> Result<f64> {
        let q = config_value(self.resolve_ref(entity, r)?).quantity()?;
        match unit {
            Some(u) => q.magnitude_in(&u),
            None => Ok(q.magnitude()),
        }
    }

    /// Remember a track before a solver trial changes it
    fn save(&mut self, entity: EntityId, id: RuleId) -> Result<()> {
        let saved = self.track(entity, id)?.clone();
        self.journal.push((Frame::new(entity, id), saved));
        Ok(())
    }

    /// Put back every track saved since `mark`, earliest copy last
    fn rollback(&mut self, mark: usize) -> Result<()> {
        let undone = self.journal.split_off(mark);
        for (frame, saved) in undone.into_iter().rev() {
            *self.track_mut(frame.entity, frame.rule)? = saved;
        }
        Ok(())
    }

    /// Evaluate the objective of an `optimize` rule with its own value held
    /// at `x`, in a regime of its own. Whatever the trial computed is
    /// forgotten afterwards, random draws included.
    fn trial(
        &mut self,
        entity: EntityId,
        id: RuleId,
        rule: &Rule,
        f: &ComputeFn,
        x: Quantity,
    ) -> Result<f64> {
        let mark = self.journal.len();
        let rng = self.rng.clone();
        let regime = self.trace.push_regime(Frame::new(entity, id));
        trace!(rule = rule.name(), regime, x = x.magnitude(), "trial");
        let result = self.run_trial(entity, id, rule, f, x);
        self.trace.pop();
        self.rng = rng;
        self.rollback(mark)?;
        result
    }

    fn run_trial(
        &mut self,
        entity: EntityId,
        id: RuleId,
        rule: &Rule,
        f: &ComputeFn,
        x: Quantity,
    ) -> Result<f64> {
        self.save(entity, id)?;
        self.track_mut(entity, id)?.force(x.into());
        let cost = self.call(entity, rule, f)?;
        Ok(cost.quantity()?.magnitude())
    }
}
