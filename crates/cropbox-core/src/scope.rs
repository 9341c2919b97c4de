//! Evaluation scope handed to compute functions
//!
//! A scope is the rule's view of the simulation while its formula runs:
//! declared dependencies by name, other entities by path, the clock, the
//! random stream, and a way to request new entities.

use crate::effect::{Effect, SPAWN_PRIORITY};
use crate::entity::Spawn;
use crate::time::Tick;
use crate::{Context, EntityId, Quantity, Result, Rule, SimRng, Unit, Value};
use chrono::NaiveDateTime;

pub struct Scope<'a> {
    ctx: &'a mut Context,
    entity: EntityId,
    rule: &'a Rule,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(ctx: &'a mut Context, entity: EntityId, rule: &'a Rule) -> Self {
        Self { ctx, entity, rule }
    }

    /// The entity the rule is being evaluated for
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn rule(&self) -> &Rule {
        self.rule
    }

    /// Value of a declared dependency.
    ///
    /// Resolution order: explicit binding, configuration, declared default,
    /// then a rule or path of the same name on this entity.
    pub fn get(&mut self, name: &str) -> Result<Value> {
        self.ctx.resolve_dep(self.entity, self.rule, name)
    }

    pub fn quantity(&mut self, name: &str) -> Result<Quantity> {
        self.get(name)?.quantity()
    }

    /// Magnitude of a numeric dependency, in whatever unit it carries
    pub fn number(&mut self, name: &str) -> Result<f64> {
        Ok(self.quantity(name)?.magnitude())
    }

    /// Magnitude of a numeric dependency expressed in `unit`
    pub fn number_in(&mut self, name: &str, unit: &Unit) -> Result<f64> {
        self.quantity(name)?.magnitude_in(unit)
    }

    pub fn truthy(&mut self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_truthy())
    }

    /// Read `path` relative to another entity, e.g. a child's rule
    pub fn value_of(&mut self, entity: EntityId, path: &str) -> Result<Value> {
        self.ctx.value(entity, path)
    }

    pub fn children(&self, collection: &str) -> Vec<EntityId> {
        self.ctx.children(self.entity, collection).to_vec()
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.ctx.parent(self.entity)
    }

    pub fn tick(&self) -> Tick {
        self.ctx.tick()
    }

    /// Simulation time of the context clock
    pub fn clock_time(&self) -> Quantity {
        self.ctx.time()
    }

    pub fn datetime(&self) -> Option<NaiveDateTime> {
        self.ctx.datetime()
    }

    pub fn rng(&mut self) -> &mut SimRng {
        self.ctx.rng_mut()
    }

    /// Request a child in `collection`; it appears at the start of the
    /// next tick.
    pub fn branch(&mut self, collection: impl Into<String>, spawn: Spawn) {
        self.ctx.submit(
            SPAWN_PRIORITY,
            Effect::Spawn {
                parent: self.entity,
                collection: collection.into(),
                spawn,
            },
        );
    }
}
