//! The simulation root
//!
//! A [`Context`] owns everything mutable about one simulation run: the
//! entity arena, the clock, configuration, the random stream, the
//! evaluation trace and the deferred-effect queue. Entities refer to each
//! other by [`EntityId`]; the context entity itself is always the first.
//!
//! Each [`Context::advance`] is one tick:
//!
//! 1. the clock moves forward
//! 2. pre-update effects run (entities spawned last tick appear)
//! 3. every rule of every entity is brought up to date, root to leaves
//! 4. post-update effects run (rates computed this tick are committed)

mod eval;

#[cfg(test)]
mod tests;

use crate::effect::{Effect, EffectQueue, Phase};
use crate::entity::{Entity, EntityType, CHILDREN};
use crate::rng::DEFAULT_SEED;
use crate::time::{parse_datetime, Tick};
use crate::trace::{Frame, Trace, BASE_REGIME};
use crate::track::Track;
use crate::{
    Clock, Config, EntityId, Error, Quantity, Result, Rule, RuleId, SimRng, Unit, Value, ValueMap,
};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Id of the context entity in every simulation
pub const CONTEXT: EntityId = EntityId(0);

pub struct Context {
    nodes: Vec<Entity>,
    root: EntityId,
    clock: Clock,
    config: Config,
    rng: SimRng,
    trace: Trace,
    /// Tracks as they were before a solver trial touched them
    journal: Vec<(Frame, Track)>,
    effects: EffectQueue,
}

impl Context {
    /// Build a simulation whose root entity is of type `ty`.
    ///
    /// The clock is read from the `Clock` section of `config`, the random
    /// seed from `Context.seed`. Every rule of the new tree is evaluated
    /// once at tick zero.
    pub fn instantiate(ty: &Arc<EntityType>, config: Config) -> Result<Self> {
        Self::instantiate_with(ty, config, ValueMap::new())
    }

    /// Like [`Context::instantiate`], pinning rules of the root entity to
    /// the given values
    pub fn instantiate_with(
        ty: &Arc<EntityType>,
        config: Config,
        overrides: ValueMap,
    ) -> Result<Self> {
        let clock = clock_from(&config)?;
        let seed = match config.get(&["Context", "seed"]) {
            None => DEFAULT_SEED,
            Some(v) => v.quantity()?.magnitude() as u64,
        };
        let mut ctx = Self {
            nodes: Vec::new(),
            root: CONTEXT,
            clock,
            config,
            rng: SimRng::new(seed),
            trace: Trace::new(),
            journal: Vec::new(),
            effects: EffectQueue::new(),
        };

        let context = ctx.construct(context_type(), None, ValueMap::new())?;
        ctx.initialize(context)?;
        let root = ctx.construct(Arc::clone(ty), Some(context), overrides)?;
        ctx.initialize(root)?;
        ctx.node_mut(context)?.attach(CHILDREN, root);
        ctx.root = root;
        ctx.flush(Phase::Post)?;

        info!(root = %ctx.describe(root), seed, "simulation instantiated");
        Ok(ctx)
    }

    /// Advance one tick
    pub fn advance(&mut self) -> Result<()> {
        self.clock.advance();
        debug!(tick = self.clock.tick, "advance");
        self.flush(Phase::Pre)?;
        for id in self.walk() {
            self.touch(id)?;
        }
        self.flush(Phase::Post)
    }

    /// Advance `ticks` times, stopping at the first error
    pub fn advance_by(&mut self, ticks: u64) -> Result<()> {
        for _ in 0..ticks {
            self.advance()?;
        }
        Ok(())
    }

    /// Queue an arbitrary mutation. Negative priorities run before the
    /// next tree update, the rest after the current one.
    pub fn queue<F>(&mut self, priority: i32, f: F)
    where
        F: FnOnce(&mut Context) -> Result<()> + 'static,
    {
        self.submit(priority, Effect::Call(Box::new(f)));
    }

    /// Effects raised inside a solver trial are discarded
    pub(crate) fn submit(&mut self, priority: i32, effect: Effect) {
        if self.trace.regime() != BASE_REGIME {
            trace!(priority, regime = self.trace.regime(), "effect discarded in trial");
            return;
        }
        self.effects.submit(priority, effect);
    }

    fn flush(&mut self, phase: Phase) -> Result<()> {
        let batch = self.effects.take(phase);
        if !batch.is_empty() {
            debug!(?phase, count = batch.len(), "flush");
        }
        for queued in batch {
            self.apply(queued.effect)?;
        }
        Ok(())
    }

    fn apply(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::CommitRate {
                entity,
                rule,
                time,
                rate,
            } => self.track_mut(entity, rule)?.commit(time, rate),
            Effect::Spawn {
                parent,
                collection,
                spawn,
            } => {
                // evaluated by the tree update that follows, once every
                // entity spawned this flush is attached
                let (ty, overrides) = spawn.into_parts();
                let child = self.construct(ty, Some(parent), overrides)?;
                self.node_mut(parent)?.attach(&collection, child);
                debug!(
                    parent = %parent,
                    child = %self.describe(child),
                    collection = %collection,
                    "spawned"
                );
                Ok(())
            }
            Effect::Call(f) => f(self),
        }
    }

    /// Allocate an entity with fresh tracks. Overrides of rate rules set
    /// their initial value; any other override pins the rule.
    fn construct(
        &mut self,
        ty: Arc<EntityType>,
        parent: Option<EntityId>,
        overrides: ValueMap,
    ) -> Result<EntityId> {
        let id = EntityId(self.nodes.len() as u64);
        let mut node = Entity::new(id, Arc::clone(&ty), parent);
        for (name, value) in overrides {
            let (rid, rule) = ty
                .lookup(&name)
                .and_then(|rid| ty.rule(rid).map(|r| (rid, r)))
                .ok_or_else(|| Error::UnknownRule {
                    entity: node.describe(),
                    name: name.clone(),
                })?;
            let value = eval::fixed_unit(rule, eval::config_value(value))?;
            if rule.strategy().is_rate() {
                node.tracks[rid.index()].initialize(value)?;
            } else {
                node.tracks[rid.index()] = Track::pinned(value);
            }
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Evaluate every rule of a newly constructed entity once
    fn initialize(&mut self, id: EntityId) -> Result<()> {
        self.touch(id)
    }

    fn touch(&mut self, id: EntityId) -> Result<()> {
        let count = self.node(id)?.tracks.len();
        for i in 0..count {
            self.evaluate(id, RuleId(i))?;
        }
        Ok(())
    }

    /// Entities of the live tree, depth first from the context
    pub fn walk(&self) -> Vec<EntityId> {
        let mut order = Vec::new();
        let mut stack = vec![CONTEXT];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(node) = self.nodes.get(id.index()) {
                let children: Vec<EntityId> = node.all_children().collect();
                stack.extend(children.into_iter().rev());
            }
        }
        order
    }

    /// The entity the simulation was instantiated with
    pub fn root(&self) -> EntityId {
        self.root
    }

    pub fn tick(&self) -> Tick {
        self.clock.tick
    }

    pub fn time(&self) -> Quantity {
        self.clock.time()
    }

    pub fn datetime(&self) -> Option<NaiveDateTime> {
        self.clock.current_datetime()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rng_mut(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.nodes.get(id.index())
    }

    pub fn type_of(&self, id: EntityId) -> Option<&Arc<EntityType>> {
        self.entity(id).map(Entity::entity_type)
    }

    pub fn parent(&self, id: EntityId) -> Option<EntityId> {
        self.entity(id).and_then(Entity::parent)
    }

    pub fn children(&self, id: EntityId, collection: &str) -> &[EntityId] {
        self.entity(id)
            .and_then(|n| n.children(collection))
            .unwrap_or(&[])
    }

    /// Value of `path` on the root entity
    pub fn get(&mut self, path: &str) -> Result<Value> {
        self.value(self.root, path)
    }

    /// Magnitude of a numeric `path` relative to `entity`
    pub fn number(&mut self, entity: EntityId, path: &str) -> Result<f64> {
        Ok(self.value(entity, path)?.quantity()?.magnitude())
    }

    /// Last stored value of every rule of an entity, without evaluating
    pub fn snapshot(&self, id: EntityId) -> Result<ValueMap> {
        let node = self.node(id)?;
        Ok(node
            .entity_type()
            .rules()
            .iter()
            .zip(&node.tracks)
            .map(|(rule, track)| (rule.name().to_string(), track.value()))
            .collect())
    }

    fn node(&self, id: EntityId) -> Result<&Entity> {
        self.nodes.get(id.index()).ok_or(Error::EntityNotFound(id))
    }

    fn node_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.nodes
            .get_mut(id.index())
            .ok_or(Error::EntityNotFound(id))
    }

    fn describe(&self, id: EntityId) -> String {
        self.nodes
            .get(id.index())
            .map(Entity::describe)
            .unwrap_or_else(|| id.to_string())
    }
}

/// Clock settings from the `Clock` section
fn clock_from(config: &Config) -> Result<Clock> {
    let mut clock = Clock::new();
    let mut unit = match config.get(&["Clock", "unit"]) {
        None => None,
        Some(v) => Some(Unit::parse(v.as_str().ok_or_else(|| {
            Error::InvalidConfig(format!("Clock.unit must be a string, got {}", v.type_name()))
        })?)?),
    };
    let mut setting = |key: &str, default: f64| -> Result<f64> {
        let Some(v) = config.get(&["Clock", key]) else {
            return Ok(default);
        };
        let q = eval::config_value(v.clone())
            .as_quantity()
            .ok_or_else(|| Error::InvalidConfig(format!("Clock.{key} must be a number")))?;
        match (q.unit(), unit) {
            (Some(_), Some(target)) => q.magnitude_in(&target),
            (Some(u), None) => {
                unit = Some(*u);
                Ok(q.magnitude())
            }
            (None, _) => Ok(q.magnitude()),
        }
    };
    let interval = setting("interval", 1.0)?;
    let start = setting("start", 0.0)?;
    clock = clock.with_interval(start, interval);
    if let Some(u) = unit {
        clock = clock.with_unit(u);
    }
    if let Some(v) = config.get(&["Clock", "datetime"]) {
        let text = v
            .as_str()
            .ok_or_else(|| Error::InvalidConfig("Clock.datetime must be a string".into()))?;
        clock = clock.with_datetime(parse_datetime(text)?);
    }
    Ok(clock)
}

/// Type of the context entity: exposes the clock to rule paths such as
/// `context.tick`
fn context_type() -> Arc<EntityType> {
    let clock = EntityType::builder("Clock")
        .rule(Rule::derive("tick", |s| Ok(Value::from(s.tick() as f64))))
        .rule(Rule::derive("time", |s| Ok(s.clock_time().into())))
        .rule(Rule::derive("datetime", |s| {
            Ok(s.datetime().map(|d| d.to_string()).into())
        }))
        .build();
    EntityType::builder("Context").extends(&clock).build()
}
