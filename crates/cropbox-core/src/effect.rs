//! Deferred effects and the two-phase queue that holds them
//!
//! Rules never mutate shared state while a tick is being computed. Rate
//! commits and entity spawns are queued instead, then applied by the
//! context at a flush point:
//!
//! - negative priorities run in the pre-update flush of the next advance
//! - zero and positive priorities run in the post-update flush of the
//!   current advance
//!
//! Within a phase effects run in ascending priority, then in the order
//! they were queued.

use crate::entity::Spawn;
use crate::{Context, EntityId, Quantity, Result, RuleId};
use std::fmt;

/// Priority of rate commits and of rules that do not set their own
pub const DEFAULT_PRIORITY: i32 = 0;

/// Priority of entity spawns: pre-update, so the new entity's first tick
/// is the next one
pub const SPAWN_PRIORITY: i32 = -1;

/// Which flush an effect belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    pub fn of(priority: i32) -> Self {
        if priority < 0 {
            Phase::Pre
        } else {
            Phase::Post
        }
    }
}

/// A mutation waiting for its flush. Values are already computed.
pub enum Effect {
    /// Record a rate on an integrating track
    CommitRate {
        entity: EntityId,
        rule: RuleId,
        /// Time the rate applies from
        time: Quantity,
        rate: Quantity,
    },
    /// Construct an entity and attach it to a parent collection
    Spawn {
        parent: EntityId,
        collection: String,
        spawn: Spawn,
    },
    /// Arbitrary mutation of the context
    Call(Box<dyn FnOnce(&mut Context) -> Result<()>>),
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::CommitRate {
                entity,
                rule,
                time,
                rate,
            } => f
                .debug_struct("CommitRate")
                .field("entity", entity)
                .field("rule", rule)
                .field("time", time)
                .field("rate", rate)
                .finish(),
            Effect::Spawn {
                parent,
                collection,
                spawn,
            } => f
                .debug_struct("Spawn")
                .field("parent", parent)
                .field("collection", collection)
                .field("type", &spawn.entity_type().name())
                .finish(),
            Effect::Call(_) => f.write_str("Call(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Queued {
    pub priority: i32,
    seq: u64,
    pub effect: Effect,
}

/// Pending effects split by phase
#[derive(Debug, Default)]
pub struct EffectQueue {
    pre: Vec<Queued>,
    post: Vec<Queued>,
    seq: u64,
}

impl EffectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, priority: i32, effect: Effect) {
        let queued = Queued {
            priority,
            seq: self.seq,
            effect,
        };
        self.seq += 1;
        match Phase::of(priority) {
            Phase::Pre => self.pre.push(queued),
            Phase::Post => self.post.push(queued),
        }
    }

    /// Remove and return a phase's effects in execution order. Effects
    /// submitted while the batch runs wait for the next flush.
    pub fn take(&mut self, phase: Phase) -> Vec<Queued> {
        let mut batch = match phase {
            Phase::Pre => std::mem::take(&mut self.pre),
            Phase::Post => std::mem::take(&mut self.post),
        };
        batch.sort_by_key(|q| (q.priority, q.seq));
        batch
    }

    pub fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::Pre => self.pre.len(),
            Phase::Post => self.post.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}
