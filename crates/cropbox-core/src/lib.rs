//! Cropbox Core - declarative time-stepped simulation engine
//!
//! This crate provides the building blocks of a simulation model:
//! - Unit-aware numbers (`Unit`, `Quantity`) and dynamic values (`Value`)
//! - Variable rules (`Rule`) describing how each quantity of an entity is
//!   computed and how it evolves over time
//! - Entity types (`EntityType`) grouping rules, tags and child collections
//! - The simulation root (`Context`) owning the entity tree, the clock and
//!   the deferred-effect queue
//! - Nested configuration (`Config`) overriding parameters by type and name
//!
//! ## Example
//!
//! ```
//! use cropbox_core::{Config, Context, EntityType, Rule};
//!
//! let plant = EntityType::builder("Plant")
//!     .rule(Rule::parameter("rate", |_| Ok(1.0.into())))
//!     .rule(Rule::accumulate("mass", |s| Ok(s.number("rate")?.into())).deps(["rate"]))
//!     .build();
//!
//! let mut ctx = Context::instantiate(&plant, Config::new()).unwrap();
//! ctx.advance_by(3).unwrap();
//! assert_eq!(ctx.get("mass").unwrap().as_number(), Some(3.0));
//! ```

pub mod config;
pub mod context;
pub mod effect;
pub mod entity;
mod error;
mod identity;
mod quantity;
mod rng;
pub mod rule;
mod scope;
pub mod solve;
pub mod time;
mod trace;
mod track;
pub mod unit;
mod value;

pub use config::Config;
pub use context::Context;
pub use effect::Phase;
pub use entity::{stage_type, Entity, EntityType, EntityTypeBuilder, Spawn};
pub use error::{Error, Result};
pub use identity::{EntityId, RuleId};
pub use quantity::Quantity;
pub use rng::SimRng;
pub use rule::{Dep, Ref, Rule, Strategy, TimeSource};
pub use scope::Scope;
pub use time::{Clock, Tick};
pub use unit::Unit;
pub use value::{Value, ValueMap};
