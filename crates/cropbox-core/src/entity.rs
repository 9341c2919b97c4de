//! Entity types and the instances built from them
//!
//! An [`EntityType`] is the immutable definition shared by all instances:
//! an ordered set of rules, the names of its child collections and its tags
//! (own name first, then the names of the types it extends). An [`Entity`]
//! is one node of the simulation tree with a track per rule.

use crate::rule::Kind;
use crate::track::Track;
use crate::{EntityId, Rule, RuleId, Value, ValueMap};
use indexmap::IndexMap;
use std::sync::Arc;

/// Collection every entity has
pub const CHILDREN: &str = "children";

/// Tag every entity type carries last
pub const SYSTEM_TAG: &str = "System";

/// Immutable definition of a kind of entity
#[derive(Debug)]
pub struct EntityType {
    name: String,
    tags: Vec<String>,
    rules: Vec<Arc<Rule>>,
    index: IndexMap<String, RuleId>,
    collections: Vec<String>,
}

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Own name, then inherited type names, most specific first
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> Option<&Arc<Rule>> {
        self.rules.get(id.index())
    }

    /// Find a rule by name or alias
    pub fn lookup(&self, name: &str) -> Option<RuleId> {
        self.index.get(name).copied()
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.iter().any(|c| c == name)
    }
}

/// Builder for [`EntityType`]
///
/// Rules keep declaration order, inherited ones first. Redeclaring a rule
/// by name replaces it in place.
#[derive(Debug)]
pub struct EntityTypeBuilder {
    name: String,
    inherited_tags: Vec<String>,
    rules: IndexMap<String, Arc<Rule>>,
    collections: Vec<String>,
}

impl EntityTypeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inherited_tags: Vec::new(),
            rules: IndexMap::new(),
            collections: vec![CHILDREN.to_string()],
        }
    }

    /// Inherit rules, collections and tags from `base`
    pub fn extends(mut self, base: &EntityType) -> Self {
        for tag in base.tags() {
            if !self.inherited_tags.contains(tag) {
                self.inherited_tags.push(tag.clone());
            }
        }
        for rule in base.rules() {
            self.rules.insert(rule.name().to_string(), Arc::clone(rule));
        }
        for c in base.collections() {
            self.push_collection(c);
        }
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.insert(rule.name().to_string(), Arc::new(rule));
        self
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.push_collection(&name);
        self
    }

    fn push_collection(&mut self, name: &str) {
        if !self.collections.iter().any(|c| c == name) {
            self.collections.push(name.to_string());
        }
    }

    pub fn build(mut self) -> Arc<EntityType> {
        let targets: Vec<String> = self
            .rules
            .values()
            .filter_map(|r| match r.kind() {
                Kind::Produce { target } => Some(target.clone()),
                _ => None,
            })
            .collect();
        for t in &targets {
            self.push_collection(t);
        }

        let rules: Vec<Arc<Rule>> = self.rules.into_values().collect();
        // aliases first so a declared name always wins over an alias
        let mut index = IndexMap::new();
        for (i, rule) in rules.iter().enumerate() {
            for alias in rule.aliases() {
                index.insert(alias.clone(), RuleId(i));
            }
        }
        for (i, rule) in rules.iter().enumerate() {
            index.insert(rule.name().to_string(), RuleId(i));
        }

        let mut tags = vec![self.name.clone()];
        tags.extend(
            self.inherited_tags
                .into_iter()
                .filter(|t| *t != self.name && t != SYSTEM_TAG),
        );
        tags.push(SYSTEM_TAG.to_string());

        Arc::new(EntityType {
            name: self.name,
            tags,
            rules,
            index,
            collections: self.collections,
        })
    }
}

/// A request to construct an entity, with values overriding its rules
#[derive(Debug, Clone)]
pub struct Spawn {
    ty: Arc<EntityType>,
    overrides: ValueMap,
}

impl Spawn {
    pub fn new(ty: &Arc<EntityType>) -> Self {
        Self {
            ty: Arc::clone(ty),
            overrides: ValueMap::new(),
        }
    }

    pub fn with(mut self, rule: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(rule.into(), value.into());
        self
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.ty
    }

    pub fn overrides(&self) -> &ValueMap {
        &self.overrides
    }

    pub(crate) fn into_parts(self) -> (Arc<EntityType>, ValueMap) {
        (self.ty, self.overrides)
    }
}

/// A node of the simulation tree
#[derive(Debug)]
pub struct Entity {
    id: EntityId,
    ty: Arc<EntityType>,
    parent: Option<EntityId>,
    collections: IndexMap<String, Vec<EntityId>>,
    pub(crate) tracks: Vec<Track>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, ty: Arc<EntityType>, parent: Option<EntityId>) -> Self {
        let tracks = ty.rules().iter().map(|r| Track::new(r.strategy())).collect();
        let collections = ty
            .collections()
            .iter()
            .map(|c| (c.clone(), Vec::new()))
            .collect();
        Self {
            id,
            ty,
            parent,
            collections,
            tracks,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.ty
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn children(&self, collection: &str) -> Option<&[EntityId]> {
        self.collections.get(collection).map(Vec::as_slice)
    }

    /// Children across every collection, in collection order
    pub fn all_children(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.collections.values().flatten().copied()
    }

    pub(crate) fn attach(&mut self, collection: &str, child: EntityId) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(child);
    }

    /// `Type(entity:N)`, as used in error messages
    pub fn describe(&self) -> String {
        format!("{}({})", self.ty.name(), self.id)
    }
}

/// Base type for entities that pass through a phase of development.
///
/// `ready` and `over` default to false; types extending it redeclare them.
/// `ing` holds while the stage is ready and not yet over.
pub fn stage_type() -> Arc<EntityType> {
    EntityType::builder("Stage")
        .rule(Rule::derive("ready", |_| Ok(false.into())))
        .rule(Rule::derive("over", |_| Ok(false.into())))
        .rule(
            Rule::derive("ing", |s| Ok((s.truthy("ready")? && !s.truthy("over")?).into()))
                .deps(["ready", "over"]),
        )
        .build()
}
