//! Lazy evaluation context
//!
//! One context lives for one group evaluation cycle. Preparing it only creates
//! empty slots; a slot is resolved the first time somebody asks for it and the
//! resolved value is memoized for the rest of the cycle. Lookups walk three
//! layers, highest precedence first:
//!
//! 1. formula-local: bindings of the formula currently executing (`state`,
//!    reference-call placeholders)
//! 2. group-local: values produced inside the group, literal variables and
//!    aliases
//! 3. global: external names resolved through the injected lookup

use crate::value::{FormulaValue, Lookup};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Host-provided value source
///
/// The engine never reads entity state by itself; every external name goes
/// through this trait. Calls are synchronous from the engine's point of view.
pub trait ExternalLookup: Send + Sync {
    /// Resolve one name
    fn lookup(&self, name: &str) -> Lookup;

    /// Metadata about a name (e.g. `last_changed`), if the host tracks any
    fn metadata(&self, _name: &str, _key: &str) -> Option<FormulaValue> {
        None
    }

    /// Version of the host snapshot backing this lookup
    ///
    /// Two evaluations that observe the same version see the same inputs; the
    /// result cache relies on this. `None` disables result caching.
    fn snapshot_version(&self) -> Option<u64> {
        None
    }
}

/// Simple map-backed lookup for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MapLookup {
    values: HashMap<String, Lookup>,
    metadata: HashMap<(String, String), FormulaValue>,
    version: Option<u64>,
}

impl MapLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<FormulaValue>) -> Self {
        self.values.insert(name.into(), Lookup::Value(value.into()));
        self
    }

    pub fn with_state(mut self, name: impl Into<String>, state: Lookup) -> Self {
        self.values.insert(name.into(), state);
        self
    }

    pub fn with_metadata(
        mut self,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<FormulaValue>,
    ) -> Self {
        self.metadata.insert((name.into(), key.into()), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, state: Lookup) {
        self.values.insert(name.into(), state);
    }
}

impl ExternalLookup for MapLookup {
    fn lookup(&self, name: &str) -> Lookup {
        self.values.get(name).cloned().unwrap_or(Lookup::NotFound)
    }

    fn metadata(&self, name: &str, key: &str) -> Option<FormulaValue> {
        self.metadata
            .get(&(name.to_string(), key.to_string()))
            .cloned()
    }

    fn snapshot_version(&self) -> Option<u64> {
        self.version
    }
}

/// One named slot: `value` is `None` until first resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceValue {
    pub name: String,
    pub value: Option<Lookup>,
}

impl ReferenceValue {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }
}

/// Where a prepared name gets its value from
#[derive(Debug, Clone, PartialEq)]
pub enum SlotBinding {
    /// Global slot resolved through the external lookup
    External,
    /// Group slot forwarding to an external name (group variable alias)
    Alias(String),
    /// Group slot with a fixed value (literal variable, constant)
    Literal(FormulaValue),
    /// Group slot filled by a formula of the group via [`EvaluationContext::set`]
    Produced,
}

/// Formula-local binding, installed per formula execution
#[derive(Debug, Clone, PartialEq)]
pub enum LocalBinding {
    /// Read another name instead (e.g. `state` reading the subject entity)
    Alias(String),
    /// Fixed value (e.g. a reference-call placeholder)
    Value(Lookup),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    FormulaLocal,
    GroupLocal,
    Global,
}

#[derive(Debug)]
enum GroupSource {
    Produced,
    Literal(FormulaValue),
    Alias(String),
}

#[derive(Debug)]
struct GroupSlot {
    reference: ReferenceValue,
    source: GroupSource,
}

/// Per-cycle layered context
pub struct EvaluationContext<'a> {
    local: HashMap<String, LocalBinding>,
    group: HashMap<String, GroupSlot>,
    global: HashMap<String, ReferenceValue>,
    resolver: &'a dyn ExternalLookup,
    /// Reference-call results keyed by call signature, valid for this cycle
    call_cache: HashMap<String, Lookup>,
    external_lookups: usize,
}

impl<'a> EvaluationContext<'a> {
    /// Create empty slots for exactly the given names; nothing is resolved
    pub fn prepare<I>(bindings: I, resolver: &'a dyn ExternalLookup) -> Self
    where
        I: IntoIterator<Item = (String, SlotBinding)>,
    {
        let mut context = Self {
            local: HashMap::new(),
            group: HashMap::new(),
            global: HashMap::new(),
            resolver,
            call_cache: HashMap::new(),
            external_lookups: 0,
        };

        for (name, binding) in bindings {
            let source = match binding {
                SlotBinding::External => {
                    context
                        .global
                        .entry(name.clone())
                        .or_insert_with(|| ReferenceValue::empty(&name));
                    continue;
                },
                SlotBinding::Alias(target) => {
                    context
                        .global
                        .entry(target.clone())
                        .or_insert_with(|| ReferenceValue::empty(&target));
                    GroupSource::Alias(target)
                },
                SlotBinding::Literal(value) => GroupSource::Literal(value),
                SlotBinding::Produced => GroupSource::Produced,
            };
            context.group.insert(
                name.clone(),
                GroupSlot {
                    reference: ReferenceValue::empty(&name),
                    source,
                },
            );
        }

        trace!(
            group_slots = context.group.len(),
            global_slots = context.global.len(),
            "Prepared evaluation context"
        );
        context
    }

    /// Value for `name`, resolving and memoizing it on first access
    pub fn get(&mut self, name: &str) -> Lookup {
        if let Some(binding) = self.local.get(name) {
            match binding {
                LocalBinding::Value(value) => return value.clone(),
                LocalBinding::Alias(target) => {
                    let target = target.clone();
                    return self.get_shared(&target);
                },
            }
        }
        self.get_shared(name)
    }

    fn get_shared(&mut self, name: &str) -> Lookup {
        if let Some(slot) = self.group.get(name) {
            if let Some(value) = &slot.reference.value {
                return value.clone();
            }
            let resolved = match &slot.source {
                // Producer has not run (or was skipped); leave the slot open
                GroupSource::Produced => return Lookup::Absent,
                GroupSource::Literal(value) => Lookup::Value(value.clone()),
                GroupSource::Alias(target) => {
                    let target = target.clone();
                    self.get_global(&target)
                },
            };
            if let Some(slot) = self.group.get_mut(name) {
                slot.reference.value = Some(resolved.clone());
            }
            return resolved;
        }
        self.get_global(name)
    }

    fn get_global(&mut self, name: &str) -> Lookup {
        match self.global.get(name) {
            Some(ReferenceValue {
                value: Some(value), ..
            }) => return value.clone(),
            Some(_) => {},
            None => {
                // Names found only at execution time are resolved on demand
                debug!(name, "Resolving name outside the binding plan");
            },
        }

        let resolved = self.resolver.lookup(name);
        self.external_lookups += 1;
        trace!(name, ?resolved, "Resolved external name");

        self.global
            .entry(name.to_string())
            .or_insert_with(|| ReferenceValue::empty(name))
            .value = Some(resolved.clone());
        resolved
    }

    /// Store a value produced inside the group
    pub fn set(&mut self, name: &str, value: Lookup) {
        match self.group.get_mut(name) {
            Some(slot) => slot.reference.value = Some(value),
            None => {
                debug!(name, "Storing value outside the binding plan");
                self.group.insert(
                    name.to_string(),
                    GroupSlot {
                        reference: ReferenceValue {
                            name: name.to_string(),
                            value: Some(value),
                        },
                        source: GroupSource::Produced,
                    },
                );
            },
        }
    }

    /// Install formula-local bindings for the formula about to execute
    pub fn enter_formula<I>(&mut self, bindings: I)
    where
        I: IntoIterator<Item = (String, LocalBinding)>,
    {
        self.local.clear();
        self.local.extend(bindings);
    }

    /// Bind one formula-local name
    pub fn bind_local(&mut self, name: impl Into<String>, binding: LocalBinding) {
        self.local.insert(name.into(), binding);
    }

    pub fn leave_formula(&mut self) {
        self.local.clear();
    }

    /// Entity id a name stands for, following aliases but never values
    pub fn resolve_name(&self, name: &str) -> String {
        let mut current = name;
        if let Some(LocalBinding::Alias(target)) = self.local.get(current) {
            current = target;
        }
        if let Some(GroupSlot {
            source: GroupSource::Alias(target),
            ..
        }) = self.group.get(current)
        {
            current = target;
        }
        current.to_string()
    }

    /// Host metadata for a name (aliases followed)
    pub fn metadata(&self, name: &str, key: &str) -> Option<FormulaValue> {
        self.resolver.metadata(&self.resolve_name(name), key)
    }

    /// Layer that would answer a lookup for `name`
    pub fn layer_of(&self, name: &str) -> Option<Layer> {
        if self.local.contains_key(name) {
            Some(Layer::FormulaLocal)
        } else if self.group.contains_key(name) {
            Some(Layer::GroupLocal)
        } else if self.global.contains_key(name) {
            Some(Layer::Global)
        } else {
            None
        }
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.group
            .get(name)
            .map(|slot| slot.reference.is_resolved())
            .or_else(|| self.global.get(name).map(ReferenceValue::is_resolved))
            .unwrap_or(false)
    }

    /// Names with a group or global slot
    pub fn slot_names(&self) -> BTreeSet<String> {
        self.group
            .keys()
            .chain(self.global.keys())
            .cloned()
            .collect()
    }

    /// Memoized reference-call result for `signature`
    pub fn cached_call(&self, signature: &str) -> Option<Lookup> {
        self.call_cache.get(signature).cloned()
    }

    pub fn cache_call(&mut self, signature: impl Into<String>, value: Lookup) {
        self.call_cache.insert(signature.into(), value);
    }

    /// Number of external lookups performed this cycle
    pub fn external_lookups(&self) -> usize {
        self.external_lookups
    }
}
