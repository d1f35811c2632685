//! Formula groups and group-level binding plans
//!
//! A [`FormulaGroup`] is the caller's input for one evaluation: a primary
//! formula, optional attribute and computed formulas, group variables and an
//! optional subject entity. [`GroupPlan`] refines the per-text binding plans
//! with what only the group knows: which names are produced by sibling
//! formulas, which are variables, and what `state` stands for.

use crate::alternate::{AlternateState, FallbackValue};
use crate::context::{LocalBinding, SlotBinding};
use crate::error::{FormulaError, Result};
use crate::plan::{constant_value, AnalysisService, BindingPlan, ResolutionStrategy};
use crate::value::FormulaValue;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type FormulaId = String;

/// Token that reads the subject (primary formula) or the primary result
/// (every other formula)
pub const STATE_TOKEN: &str = "state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaKind {
    #[default]
    Primary,
    Attribute,
    Computed,
}

/// Group variable
///
/// In YAML a plain scalar is a literal, `{ entity: sensor.x }` aliases an
/// external entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableBinding {
    Entity { entity: String },
    Literal(FormulaValue),
}

impl VariableBinding {
    pub fn entity(id: impl Into<String>) -> Self {
        VariableBinding::Entity { entity: id.into() }
    }

    pub fn literal(value: impl Into<FormulaValue>) -> Self {
        VariableBinding::Literal(value.into())
    }
}

/// One formula of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaDef {
    pub id: FormulaId,
    pub formula: String,
    #[serde(default)]
    pub kind: FormulaKind,
    #[serde(default)]
    pub fallbacks: BTreeMap<AlternateState, FallbackValue>,
}

impl FormulaDef {
    pub fn new(id: impl Into<String>, formula: impl Into<String>, kind: FormulaKind) -> Self {
        Self {
            id: id.into(),
            formula: formula.into(),
            kind,
            fallbacks: BTreeMap::new(),
        }
    }

    pub fn with_fallback(mut self, state: AlternateState, value: FallbackValue) -> Self {
        self.fallbacks.insert(state, value);
        self
    }
}

/// Input for one group evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaGroup {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub formulas: Vec<FormulaDef>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableBinding>,
}

impl FormulaGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: None,
            formulas: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_formula(mut self, formula: FormulaDef) -> Self {
        self.formulas.push(formula);
        self
    }

    pub fn primary(self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_formula(FormulaDef::new(id, text, FormulaKind::Primary))
    }

    pub fn attribute(self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_formula(FormulaDef::new(id, text, FormulaKind::Attribute))
    }

    pub fn computed(self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_formula(FormulaDef::new(id, text, FormulaKind::Computed))
    }

    pub fn variable(mut self, name: impl Into<String>, binding: VariableBinding) -> Self {
        self.variables.insert(name.into(), binding);
        self
    }

    pub fn formula(&self, id: &str) -> Option<&FormulaDef> {
        self.formulas.iter().find(|f| f.id == id)
    }

    pub fn primary_formula(&self) -> Option<&FormulaDef> {
        self.formulas.iter().find(|f| f.kind == FormulaKind::Primary)
    }

    /// Structural checks; formula texts are not parsed here
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FormulaError::invalid_group("group id must not be empty"));
        }
        if self.formulas.is_empty() {
            return Err(FormulaError::invalid_group(format!(
                "group '{}' has no formulas",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for formula in &self.formulas {
            if formula.id.trim().is_empty() {
                return Err(FormulaError::invalid_group(format!(
                    "group '{}' has a formula without id",
                    self.id
                )));
            }
            if !seen.insert(formula.id.as_str()) {
                return Err(FormulaError::invalid_group(format!(
                    "duplicate formula id '{}' in group '{}'",
                    formula.id, self.id
                )));
            }
            if self.variables.contains_key(&formula.id) {
                return Err(FormulaError::invalid_group(format!(
                    "'{}' is both a formula and a variable",
                    formula.id
                )));
            }
        }

        let primaries = self
            .formulas
            .iter()
            .filter(|f| f.kind == FormulaKind::Primary)
            .count();
        if primaries > 1 {
            return Err(FormulaError::invalid_group(format!(
                "group '{}' has {} primary formulas",
                self.id, primaries
            )));
        }
        Ok(())
    }

    /// Hash of the whole definition, used to key cached results
    pub fn fingerprint(&self) -> Result<u64> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| FormulaError::internal(format!("Failed to encode group: {}", e)))?;
        let mut hasher = DefaultHasher::new();
        encoded.hash(&mut hasher);
        Ok(hasher.finish())
    }
}

/// Planned fallback of one formula
#[derive(Debug, Clone)]
pub enum PlannedFallback {
    Literal(FormulaValue),
    Formula {
        text: String,
        plan: Result<Arc<BindingPlan>>,
    },
}

/// One formula with its text plan refined for the group
#[derive(Debug, Clone)]
pub struct PlannedFormula {
    pub id: FormulaId,
    pub kind: FormulaKind,
    pub text: String,
    /// Text plan, or the analysis error of this formula
    pub plan: Result<Arc<BindingPlan>>,
    pub fallbacks: BTreeMap<AlternateState, PlannedFallback>,
    /// Group-refined strategy per name (formula and fallback formulas)
    pub strategies: BTreeMap<String, ResolutionStrategy>,
    /// Formula-local bindings installed before execution
    pub locals: Vec<(String, LocalBinding)>,
    /// Formulas of the group this one reads, declaration order
    pub dependencies: Vec<FormulaId>,
}

impl PlannedFormula {
    pub fn fallback_texts(&self) -> impl Iterator<Item = &str> {
        self.fallbacks.values().filter_map(|fallback| match fallback {
            PlannedFallback::Formula { text, .. } => Some(text.as_str()),
            PlannedFallback::Literal(_) => None,
        })
    }
}

/// Binding plan of a whole group
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub group_id: String,
    pub subject: Option<String>,
    /// Declaration order
    pub formulas: Vec<PlannedFormula>,
    /// Slot binding for every name of every plan in the group
    pub bindings: BTreeMap<String, SlotBinding>,
}

impl GroupPlan {
    /// Analyze every formula and fallback formula and refine their plans
    ///
    /// Analysis errors stay attached to their formula; only a structurally
    /// invalid group fails here.
    pub fn build(group: &FormulaGroup, analysis: &AnalysisService) -> Result<Self> {
        group.validate()?;

        let kinds: BTreeMap<&str, FormulaKind> = group
            .formulas
            .iter()
            .map(|f| (f.id.as_str(), f.kind))
            .collect();
        let primary = group.primary_formula().map(|f| f.id.clone());

        let mut bindings = BTreeMap::new();
        let mut formulas = Vec::with_capacity(group.formulas.len());

        for def in &group.formulas {
            bindings.insert(def.id.clone(), SlotBinding::Produced);

            let plan = analysis.analyze(&def.formula);
            let fallbacks: BTreeMap<AlternateState, PlannedFallback> = def
                .fallbacks
                .iter()
                .map(|(state, value)| {
                    let planned = match value {
                        FallbackValue::Literal(v) => PlannedFallback::Literal(v.clone()),
                        FallbackValue::Formula { formula } => PlannedFallback::Formula {
                            text: formula.clone(),
                            plan: analysis.analyze(formula),
                        },
                    };
                    (*state, planned)
                })
                .collect();

            // Names of the formula and of its fallback formulas, with the
            // text-level hint of their first appearance
            let mut hints: BTreeMap<String, ResolutionStrategy> = BTreeMap::new();
            let fallback_plans = fallbacks.values().filter_map(|f| match f {
                PlannedFallback::Formula { plan: Ok(plan), .. } => Some(plan),
                _ => None,
            });
            for text_plan in plan.iter().chain(fallback_plans) {
                for (name, hint) in &text_plan.strategies {
                    let entry = hints.entry(name.clone()).or_insert(*hint);
                    if *entry == ResolutionStrategy::RawName {
                        *entry = *hint;
                    }
                }
            }

            // `state` reads the subject in the primary formula and the
            // primary result elsewhere, unless a formula or variable claims it
            let mut locals = Vec::new();
            let state_target = if hints.contains_key(STATE_TOKEN)
                && !kinds.contains_key(STATE_TOKEN)
                && !group.variables.contains_key(STATE_TOKEN)
            {
                match (&primary, def.kind) {
                    (Some(primary_id), kind) if kind != FormulaKind::Primary => {
                        Some(primary_id.clone())
                    },
                    _ => group.subject.clone(),
                }
            } else {
                None
            };
            if let Some(target) = &state_target {
                locals.push((STATE_TOKEN.to_string(), LocalBinding::Alias(target.clone())));
            }

            let mut strategies = BTreeMap::new();
            let mut dependencies: BTreeSet<String> = BTreeSet::new();
            for (name, hint) in &hints {
                let effective = match (&state_target, name.as_str()) {
                    (Some(target), STATE_TOKEN) => target.as_str(),
                    _ => name.as_str(),
                };

                let strategy = if let Some(kind) = kinds.get(effective) {
                    dependencies.insert(effective.to_string());
                    match kind {
                        FormulaKind::Computed => ResolutionStrategy::Computed,
                        _ => ResolutionStrategy::GroupInternal,
                    }
                } else if let Some(variable) = group.variables.get(effective) {
                    match variable {
                        VariableBinding::Literal(value) => {
                            bindings
                                .insert(effective.to_string(), SlotBinding::Literal(value.clone()));
                            ResolutionStrategy::Literal
                        },
                        VariableBinding::Entity { entity } => {
                            bindings
                                .insert(effective.to_string(), SlotBinding::Alias(entity.clone()));
                            ResolutionStrategy::ExternalLookup
                        },
                    }
                } else if let Some(constant) = constant_value(effective) {
                    bindings.insert(
                        effective.to_string(),
                        SlotBinding::Literal(FormulaValue::Number(constant)),
                    );
                    ResolutionStrategy::Literal
                } else {
                    bindings
                        .entry(effective.to_string())
                        .or_insert(SlotBinding::External);
                    ResolutionStrategy::ExternalLookup
                };

                // Raw-only names keep their hint; they still order the graph
                let strategy = if *hint == ResolutionStrategy::RawName {
                    ResolutionStrategy::RawName
                } else {
                    strategy
                };
                strategies.insert(name.clone(), strategy);
            }

            // Declaration order for a stable topological order
            let dependencies = group
                .formulas
                .iter()
                .filter(|f| dependencies.contains(&f.id))
                .map(|f| f.id.clone())
                .collect();

            formulas.push(PlannedFormula {
                id: def.id.clone(),
                kind: def.kind,
                text: def.formula.clone(),
                plan,
                fallbacks,
                strategies,
                locals,
                dependencies,
            });
        }

        Ok(Self {
            group_id: group.id.clone(),
            subject: group.subject.clone(),
            formulas,
            bindings,
        })
    }

    pub fn formula(&self, id: &str) -> Option<&PlannedFormula> {
        self.formulas.iter().find(|f| f.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.formulas.iter().map(|f| f.id.as_str())
    }

    /// Union of the slot names of every plan in the group
    pub fn names(&self) -> BTreeSet<String> {
        self.bindings.keys().cloned().collect()
    }
}
