//! Dependency graph of a formula group
//!
//! Nodes are formula ids, an edge A -> B means A reads a name produced by B.
//! The order returned by [`DependencyGraph::order`] evaluates producers before
//! their consumers.

use crate::error::{FormulaError, Result};
use crate::group::{FormulaId, GroupPlan};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Declaration order
    nodes: Vec<FormulaId>,
    /// node -> formulas it depends on
    edges: HashMap<FormulaId, Vec<FormulaId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_plan(plan: &GroupPlan) -> Self {
        let mut graph = Self::new();
        for formula in &plan.formulas {
            graph.add_node(&formula.id);
            for dependency in &formula.dependencies {
                graph.add_dependency(&formula.id, dependency);
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: &str) {
        if !self.edges.contains_key(id) {
            self.nodes.push(id.to_string());
            self.edges.insert(id.to_string(), Vec::new());
        }
    }

    /// Record that `dependent` reads the output of `precedent`
    pub fn add_dependency(&mut self, dependent: &str, precedent: &str) {
        self.add_node(dependent);
        self.add_node(precedent);
        if let Some(deps) = self.edges.get_mut(dependent) {
            if !deps.iter().any(|d| d == precedent) {
                deps.push(precedent.to_string());
            }
        }
    }

    pub fn dependencies(&self, id: &str) -> &[FormulaId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological order, producers first
    ///
    /// Roots are visited in declaration order and so are each node's
    /// dependencies, which keeps the order stable between cycles. A node met
    /// again while still on the DFS stack closes a cycle; the error names the
    /// participating ids in path order, first id repeated at the end.
    pub fn order(&self) -> Result<Vec<FormulaId>> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for node in &self.nodes {
            self.visit(node, &mut result, &mut visited, &mut stack)?;
        }

        debug!(order = ?result, "Resolved evaluation order");
        Ok(result)
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        result: &mut Vec<FormulaId>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        if let Some(start) = stack.iter().position(|n| *n == node) {
            let mut members: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            members.push(node.to_string());
            return Err(FormulaError::Cycle { members });
        }
        if visited.contains(node) {
            return Ok(());
        }

        stack.push(node);
        for dependency in self.dependencies(node) {
            self.visit(dependency, result, visited, stack)?;
        }
        stack.pop();

        visited.insert(node);
        result.push(node.to_string());
        Ok(())
    }
}

/// Evaluation order of a planned group
pub fn order(plan: &GroupPlan) -> Result<Vec<FormulaId>> {
    DependencyGraph::from_plan(plan).order()
}
