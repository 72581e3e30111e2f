//! The action graph: every rule of a build, keyed by target

use crate::error::{BuildError, EngineResult};
use crate::rules::{BuildRule, GenRule, WorkerToolRule};
use crate::target::BuildTarget;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One rule as written in a graph description
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSpec {
    /// Shell command rule
    Genrule(GenRule),
    /// Persistent worker rule
    WorkerTool(WorkerToolRule),
}

impl RuleSpec {
    fn into_rule(self) -> Arc<dyn BuildRule> {
        match self {
            Self::Genrule(rule) => Arc::new(rule),
            Self::WorkerTool(rule) => Arc::new(rule),
        }
    }
}

/// JSON description of an action graph
#[derive(Debug, Clone, Deserialize)]
pub struct GraphSpec {
    /// All rules
    pub rules: Vec<RuleSpec>,
}

/// Immutable set of rules with validated dependencies
#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
    rules: BTreeMap<BuildTarget, Arc<dyn BuildRule>>,
}

impl ActionGraph {
    /// Graph of `rules`
    ///
    /// # Errors
    ///
    /// Duplicate targets and dependencies on unknown targets
    pub fn new(rules: Vec<Arc<dyn BuildRule>>) -> EngineResult<Self> {
        let mut by_target = BTreeMap::new();
        for rule in rules {
            let target = rule.target().clone();
            if by_target.insert(target.clone(), rule).is_some() {
                return Err(BuildError::DuplicateRule(target.to_string()));
            }
        }
        let graph = Self { rules: by_target };
        graph.validate()?;
        Ok(graph)
    }

    /// Graph from a parsed description
    ///
    /// # Errors
    ///
    /// See [`ActionGraph::new`]
    pub fn from_spec(spec: GraphSpec) -> EngineResult<Self> {
        Self::new(spec.rules.into_iter().map(RuleSpec::into_rule).collect())
    }

    /// Graph from a JSON file
    ///
    /// # Errors
    ///
    /// I/O, JSON and validation errors
    pub fn from_json_file(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let spec: GraphSpec = serde_json::from_str(&contents)?;
        debug!("Loaded {} rules from {}", spec.rules.len(), path.display());
        Self::from_spec(spec)
    }

    fn validate(&self) -> EngineResult<()> {
        for rule in self.rules.values() {
            if let Some(dep) = rule.deps().iter().find(|dep| !self.rules.contains_key(*dep)) {
                return Err(BuildError::MissingDependency {
                    rule: rule.target().to_string(),
                    dep: dep.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Rule for `target`
    ///
    /// # Errors
    ///
    /// `BuildError::UnknownTarget` if there is none
    pub fn require_rule(&self, target: &BuildTarget) -> EngineResult<&Arc<dyn BuildRule>> {
        self.rules
            .get(target)
            .ok_or_else(|| BuildError::UnknownTarget(target.to_string()))
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the graph has no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// All rules in target order
    pub fn rules(&self) -> impl Iterator<Item = &Arc<dyn BuildRule>> {
        self.rules.values()
    }

    /// `roots` and everything they transitively depend on, dependencies first.
    ///
    /// # Errors
    ///
    /// Unknown roots, and `BuildError::Cycle` naming the rules on or behind a cycle
    pub fn topological_order(&self, roots: &[BuildTarget]) -> EngineResult<Vec<Arc<dyn BuildRule>>> {
        // Transitive closure of the roots
        let mut closure: BTreeSet<&BuildTarget> = BTreeSet::new();
        let mut stack: Vec<&BuildTarget> = Vec::new();
        for root in roots {
            stack.push(self.require_rule(root)?.target());
        }
        while let Some(target) = stack.pop() {
            if closure.insert(target) {
                stack.extend(self.require_rule(target)?.deps());
            }
        }

        // Kahn's algorithm over dependency edges
        let mut pending: BTreeMap<&BuildTarget, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&BuildTarget, Vec<&BuildTarget>> = BTreeMap::new();
        for target in &closure {
            let deps: BTreeSet<&BuildTarget> = self.require_rule(target)?.deps().iter().collect();
            let _ = pending.insert(*target, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(*target);
            }
        }

        let mut ready: VecDeque<&BuildTarget> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&target, _)| target)
            .collect();
        let mut order = Vec::with_capacity(closure.len());
        while let Some(target) = ready.pop_front() {
            order.push(Arc::clone(self.require_rule(target)?));
            for dependent in dependents.get(target).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() == closure.len() {
            Ok(order)
        } else {
            let stuck = pending
                .into_iter()
                .filter(|&(_, count)| count > 0)
                .map(|(target, _)| target.to_string())
                .collect();
            Err(BuildError::Cycle(stuck))
        }
    }
}
