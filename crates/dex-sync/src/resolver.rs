use std::collections::{BTreeSet, HashMap};

use dex_stages::Stage;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown category: {0}")]
    UnknownCategory(String),
    #[error("category {category} depends on unknown category {prerequisite}")]
    UnknownPrerequisite {
        category: String,
        prerequisite: String,
    },
    #[error("category {0} is declared twice")]
    Duplicate(String),
    #[error("dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Static prerequisite map between categories, checked for cycles on construction.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    prerequisites: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// `declarations` order is the tie-break when several categories are ready.
    pub fn new<I, S>(declarations: I) -> Result<Self, ResolveError>
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: Into<String>,
    {
        let declarations = declarations
            .into_iter()
            .map(|(name, deps)| (name.into(), deps.into_iter().map(Into::into).collect::<Vec<String>>()))
            .collect::<Vec<_>>();

        let mut index = HashMap::with_capacity(declarations.len());
        for (position, (name, _)) in declarations.iter().enumerate() {
            if index.insert(name.clone(), position).is_some() {
                return Err(ResolveError::Duplicate(name.clone()));
            }
        }

        let mut prerequisites = Vec::with_capacity(declarations.len());
        for (name, deps) in &declarations {
            let mut resolved = Vec::with_capacity(deps.len());
            for dep in deps {
                let position = index.get(dep).copied().ok_or_else(|| {
                    ResolveError::UnknownPrerequisite {
                        category: name.clone(),
                        prerequisite: dep.clone(),
                    }
                })?;
                resolved.push(position);
            }
            prerequisites.push(resolved);
        }

        let graph = Self {
            names: declarations.into_iter().map(|(name, _)| name).collect(),
            prerequisites,
            index,
        };
        graph.topo_sort(&(0..graph.names.len()).collect())?;
        Ok(graph)
    }

    pub fn from_stages(stages: &[Box<dyn Stage>]) -> Result<Self, ResolveError> {
        Self::new(
            stages
                .iter()
                .map(|s| (s.category(), s.depends_on().to_vec())),
        )
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Expands `requested` to its transitive closure and orders it so every
    /// prerequisite comes first. An empty request enables every category.
    pub fn resolve(&self, requested: &[String]) -> Result<Vec<String>, ResolveError> {
        let enabled = if requested.is_empty() {
            (0..self.names.len()).collect()
        } else {
            self.closure(requested)?
        };
        Ok(self
            .topo_sort(&enabled)?
            .into_iter()
            .map(|i| self.names[i].clone())
            .collect())
    }

    fn closure(&self, requested: &[String]) -> Result<BTreeSet<usize>, ResolveError> {
        let mut enabled = BTreeSet::new();
        let mut pending = Vec::with_capacity(requested.len());
        for name in requested {
            let position = self
                .index
                .get(name.as_str())
                .copied()
                .ok_or_else(|| ResolveError::UnknownCategory(name.clone()))?;
            pending.push(position);
        }
        while let Some(position) = pending.pop() {
            if enabled.insert(position) {
                pending.extend(self.prerequisites[position].iter().copied());
            }
        }
        Ok(enabled)
    }

    /// Kahn's algorithm over `enabled`, always taking the earliest-declared ready node.
    fn topo_sort(&self, enabled: &BTreeSet<usize>) -> Result<Vec<usize>, ResolveError> {
        let mut indegree: HashMap<usize, usize> = enabled.iter().map(|&n| (n, 0)).collect();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &node in enabled {
            for &dep in &self.prerequisites[node] {
                if !enabled.contains(&dep) {
                    continue;
                }
                *indegree.entry(node).or_default() += 1;
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(&n, _)| n)
            .collect::<BTreeSet<_>>();
        let mut out = Vec::with_capacity(enabled.len());
        while let Some(node) = ready.pop_first() {
            out.push(node);
            for &child in dependents.get(&node).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        if out.len() != enabled.len() {
            let stuck = enabled
                .iter()
                .filter(|&&n| !out.contains(&n))
                .map(|&n| self.names[n].clone())
                .collect();
            return Err(ResolveError::Cycle(stuck));
        }
        Ok(out)
    }
}
