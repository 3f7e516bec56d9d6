//! Registry for custom merge combiners

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;

use crate::graph::ChildResult;

/// A custom merge combiner. Must be pure: same input, same output.
pub trait Combiner: Send + Sync {
    /// Name the combiner is registered under
    fn name(&self) -> &str;

    /// Combine ordered child results into the merge text
    fn combine(&self, results: &[ChildResult]) -> String;
}

/// Combiner backed by a closure
pub struct FnCombiner<F> {
    name: String,
    f: F,
}

impl<F> FnCombiner<F>
where
    F: Fn(&[ChildResult]) -> String + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Combiner for FnCombiner<F>
where
    F: Fn(&[ChildResult]) -> String + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn combine(&self, results: &[ChildResult]) -> String {
        (self.f)(results)
    }
}

/// Registry for named combiners
#[derive(Clone)]
pub struct CombinerRegistry {
    combiners: Arc<RwLock<HashMap<String, Arc<dyn Combiner>>>>,
}

impl CombinerRegistry {
    pub fn new() -> Self {
        Self {
            combiners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a combiner, replacing any previous one with the same name
    pub fn register(&self, combiner: Arc<dyn Combiner>) {
        let mut combiners = self.combiners.write();
        combiners.insert(combiner.name().to_string(), combiner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Combiner>> {
        self.combiners.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.combiners.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.combiners.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CombinerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_list() {
        let registry = CombinerRegistry::new();
        registry.register(Arc::new(FnCombiner::new("b", |_: &[ChildResult]| String::new())));
        registry.register(Arc::new(FnCombiner::new("a", |_: &[ChildResult]| String::new())));
        assert!(registry.contains("a"));
        assert_eq!(registry.list(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = CombinerRegistry::new();
        let other = registry.clone();
        other.register(Arc::new(FnCombiner::new("first", |rs: &[ChildResult]| {
            rs.first().map(|r| r.text.clone()).unwrap_or_default()
        })));
        let combiner = registry.get("first").unwrap();
        assert_eq!(combiner.combine(&[ChildResult::finished(1, "x")]), "x");
    }
}
