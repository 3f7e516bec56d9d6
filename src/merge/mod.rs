//! Result merger
//!
//! Pure combination of finished children's results into the text appended to
//! the parent. The strategy is a closed set of variants; custom combiners are
//! injected by name through a [`CombinerRegistry`] so the strategy stays
//! serializable.

pub mod registry;

pub use registry::*;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SeqHookError};
use crate::graph::ChildResult;

pub const DEFAULT_SEPARATOR: &str = "\n";

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

/// How finished child results are combined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Join result texts with `separator`. Failed children contribute an empty slot.
    Concatenate {
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Prefix each result with its child id, then join.
    LabeledJoin {
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Delegate to a combiner registered under `name`.
    Custom { name: String },
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::Concatenate {
            separator: default_separator(),
        }
    }
}

impl MergeStrategy {
    pub fn labeled() -> Self {
        Self::LabeledJoin {
            separator: default_separator(),
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom { name: name.into() }
    }

    /// Parse the short names accepted in spawn payloads and config files
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "concatenate" | "concat" => Some(Self::default()),
            "labeled-join" | "labeled" => Some(Self::labeled()),
            other => other
                .strip_prefix("custom:")
                .map(|n| Self::custom(n.trim())),
        }
    }
}

/// Applies a [`MergeStrategy`] to ordered child results
#[derive(Clone, Default)]
pub struct ResultMerger {
    registry: CombinerRegistry,
}

impl ResultMerger {
    pub fn new(registry: CombinerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CombinerRegistry {
        &self.registry
    }

    /// Combine `results` (already in spawn order) into one string.
    pub fn merge(&self, results: &[ChildResult], strategy: &MergeStrategy) -> Result<String> {
        match strategy {
            MergeStrategy::Concatenate { separator } => Ok(results
                .iter()
                .map(|r| if r.failed { "" } else { r.text.as_str() })
                .collect::<Vec<_>>()
                .join(separator)),
            MergeStrategy::LabeledJoin { separator } => Ok(results
                .iter()
                .map(|r| {
                    if r.failed {
                        format!("[child {} failed]", r.child_id)
                    } else {
                        format!("[child {}] {}", r.child_id, r.text)
                    }
                })
                .collect::<Vec<_>>()
                .join(separator)),
            MergeStrategy::Custom { name } => {
                let combiner = self.registry.get(name).ok_or_else(|| {
                    SeqHookError::configuration_field(
                        format!("no combiner registered under '{}'", name),
                        "merge_strategy",
                    )
                })?;
                Ok(combiner.combine(results))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn results() -> Vec<ChildResult> {
        vec![
            ChildResult::finished(3, "r1"),
            ChildResult::failed(4),
            ChildResult::finished(5, "r3"),
        ]
    }

    #[test]
    fn test_concatenate_default() {
        let merger = ResultMerger::default();
        let out = merger
            .merge(&[ChildResult::finished(1, "r1"), ChildResult::finished(2, "r2")], &MergeStrategy::default())
            .unwrap();
        assert_eq!(out, "r1\nr2");
    }

    #[test]
    fn test_failed_child_keeps_empty_slot() {
        let merger = ResultMerger::default();
        let out = merger.merge(&results(), &MergeStrategy::default()).unwrap();
        assert_eq!(out, "r1\n\nr3");
        let out = merger.merge(&[ChildResult::failed(9)], &MergeStrategy::default()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_labeled_join() {
        let merger = ResultMerger::default();
        let out = merger
            .merge(
                &results(),
                &MergeStrategy::LabeledJoin {
                    separator: " | ".into(),
                },
            )
            .unwrap();
        assert_eq!(out, "[child 3] r1 | [child 4 failed] | [child 5] r3");
    }

    #[test]
    fn test_custom_combiner() {
        let registry = CombinerRegistry::new();
        registry.register(Arc::new(FnCombiner::new("count", |rs: &[ChildResult]| {
            format!("{} results", rs.len())
        })));
        let merger = ResultMerger::new(registry);
        assert_eq!(
            merger.merge(&results(), &MergeStrategy::custom("count")).unwrap(),
            "3 results"
        );
        assert!(merger.merge(&results(), &MergeStrategy::custom("missing")).is_err());
    }

    #[test]
    fn test_merge_is_pure() {
        let merger = ResultMerger::default();
        let first = merger.merge(&results(), &MergeStrategy::labeled()).unwrap();
        let second = merger.merge(&results(), &MergeStrategy::labeled()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(MergeStrategy::from_name("concatenate"), Some(MergeStrategy::default()));
        assert_eq!(MergeStrategy::from_name("labeled-join"), Some(MergeStrategy::labeled()));
        assert_eq!(MergeStrategy::from_name("custom: vote"), Some(MergeStrategy::custom("vote")));
        assert_eq!(MergeStrategy::from_name("bogus"), None);
    }

    #[test]
    fn test_strategy_serde() {
        let strategy: MergeStrategy = serde_json::from_str(r#"{"labeled-join": {}}"#).unwrap();
        assert_eq!(strategy, MergeStrategy::labeled());
        let json = serde_json::to_value(MergeStrategy::custom("vote")).unwrap();
        assert_eq!(json, serde_json::json!({"custom": {"name": "vote"}}));
    }
}
