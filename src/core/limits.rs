use crate::core::errors::{Result, SeqHookError};
use crate::entity::SequenceId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds on dynamic spawning and blocking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnLimits {
    /// Maximum spawn depth of any sequence (roots are depth 0, so 0 disables spawning)
    pub max_spawn_depth: usize,
    /// Maximum number of children a parent may hold whose results are not yet merged
    pub max_children_per_parent: usize,
    /// Maximum number of live (non-released) sequences in the store
    pub max_live_sequences: usize,
    /// Force-unblock a parent after it waited this long. `None` disables the policy.
    #[serde(with = "opt_duration_ms")]
    pub max_blocked_duration: Option<Duration>,
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 4,
            max_children_per_parent: 64,
            max_live_sequences: 4_096,
            max_blocked_duration: None,
        }
    }
}

impl SpawnLimits {
    /// `max_spawn_depth == 0` is valid and forbids roots from spawning.
    pub fn validate(&self) -> Result<()> {
        if self.max_children_per_parent == 0 {
            return Err(SeqHookError::configuration_field(
                "max_children_per_parent must be greater than 0",
                "max_children_per_parent",
            ));
        }
        if self.max_live_sequences < 2 {
            return Err(SeqHookError::configuration_field(
                "max_live_sequences must allow at least a parent and one child",
                "max_live_sequences",
            ));
        }
        if let Some(d) = self.max_blocked_duration {
            if d.is_zero() {
                return Err(SeqHookError::configuration_field(
                    "max_blocked_duration must be non-zero when set",
                    "max_blocked_duration",
                ));
            }
        }
        Ok(())
    }

    /// Limits used by tests and local experiments
    pub fn conservative() -> Self {
        Self {
            max_spawn_depth: 2,
            max_children_per_parent: 8,
            max_live_sequences: 64,
            max_blocked_duration: Some(Duration::from_secs(30)),
        }
    }

    /// Check whether `parent` (at `parent_depth`, with `current_children`
    /// unmerged) may spawn another child while `live` sequences exist.
    pub fn check_spawn(
        &self,
        parent: SequenceId,
        parent_depth: usize,
        current_children: usize,
        live: usize,
    ) -> Result<()> {
        let depth = parent_depth + 1;
        if depth > self.max_spawn_depth {
            return Err(SeqHookError::MaxDepthExceeded {
                parent,
                depth,
                limit: self.max_spawn_depth,
            });
        }
        if current_children >= self.max_children_per_parent {
            return Err(SeqHookError::ChildLimitExceeded {
                parent,
                current: current_children,
                limit: self.max_children_per_parent,
            });
        }
        if live >= self.max_live_sequences {
            return Err(SeqHookError::CapacityExhausted {
                live,
                limit: self.max_live_sequences,
            });
        }
        Ok(())
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = SpawnLimits::default();
        assert!(limits.validate().is_ok());
        assert!(limits.max_blocked_duration.is_none());
        assert!(SpawnLimits::conservative().validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let limits = SpawnLimits { max_children_per_parent: 0, ..Default::default() };
        assert!(limits.validate().is_err());

        let limits = SpawnLimits {
            max_blocked_duration: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_depth_disables_spawning() {
        let limits = SpawnLimits { max_spawn_depth: 0, ..Default::default() };
        assert!(limits.validate().is_ok());
        let err = limits.check_spawn(1, 0, 0, 1).unwrap_err();
        assert!(matches!(err, SeqHookError::MaxDepthExceeded { depth: 1, limit: 0, .. }));
    }

    #[test]
    fn test_check_spawn_depth() {
        let limits = SpawnLimits { max_spawn_depth: 1, ..Default::default() };
        assert!(limits.check_spawn(1, 0, 0, 1).is_ok());
        let err = limits.check_spawn(2, 1, 0, 2).unwrap_err();
        assert!(matches!(err, SeqHookError::MaxDepthExceeded { depth: 2, limit: 1, .. }));
    }

    #[test]
    fn test_check_spawn_fanout_and_capacity() {
        let limits = SpawnLimits {
            max_children_per_parent: 2,
            max_live_sequences: 3,
            ..Default::default()
        };
        assert!(matches!(
            limits.check_spawn(1, 0, 2, 1),
            Err(SeqHookError::ChildLimitExceeded { current: 2, .. })
        ));
        assert!(matches!(
            limits.check_spawn(1, 0, 0, 3),
            Err(SeqHookError::CapacityExhausted { live: 3, limit: 3 })
        ));
    }

    #[test]
    fn test_blocked_duration_serializes_as_millis() {
        let limits = SpawnLimits {
            max_blocked_duration: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let json = serde_json::to_value(&limits).unwrap();
        assert_eq!(json["max_blocked_duration"], 1500);
        let back: SpawnLimits = serde_json::from_value(json).unwrap();
        assert_eq!(back, limits);
    }
}
