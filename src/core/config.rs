use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::errors::{Result, SeqHookError};
use crate::core::limits::SpawnLimits;
use crate::detect::{PayloadFormat, SignalGrammar};
use crate::merge::MergeStrategy;

/// Lifecycle controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    // Detection
    /// Signal grammar: sentinel token ids or a textual grammar
    pub grammar: SignalGrammar,
    /// Encoding of signal payloads
    pub payload_format: PayloadFormat,
    /// Maximum buffered tokens (sentinel) or characters (textual) of an open signal
    pub max_lookahead: usize,

    // Merging
    /// Strategy given to roots registered without one
    pub default_merge_strategy: MergeStrategy,

    // Spawning and blocking
    pub limits: SpawnLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            grammar: SignalGrammar::default(),
            payload_format: PayloadFormat::Plain,
            max_lookahead: 2_048,
            default_merge_strategy: MergeStrategy::default(),
            limits: SpawnLimits::default(),
        }
    }
}

impl ControllerConfig {
    /// Create a new builder for ControllerConfig
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.grammar.validate()?;
        if self.max_lookahead == 0 {
            return Err(SeqHookError::configuration_field(
                "max_lookahead must be greater than 0",
                "max_lookahead",
            ));
        }
        if let MergeStrategy::Custom { name } = &self.default_merge_strategy {
            if name.trim().is_empty() {
                return Err(SeqHookError::configuration_field(
                    "custom merge strategy needs a combiner name",
                    "default_merge_strategy",
                ));
            }
        }
        self.limits.validate()
    }

    /// Configuration for development/testing: shallow trees, short blocks
    pub fn development() -> Self {
        Self {
            max_lookahead: 256,
            limits: SpawnLimits::conservative(),
            ..Default::default()
        }
    }

    /// Configuration for production serving
    pub fn production() -> Self {
        Self {
            max_lookahead: 8_192,
            limits: SpawnLimits {
                max_live_sequences: 65_536,
                ..SpawnLimits::default()
            },
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SeqHookError::io(format!("reading {}", path.display()), e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(SeqHookError::configuration(format!(
                "unsupported config file extension {:?}",
                other.unwrap_or("")
            ))),
        }
    }
}

/// Builder for ControllerConfig
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn grammar(mut self, grammar: SignalGrammar) -> Self {
        self.config.grammar = grammar;
        self
    }

    pub fn payload_format(mut self, format: PayloadFormat) -> Self {
        self.config.payload_format = format;
        self
    }

    pub fn max_lookahead(mut self, max_lookahead: usize) -> Self {
        self.config.max_lookahead = max_lookahead;
        self
    }

    pub fn merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.config.default_merge_strategy = strategy;
        self
    }

    pub fn max_spawn_depth(mut self, depth: usize) -> Self {
        self.config.limits.max_spawn_depth = depth;
        self
    }

    pub fn max_children_per_parent(mut self, max: usize) -> Self {
        self.config.limits.max_children_per_parent = max;
        self
    }

    pub fn max_live_sequences(mut self, max: usize) -> Self {
        self.config.limits.max_live_sequences = max;
        self
    }

    /// Set the force-unblock timeout (`None` disables it)
    pub fn max_blocked_duration(mut self, duration: Option<Duration>) -> Self {
        self.config.limits.max_blocked_duration = duration;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ControllerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{SentinelTokens, SignalNames};

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_blocked_duration, None);
    }

    #[test]
    fn test_presets() {
        assert!(ControllerConfig::development().validate().is_ok());
        assert_eq!(ControllerConfig::development().limits.max_spawn_depth, 2);
        assert!(ControllerConfig::production().validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ControllerConfig::default();
        config.max_lookahead = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.limits.max_children_per_parent = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.limits.max_spawn_depth = 0;
        assert!(config.validate().is_ok());

        let config = ControllerConfig {
            default_merge_strategy: MergeStrategy::custom(" "),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ControllerConfig::builder()
            .grammar(SignalGrammar::Sentinel(SentinelTokens {
                spawn: 10,
                sync: 11,
                ret: 12,
                end: 13,
            }))
            .max_spawn_depth(1)
            .max_blocked_duration(Some(Duration::from_millis(500)))
            .build()
            .unwrap();
        assert_eq!(config.limits.max_spawn_depth, 1);
        assert!(!config.grammar.is_textual());

        assert!(ControllerConfig::builder().max_live_sequences(1).build().is_err());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
grammar:
  mode: tags
  spawn: fork
payload_format: json
max_lookahead: 512
limits:
  max_spawn_depth: 3
  max_blocked_duration: 1500
"#;
        let config = ControllerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.grammar,
            SignalGrammar::Tags(SignalNames {
                spawn: "fork".to_string(),
                ..SignalNames::default()
            })
        );
        assert_eq!(config.payload_format, PayloadFormat::Json);
        assert_eq!(config.default_merge_strategy, MergeStrategy::default());
        assert_eq!(config.limits.max_spawn_depth, 3);
        assert_eq!(config.limits.max_children_per_parent, 64);
        assert_eq!(config.limits.max_blocked_duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_json_and_file() {
        let json = r#"{"grammar": {"mode": "sentinel", "spawn": 1, "sync": 2, "return": 3, "end": 4}}"#;
        let config = ControllerConfig::from_json_str(json).unwrap();
        assert!(matches!(config.grammar, SignalGrammar::Sentinel(_)));

        let labeled = r#"{"default_merge_strategy": {"labeled-join": {"separator": " | "}}}"#;
        let config = ControllerConfig::from_json_str(labeled).unwrap();
        assert_eq!(
            config.default_merge_strategy,
            MergeStrategy::LabeledJoin {
                separator: " | ".to_string()
            }
        );

        let bad = r#"{"grammar": {"mode": "sentinel", "spawn": 1, "sync": 1, "return": 3, "end": 4}}"#;
        assert!(ControllerConfig::from_json_str(bad).is_err());

        let path = std::env::temp_dir().join(format!("seqhook-config-{}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();
        assert!(ControllerConfig::from_file(&path).is_ok());
        std::fs::remove_file(&path).unwrap();

        assert!(ControllerConfig::from_file("/nonexistent/seqhook.toml").is_err());
    }
}
