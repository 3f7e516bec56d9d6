//! Signal payload decoding
//!
//! Spawn, sync and return bodies are either plain inline text or JSON
//! arguments. The function-call grammar always carries JSON arguments and
//! goes through the `*_from_value` entry points directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::SpawnRequest;
use crate::entity::{Priority, SamplingOverrides, SequenceId};
use crate::merge::MergeStrategy;

/// Encoding of the text between a signal's delimiters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Spawn body is the prompt, sync body is a comma separated id list,
    /// return body is the result text.
    #[default]
    Plain,
    /// Bodies are JSON objects (or bare strings / arrays as shorthand).
    Json,
}

#[derive(Debug, Deserialize)]
struct SpawnArgs {
    prompt: String,
    #[serde(default, alias = "child_id")]
    id: Option<SequenceId>,
    #[serde(default)]
    merge_strategy: Option<StrategyArg>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    stop: Option<Vec<String>>,
}

/// Strategy given either by short name or as a full tagged object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StrategyArg {
    Name(String),
    Full(MergeStrategy),
}

impl StrategyArg {
    fn resolve(self) -> Result<MergeStrategy, String> {
        match self {
            Self::Full(strategy) => Ok(strategy),
            Self::Name(name) => MergeStrategy::from_name(&name)
                .ok_or_else(|| format!("unknown merge strategy '{}'", name)),
        }
    }
}

pub fn parse_spawn(body: &str, format: PayloadFormat) -> Result<SpawnRequest, String> {
    match format {
        PayloadFormat::Plain => {
            let prompt = body.trim();
            if prompt.is_empty() {
                return Err("empty spawn prompt".to_string());
            }
            Ok(SpawnRequest::new(prompt))
        }
        PayloadFormat::Json => spawn_from_value(parse_json(body)?),
    }
}

pub fn parse_sync(body: &str, format: PayloadFormat) -> Result<Option<Vec<SequenceId>>, String> {
    match format {
        PayloadFormat::Plain => parse_id_list(body),
        PayloadFormat::Json => {
            if body.trim().is_empty() {
                return Ok(None);
            }
            sync_from_value(parse_json(body)?)
        }
    }
}

pub fn parse_return(body: &str, format: PayloadFormat) -> Result<String, String> {
    match format {
        PayloadFormat::Plain => Ok(body.trim().to_string()),
        PayloadFormat::Json => return_from_value(parse_json(body)?),
    }
}

pub fn spawn_from_value(value: Value) -> Result<SpawnRequest, String> {
    let args: SpawnArgs = match value {
        Value::String(prompt) => return parse_spawn(&prompt, PayloadFormat::Plain),
        other => serde_json::from_value(other).map_err(|e| e.to_string())?,
    };
    if args.prompt.trim().is_empty() {
        return Err("empty spawn prompt".to_string());
    }
    let merge_strategy = args.merge_strategy.map(StrategyArg::resolve).transpose()?;
    Ok(SpawnRequest {
        prompt: args.prompt,
        child_id: args.id,
        merge_strategy,
        priority: args.priority,
        sampling: SamplingOverrides {
            temperature: args.temperature,
            top_p: args.top_p,
            max_tokens: args.max_tokens,
            stop: args.stop,
        },
    })
}

pub fn sync_from_value(value: Value) -> Result<Option<Vec<SequenceId>>, String> {
    let targets = match value {
        Value::Null => return Ok(None),
        Value::Object(mut map) => match map.remove("targets") {
            None | Some(Value::Null) => return Ok(None),
            Some(targets) => targets,
        },
        other => other,
    };
    let ids: Vec<SequenceId> = serde_json::from_value(targets).map_err(|e| e.to_string())?;
    Ok(Some(ids))
}

pub fn return_from_value(value: Value) -> Result<String, String> {
    match value {
        Value::String(text) => Ok(text),
        Value::Object(mut map) => match map.remove("text") {
            Some(Value::String(text)) => Ok(text),
            Some(other) => Err(format!("return text must be a string, got {}", other)),
            None => Err("return payload missing 'text'".to_string()),
        },
        other => Err(format!("unexpected return payload {}", other)),
    }
}

fn parse_json(body: &str) -> Result<Value, String> {
    serde_json::from_str(body.trim()).map_err(|e| e.to_string())
}

fn parse_id_list(body: &str) -> Result<Option<Vec<SequenceId>>, String> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }
    body.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SequenceId>()
                .map_err(|_| format!("invalid sequence id '{}'", s))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
