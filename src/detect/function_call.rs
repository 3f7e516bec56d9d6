//! Streaming function-call grammar
//!
//! Calls look like `<tool_call>{"name": "spawn", "arguments": {...}}`. The
//! JSON object is accumulated across ticks and is complete once its braces
//! balance. Each call is emitted exactly once; calls to other tools are
//! ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::event::ParseErrorKind;
use super::tags::SignalNames;
use super::{Detection, ScanContext, TextState};

pub const DEFAULT_START_MARKER: &str = "<tool_call>";

/// Function-call grammar settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionCallGrammar {
    pub names: SignalNames,
    /// Text that precedes every call object
    pub start_marker: String,
}

impl Default for FunctionCallGrammar {
    fn default() -> Self {
        Self {
            names: SignalNames::default(),
            start_marker: DEFAULT_START_MARKER.to_string(),
        }
    }
}

/// Byte length of the leading JSON object in `text`, if its braces balance.
/// Braces inside string literals are not counted.
fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| {
            k <= text.len()
                && marker.is_char_boundary(k)
                && text.is_char_boundary(text.len() - k)
                && text.ends_with(&marker[..k])
        })
        .unwrap_or(0)
}

/// Split a call object into its tool name and argument value
fn split_call(call: Value) -> Result<(String, Value), String> {
    let Value::Object(mut map) = call else {
        return Err("tool call is not a JSON object".to_string());
    };
    let name = match map.remove("name") {
        Some(Value::String(name)) => name,
        _ => return Err("tool call has no 'name'".to_string()),
    };
    let arguments = match map.remove("arguments").or_else(|| map.remove("parameters")) {
        Some(Value::String(raw)) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Some(value) => value,
        None => Value::Null,
    };
    Ok((name, arguments))
}

pub(crate) fn scan(
    grammar: &FunctionCallGrammar,
    state: &mut TextState,
    ctx: &ScanContext<'_>,
    new_text: &str,
    out: &mut Detection,
) {
    state.buffer.push_str(new_text);
    let offset = ctx.completion_offset();
    let marker = grammar.start_marker.as_str();
    let mut cursor = 0;

    loop {
        let rest = &state.buffer[cursor..];
        let Some(pos) = rest.find(marker) else {
            cursor = state.buffer.len() - partial_marker_len(rest, marker);
            break;
        };
        let marker_start = cursor + pos;
        let after_marker = marker_start + marker.len();
        let tail = &state.buffer[after_marker..];
        let object_start = after_marker + (tail.len() - tail.trim_start().len());
        let object = &state.buffer[object_start..];

        if object.is_empty() {
            cursor = marker_start;
            break;
        }
        if !object.starts_with('{') {
            out.error(
                ctx,
                None,
                ParseErrorKind::InvalidPayload,
                offset,
                "expected a JSON object after the call marker".to_string(),
            );
            cursor = object_start;
            continue;
        }

        let Some(len) = balanced_object_len(object) else {
            if object.chars().count() > ctx.max_lookahead {
                out.error(
                    ctx,
                    None,
                    ParseErrorKind::LookaheadExceeded,
                    offset,
                    format!("call arguments unbalanced after {} characters", ctx.max_lookahead),
                );
                cursor = object_start;
                continue;
            }
            cursor = marker_start;
            break;
        };

        let parsed = serde_json::from_str::<Value>(&object[..len])
            .map_err(|e| e.to_string())
            .and_then(split_call);
        cursor = object_start + len;

        match parsed {
            Ok((name, arguments)) => match grammar.names.kind_of(&name) {
                Some(kind) => out.signal_value(ctx, kind, arguments, offset),
                None => debug!(seq_id = ctx.seq_id, tool = %name, "Ignoring unrelated tool call"),
            },
            Err(message) => {
                out.error(ctx, None, ParseErrorKind::InvalidPayload, offset, message);
            }
        }
    }

    state.buffer.drain(..cursor);
}
