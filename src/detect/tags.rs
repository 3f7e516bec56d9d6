//! Declarative tag grammar
//!
//! `<spawn>prompt</spawn>`, `<sync/>`, `<sync>3,4</sync>` and
//! `<return>text</return>`. Tag names are configurable.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::event::{ParseErrorKind, SignalKind};
use super::{Detection, ScanContext, TextState};
use crate::core::errors::{Result, SeqHookError};

/// Names used for the three signals in textual grammars
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalNames {
    pub spawn: String,
    pub sync: String,
    #[serde(rename = "return")]
    pub ret: String,
}

impl Default for SignalNames {
    fn default() -> Self {
        Self {
            spawn: "spawn".to_string(),
            sync: "sync".to_string(),
            ret: "return".to_string(),
        }
    }
}

impl SignalNames {
    pub fn kind_of(&self, name: &str) -> Option<SignalKind> {
        if name == self.spawn {
            Some(SignalKind::Spawn)
        } else if name == self.sync {
            Some(SignalKind::Sync)
        } else if name == self.ret {
            Some(SignalKind::Return)
        } else {
            None
        }
    }

    pub fn name_of(&self, kind: SignalKind) -> &str {
        match kind {
            SignalKind::Spawn => &self.spawn,
            SignalKind::Sync => &self.sync,
            SignalKind::Return => &self.ret,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for name in [&self.spawn, &self.sync, &self.ret] {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(SeqHookError::configuration_field(
                    format!("invalid signal name '{}'", name),
                    "grammar",
                ));
            }
        }
        if self.spawn == self.sync || self.spawn == self.ret || self.sync == self.ret {
            return Err(SeqHookError::configuration_field(
                "signal names must be distinct",
                "grammar",
            ));
        }
        Ok(())
    }
}

/// Compiled tag matcher
#[derive(Debug, Clone)]
pub(crate) struct TagPattern {
    names: SignalNames,
    open: Regex,
    closes: [String; 3],
    longest_open: usize,
}

impl TagPattern {
    pub(crate) fn new(names: &SignalNames) -> Result<Self> {
        names.validate()?;
        let alternatives = [&names.spawn, &names.sync, &names.ret]
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");
        let open = Regex::new(&format!(r"<({})\s*(/?)>", alternatives))
            .map_err(|e| SeqHookError::configuration_field(e.to_string(), "grammar"))?;
        let closes = [
            format!("</{}>", names.spawn),
            format!("</{}>", names.sync),
            format!("</{}>", names.ret),
        ];
        let longest_open = [&names.spawn, &names.sync, &names.ret]
            .iter()
            .map(|n| n.len() + 3)
            .max()
            .unwrap_or(0);
        Ok(Self {
            names: names.clone(),
            open,
            closes,
            longest_open,
        })
    }

    fn close_tag(&self, kind: SignalKind) -> &str {
        &self.closes[kind.rank() as usize]
    }

    /// Bytes at the end of `rest` that may be the start of an opening tag
    fn partial_suffix(&self, rest: &str) -> usize {
        match rest.rfind('<') {
            Some(pos) => {
                let suffix = &rest[pos..];
                if !suffix.contains('>') && suffix.len() < self.longest_open {
                    suffix.len()
                } else {
                    0
                }
            }
            None => 0,
        }
    }
}

pub(crate) fn scan(
    pattern: &TagPattern,
    state: &mut TextState,
    ctx: &ScanContext<'_>,
    new_text: &str,
    out: &mut Detection,
) {
    state.buffer.push_str(new_text);
    let offset = ctx.completion_offset();
    let mut cursor = 0;

    loop {
        let rest = &state.buffer[cursor..];
        let Some(caps) = pattern.open.captures(rest) else {
            cursor = state.buffer.len() - pattern.partial_suffix(rest);
            break;
        };
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let Some(kind) = pattern.names.kind_of(name.as_str()) else {
            cursor += whole.end();
            continue;
        };
        let self_closing = caps.get(2).map(|m| !m.as_str().is_empty()).unwrap_or(false);
        let open_start = cursor + whole.start();
        let body_start = cursor + whole.end();

        if self_closing {
            if kind == SignalKind::Sync {
                out.signal(ctx, kind, "", offset);
            } else {
                out.error(
                    ctx,
                    Some(kind),
                    ParseErrorKind::InvalidPayload,
                    offset,
                    format!("<{}/> carries no payload", pattern.names.name_of(kind)),
                );
            }
            cursor = body_start;
            continue;
        }

        let close = pattern.close_tag(kind);
        match state.buffer[body_start..].find(close) {
            Some(len) => {
                let body = &state.buffer[body_start..body_start + len];
                out.signal(ctx, kind, body, offset);
                cursor = body_start + len + close.len();
            }
            None => {
                // A new opening tag ends an unclosed body
                if let Some(inner) = pattern.open.find(&state.buffer[body_start..]) {
                    out.error(
                        ctx,
                        Some(kind),
                        ParseErrorKind::Unterminated,
                        offset,
                        format!("<{}> interrupted by another signal", pattern.names.name_of(kind)),
                    );
                    cursor = body_start + inner.start();
                    continue;
                }
                if state.buffer[body_start..].chars().count() > ctx.max_lookahead {
                    out.error(
                        ctx,
                        Some(kind),
                        ParseErrorKind::LookaheadExceeded,
                        offset,
                        format!("no {} within {} characters", close, ctx.max_lookahead),
                    );
                    cursor = body_start;
                    continue;
                }
                cursor = open_start;
                break;
            }
        }
    }

    state.buffer.drain(..cursor);
}
