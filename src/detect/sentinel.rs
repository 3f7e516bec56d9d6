//! Exact sentinel-token matching
//!
//! `spawn` and `return` tokens open a payload span closed by `end`. The
//! `sync` token stands alone and waits on every registered child.

use serde::{Deserialize, Serialize};

use super::event::{ParseErrorKind, SignalKind};
use super::{Detection, ScanContext};
use crate::entity::TokenId;

/// Reserved token ids marking lifecycle signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelTokens {
    pub spawn: TokenId,
    pub sync: TokenId,
    #[serde(rename = "return")]
    pub ret: TokenId,
    pub end: TokenId,
}

impl SentinelTokens {
    pub fn is_distinct(&self) -> bool {
        let ids = [self.spawn, self.sync, self.ret, self.end];
        ids.iter()
            .enumerate()
            .all(|(i, a)| ids[i + 1..].iter().all(|b| a != b))
    }

    fn opener(&self, token: TokenId) -> Option<SignalKind> {
        if token == self.spawn {
            Some(SignalKind::Spawn)
        } else if token == self.ret {
            Some(SignalKind::Return)
        } else if token == self.sync {
            Some(SignalKind::Sync)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct OpenSpan {
    kind: SignalKind,
    start: usize,
    body: Vec<TokenId>,
}

/// Per-sequence streaming state
#[derive(Debug, Default)]
pub(crate) struct SentinelState {
    open: Option<OpenSpan>,
}

impl SentinelState {
    pub(crate) fn buffered(&self) -> usize {
        self.open.as_ref().map(|o| o.body.len()).unwrap_or(0)
    }
}

pub(crate) fn scan(
    tokens: &SentinelTokens,
    state: &mut SentinelState,
    ctx: &ScanContext<'_>,
    new_tokens: &[TokenId],
    out: &mut Detection,
) {
    for (i, &token) in new_tokens.iter().enumerate() {
        let offset = ctx.base_offset + i;

        if let Some(mut open) = state.open.take() {
            if token == tokens.end {
                match ctx.tokenizer.decode(&open.body) {
                    Ok(body) => out.signal(ctx, open.kind, &body, open.start),
                    Err(e) => out.error(
                        ctx,
                        Some(open.kind),
                        ParseErrorKind::InvalidPayload,
                        open.start,
                        format!("payload decode failed: {}", e),
                    ),
                }
                continue;
            }
            if tokens.opener(token).is_none() {
                open.body.push(token);
                if open.body.len() > ctx.max_lookahead {
                    out.error(
                        ctx,
                        Some(open.kind),
                        ParseErrorKind::LookaheadExceeded,
                        open.start,
                        format!("no closing token within {} tokens", ctx.max_lookahead),
                    );
                } else {
                    state.open = Some(open);
                }
                continue;
            }
            out.error(
                ctx,
                Some(open.kind),
                ParseErrorKind::Unterminated,
                open.start,
                format!("signal interrupted at token offset {}", offset),
            );
        }

        match tokens.opener(token) {
            Some(SignalKind::Sync) => out.signal(ctx, SignalKind::Sync, "", offset),
            Some(kind) => {
                state.open = Some(OpenSpan {
                    kind,
                    start: offset,
                    body: Vec::new(),
                })
            }
            None => {}
        }
    }
}
