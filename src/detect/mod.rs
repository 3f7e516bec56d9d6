//! Hook/signal detection
//!
//! Scans each advanced sequence's newly generated span for spawn, sync and
//! return signals. The grammar is chosen by configuration: exact sentinel
//! tokens, a tag grammar, or streamed function calls. Open signals are
//! buffered per sequence across ticks up to `max_lookahead`.

pub mod event;
pub mod function_call;
pub mod payload;
pub mod sentinel;
pub mod tags;

pub use event::*;
pub use function_call::FunctionCallGrammar;
pub use payload::PayloadFormat;
pub use sentinel::SentinelTokens;
pub use tags::SignalNames;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

use crate::collab::Tokenizer;
use crate::core::errors::{Result, SeqHookError};
use crate::entity::{SequenceId, TokenId};
use sentinel::SentinelState;
use tags::TagPattern;

/// Signal grammar, selected by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SignalGrammar {
    /// Exact reserved-token matching
    Sentinel(SentinelTokens),
    /// `<spawn>..</spawn>` style tags
    Tags(SignalNames),
    /// JSON tool calls after a start marker
    FunctionCall(FunctionCallGrammar),
}

impl Default for SignalGrammar {
    fn default() -> Self {
        Self::Tags(SignalNames::default())
    }
}

impl SignalGrammar {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sentinel(tokens) => {
                if !tokens.is_distinct() {
                    return Err(SeqHookError::configuration_field(
                        "sentinel token ids must be distinct",
                        "grammar",
                    ));
                }
                Ok(())
            }
            Self::Tags(names) => names.validate(),
            Self::FunctionCall(grammar) => {
                if grammar.start_marker.trim().is_empty() {
                    return Err(SeqHookError::configuration_field(
                        "function call start marker cannot be empty",
                        "grammar",
                    ));
                }
                grammar.names.validate()
            }
        }
    }

    /// Whether detection reads the decoded text rather than token ids
    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Sentinel(_))
    }
}

/// Inputs shared by the grammar scanners for one sequence and tick
pub(crate) struct ScanContext<'a> {
    pub seq_id: SequenceId,
    /// Absolute index of the first new token
    pub base_offset: usize,
    pub new_tokens: usize,
    pub payload_format: PayloadFormat,
    pub max_lookahead: usize,
    pub tokenizer: &'a dyn Tokenizer,
}

impl ScanContext<'_> {
    /// Offset of the last token of the span, where a textual signal completes
    pub fn completion_offset(&self) -> usize {
        self.base_offset + self.new_tokens.saturating_sub(1)
    }
}

/// Unconsumed text of a textual grammar
#[derive(Debug, Default)]
pub(crate) struct TextState {
    pub buffer: String,
}

#[derive(Debug)]
enum StreamState {
    Sentinel(SentinelState),
    Text(TextState),
}

impl StreamState {
    fn buffered(&self) -> usize {
        match self {
            Self::Sentinel(state) => state.buffered(),
            Self::Text(state) => state.buffer.chars().count(),
        }
    }
}

/// Events and parse errors found in one sequence's span
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub events: Vec<Event>,
    pub errors: Vec<ParseError>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.errors.is_empty()
    }

    fn signal(&mut self, ctx: &ScanContext<'_>, kind: SignalKind, body: &str, offset: usize) {
        let format = ctx.payload_format;
        let event = match kind {
            SignalKind::Spawn => payload::parse_spawn(body, format).map(|request| Event::Spawn {
                parent_id: ctx.seq_id,
                request,
                token_offset: offset,
            }),
            SignalKind::Sync => payload::parse_sync(body, format).map(|targets| Event::Sync {
                parent_id: ctx.seq_id,
                targets,
                token_offset: offset,
            }),
            SignalKind::Return => payload::parse_return(body, format).map(|text| Event::Return {
                child_id: ctx.seq_id,
                text,
                token_offset: offset,
            }),
        };
        self.accept(ctx, kind, event, offset);
    }

    fn signal_value(&mut self, ctx: &ScanContext<'_>, kind: SignalKind, value: Value, offset: usize) {
        let event = match kind {
            SignalKind::Spawn => payload::spawn_from_value(value).map(|request| Event::Spawn {
                parent_id: ctx.seq_id,
                request,
                token_offset: offset,
            }),
            SignalKind::Sync => payload::sync_from_value(value).map(|targets| Event::Sync {
                parent_id: ctx.seq_id,
                targets,
                token_offset: offset,
            }),
            SignalKind::Return => payload::return_from_value(value).map(|text| Event::Return {
                child_id: ctx.seq_id,
                text,
                token_offset: offset,
            }),
        };
        self.accept(ctx, kind, event, offset);
    }

    fn accept(
        &mut self,
        ctx: &ScanContext<'_>,
        kind: SignalKind,
        event: std::result::Result<Event, String>,
        offset: usize,
    ) {
        match event {
            Ok(event) => self.events.push(event),
            Err(message) => self.error(ctx, Some(kind), ParseErrorKind::InvalidPayload, offset, message),
        }
    }

    fn error(
        &mut self,
        ctx: &ScanContext<'_>,
        signal: Option<SignalKind>,
        kind: ParseErrorKind,
        offset: usize,
        message: String,
    ) {
        warn!(
            seq_id = ctx.seq_id,
            token_offset = offset,
            signal = signal.map(|s| s.as_str()).unwrap_or("unknown"),
            error = %message,
            "Malformed signal ignored"
        );
        self.errors.push(ParseError {
            seq_id: ctx.seq_id,
            signal,
            kind,
            token_offset: offset,
            message,
        });
    }
}

/// Stateful detector over all live sequences
#[derive(Debug)]
pub struct SignalDetector {
    grammar: SignalGrammar,
    payload_format: PayloadFormat,
    max_lookahead: usize,
    tag_pattern: Option<TagPattern>,
    streams: HashMap<SequenceId, StreamState>,
}

impl SignalDetector {
    pub fn new(grammar: SignalGrammar, payload_format: PayloadFormat, max_lookahead: usize) -> Result<Self> {
        grammar.validate()?;
        let tag_pattern = match &grammar {
            SignalGrammar::Tags(names) => Some(TagPattern::new(names)?),
            _ => None,
        };
        Ok(Self {
            grammar,
            payload_format,
            max_lookahead,
            tag_pattern,
            streams: HashMap::new(),
        })
    }

    pub fn grammar(&self) -> &SignalGrammar {
        &self.grammar
    }

    /// Scan one sequence's newly generated span.
    ///
    /// `base_offset` is the absolute index of `new_tokens[0]` in the
    /// sequence. `new_text` is the detokenized span; it is only read by
    /// textual grammars. Events come back ordered Spawn, Sync, Return and
    /// in detection order within each kind.
    pub fn scan(
        &mut self,
        seq_id: SequenceId,
        base_offset: usize,
        new_tokens: &[TokenId],
        new_text: &str,
        tokenizer: &dyn Tokenizer,
    ) -> Detection {
        let ctx = ScanContext {
            seq_id,
            base_offset,
            new_tokens: new_tokens.len(),
            payload_format: self.payload_format,
            max_lookahead: self.max_lookahead,
            tokenizer,
        };
        let mut out = Detection::default();

        let textual = self.grammar.is_textual();
        let state = self.streams.entry(seq_id).or_insert_with(|| {
            if textual {
                StreamState::Text(TextState::default())
            } else {
                StreamState::Sentinel(SentinelState::default())
            }
        });

        match (&self.grammar, state) {
            (SignalGrammar::Sentinel(tokens), StreamState::Sentinel(state)) => {
                sentinel::scan(tokens, state, &ctx, new_tokens, &mut out)
            }
            (SignalGrammar::Tags(_), StreamState::Text(state)) => {
                if let Some(pattern) = &self.tag_pattern {
                    tags::scan(pattern, state, &ctx, new_text, &mut out)
                }
            }
            (SignalGrammar::FunctionCall(grammar), StreamState::Text(state)) => {
                function_call::scan(grammar, state, &ctx, new_text, &mut out)
            }
            _ => {}
        }

        if self.streams.get(&seq_id).map(|s| s.buffered() == 0).unwrap_or(false) {
            self.streams.remove(&seq_id);
        }

        out.events.sort_by_key(|e| e.kind().rank());
        out
    }

    /// Drop buffered partial signals of a released sequence.
    pub fn clear(&mut self, seq_id: SequenceId) {
        self.streams.remove(&seq_id);
    }

    /// Buffered units (tokens or characters) awaiting a closing delimiter
    pub fn buffered(&self, seq_id: SequenceId) -> usize {
        self.streams.get(&seq_id).map(|s| s.buffered()).unwrap_or(0)
    }

    pub fn tracked_sequences(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::sim::CharTokenizer;

    const SPAWN: TokenId = 0xE000;
    const SYNC: TokenId = 0xE001;
    const RET: TokenId = 0xE002;
    const END: TokenId = 0xE003;

    fn sentinel_detector(lookahead: usize) -> SignalDetector {
        SignalDetector::new(
            SignalGrammar::Sentinel(SentinelTokens {
                spawn: SPAWN,
                sync: SYNC,
                ret: RET,
                end: END,
            }),
            PayloadFormat::Plain,
            lookahead,
        )
        .unwrap()
    }

    fn tokens(text: &str) -> Vec<TokenId> {
        text.chars().map(|c| c as TokenId).collect()
    }

    #[test]
    fn test_sentinel_signals_ordered_spawn_sync_return() {
        let mut detector = sentinel_detector(64);
        let mut span = vec![RET];
        span.extend(tokens("done"));
        span.push(END);
        span.push(SYNC);
        span.push(SPAWN);
        span.extend(tokens("child"));
        span.push(END);

        let detection = detector.scan(1, 10, &span, "", &CharTokenizer);
        assert!(detection.errors.is_empty());
        let kinds: Vec<_> = detection.events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec![SignalKind::Spawn, SignalKind::Sync, SignalKind::Return]);
        assert_eq!(detection.events[0].token_offset(), 17);
        assert_eq!(detection.events[1].token_offset(), 16);
        assert_eq!(detection.events[2].token_offset(), 10);
        match &detection.events[2] {
            Event::Return { child_id, text, .. } => {
                assert_eq!(*child_id, 1);
                assert_eq!(text, "done");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_sentinel_span_across_ticks() {
        let mut detector = sentinel_detector(64);
        let mut first = vec![SPAWN];
        first.extend(tokens("sub"));
        assert!(detector.scan(1, 0, &first, "", &CharTokenizer).is_empty());
        assert_eq!(detector.buffered(1), 3);

        let mut second = tokens(" task");
        second.push(END);
        let detection = detector.scan(1, 4, &second, "", &CharTokenizer);
        match &detection.events[..] {
            [Event::Spawn { request, token_offset, .. }] => {
                assert_eq!(request.prompt, "sub task");
                assert_eq!(*token_offset, 0);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(detector.tracked_sequences(), 0);
    }

    #[test]
    fn test_sentinel_lookahead_overflow_discards_signal() {
        let mut detector = sentinel_detector(4);
        let mut span = vec![SPAWN];
        span.extend(tokens("too long"));
        let detection = detector.scan(1, 0, &span, "", &CharTokenizer);
        assert!(detection.events.is_empty());
        assert_eq!(detection.errors.len(), 1);
        assert_eq!(detection.errors[0].kind, ParseErrorKind::LookaheadExceeded);

        // The closing token alone no longer produces an event
        assert!(detector.scan(1, 9, &[END], "", &CharTokenizer).events.is_empty());
    }

    #[test]
    fn test_interrupted_signal_reported() {
        let mut detector = sentinel_detector(64);
        let mut span = vec![SPAWN];
        span.extend(tokens("a"));
        span.push(SYNC);
        let detection = detector.scan(1, 0, &span, "", &CharTokenizer);
        assert_eq!(detection.errors[0].kind, ParseErrorKind::Unterminated);
        assert_eq!(detection.events.len(), 1);
        assert_eq!(detection.events[0].kind(), SignalKind::Sync);
    }

    #[test]
    fn test_tag_grammar_with_partial_tags() {
        let mut detector = SignalDetector::new(SignalGrammar::default(), PayloadFormat::Plain, 256).unwrap();
        assert!(detector.scan(7, 0, &[0; 8], "thinking <spa", &CharTokenizer).is_empty());
        assert!(detector.scan(7, 8, &[0; 8], "wn>look up", &CharTokenizer).is_empty());
        let detection = detector.scan(7, 16, &[0; 12], " x</spawn><sync/>", &CharTokenizer);
        assert_eq!(detection.events.len(), 2);
        match &detection.events[0] {
            Event::Spawn { request, token_offset, .. } => {
                assert_eq!(request.prompt, "look up x");
                assert_eq!(*token_offset, 27);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            detection.events[1],
            Event::Sync {
                parent_id: 7,
                targets: None,
                token_offset: 27
            }
        );
    }

    #[test]
    fn test_tag_grammar_explicit_targets_and_errors() {
        let mut detector = SignalDetector::new(SignalGrammar::default(), PayloadFormat::Plain, 256).unwrap();
        let detection = detector.scan(3, 0, &[0], "<sync>4, 5</sync><sync>x</sync><return/>", &CharTokenizer);
        assert_eq!(detection.events.len(), 1);
        match &detection.events[0] {
            Event::Sync { targets, .. } => assert_eq!(targets.as_deref(), Some(&[4, 5][..])),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(detection.errors.len(), 2);
        assert!(detection.errors.iter().all(|e| e.kind == ParseErrorKind::InvalidPayload));
    }

    #[test]
    fn test_unclosed_tag_interrupted_by_next_signal() {
        let mut detector = SignalDetector::new(SignalGrammar::default(), PayloadFormat::Plain, 256).unwrap();
        let detection = detector.scan(4, 0, &[0; 4], "<return>oops <sync/>", &CharTokenizer);
        assert_eq!(detection.errors.len(), 1);
        assert_eq!(detection.errors[0].kind, ParseErrorKind::Unterminated);
        assert_eq!(detection.errors[0].signal, Some(SignalKind::Return));
        assert_eq!(
            detection.events,
            vec![Event::Sync {
                parent_id: 4,
                targets: None,
                token_offset: 3
            }]
        );
        assert_eq!(detector.buffered(4), 0);

        // A later close tag does not revive the dropped return
        assert!(detector.scan(4, 4, &[0], "</return>", &CharTokenizer).is_empty());
    }

    #[test]
    fn test_clear_drops_partial_state() {
        let mut detector = SignalDetector::new(SignalGrammar::default(), PayloadFormat::Plain, 256).unwrap();
        detector.scan(2, 0, &[0], "<return>partial", &CharTokenizer);
        assert!(detector.buffered(2) > 0);
        detector.clear(2);
        assert_eq!(detector.buffered(2), 0);
        assert!(detector.scan(2, 1, &[0], "</return>", &CharTokenizer).is_empty());
    }

    #[test]
    fn test_invalid_grammar_rejected() {
        let grammar = SignalGrammar::Sentinel(SentinelTokens {
            spawn: 1,
            sync: 1,
            ret: 2,
            end: 3,
        });
        assert!(SignalDetector::new(grammar, PayloadFormat::Plain, 8).is_err());
        let names = SignalNames {
            spawn: "a b".to_string(),
            ..SignalNames::default()
        };
        assert!(SignalDetector::new(SignalGrammar::Tags(names), PayloadFormat::Plain, 8).is_err());
    }
}
