//! Trace log codec
//!
//! The trace log is line oriented: every line is a whitespace separated list
//! of tokens whose first token is an integer event tag. Text payloads
//! (module names, annotations, labels) are the remainder of the line and may
//! contain spaces. Heap snapshots carry a single JSON array of
//! `[typeId, count, totalSize]` triples.
//!
//! ```text
//! 0 app.models            ModuleDef (id 0)
//! 0 app.views             ModuleDef (id 1)
//! 1 0 1                   CallsiteDef (id 0): app.models -> app.views
//! 3 50                    Timestamp: 50ms since recording start
//! 2 0                     Call on callsite 0 at 50ms
//! 12 0 150 render         Return: callsite 0 took 150ms in `render`
//! ```
//!
//! Ids are never written explicitly; they are implied by definition order.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::{FromStr, SplitWhitespace};
use thiserror::Error;

/// Event kind tags as written in the first column of each line
pub mod tag {
    pub const MODULE: u32 = 0;
    pub const CALLSITE: u32 = 1;
    pub const CALL: u32 = 2;
    pub const TIMESTAMP: u32 = 3;
    pub const CPU: u32 = 4;
    pub const MEMORY: u32 = 5;
    pub const TYPE: u32 = 6;
    pub const HEAP: u32 = 7;
    pub const GC: u32 = 8;
    pub const ANNOTATE: u32 = 9;
    pub const ENTER: u32 = 10;
    pub const EXIT: u32 = 11;
    pub const RETURN: u32 = 12;
}

/// Errors produced while parsing a single log line
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,

    #[error("invalid event tag {0:?}")]
    InvalidTag(String),

    #[error("unknown event tag {0}")]
    UnknownTag(u32),

    #[error("missing field `{field}` in {kind} event")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("invalid value {value:?} for field `{field}`")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid heap payload: {0}")]
    InvalidHeap(String),

    #[error("reference to undefined {what} {id}")]
    UndefinedReference { what: &'static str, id: u32 },

    #[error("timestamp {to} is earlier than current time {from}")]
    TimeWentBackwards { from: u64, to: u64 },
}

/// One `[typeId, count, totalSize]` entry of a heap snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSample(pub u32, pub u64, pub u64);

impl HeapSample {
    pub fn type_id(&self) -> u32 {
        self.0
    }

    pub fn count(&self) -> u64 {
        self.1
    }

    pub fn size(&self) -> u64 {
        self.2
    }
}

/// A single trace log event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ModuleDef {
        name: String,
    },
    CallsiteDef {
        source: u32,
        target: u32,
    },
    TypeDef {
        name: String,
    },
    Call {
        callsite: u32,
    },
    /// A slow call: emitted on return when the call exceeded the hotspot threshold
    Return {
        callsite: u32,
        duration_ms: u64,
        label: String,
    },
    Annotate {
        message: String,
    },
    Enter {
        label: String,
    },
    Exit {
        label: String,
    },
    /// Milliseconds since the recording started
    Timestamp {
        ms: u64,
    },
    /// Process CPU (normalized by core count) and system CPU, in percent
    Cpu {
        process: f64,
        system: f64,
    },
    Memory {
        rss_bytes: u64,
    },
    Heap {
        entries: Vec<HeapSample>,
    },
    Gc {
        duration_ms: u64,
        collected: u64,
        uncollectable: u64,
    },
}

impl Event {
    /// Numeric tag written in the first column
    pub fn tag(&self) -> u32 {
        match self {
            Event::ModuleDef { .. } => tag::MODULE,
            Event::CallsiteDef { .. } => tag::CALLSITE,
            Event::TypeDef { .. } => tag::TYPE,
            Event::Call { .. } => tag::CALL,
            Event::Return { .. } => tag::RETURN,
            Event::Annotate { .. } => tag::ANNOTATE,
            Event::Enter { .. } => tag::ENTER,
            Event::Exit { .. } => tag::EXIT,
            Event::Timestamp { .. } => tag::TIMESTAMP,
            Event::Cpu { .. } => tag::CPU,
            Event::Memory { .. } => tag::MEMORY,
            Event::Heap { .. } => tag::HEAP,
            Event::Gc { .. } => tag::GC,
        }
    }

    /// Human readable kind, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        kind_name(self.tag())
    }

    /// Whether the event is implicitly stamped with the current timestamp
    ///
    /// Definitions and timestamps themselves carry no time.
    pub fn is_stamped(&self) -> bool {
        !matches!(
            self,
            Event::ModuleDef { .. }
                | Event::CallsiteDef { .. }
                | Event::TypeDef { .. }
                | Event::Timestamp { .. }
        )
    }

    /// Encode as a newline terminated log line
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    /// Parse one log line (with or without its trailing newline)
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        let mut tokens = line.split_whitespace();
        let first = tokens.next().ok_or(DecodeError::Empty)?;
        let tag: u32 = first
            .parse()
            .map_err(|_| DecodeError::InvalidTag(first.to_string()))?;
        let kind = kind_name(tag);

        let event = match tag {
            tag::MODULE => Event::ModuleDef {
                name: remainder(tokens),
            },
            tag::CALLSITE => Event::CallsiteDef {
                source: field(&mut tokens, kind, "source")?,
                target: field(&mut tokens, kind, "target")?,
            },
            tag::TYPE => Event::TypeDef {
                name: remainder(tokens),
            },
            tag::CALL => Event::Call {
                callsite: field(&mut tokens, kind, "callsite")?,
            },
            tag::RETURN => Event::Return {
                callsite: field(&mut tokens, kind, "callsite")?,
                duration_ms: field(&mut tokens, kind, "duration")?,
                label: remainder(tokens),
            },
            tag::ANNOTATE => Event::Annotate {
                message: remainder(tokens),
            },
            tag::ENTER => Event::Enter {
                label: remainder(tokens),
            },
            tag::EXIT => Event::Exit {
                label: remainder(tokens),
            },
            tag::TIMESTAMP => Event::Timestamp {
                ms: field(&mut tokens, kind, "ms")?,
            },
            tag::CPU => Event::Cpu {
                process: field(&mut tokens, kind, "process")?,
                system: field(&mut tokens, kind, "system")?,
            },
            tag::MEMORY => Event::Memory {
                rss_bytes: field(&mut tokens, kind, "rss")?,
            },
            tag::HEAP => {
                let payload = remainder(tokens);
                let entries = serde_json::from_str(&payload)
                    .map_err(|e| DecodeError::InvalidHeap(e.to_string()))?;
                Event::Heap { entries }
            }
            tag::GC => Event::Gc {
                duration_ms: field(&mut tokens, kind, "duration")?,
                collected: field(&mut tokens, kind, "collected")?,
                uncollectable: field(&mut tokens, kind, "uncollectable")?,
            },
            other => return Err(DecodeError::UnknownTag(other)),
        };

        Ok(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Event::ModuleDef { name } | Event::TypeDef { name } => {
                write!(f, "{} {}", tag, single_line(name))
            }
            Event::CallsiteDef { source, target } => write!(f, "{} {} {}", tag, source, target),
            Event::Call { callsite } => write!(f, "{} {}", tag, callsite),
            Event::Return {
                callsite,
                duration_ms,
                label,
            } => write!(
                f,
                "{} {} {} {}",
                tag,
                callsite,
                duration_ms,
                single_line(label)
            ),
            Event::Annotate { message: text }
            | Event::Enter { label: text }
            | Event::Exit { label: text } => write!(f, "{} {}", tag, single_line(text)),
            Event::Timestamp { ms } => write!(f, "{} {}", tag, ms),
            Event::Cpu { process, system } => write!(f, "{} {:.1} {:.1}", tag, process, system),
            Event::Memory { rss_bytes } => write!(f, "{} {}", tag, rss_bytes),
            Event::Heap { entries } => {
                let payload = serde_json::to_string(entries).map_err(|_| fmt::Error)?;
                write!(f, "{} {}", tag, payload)
            }
            Event::Gc {
                duration_ms,
                collected,
                uncollectable,
            } => write!(f, "{} {} {} {}", tag, duration_ms, collected, uncollectable),
        }
    }
}

fn kind_name(tag: u32) -> &'static str {
    match tag {
        tag::MODULE => "module",
        tag::CALLSITE => "callsite",
        tag::CALL => "call",
        tag::TIMESTAMP => "timestamp",
        tag::CPU => "cpu",
        tag::MEMORY => "memory",
        tag::TYPE => "type",
        tag::HEAP => "heap",
        tag::GC => "gc",
        tag::ANNOTATE => "annotate",
        tag::ENTER => "enter",
        tag::EXIT => "exit",
        tag::RETURN => "return",
        _ => "unknown",
    }
}

/// Parse the next token as `T`
fn field<T: FromStr>(
    tokens: &mut SplitWhitespace<'_>,
    kind: &'static str,
    name: &'static str,
) -> Result<T, DecodeError> {
    let token = tokens
        .next()
        .ok_or(DecodeError::MissingField { kind, field: name })?;
    token.parse().map_err(|_| DecodeError::InvalidField {
        field: name,
        value: token.to_string(),
    })
}

/// Rejoin the remaining tokens of a line with single spaces
fn remainder(tokens: SplitWhitespace<'_>) -> String {
    tokens.collect::<Vec<_>>().join(" ")
}

/// Text payloads must not break the one-event-per-line framing
fn single_line(text: &str) -> Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        Cow::Owned(text.replace(['\n', '\r'], " "))
    } else {
        Cow::Borrowed(text)
    }
}
