//! Decoder / aggregator
//!
//! Replays a trace log into a [`Timeline`] for the renderer. Besides
//! rebuilding the symbol tables it performs two reductions:
//!
//! - **Call coalescing**: consecutive calls to one callsite that arrive within
//!   `coalesce_gap_ms` of each other become a single `(when, callsite, count)`
//!   record. A tight loop yields about one record per burst instead of one per
//!   invocation. Annotations and end of input flush every pending run.
//! - **Noise filtering**: calls and spans touching a denylisted module (the
//!   tracer itself, bootstrap and import machinery) are dropped. Their
//!   definitions still take up ids so numbering matches the recorder's.
//!
//! Malformed lines are logged, counted and skipped; they never abort a decode.

use crate::codec::{DecodeError, Event, HeapSample};
use crate::config::DecoderConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that stop a decode as a whole
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("failed to read trace log: {0}")]
    Io(#[from] io::Error),

    #[error("failed to fetch trace log: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("invalid denylist pattern: {0}")]
    Denylist(#[from] regex::Error),
}

/// Calls to one callsite coalesced over a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Time of the last call in the burst
    pub when: u64,
    pub callsite: u32,
    pub count: u32,
}

/// A call slower than the recorder's hotspot threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotspotSpan {
    pub start: u64,
    pub callsite: u32,
    pub duration: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub when: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub when: u64,
    pub process: f64,
    pub system: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySample {
    pub when: u64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapSnapshot {
    pub when: u64,
    pub entries: Vec<HeapSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRecord {
    pub when: u64,
    pub duration: u64,
    pub collected: u64,
    pub uncollectable: u64,
}

/// Decoded trace, ready to hand to a renderer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Module names indexed by module id
    pub modules: Vec<String>,
    /// `(source, target)` module ids indexed by callsite id
    pub callsites: Vec<(u32, u32)>,
    /// Heap type names indexed by type id
    pub types: Vec<String>,
    /// Coalesced calls ordered by time
    pub calls: Vec<CallRecord>,
    pub hotspots: Vec<HotspotSpan>,
    pub annotations: Vec<Annotation>,
    pub cpu: Vec<CpuSample>,
    pub memory: Vec<MemorySample>,
    pub heap: Vec<HeapSnapshot>,
    pub gc: Vec<GcRecord>,
    /// Time of the last call or annotation
    pub duration: u64,
    /// Calls kept after noise filtering, before coalescing
    pub total_calls: u64,
    /// Lines skipped because they could not be decoded
    pub malformed_lines: usize,
}

impl Timeline {
    /// Source and target module names of a callsite
    pub fn callsite_modules(&self, callsite: u32) -> Option<(&str, &str)> {
        let &(source, target) = self.callsites.get(callsite as usize)?;
        let source = self.modules.get(source as usize)?;
        let target = self.modules.get(target as usize)?;
        Some((source, target))
    }

    /// JSON document consumed by the renderer
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Compiled module name denylist
#[derive(Debug, Clone)]
pub struct ModuleDenylist {
    patterns: Vec<Regex>,
}

impl ModuleDenylist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Denylist that lets every module through
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn is_denied(&self, module: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(module))
    }
}

/// Incremental trace log decoder
#[derive(Debug)]
pub struct Decoder {
    gap_ms: u64,
    denylist: ModuleDenylist,
    timeline: Timeline,
    /// Current relative time
    when: u64,
    /// Callsite -> (time of last call, calls in the run)
    pending: BTreeMap<u32, (u64, u32)>,
    /// Denylist verdict per module id
    denied: Vec<bool>,
}

impl Decoder {
    pub fn new(config: &DecoderConfig) -> Result<Self, DecoderError> {
        let denylist = ModuleDenylist::new(&config.denylist)?;
        Ok(Self::with_denylist(config.coalesce_gap_ms, denylist))
    }

    pub fn with_denylist(gap_ms: u64, denylist: ModuleDenylist) -> Self {
        Self {
            gap_ms,
            denylist,
            timeline: Timeline::default(),
            when: 0,
            pending: BTreeMap::new(),
            denied: Vec::new(),
        }
    }

    /// Decode one line and fold it into the timeline
    ///
    /// Blank lines are ignored. On error the line is counted as malformed and
    /// the timeline is left as it was.
    pub fn parse_line(&mut self, line: &str) -> Result<(), DecodeError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        let result = Event::parse(line).and_then(|event| self.apply(event));
        if result.is_err() {
            self.timeline.malformed_lines += 1;
        }
        result
    }

    /// Like [`Decoder::parse_line`], but logs a rejected line instead of
    /// returning the error
    pub fn feed_line(&mut self, line_number: usize, line: &str) {
        if let Err(err) = self.parse_line(line) {
            warn!(
                line = line_number,
                content = %line.trim_end(),
                error = %err,
                "skipping malformed trace line"
            );
        }
    }

    /// Fold one decoded event into the timeline
    pub fn apply(&mut self, event: Event) -> Result<(), DecodeError> {
        match event {
            Event::ModuleDef { name } => {
                self.denied.push(self.denylist.is_denied(&name));
                self.timeline.modules.push(name);
            }
            Event::CallsiteDef { source, target } => {
                self.check_module(source)?;
                self.check_module(target)?;
                self.timeline.callsites.push((source, target));
            }
            Event::TypeDef { name } => self.timeline.types.push(name),
            Event::Call { callsite } => {
                self.check_callsite(callsite)?;
                if !self.is_noise(callsite) {
                    self.add_call(callsite);
                }
                self.timeline.duration = self.when;
            }
            Event::Return {
                callsite,
                duration_ms,
                label,
            } => {
                self.check_callsite(callsite)?;
                if !self.is_noise(callsite) {
                    self.timeline.hotspots.push(HotspotSpan {
                        start: self.when.saturating_sub(duration_ms),
                        callsite,
                        duration: duration_ms,
                        label,
                    });
                }
            }
            Event::Annotate { message } => self.add_annotation(message),
            Event::Enter { label } => self.add_annotation(format!("Enter {}", label)),
            Event::Exit { label } => self.add_annotation(format!("Exit {}", label)),
            Event::Timestamp { ms } => {
                if ms < self.when {
                    return Err(DecodeError::TimeWentBackwards {
                        from: self.when,
                        to: ms,
                    });
                }
                self.when = ms;
            }
            Event::Cpu { process, system } => self.timeline.cpu.push(CpuSample {
                when: self.when,
                process,
                system,
            }),
            Event::Memory { rss_bytes } => self.timeline.memory.push(MemorySample {
                when: self.when,
                rss_bytes,
            }),
            Event::Heap { entries } => {
                for entry in &entries {
                    if entry.type_id() as usize >= self.timeline.types.len() {
                        return Err(DecodeError::UndefinedReference {
                            what: "type",
                            id: entry.type_id(),
                        });
                    }
                }
                self.timeline.heap.push(HeapSnapshot {
                    when: self.when,
                    entries,
                });
            }
            Event::Gc {
                duration_ms,
                collected,
                uncollectable,
            } => self.timeline.gc.push(GcRecord {
                when: self.when,
                duration: duration_ms,
                collected,
                uncollectable,
            }),
        }
        Ok(())
    }

    fn check_module(&self, id: u32) -> Result<(), DecodeError> {
        if (id as usize) < self.timeline.modules.len() {
            Ok(())
        } else {
            Err(DecodeError::UndefinedReference { what: "module", id })
        }
    }

    fn check_callsite(&self, id: u32) -> Result<(), DecodeError> {
        if (id as usize) < self.timeline.callsites.len() {
            Ok(())
        } else {
            Err(DecodeError::UndefinedReference {
                what: "callsite",
                id,
            })
        }
    }

    fn is_noise(&self, callsite: u32) -> bool {
        let (source, target) = self.timeline.callsites[callsite as usize];
        self.denied[source as usize] || self.denied[target as usize]
    }

    fn add_call(&mut self, callsite: u32) {
        let when = self.when;
        self.timeline.total_calls += 1;
        match self.pending.get_mut(&callsite) {
            Some((last, count)) if when.saturating_sub(*last) <= self.gap_ms => {
                *last = when;
                *count = count.saturating_add(1);
            }
            Some(run) => {
                self.timeline.calls.push(CallRecord {
                    when: run.0,
                    callsite,
                    count: run.1,
                });
                *run = (when, 1);
            }
            None => {
                self.pending.insert(callsite, (when, 1));
            }
        }
    }

    fn add_annotation(&mut self, message: String) {
        self.flush_pending();
        self.timeline.annotations.push(Annotation {
            when: self.when,
            message,
        });
        self.timeline.duration = self.when;
    }

    /// Emit every pending run, oldest first
    fn flush_pending(&mut self) {
        let mut runs: Vec<CallRecord> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(callsite, (when, count))| CallRecord {
                when,
                callsite,
                count,
            })
            .collect();
        runs.sort_by_key(|r| (r.when, r.callsite));
        self.timeline.calls.extend(runs);
    }

    /// End of input: flush pending runs and return the timeline
    pub fn finish(mut self) -> Timeline {
        self.flush_pending();
        self.timeline.calls.sort_by_key(|r| r.when);
        self.timeline
    }
}

/// Decode a trace log from any buffered reader
///
/// Invalid UTF-8 is replaced rather than treated as an I/O failure, so a
/// damaged line only costs that line.
pub fn decode_reader<R: BufRead>(
    mut reader: R,
    config: &DecoderConfig,
) -> Result<Timeline, DecoderError> {
    let mut decoder = Decoder::new(config)?;
    let mut raw = Vec::new();
    let mut line_number = 0usize;
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        line_number += 1;
        decoder.feed_line(line_number, &String::from_utf8_lossy(&raw));
    }
    let timeline = decoder.finish();
    debug!(
        lines = line_number,
        malformed = timeline.malformed_lines,
        "trace decoded"
    );
    Ok(timeline)
}

/// Decode a trace log file
pub fn decode_file(path: &Path, config: &DecoderConfig) -> Result<Timeline, DecoderError> {
    let file = File::open(path)?;
    info!(path = %path.display(), bytes = file.metadata()?.len(), "loading trace");
    decode_reader(BufReader::new(file), config)
}

/// Fetch a trace log over HTTP and decode it
pub fn decode_url(url: &str, config: &DecoderConfig) -> Result<Timeline, DecoderError> {
    info!(url, "fetching trace");
    let body = reqwest::blocking::get(url)?.error_for_status()?.bytes()?;
    decode_reader(&body[..], config)
}

/// Decode from a path or an `http(s)://` URL
pub fn decode_source(source: &str, config: &DecoderConfig) -> Result<Timeline, DecoderError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        decode_url(source, config)
    } else {
        decode_file(Path::new(source), config)
    }
}
