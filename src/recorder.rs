//! Recorder core
//!
//! Turns call notifications from the host into an indexed, delta-stamped
//! event log. All mutable session state lives in one [`RecorderState`]
//! guarded by a single mutex: the call hook, the metrics sampler and the
//! remote control thread all funnel through it, so "look up or insert an
//! index entry" and "append a line" are one critical section.
//!
//! The hook is fail-open. A notification that cannot be recorded is dropped
//! and logged; nothing propagates back into the traced program. The one
//! exception is the trace log itself: when a write fails, tracing is aborted
//! instead of silently losing the rest of the session.

use crate::clock::{Clock, MonotonicClock};
use crate::codec::{Event, HeapSample};
use crate::config::RecorderConfig;
use crate::host::{ActivationId, CallBoundary, CallKind, Host, ModuleResolver, NullHost, PathModuleResolver};
use crate::sampler::{self, MetricsSampler, ResourceProbe, ResourceSample, SysinfoProbe};
use crate::symbols::SymbolTables;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors surfaced by recorder lifecycle operations
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("failed to open trace log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write trace log: {0}")]
    Write(#[from] io::Error),

    #[error("failed to start metrics sampler: {0}")]
    Sampler(#[source] io::Error),
}

/// Why a single call notification was not recorded
#[derive(Error, Debug)]
enum HookError {
    #[error("caller is a bootstrap frame")]
    Bootstrap,

    #[error("self call")]
    SelfCall,

    #[error("cannot resolve a module for {0:?}")]
    Unresolvable(String),

    #[error(transparent)]
    Flush(#[from] RecorderError),
}

/// Kind of a user annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    /// Free-form milestone
    Annotate,
    /// Start of a labeled operation
    Enter,
    /// End of a labeled operation
    Exit,
}

/// Outcome of a recording session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Calls recorded during the session
    pub calls: u64,
    /// Trace log written
    pub path: PathBuf,
}

/// A call waiting for its matching `Left` notification
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    start_ms: u64,
    callsite: u32,
}

/// Mutable state of one recording session
#[derive(Debug, Default)]
pub(crate) struct RecorderState {
    symbols: SymbolTables,
    /// Resolution cache: file identifier -> module id, `None` when unresolvable
    module_files: HashMap<String, Option<u32>>,
    /// Encoded lines awaiting a flush
    buffer: Vec<String>,
    /// Value of the last emitted `Timestamp`
    last_when: u64,
    /// Clock reading at `start_tracing`
    start_ms: u64,
    /// Relative time of the last flush
    last_flush_ms: u64,
    call_count: u64,
    activations: HashMap<ActivationId, PendingCall>,
    /// Sampler cycles left until the next heap census
    heap_countdown: u32,
    heap_baseline_taken: bool,
    gc_start_ms: Option<u64>,
}

impl RecorderState {
    fn reset(&mut self, start_ms: u64) {
        *self = RecorderState {
            start_ms,
            heap_countdown: 1,
            ..RecorderState::default()
        };
    }

    /// Append a stamped event, preceded by a `Timestamp` when time moved
    fn record(&mut self, when: u64, event: Event) {
        if event.is_stamped() && when != self.last_when {
            self.buffer.push(Event::Timestamp { ms: when }.encode());
            self.last_when = when;
        }
        self.buffer.push(event.encode());
    }

    fn module_id(&mut self, file: &str, resolver: &dyn ModuleResolver) -> Result<u32, HookError> {
        let cached = match self.module_files.get(file) {
            Some(&cached) => cached,
            None => {
                let resolved = resolver.resolve(file).map(|name| {
                    let interned = self.symbols.modules.intern(name.as_str());
                    if interned.is_new {
                        self.buffer.push(Event::ModuleDef { name }.encode());
                    }
                    interned.id
                });
                self.module_files.insert(file.to_string(), resolved);
                resolved
            }
        };
        cached.ok_or_else(|| HookError::Unresolvable(file.to_string()))
    }

    fn callsite_id(&mut self, source: u32, target: u32) -> u32 {
        let interned = self.symbols.callsites.intern(&(source, target));
        if interned.is_new {
            self.buffer
                .push(Event::CallsiteDef { source, target }.encode());
        }
        interned.id
    }

    fn type_id(&mut self, name: &str) -> u32 {
        let interned = self.symbols.types.intern(name);
        if interned.is_new {
            self.buffer.push(
                Event::TypeDef {
                    name: name.to_string(),
                }
                .encode(),
            );
        }
        interned.id
    }
}

struct Inner {
    config: RecorderConfig,
    output_path: PathBuf,
    clock: Arc<dyn Clock>,
    host: Arc<dyn Host>,
    resolver: Box<dyn ModuleResolver>,
    probe: Mutex<Box<dyn ResourceProbe>>,
    tracing: AtomicBool,
    state: Mutex<RecorderState>,
    /// Always acquired after `state` when both are held
    output: Mutex<Option<BufWriter<File>>>,
    sampler: Mutex<Option<MetricsSampler>>,
    /// Serializes start/stop
    lifecycle: Mutex<()>,
}

impl Drop for Inner {
    /// Last handle gone while tracing: keep what was buffered
    fn drop(&mut self) {
        if !self.tracing.swap(false, Ordering::SeqCst) {
            return;
        }
        self.host.uninstall();
        let sampler = self
            .sampler
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sampler) = sampler {
            sampler.stop();
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let lines = std::mem::take(&mut state.buffer);
        let output = self.output.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(mut writer) = output.take() else {
            return;
        };
        let written = lines
            .iter()
            .try_for_each(|line| writer.write_all(line.as_bytes()))
            .and_then(|()| writer.flush());
        match written {
            Ok(()) => info!(
                lines = lines.len(),
                path = %self.output_path.display(),
                "recorder dropped while tracing, trace log flushed"
            ),
            Err(e) => error!(
                error = %e,
                path = %self.output_path.display(),
                "recorder dropped while tracing, final flush failed"
            ),
        }
    }
}

/// Builder for a [`Recorder`] with non-default collaborators
pub struct RecorderBuilder {
    config: RecorderConfig,
    clock: Option<Arc<dyn Clock>>,
    host: Option<Arc<dyn Host>>,
    resolver: Option<Box<dyn ModuleResolver>>,
    probe: Option<Box<dyn ResourceProbe>>,
}

impl RecorderBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn resolver(mut self, resolver: impl ModuleResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn probe(mut self, probe: impl ResourceProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn build(self) -> Recorder {
        let output_path = self.config.output_path();
        let inner = Inner {
            output_path,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            host: self.host.unwrap_or_else(|| Arc::new(NullHost)),
            resolver: self
                .resolver
                .unwrap_or_else(|| Box::new(PathModuleResolver::new())),
            probe: Mutex::new(
                self.probe
                    .unwrap_or_else(|| Box::new(SysinfoProbe::new())),
            ),
            tracing: AtomicBool::new(false),
            state: Mutex::new(RecorderState::default()),
            output: Mutex::new(None),
            sampler: Mutex::new(None),
            lifecycle: Mutex::new(()),
            config: self.config,
        };
        Recorder {
            inner: Arc::new(inner),
        }
    }
}

/// Shared handle to a recording engine
///
/// Cloning is cheap; every clone drives the same session.
///
/// # Example
///
/// ```no_run
/// use modscope::config::RecorderConfig;
/// use modscope::host::{CallBoundary, CallKind, Location};
/// use modscope::recorder::Recorder;
///
/// # fn main() -> anyhow::Result<()> {
/// let recorder = Recorder::new(RecorderConfig::default().with_output("/tmp/trace.txt"));
/// recorder.start_tracing()?;
///
/// let call = CallBoundary::new(
///     1,
///     Location::new("/src/app/views.py", 10),
///     Some(Location::new("/src/app/main.py", 3)),
///     "render",
/// );
/// recorder.on_call_event(CallKind::Entered, &call);
/// recorder.on_call_event(CallKind::Left, &call);
///
/// let summary = recorder.stop_tracing()?;
/// println!("traced {} calls", summary.calls);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

/// Non-owning handle held by background threads
#[derive(Clone)]
pub(crate) struct WeakRecorder {
    inner: Weak<Inner>,
}

impl WeakRecorder {
    pub(crate) fn upgrade(&self) -> Option<Recorder> {
        self.inner.upgrade().map(|inner| Recorder { inner })
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("output_path", &self.inner.output_path)
            .field("tracing", &self.is_tracing())
            .finish()
    }
}

impl Recorder {
    /// Recorder with the default clock, resolver, resource probe and no host
    pub fn new(config: RecorderConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: RecorderConfig) -> RecorderBuilder {
        RecorderBuilder {
            config,
            clock: None,
            host: None,
            resolver: None,
            probe: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    pub fn output_path(&self) -> &Path {
        &self.inner.output_path
    }

    pub fn is_tracing(&self) -> bool {
        self.inner.tracing.load(Ordering::SeqCst)
    }

    /// Calls recorded in the current (or last) session
    pub fn call_count(&self) -> u64 {
        self.lock_state().call_count
    }

    pub(crate) fn downgrade(&self) -> WeakRecorder {
        WeakRecorder {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn host(&self) -> &dyn Host {
        self.inner.host.as_ref()
    }

    fn lock_state(&self) -> MutexGuard<'_, RecorderState> {
        lock(&self.inner.state)
    }

    /// Milliseconds since `start_tracing`
    fn elapsed(&self, state: &RecorderState) -> u64 {
        self.inner.clock.now_ms().saturating_sub(state.start_ms)
    }

    /// Open the trace log and begin recording
    ///
    /// Idempotent: calling it while tracing does nothing. Each session
    /// truncates the log and restarts id numbering.
    pub fn start_tracing(&self) -> Result<(), RecorderError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        if self.is_tracing() {
            return Ok(());
        }

        let path = &self.inner.output_path;
        let file = File::create(path).map_err(|source| RecorderError::Open {
            path: path.clone(),
            source,
        })?;
        {
            let mut state = self.lock_state();
            state.reset(self.inner.clock.now_ms());
            *lock(&self.inner.output) = Some(BufWriter::new(file));
        }
        self.inner.tracing.store(true, Ordering::SeqCst);
        info!(path = %path.display(), "tracing started");

        if self.inner.config.sample_metrics {
            let interval = Duration::from_millis(self.inner.config.metrics_interval_ms);
            match MetricsSampler::spawn(self.downgrade(), interval) {
                Ok(sampler) => *lock(&self.inner.sampler) = Some(sampler),
                Err(e) => {
                    self.inner.tracing.store(false, Ordering::SeqCst);
                    *lock(&self.inner.output) = None;
                    return Err(RecorderError::Sampler(e));
                }
            }
        }

        self.inner.host.install(self);
        Ok(())
    }

    /// Stop recording, take final measurements and flush the log
    ///
    /// Idempotent: when not tracing, returns the last session's summary.
    pub fn stop_tracing(&self) -> Result<SessionSummary, RecorderError> {
        let _lifecycle = lock(&self.inner.lifecycle);
        if !self.inner.tracing.swap(false, Ordering::SeqCst) {
            return Ok(self.summary());
        }

        self.inner.host.uninstall();
        self.stop_sampler();

        sampler::measure_resources(self);
        sampler::measure_heap(self, true);

        let flushed = self.flush_and_close();
        let summary = self.summary();
        info!(
            calls = summary.calls,
            path = %summary.path.display(),
            "tracing finished"
        );
        flushed.map(|_| summary)
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            calls: self.call_count(),
            path: self.inner.output_path.clone(),
        }
    }

    fn stop_sampler(&self) {
        let sampler = lock(&self.inner.sampler).take();
        if let Some(sampler) = sampler {
            sampler.stop();
        }
    }

    /// Start tracing and return a guard that stops it when dropped
    pub fn begin_recording(&self) -> Result<RecordingGuard, RecorderError> {
        self.start_tracing()?;
        Ok(RecordingGuard {
            recorder: self.clone(),
            finished: false,
        })
    }

    /// Write buffered lines to the trace log
    ///
    /// The buffer is swapped out under the state lock, so lines appended
    /// concurrently land in the next flush instead of being lost. Returns the
    /// number of lines written; nothing is written when no log is open.
    pub fn flush(&self) -> Result<usize, RecorderError> {
        let state = self.lock_state();
        self.write_out(state)
    }

    /// Write out the buffer; a failed write aborts the session
    fn write_out(&self, state: MutexGuard<'_, RecorderState>) -> Result<usize, RecorderError> {
        let written = self.write_lines(state);
        if let Err(err) = &written {
            self.abort(err);
        }
        written
    }

    fn write_lines(&self, mut state: MutexGuard<'_, RecorderState>) -> Result<usize, RecorderError> {
        let mut output = lock(&self.inner.output);
        let Some(writer) = output.as_mut() else {
            return Ok(0);
        };
        let lines = std::mem::take(&mut state.buffer);
        drop(state);

        for line in &lines {
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;
        debug!(lines = lines.len(), "flushed trace buffer");
        Ok(lines.len())
    }

    fn flush_and_close(&self) -> Result<usize, RecorderError> {
        let written = self.flush();
        let writer = lock(&self.inner.output).take();
        if let Some(writer) = writer {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        written
    }

    /// Give up on the session after a trace log write failure
    fn abort(&self, err: &RecorderError) {
        error!(
            error = %err,
            path = %self.inner.output_path.display(),
            "trace log write failed, tracing aborted"
        );
        if self.inner.tracing.swap(false, Ordering::SeqCst) {
            self.inner.host.uninstall();
            self.stop_sampler();
        }
        *lock(&self.inner.output) = None;
    }

    /// Entry point for the host's call hook
    ///
    /// Never fails and never panics: bootstrap frames and self calls are
    /// skipped silently, anything else that goes wrong is logged and the
    /// notification dropped.
    pub fn on_call_event(&self, kind: CallKind, boundary: &CallBoundary) {
        if !self.is_tracing() {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match kind {
            CallKind::Entered => self.record_entered(boundary),
            CallKind::Left => self.record_left(boundary),
        }));
        match outcome {
            // A failed flush has already aborted the session
            Ok(Ok(()))
            | Ok(Err(HookError::Bootstrap))
            | Ok(Err(HookError::SelfCall))
            | Ok(Err(HookError::Flush(_))) => {}
            Ok(Err(err)) => warn!(
                error = %err,
                activation = boundary.activation,
                callee = %boundary.callee.file,
                "call event dropped"
            ),
            Err(_) => warn!(
                activation = boundary.activation,
                callee = %boundary.callee.file,
                "panic while recording call event, event dropped"
            ),
        }
    }

    fn record_entered(&self, boundary: &CallBoundary) -> Result<(), HookError> {
        let caller = boundary.caller.as_ref().ok_or(HookError::Bootstrap)?;
        let resolver = self.inner.resolver.as_ref();

        let mut state = self.lock_state();
        let target = state.module_id(&boundary.callee.file, resolver)?;
        let source = state.module_id(&caller.file, resolver)?;
        if source == target {
            return Err(HookError::SelfCall);
        }
        let callsite = state.callsite_id(source, target);

        let when = self.elapsed(&state);
        state.record(when, Event::Call { callsite });
        state.activations.insert(
            boundary.activation,
            PendingCall {
                start_ms: when,
                callsite,
            },
        );
        state.call_count += 1;

        if when.saturating_sub(state.last_flush_ms) > self.inner.config.flush_interval_ms {
            state.last_flush_ms = when;
            self.write_out(state)?;
        }
        Ok(())
    }

    fn record_left(&self, boundary: &CallBoundary) -> Result<(), HookError> {
        let mut state = self.lock_state();
        let Some(pending) = state.activations.remove(&boundary.activation) else {
            return Ok(());
        };
        let when = self.elapsed(&state);
        let duration_ms = when.saturating_sub(pending.start_ms);
        if duration_ms > self.inner.config.hotspot_threshold_ms {
            state.record(
                when,
                Event::Return {
                    callsite: pending.callsite,
                    duration_ms,
                    label: boundary.callee_label.clone(),
                },
            );
        }
        Ok(())
    }

    /// Mark a logical milestone
    pub fn annotate(&self, message: &str) {
        self.annotate_as(AnnotationKind::Annotate, message);
    }

    pub fn annotate_enter(&self, label: &str) {
        self.annotate_as(AnnotationKind::Enter, label);
    }

    pub fn annotate_exit(&self, label: &str) {
        self.annotate_as(AnnotationKind::Exit, label);
    }

    /// Append an annotation of the given kind at the current time
    pub fn annotate_as(&self, kind: AnnotationKind, text: &str) {
        if !self.is_tracing() {
            return;
        }
        let text = text.to_string();
        let event = match kind {
            AnnotationKind::Annotate => Event::Annotate { message: text },
            AnnotationKind::Enter => Event::Enter { label: text },
            AnnotationKind::Exit => Event::Exit { label: text },
        };
        self.record_now(event);
    }

    /// Run `f` between an `Enter` and an `Exit` annotation
    ///
    /// The `Exit` is recorded on every exit path, including unwinding.
    pub fn traced<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        self.annotate_enter(label);
        let _exit = ExitAnnotation {
            recorder: self,
            label,
        };
        f()
    }

    /// GC callback: a collection started
    pub fn gc_started(&self) {
        if !self.is_tracing() {
            return;
        }
        let mut state = self.lock_state();
        let when = self.elapsed(&state);
        state.gc_start_ms = Some(when);
    }

    /// GC callback: a collection finished
    pub fn gc_finished(&self, collected: u64, uncollectable: u64) {
        if !self.is_tracing() {
            return;
        }
        let mut state = self.lock_state();
        let when = self.elapsed(&state);
        let duration_ms = state
            .gc_start_ms
            .take()
            .map_or(0, |start| when.saturating_sub(start));
        state.record(
            when,
            Event::Gc {
                duration_ms,
                collected,
                uncollectable,
            },
        );
    }

    /// Record memory and CPU usage immediately
    pub fn sample_now(&self) {
        sampler::measure_resources(self);
    }

    /// Take a heap census immediately, regardless of the sampler cadence
    pub fn heap_census_now(&self) {
        sampler::measure_heap(self, true);
    }

    /// Append a stamped event at the current time
    pub(crate) fn record_now(&self, event: Event) {
        let mut state = self.lock_state();
        let when = self.elapsed(&state);
        state.record(when, event);
    }

    pub(crate) fn probe_sample(&self) -> Option<ResourceSample> {
        lock(&self.inner.probe).sample()
    }

    /// Advance the census countdown; true when a census should be taken now
    pub(crate) fn heap_census_due(&self, force: bool) -> bool {
        let mut state = self.lock_state();
        state.heap_countdown = state.heap_countdown.saturating_sub(1);
        if !force && state.heap_countdown > 0 {
            return false;
        }
        state.heap_countdown = self.inner.config.heap_every;
        true
    }

    /// Emit a summarized census; the session's first census is only a baseline
    pub(crate) fn record_heap_snapshot(&self, snapshot: &[(String, u64, u64)]) -> bool {
        let mut state = self.lock_state();
        if !state.heap_baseline_taken {
            state.heap_baseline_taken = true;
            return false;
        }
        let entries: Vec<HeapSample> = snapshot
            .iter()
            .map(|(name, count, size)| HeapSample(state.type_id(name), *count, *size))
            .collect();
        let when = self.elapsed(&state);
        state.record(when, Event::Heap { entries });
        true
    }
}

/// Stops tracing when dropped
///
/// Returned by [`Recorder::begin_recording`].
pub struct RecordingGuard {
    recorder: Recorder,
    finished: bool,
}

impl RecordingGuard {
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Stop tracing now and report the outcome
    pub fn finish(mut self) -> Result<SessionSummary, RecorderError> {
        self.finished = true;
        self.recorder.stop_tracing()
    }
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.recorder.stop_tracing() {
            error!(error = %err, "failed to stop tracing");
        }
    }
}

struct ExitAnnotation<'a> {
    recorder: &'a Recorder,
    label: &'a str,
}

impl Drop for ExitAnnotation<'_> {
    fn drop(&mut self) {
        self.recorder.annotate_exit(self.label);
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
