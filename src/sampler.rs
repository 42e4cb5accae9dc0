//! Metrics sampler
//!
//! A named background thread that records process memory and CPU usage on a
//! fixed cadence, plus a heap census every `heap_every` cycles. Samples flow
//! through the recorder like any other event, so they share its lock,
//! timestamps and buffer.

use crate::codec::Event;
use crate::host::HeapEntry;
use crate::recorder::{Recorder, WeakRecorder};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Name of the synthetic entry summing every live object in a census
pub const HEAP_TOTAL_TYPE: &str = "Total";

/// One reading of process resource usage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// Resident set size in bytes
    pub rss_bytes: u64,
    /// Process CPU usage divided by the number of cores, in percent
    pub process_cpu: f64,
    /// Whole-system CPU usage, in percent
    pub system_cpu: f64,
}

/// Source of resource readings
pub trait ResourceProbe: Send {
    /// `None` when the platform cannot report usage right now
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Reads the current process through `sysinfo`
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
    cores: usize,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        let cores = match system.cpus().len() {
            0 => thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("cannot determine current pid, process metrics disabled");
        }
        Self { system, pid, cores }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        let pid = self.pid?;
        self.system.refresh_cpu_usage();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;
        Some(ResourceSample {
            rss_bytes: process.memory(),
            process_cpu: f64::from(process.cpu_usage()) / self.cores as f64,
            system_cpu: f64::from(self.system.global_cpu_usage()),
        })
    }
}

/// Handle to the running sampler thread
pub(crate) struct MetricsSampler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl MetricsSampler {
    pub(crate) fn spawn(recorder: WeakRecorder, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("modscope-metrics".to_string())
            .spawn(move || {
                loop {
                    let Some(recorder) = recorder.upgrade() else {
                        break;
                    };
                    if !recorder.is_tracing() {
                        break;
                    }
                    measure_resources(&recorder);
                    measure_heap(&recorder, false);
                    drop(recorder);

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("metrics sampler stopped");
            })?;
        Ok(Self { stop_tx, handle })
    }

    /// Signal the thread and wait for it, unless called from the thread itself
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.try_send(());
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            warn!("metrics sampler thread panicked");
        }
    }
}

/// Record one memory and one CPU event
pub(crate) fn measure_resources(recorder: &Recorder) {
    let Some(sample) = recorder.probe_sample() else {
        return;
    };
    recorder.record_now(Event::Memory {
        rss_bytes: sample.rss_bytes,
    });
    recorder.record_now(Event::Cpu {
        process: sample.process_cpu,
        system: sample.system_cpu,
    });
}

/// Take a heap census when due (or when forced) and record it
pub(crate) fn measure_heap(recorder: &Recorder, force: bool) {
    if !recorder.heap_census_due(force) {
        return;
    }
    let Some(entries) = recorder.host().heap_census() else {
        return;
    };
    let snapshot = summarize_census(&entries, recorder.config().heap_top);
    if recorder.record_heap_snapshot(&snapshot) {
        debug!(types = snapshot.len(), "heap snapshot recorded");
    }
}

/// Keep the `top` types by retained size and append a total over everything
///
/// Entries are ordered by size, largest first; ties are broken by name so
/// the result does not depend on the host's iteration order.
pub fn summarize_census(entries: &[HeapEntry], top: usize) -> Vec<(String, u64, u64)> {
    let total_count: u64 = entries.iter().map(|e| e.count).sum();
    let total_size: u64 = entries.iter().map(|e| e.size).sum();

    let mut ranked: Vec<&HeapEntry> = entries.iter().collect();
    ranked.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.type_name.cmp(&b.type_name)));

    ranked
        .into_iter()
        .take(top)
        .map(|e| (e.type_name.clone(), e.count, e.size))
        .chain(std::iter::once((
            HEAP_TOTAL_TYPE.to_string(),
            total_count,
            total_size,
        )))
        .collect()
}
