// Shared fakes for integration tests
//
// A deterministic host, resolver and resource probe, so a whole recording
// session can run without a real instrumented runtime.

#![allow(dead_code)]

use modscope::clock::ManualClock;
use modscope::config::RecorderConfig;
use modscope::host::{CallBoundary, HeapEntry, Host, Location, ModuleResolver};
use modscope::sampler::{ResourceProbe, ResourceSample};
use modscope::Recorder;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Host that counts registrations and reports a fixed heap census
#[derive(Debug, Default)]
pub struct FakeHost {
    pub installs: AtomicUsize,
    pub uninstalls: AtomicUsize,
    pub heap_types: u64,
}

impl FakeHost {
    pub fn with_heap_types(heap_types: u64) -> Self {
        Self {
            heap_types,
            ..Self::default()
        }
    }
}

impl Host for FakeHost {
    fn install(&self, _recorder: &Recorder) {
        self.installs.fetch_add(1, Ordering::SeqCst);
    }

    fn uninstall(&self) {
        self.uninstalls.fetch_add(1, Ordering::SeqCst);
    }

    fn heap_census(&self) -> Option<Vec<HeapEntry>> {
        if self.heap_types == 0 {
            return None;
        }
        Some(
            (0..self.heap_types)
                .map(|i| HeapEntry::new(format!("type{}", i), i + 1, (i + 1) * 64))
                .collect(),
        )
    }
}

/// Module name is the file name without its extension
pub struct StemResolver;

impl ModuleResolver for StemResolver {
    fn resolve(&self, file: &str) -> Option<String> {
        let stem = Path::new(file).file_stem()?.to_string_lossy().into_owned();
        if stem == "unresolvable" {
            None
        } else {
            Some(stem)
        }
    }
}

pub struct FixedProbe(pub ResourceSample);

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> Option<ResourceSample> {
        Some(self.0)
    }
}

pub fn fixed_probe() -> FixedProbe {
    FixedProbe(ResourceSample {
        rss_bytes: 4096,
        process_cpu: 1.5,
        system_cpu: 10.0,
    })
}

/// Recorder with a manual clock, stem resolver and fixed probe; no sampler thread
pub fn test_recorder(path: &Path, clock: Arc<ManualClock>, host: Arc<FakeHost>) -> Recorder {
    let config = RecorderConfig {
        sample_metrics: false,
        ..RecorderConfig::default()
    }
    .with_output(path);
    Recorder::builder(config)
        .clock(clock)
        .host(host)
        .resolver(StemResolver)
        .probe(fixed_probe())
        .build()
}

/// `callee` called from `caller`, identified by `activation`
pub fn call(activation: u64, callee: &str, caller: &str) -> CallBoundary {
    CallBoundary::new(
        activation,
        Location::new(callee, 1),
        Some(Location::new(caller, 1)),
        format!("{}_fn", callee.trim_end_matches(".py")),
    )
}
