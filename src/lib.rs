//! modscope - module-level call tracing for live programs
//!
//! This library records cross-module call activity and resource usage of a
//! running program into a compact line-oriented trace log, and decodes such
//! logs into a timeline for visualization.
//!
//! ```no_run
//! use modscope::config::RecorderConfig;
//! use modscope::Recorder;
//!
//! let recorder = Recorder::new(RecorderConfig::default().with_output("/tmp/trace.txt"));
//! let session = recorder.begin_recording()?;
//! recorder.traced("load", || {
//!     // host hooks deliver call notifications while this runs
//! });
//! session.finish()?;
//! # Ok::<(), modscope::recorder::RecorderError>(())
//! ```

pub mod cli;
pub mod clock;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod host;
pub mod recorder;
pub mod remote;
pub mod sampler;
pub mod symbols;

pub use codec::{DecodeError, Event};
pub use config::Config;
pub use decoder::{Decoder, Timeline};
pub use host::{CallBoundary, CallKind, Host, Location};
pub use recorder::{Recorder, RecorderError, RecordingGuard};
