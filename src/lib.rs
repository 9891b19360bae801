//! gputrace - GPU driver callback and device activity tracer
//!
//! This library intercepts driver API calls through a callback subscription,
//! collects asynchronous device activity records, correlates both views by
//! correlation id and hands a unified event stream to a trace collector.
//!
//! The vendor layer sits behind [`driver::DriverInterface`]; the crate ships
//! an in-process [`driver::sim::SimulatedDriver`] used by the CLI, the tests
//! and the benches.

pub mod activity;
pub mod annotation;
pub mod append_buffer;
pub mod buffer_pool;
pub mod cli;
pub mod collector;
pub mod config;
pub mod decode;
pub mod driver;
pub mod error;
pub mod event;
pub mod hook;
pub mod host;
pub mod output;
pub mod registry;
pub mod thread_buffer;
pub mod tracer;

pub use collector::{CollectorOptions, InMemoryCollector, TraceCollector};
pub use error::{DriverError, Result, TracerError};
pub use event::{TracerEvent, TracerEventSource, TracerEventType};
pub use tracer::{Tracer, TracerOptions, TracerState, TracerStats};
