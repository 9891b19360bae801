// Shared helpers for tracer integration tests
//
// Every session runs against the in-process simulated driver.
#![allow(dead_code)]

use gputrace::collector::{CollectorOptions, InMemoryCollector};
use gputrace::driver::sim::{SimulatedDriver, SimulatedDriverConfig};
use gputrace::driver::ContextHandle;
use gputrace::event::{TracerEvent, TracerEventSource, TracerEventType};
use gputrace::tracer::{Tracer, TracerOptions};
use std::sync::Arc;

pub struct TestSession {
    pub driver: Arc<SimulatedDriver>,
    pub tracer: Tracer,
    pub collector: Arc<InMemoryCollector>,
    pub context: ContextHandle,
}

/// Build a driver with one context on device 0 and a tracer that has not been enabled
pub fn idle_session(driver_config: SimulatedDriverConfig, collector_options: CollectorOptions) -> TestSession {
    let driver = Arc::new(SimulatedDriver::new(driver_config));
    let context = driver.create_context(0).expect("context on device 0");
    let tracer = Tracer::new(driver.clone());
    let collector = Arc::new(InMemoryCollector::new(collector_options));
    TestSession {
        driver,
        tracer,
        collector,
        context,
    }
}

/// Same as [`idle_session`] with the tracer enabled
pub fn start_session(
    driver_config: SimulatedDriverConfig,
    options: TracerOptions,
    collector_options: CollectorOptions,
) -> TestSession {
    let session = idle_session(driver_config, collector_options);
    session
        .tracer
        .enable(options, session.collector.clone())
        .expect("tracer enables");
    session
}

pub fn default_session(options: TracerOptions) -> TestSession {
    start_session(SimulatedDriverConfig::default(), options, CollectorOptions::default())
}

pub fn of_type(events: &[TracerEvent], event_type: TracerEventType) -> Vec<TracerEvent> {
    events
        .iter()
        .filter(|event| event.event_type == event_type)
        .cloned()
        .collect()
}

pub fn from_source(events: &[TracerEvent], source: TracerEventSource) -> Vec<TracerEvent> {
    events
        .iter()
        .filter(|event| event.source == source)
        .cloned()
        .collect()
}
