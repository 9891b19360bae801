//! Loading tracer configuration files from disk

mod utils;

use gputrace::config::TracerConfig;
use gputrace::driver::records::ActivityKind;
use gputrace::driver::sim::SimulatedDriverConfig;
use gputrace::driver::{DriverApi, DriverCallArgs};
use gputrace::event::TracerEventType;
use gputrace::TracerError;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;
use utils::{of_type, start_session};

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("gputrace.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_full_config_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[tracer]
cbids_selected = ["cuLaunchKernel", "cuMemcpyHtoDAsync"]
activities_selected = ["concurrent_kernel", "memcpy"]
sync_devices_before_stop = true
enable_range_tracking = true

[collector]
max_callback_api_events = 1000
max_annotation_strings = 16

[buffer_pool]
buffer_size_bytes = 65536
max_buffers = 8
preallocate = 2
"#,
    );

    let config = TracerConfig::from_toml_file(&path).unwrap();
    assert_eq!(
        config.tracer.cbids_selected,
        vec![DriverApi::LaunchKernel, DriverApi::MemcpyHtoDAsync]
    );
    assert_eq!(
        config.tracer.activities_selected,
        vec![ActivityKind::ConcurrentKernel, ActivityKind::Memcpy]
    );
    assert!(config.tracer.sync_devices_before_stop);
    assert!(config.tracer.enable_range_tracking);
    assert!(config.tracer.required_callback_api_events);
    assert_eq!(config.collector.max_callback_api_events, 1000);
    assert_eq!(config.collector.max_annotation_strings, 16);
    assert_eq!(config.buffer_pool.buffer_size_bytes, 65536);
    assert_eq!(config.buffer_pool.preallocate, 2);
}

#[test]
fn test_empty_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");
    assert_eq!(TracerConfig::from_toml_file(&path).unwrap(), TracerConfig::default());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = TracerConfig::from_toml_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, TracerError::Io(_)));
}

#[test]
fn test_unknown_driver_api_names_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[tracer]\ncbids_selected = [\"cuNotAThing\"]\n");
    let err = TracerConfig::from_toml_file(&path).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, TracerError::Config(_)));
    assert!(message.contains("gputrace.toml"));
}

#[test]
fn test_undersized_buffers_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[buffer_pool]\nbuffer_size_bytes = 16\n");
    assert!(matches!(
        TracerConfig::from_toml_file(&path),
        Err(TracerError::Config(_))
    ));
}

#[test]
#[serial]
fn test_selected_calls_from_file_drive_session() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[tracer]\ncbids_selected = [\"cuLaunchKernel\"]\n");
    let config = TracerConfig::from_toml_file(&path).unwrap();

    let s = start_session(
        SimulatedDriverConfig::default(),
        config.tracer,
        config.collector,
    );
    s.driver
        .memcpy(
            s.context,
            DriverApi::MemcpyHtoD,
            DriverCallArgs::Memcpy { byte_count: 64 },
            0,
        )
        .unwrap();
    s.driver
        .launch_kernel(s.context, "selected", [1, 1, 1], [1, 1, 1], 0)
        .unwrap();
    s.tracer.disable().unwrap();

    let events = s.collector.events();
    assert_eq!(events.len(), 1);
    assert_eq!(of_type(&events, TracerEventType::Kernel).len(), 1);
}
