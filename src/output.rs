//! Rendering of collected events
//!
//! Text output prints one event per line followed by a summary. JSON output
//! prints one JSON object per line with the summary as the final line.

use crate::collector::DropReport;
use crate::event::{TracerEvent, TracerEventSource};
use crate::tracer::TracerStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Totals printed after the event list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub total_events: usize,
    pub callback_events: usize,
    pub activity_events: usize,
    /// Event count per event type name
    pub by_type: BTreeMap<String, usize>,
    pub callback_events_dropped: usize,
    pub activity_events_estimated_dropped: usize,
    pub activity_records_dropped_by_driver: usize,
    pub drop_reports: Vec<DropReport>,
}

impl TraceSummary {
    pub fn new(events: &[TracerEvent], stats: &TracerStats, drop_reports: Vec<DropReport>) -> Self {
        let mut by_type = BTreeMap::new();
        for event in events {
            *by_type.entry(type_label(event).to_string()).or_insert(0) += 1;
        }
        let count_source = |source| events.iter().filter(|e| e.source == source).count();
        Self {
            total_events: events.len(),
            callback_events: count_source(TracerEventSource::DriverCallback),
            activity_events: count_source(TracerEventSource::Activity),
            by_type,
            callback_events_dropped: stats.callback_events_dropped,
            activity_events_estimated_dropped: stats.activity.estimated_dropped,
            activity_records_dropped_by_driver: stats.activity.driver_dropped,
            drop_reports,
        }
    }

    pub fn write_text<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out)?;
        writeln!(
            out,
            "{} events ({} callback, {} activity)",
            self.total_events, self.callback_events, self.activity_events
        )?;
        for (event_type, count) in &self.by_type {
            writeln!(out, "  {event_type:<16} {count:>8}")?;
        }
        writeln!(out, "callback events dropped: {}", self.callback_events_dropped)?;
        writeln!(
            out,
            "activity events dropped (estimated): {}",
            self.activity_events_estimated_dropped
        )?;
        writeln!(
            out,
            "activity records dropped by driver: {}",
            self.activity_records_dropped_by_driver
        )?;
        Ok(())
    }
}

fn type_label(event: &TracerEvent) -> &'static str {
    match event.event_type.name() {
        "" => "Unsupported",
        name => name,
    }
}

/// One line per event, human readable
pub fn write_text<W: Write>(events: &[TracerEvent], out: &mut W) -> io::Result<()> {
    for event in events {
        write!(
            out,
            "{:>14} {:>10}ns {:<16} dev={} stream={} corr={} {}",
            event.start_time_ns,
            event.duration_ns(),
            type_label(event),
            event.device_id,
            display_id(event.stream_id),
            display_id(event.correlation_id),
            event.name,
        )?;
        if let Some(bytes) = event.num_bytes() {
            write!(out, " bytes={bytes}")?;
        }
        if !event.annotation.is_empty() {
            write!(out, " [{}]", event.annotation)?;
        }
        if !event.range.is_empty() {
            write!(out, " range={}", event.range)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn display_id(id: u32) -> String {
    if id == crate::event::INVALID_ID {
        "-".to_string()
    } else {
        id.to_string()
    }
}

/// One JSON object per line
pub fn write_json_lines<W: Write>(events: &[TracerEvent], out: &mut W) -> io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut *out, event)?;
        writeln!(out)?;
    }
    Ok(())
}

pub fn write_summary_json<W: Write>(summary: &TraceSummary, out: &mut W) -> io::Result<()> {
    #[derive(Serialize)]
    struct SummaryLine<'a> {
        summary: &'a TraceSummary,
    }
    serde_json::to_writer(&mut *out, &SummaryLine { summary })?;
    writeln!(out)
}
