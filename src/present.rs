//! Presentation adapter: reconciled records to display strings.
//!
//! Everything here is pure except the [`Surface`] implementations.

use std::io::{self, Write};

use serde::Serialize;

use crate::catalog;
use crate::reconcile::{Change, DataStatus, DisplaySource, NextStep, RenderRecord, TickReport};
use crate::upstream::ConnectionStatus;

pub const UNAVAILABLE: &str = "--";
pub const NO_CHANGE: &str = "no change";
pub const UNKNOWN: &str = "unknown";
pub const COLLECTING: &str = "collecting";

pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => UNAVAILABLE.to_string(),
    }
}

pub fn format_change(change: &Change) -> String {
    match change {
        Change::Unavailable => UNAVAILABLE.to_string(),
        Change::Unknown => UNKNOWN.to_string(),
        Change::NoChange => NO_CHANGE.to_string(),
        Change::Increase { delta, percent } | Change::Decrease { delta, percent } => match percent {
            Some(p) => format!("{:+.2} ({:+.2}%)", delta, p),
            None => format!("{:+.2}", delta),
        },
    }
}

pub fn format_next_step(next: &NextStep) -> String {
    match next {
        NextStep::Collecting => COLLECTING.to_string(),
        NextStep::Unavailable => UNAVAILABLE.to_string(),
        NextStep::Value(v) => format!("{:.2}", v),
    }
}

/// Semantic tag the surface maps to a color.
pub fn status_tag(status: DataStatus, source: DisplaySource) -> &'static str {
    match (status, source) {
        (DataStatus::Error, _) => "error",
        (_, DisplaySource::Api) => "live",
        (_, DisplaySource::Cached) => "cached",
        (_, DisplaySource::Predicted) | (_, DisplaySource::Simulated) => "filled",
        (_, DisplaySource::Missing) => "absent",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub id: u16,
    pub name: &'static str,
    pub unit: &'static str,
    pub t_time: String,
    pub current: String,
    pub tag: &'static str,
    pub source: &'static str,
    pub change: String,
    pub next_step: String,
    pub out_of_range: bool,
}

impl FeatureRow {
    pub fn from_record(record: &RenderRecord) -> Self {
        let (name, unit) = catalog::descriptor(record.feature_id)
            .map(|d| (d.name, d.unit.symbol()))
            .unwrap_or(("?", ""));
        Self {
            id: record.feature_id,
            name,
            unit,
            t_time: format_value(record.t_time_prediction),
            current: format_value(record.current),
            tag: status_tag(record.status, record.source),
            source: record.source.as_str(),
            change: format_change(&record.change),
            next_step: format_next_step(&record.next_step),
            out_of_range: record.out_of_range,
        }
    }
}

/// One complete screen update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub rows: Vec<FeatureRow>,
    pub valid: usize,
    pub missing: usize,
    pub predicted: usize,
    pub status: ConnectionStatus,
    pub cycle: u64,
    pub upstream_step: u64,
    pub buffer_ready: bool,
    pub activity: &'static str,
    pub origin: &'static str,
    pub uptime_secs: i64,
}

impl Frame {
    pub fn build(report: &TickReport, status: ConnectionStatus, uptime_secs: i64) -> Self {
        Self {
            rows: report.records.iter().map(FeatureRow::from_record).collect(),
            valid: report.counts.valid,
            missing: report.counts.missing,
            predicted: report.counts.predicted,
            status,
            cycle: report.cycle,
            upstream_step: report.upstream_step,
            buffer_ready: report.buffer_ready,
            activity: report.activity.as_str(),
            origin: match report.origin {
                crate::reconcile::BatchOrigin::Upstream => "upstream",
                crate::reconcile::BatchOrigin::Fallback => "fallback",
            },
            uptime_secs,
        }
    }
}

pub fn render_text(frame: &Frame) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "[{}] cycle {} | step {} | buffer {} | machine {} | source {} | up {}s\n",
        frame.status.as_str(),
        frame.cycle,
        frame.upstream_step,
        if frame.buffer_ready { "ready" } else { "warming" },
        frame.activity,
        frame.origin,
        frame.uptime_secs,
    ));
    out.push_str(&format!(
        "{:>3}  {:<38} {:>10} {:>10} {:<7} {:>20} {:>10}\n",
        "#", "feature", "t-pred", "current", "tag", "change", "t+1"
    ));
    for row in &frame.rows {
        out.push_str(&format!(
            "{:>3}  {:<38} {:>10} {:>10} {:<7} {:>20} {:>10}{}\n",
            row.id,
            format!("{} ({})", row.name, row.unit),
            row.t_time,
            row.current,
            row.tag,
            row.change,
            row.next_step,
            if row.out_of_range { " !" } else { "" },
        ));
    }
    out.push_str(&format!("valid {} | missing {}\n", frame.valid, frame.missing));
    out
}

/// Where frames go. Opaque to the rest of the crate.
pub trait Surface: Send {
    fn render(&mut self, frame: &Frame);

    /// Indicator-only update; the table stays as it was.
    fn status(&mut self, status: ConnectionStatus, note: &str);
}

/// Writes plain-text frames to stdout.
pub struct TerminalSurface {
    clear: bool,
}

impl TerminalSurface {
    pub fn new(clear: bool) -> Self {
        Self { clear }
    }
}

impl Surface for TerminalSurface {
    fn render(&mut self, frame: &Frame) {
        let mut stdout = io::stdout().lock();
        if self.clear {
            let _ = write!(stdout, "\x1b[2J\x1b[H");
        }
        let _ = write!(stdout, "{}", render_text(frame));
        let _ = stdout.flush();
    }

    fn status(&mut self, status: ConnectionStatus, note: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "[{}] {}", status.as_str(), note);
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_formatting() {
        assert_eq!(format_value(Some(13.1)), "13.10");
        assert_eq!(format_value(None), UNAVAILABLE);
        assert_eq!(format_next_step(&NextStep::Value(13.1)), "13.10");
        assert_eq!(format_next_step(&NextStep::Collecting), COLLECTING);
    }

    #[test]
    fn test_change_formatting() {
        let inc = Change::Increase { delta: 0.8, percent: Some(6.5) };
        assert_eq!(format_change(&inc), "+0.80 (+6.50%)");
        let dec = Change::Decrease { delta: -1.25, percent: None };
        assert_eq!(format_change(&dec), "-1.25");
        assert_eq!(format_change(&Change::NoChange), NO_CHANGE);
        assert_eq!(format_change(&Change::Unknown), UNKNOWN);
    }

    #[test]
    fn test_status_tags() {
        assert_eq!(status_tag(DataStatus::Valid, DisplaySource::Api), "live");
        assert_eq!(status_tag(DataStatus::Valid, DisplaySource::Simulated), "filled");
        assert_eq!(status_tag(DataStatus::Missing, DisplaySource::Missing), "absent");
        assert_eq!(status_tag(DataStatus::Error, DisplaySource::Missing), "error");
    }

    #[test]
    fn test_row_from_record() {
        let record = RenderRecord {
            feature_id: 21,
            status: DataStatus::Valid,
            source: DisplaySource::Cached,
            current: Some(2500.0),
            change: Change::Unknown,
            t_time_prediction: None,
            next_step: NextStep::Collecting,
            buffer_ready: false,
            out_of_range: false,
        };
        let row = FeatureRow::from_record(&record);
        assert_eq!(row.name, "Cutterhead torque");
        assert_eq!(row.unit, "kN·m");
        assert_eq!(row.current, "2500.00");
        assert_eq!(row.tag, "cached");
        assert_eq!(row.t_time, UNAVAILABLE);
    }
}
