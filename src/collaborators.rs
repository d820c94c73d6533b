use async_trait::async_trait;
use chrono::NaiveDateTime;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;
use tracing::{error, warn};

/// Consumer of decoded waveform segments; typically the decompression / archival pipeline.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SampleSink: Send + Sync + 'static {
    async fn accept(&self, station_code: &str, start_time: NaiveDateTime, sample_rate: f64, samples: Vec<i32>);
}

/// Validates station identifiers against the deployment's channel registry.
#[cfg_attr(test, automock)]
pub trait StationValidator: Send + Sync + 'static {
    fn is_known_station(&self, station_name: &str) -> bool;
}

/// Registry backed by a fixed set of station names, for deployments without an external lookup.
pub struct FixedStationValidator {
    known: FxHashSet<String>,
}

impl FixedStationValidator {
    pub fn new<I, S>(names: I) -> FixedStationValidator
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FixedStationValidator {
            known: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl StationValidator for FixedStationValidator {
    fn is_known_station(&self, station_name: &str) -> bool {
        self.known.contains(station_name)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlarmSeverity {
    /// recovered automatically, worth surfacing
    Warning,
    /// needs investigation
    Fault,
}

/// Operator notification channel (paging, dashboards). The protocol engine only raises signals;
///  routing and escalation live outside this crate.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlarmSink: Send + Sync + 'static {
    async fn raise(&self, severity: AlarmSeverity, message: String);
}

/// Alarm sink that forwards to the log only.
pub struct LogAlarmSink;

#[async_trait]
impl AlarmSink for LogAlarmSink {
    async fn raise(&self, severity: AlarmSeverity, message: String) {
        match severity {
            AlarmSeverity::Warning => warn!("alarm: {}", message),
            AlarmSeverity::Fault => error!("alarm: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_station_validator() {
        let validator = FixedStationValidator::new(["STA01", "STA02"]);
        assert!(validator.is_known_station("STA01"));
        assert!(!validator.is_known_station("STA99"));
    }
}
