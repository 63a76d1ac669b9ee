//! CSV audit trail of setpoint proposals.

use chrono::Utc;
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use super::AdmissionRule;
use crate::devices::cryoboss::{Acknowledgement, CryobossError};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// FAA temperatures observed while a proposal ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterlockTrace {
    pub s1_faa_k: Option<f64>,
    pub s2_faa_k: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Rejected,
    Cancelled,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct ProposalRecord {
    pub timestamp: String, // UTC ISO timestamp
    #[serde(rename = "proposed_K")]
    pub proposed_k: f64,
    pub outcome: Outcome,
    pub rule: Option<AdmissionRule>,
    pub measured: Option<f64>,
    pub limit: Option<f64>,
    #[serde(rename = "s1_faa_K")]
    pub s1_faa_k: Option<f64>,
    #[serde(rename = "s2_faa_K")]
    pub s2_faa_k: Option<f64>,
    pub detail: String,
}

impl ProposalRecord {
    pub fn new(
        proposed_k: f64,
        trace: &InterlockTrace,
        outcome: &Result<Acknowledgement, CryobossError>,
    ) -> Self {
        let mut record = ProposalRecord {
            timestamp: Utc::now().to_rfc3339(),
            proposed_k,
            outcome: Outcome::Committed,
            rule: None,
            measured: None,
            limit: None,
            s1_faa_k: trace.s1_faa_k,
            s2_faa_k: trace.s2_faa_k,
            detail: String::new(),
        };
        match outcome {
            Ok(ack) => record.detail = ack.text().trim_end().to_string(),
            Err(CryobossError::Rejected(rejection)) => {
                record.outcome = Outcome::Rejected;
                record.rule = Some(rejection.rule);
                record.measured = Some(rejection.measured);
                record.limit = Some(rejection.limit);
                record.detail = rejection.to_string();
            }
            Err(CryobossError::Cancelled) => record.outcome = Outcome::Cancelled,
            Err(e) => {
                record.outcome = Outcome::Failed;
                record.detail = e.to_string();
            }
        }
        record
    }
}

/// Appends one row per proposal to a daily CSV file under `dir`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn append(&self, record: &ProposalRecord) -> Result<PathBuf, AuditError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(Utc::now().format("setpoint_audit_%Y-%m-%d.csv").to_string());

        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = WriterBuilder::new().has_headers(is_new).from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;

        debug!("Audit record appended to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit"));
        let trace = InterlockTrace {
            s1_faa_k: Some(0.05),
            s2_faa_k: None,
        };
        let record = ProposalRecord::new(0.06, &trace, &Err(CryobossError::Cancelled));

        let path = log.append(&record).unwrap();
        log.append(&record).unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,proposed_K,outcome,rule"));
        assert!(lines[1].contains(",cancelled,"));
    }

    #[test]
    fn failure_records_error_text() {
        let record = ProposalRecord::new(
            0.06,
            &InterlockTrace::default(),
            &Err(CryobossError::NotConnected),
        );
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.detail, "Device not connected");
        assert!(record.rule.is_none());
    }
}
