//! Telemetry snapshots decoded from the cryoboss `queryall` / `queryheader` pair.
//!
//! The instrument exposes names and values through two independent queries, so a
//! snapshot is assembled by pairing them positionally. Only the first
//! [`SNAPSHOT_FIELDS`] pairs are kept.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Number of name/value pairs kept from each snapshot.
pub const SNAPSHOT_FIELDS: usize = 20;

pub const FAA_TEMPERATURE: &str = "50 mK FAA Temperature";
pub const PID_SETPOINT: &str = "PID Setpoint";
pub const MAGNET_CURRENT: &str = "Magnet Current";
pub const POWER_SUPPLY_VOLTAGE: &str = "Power Supply Voltage";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Response exceeded the {limit} byte frame limit")]
    FrameOverflow { limit: usize },

    #[error("Response is not valid UTF-8")]
    NotUtf8,

    #[error("Expected at least {expected} {what}, got {got}")]
    FieldCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Snapshot is missing field '{0}'")]
    MissingField(String),

    #[error("Field '{name}' is not numeric: {raw:?}")]
    NotNumeric { name: String, raw: String },

    #[error("Field '{name}' is not finite: {value}")]
    NonFinite { name: String, value: f64 },
}

/// One telemetry value. The wire format does not distinguish numeric and
/// textual fields, so each token is parsed best-effort.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Number(f64),
    Text(String),
}

impl Reading {
    pub fn parse(token: &str) -> Self {
        match token.trim().parse::<f64>() {
            Ok(value) => Reading::Number(value),
            Err(_) => Reading::Text(token.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Reading::Number(value) => Some(*value),
            Reading::Text(_) => None,
        }
    }
}

/// A point-in-time read of every telemetry field. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    fields: BTreeMap<String, Reading>,
}

impl Snapshot {
    /// Pair the `queryall` frame with the `queryheader` frame.
    pub fn decode(values: &str, header: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = values.split(',').collect();
        // First record of the header response is the header row itself.
        let names: Vec<&str> = header
            .split("\r\n")
            .skip(1)
            .map(|record| record.split(',').next().unwrap_or_default().trim())
            .collect();

        if tokens.len() < SNAPSHOT_FIELDS {
            return Err(ProtocolError::FieldCount {
                what: "values",
                expected: SNAPSHOT_FIELDS,
                got: tokens.len(),
            });
        }
        if names.len() < SNAPSHOT_FIELDS {
            return Err(ProtocolError::FieldCount {
                what: "field names",
                expected: SNAPSHOT_FIELDS,
                got: names.len(),
            });
        }
        if tokens.len() > SNAPSHOT_FIELDS {
            debug!("Discarding {} extra values", tokens.len() - SNAPSHOT_FIELDS);
        }
        if names.len() > SNAPSHOT_FIELDS {
            debug!("Discarding {} extra field names", names.len() - SNAPSHOT_FIELDS);
        }

        let fields = names
            .iter()
            .zip(tokens.iter())
            .take(SNAPSHOT_FIELDS)
            .map(|(name, token)| (name.to_string(), Reading::parse(token)))
            .collect();

        Ok(Snapshot { fields })
    }

    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.fields.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Reading::as_number)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.fields.iter().map(|(name, reading)| (name.as_str(), reading))
    }

    fn required(&self, name: &str) -> Result<f64, ProtocolError> {
        match self.get(name) {
            None => Err(ProtocolError::MissingField(name.to_string())),
            Some(Reading::Text(raw)) => Err(ProtocolError::NotNumeric {
                name: name.to_string(),
                raw: raw.clone(),
            }),
            Some(Reading::Number(value)) if !value.is_finite() => Err(ProtocolError::NonFinite {
                name: name.to_string(),
                value: *value,
            }),
            Some(Reading::Number(value)) => Ok(*value),
        }
    }
}

/// The four measurements the setpoint interlock depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterlockReadings {
    pub faa_temperature_k: f64,
    pub pid_setpoint_k: f64,
    pub magnet_current_a: f64,
    pub power_supply_voltage_v: f64,
}

impl TryFrom<&Snapshot> for InterlockReadings {
    type Error = ProtocolError;

    fn try_from(snapshot: &Snapshot) -> Result<Self, Self::Error> {
        Ok(InterlockReadings {
            faa_temperature_k: snapshot.required(FAA_TEMPERATURE)?,
            pid_setpoint_k: snapshot.required(PID_SETPOINT)?,
            magnet_current_a: snapshot.required(MAGNET_CURRENT)?,
            power_supply_voltage_v: snapshot.required(POWER_SUPPLY_VOLTAGE)?,
        })
    }
}
