//! Control-channel client for the cryoboss ADR controller.
//!
//! [`Cryoboss`] owns the socket to the instrument, decodes telemetry
//! [`Snapshot`]s, and gates every FAA setpoint change behind the interlock in
//! [`interlock`].

pub mod config;
pub mod devices;
pub mod interlock;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CliArgs, ConfigError, ReconnectPolicy, SessionConfig};
pub use devices::{Acknowledgement, Cryoboss, CryobossError};
pub use interlock::dwell::{CancelToken, Dwell, WallClockDwell};
pub use interlock::{AdmissionRule, Rejection};
pub use telemetry::{InterlockReadings, ProtocolError, Reading, Snapshot};
