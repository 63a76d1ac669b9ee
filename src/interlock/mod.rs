//! Interlocked FAA setpoint changes.
//!
//! A proposal is admitted only after a fixed sequence of checks:
//!
//! 1. the voltage divider cap (no telemetry needed),
//! 2. a ramp limit against the measured FAA temperature,
//! 3. magnet current and power supply voltage limits, for increases only,
//! 4. after a 10 s quiescence wait, a warming-rate limit computed from two
//!    snapshots, again for increases only.
//!
//! The first failing check aborts the sequence before anything is written.
//! Decreasing the setpoint is always considered safe and skips the
//! current, voltage and rate checks.

pub mod audit;
pub mod dwell;

use std::fmt;
use std::sync::PoisonError;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::devices::cryoboss::{Acknowledgement, Cryoboss, CryobossError, Result};
use crate::devices::transport::Transport;
use crate::telemetry::InterlockReadings;
use audit::{InterlockTrace, ProposalRecord};
use dwell::CancelToken;

/// Highest setpoint allowed without the voltage divider.
pub const NO_DIVIDER_MAX_SETPOINT_K: f64 = 0.15;
/// Largest step above the measured FAA temperature.
pub const MAX_STEP_ABOVE_FAA_K: f64 = 0.020;
pub const MAX_MAGNET_CURRENT_A: f64 = 8.0;
pub const MAX_SUPPLY_VOLTAGE_V: f64 = 14.0;
/// Largest FAA temperature rise tolerated over one quiescence wait.
pub const MAX_FAA_RISE_K: f64 = 0.001;
pub const QUIESCENCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionRule {
    FiniteProposal,
    VoltageDivider,
    RampLimit,
    MagnetCurrent,
    SupplyVoltage,
    WarmingRate,
}

/// Why a proposal was refused, with the measurement that tripped the rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rejection {
    pub rule: AdmissionRule,
    pub proposed_k: f64,
    pub measured: f64,
    pub limit: f64,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rule {
            AdmissionRule::FiniteProposal => {
                write!(f, "Setpoint {} K is not a finite temperature.", self.proposed_k)
            }
            AdmissionRule::VoltageDivider => write!(
                f,
                "Cannot regulate at {:.4} K; above {} K requires the voltage divider.",
                self.proposed_k, self.limit
            ),
            AdmissionRule::RampLimit => write!(
                f,
                "Cannot set FAA setpoint to {:.4} K, more than {} K above the current FAA temperature of {:.4} K.",
                self.proposed_k, MAX_STEP_ABOVE_FAA_K, self.measured
            ),
            AdmissionRule::MagnetCurrent => write!(
                f,
                "Magnet current is {:.4} A. Cannot increase setpoint when current exceeds {} A.",
                self.measured, self.limit
            ),
            AdmissionRule::SupplyVoltage => write!(
                f,
                "Power supply voltage is {:.4} V. Cannot increase setpoint when voltage exceeds {} V.",
                self.measured, self.limit
            ),
            AdmissionRule::WarmingRate => write!(
                f,
                "FAA temperature increased {:.4} K in {} sec. Cannot increase setpoint when the rate exceeds {} K per {} sec.",
                self.measured,
                QUIESCENCE.as_secs(),
                self.limit,
                QUIESCENCE.as_secs()
            ),
        }
    }
}

impl std::error::Error for Rejection {}

fn reject(rule: AdmissionRule, proposed_k: f64, measured: f64, limit: f64) -> std::result::Result<(), Rejection> {
    Err(Rejection {
        rule,
        proposed_k,
        measured,
        limit,
    })
}

/// Checks that need no telemetry.
pub fn check_proposal(setpoint_k: f64, voltage_divider_installed: bool) -> std::result::Result<(), Rejection> {
    if !setpoint_k.is_finite() {
        return reject(AdmissionRule::FiniteProposal, setpoint_k, setpoint_k, f64::MAX);
    }
    if !voltage_divider_installed && setpoint_k > NO_DIVIDER_MAX_SETPOINT_K {
        return reject(
            AdmissionRule::VoltageDivider,
            setpoint_k,
            setpoint_k,
            NO_DIVIDER_MAX_SETPOINT_K,
        );
    }
    Ok(())
}

/// Ramp, magnet current and supply voltage checks against the first snapshot.
pub fn check_static_limits(setpoint_k: f64, s1: &InterlockReadings) -> std::result::Result<(), Rejection> {
    let ceiling = s1.faa_temperature_k + MAX_STEP_ABOVE_FAA_K;
    if setpoint_k > ceiling {
        return reject(AdmissionRule::RampLimit, setpoint_k, s1.faa_temperature_k, ceiling);
    }

    if setpoint_k > s1.pid_setpoint_k {
        if s1.magnet_current_a > MAX_MAGNET_CURRENT_A {
            return reject(
                AdmissionRule::MagnetCurrent,
                setpoint_k,
                s1.magnet_current_a,
                MAX_MAGNET_CURRENT_A,
            );
        }
        if s1.power_supply_voltage_v > MAX_SUPPLY_VOLTAGE_V {
            return reject(
                AdmissionRule::SupplyVoltage,
                setpoint_k,
                s1.power_supply_voltage_v,
                MAX_SUPPLY_VOLTAGE_V,
            );
        }
    }
    Ok(())
}

/// Warming-rate check. The increase test uses the setpoint in effect at the
/// second snapshot, which may have been changed by someone else meanwhile.
pub fn check_warming_rate(
    setpoint_k: f64,
    s1: &InterlockReadings,
    s2: &InterlockReadings,
) -> std::result::Result<(), Rejection> {
    let rise = s2.faa_temperature_k - s1.faa_temperature_k;
    if setpoint_k > s2.pid_setpoint_k && rise > MAX_FAA_RISE_K {
        return reject(AdmissionRule::WarmingRate, setpoint_k, rise, MAX_FAA_RISE_K);
    }
    Ok(())
}

fn ensure_live(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CryobossError::Cancelled);
    }
    Ok(())
}

impl<S: Transport> Cryoboss<S> {
    /// Change the FAA PID setpoint once every interlock passes.
    ///
    /// Blocks for at least [`QUIESCENCE`]; run it on a worker thread if the
    /// caller must stay responsive. Returns the instrument's acknowledgement
    /// exactly as received.
    pub fn propose_setpoint(&self, setpoint_k: f64) -> Result<Acknowledgement> {
        self.propose_setpoint_with(setpoint_k, &CancelToken::new())
    }

    /// Like [`Cryoboss::propose_setpoint`], but gives up with
    /// [`CryobossError::Cancelled`] once `cancel` fires or its deadline passes.
    /// A cancelled proposal never writes the setpoint.
    pub fn propose_setpoint_with(&self, setpoint_k: f64, cancel: &CancelToken) -> Result<Acknowledgement> {
        let _proposal = self.proposal_lock.lock().unwrap_or_else(PoisonError::into_inner);
        info!("Proposing FAA setpoint {:.4} K", setpoint_k);

        let mut trace = InterlockTrace::default();
        let outcome = self.run_interlock(setpoint_k, cancel, &mut trace);
        match &outcome {
            Ok(ack) => info!("Setpoint {:.4} K committed: {}", setpoint_k, ack.text()),
            Err(CryobossError::Rejected(rejection)) => warn!("{}", rejection),
            Err(e) => error!("Setpoint proposal {:.4} K aborted: {}", setpoint_k, e),
        }

        if let Some(audit) = &self.audit {
            let record = ProposalRecord::new(setpoint_k, &trace, &outcome);
            if let Err(e) = audit.append(&record) {
                warn!("Failed to write setpoint audit record: {}", e);
            }
        }
        outcome
    }

    /// Snapshot reduced to the interlock fields. Missing or unusable fields
    /// drop the connection, the same as an undecodable snapshot.
    fn read_interlock_readings(&self) -> Result<InterlockReadings> {
        let snapshot = self.read_snapshot()?;
        InterlockReadings::try_from(&snapshot).map_err(|e| {
            self.disconnect();
            e.into()
        })
    }

    fn run_interlock(
        &self,
        setpoint_k: f64,
        cancel: &CancelToken,
        trace: &mut InterlockTrace,
    ) -> Result<Acknowledgement> {
        check_proposal(setpoint_k, self.voltage_divider_installed())?;

        ensure_live(cancel)?;
        let s1 = self.read_interlock_readings()?;
        trace.s1_faa_k = Some(s1.faa_temperature_k);
        debug!("First snapshot: {:?}", s1);
        check_static_limits(setpoint_k, &s1)?;

        debug!("Waiting {:?} to measure the FAA warming rate", QUIESCENCE);
        self.dwell
            .dwell(QUIESCENCE, cancel)
            .map_err(|_| CryobossError::Cancelled)?;

        ensure_live(cancel)?;
        let s2 = self.read_interlock_readings()?;
        trace.s2_faa_k = Some(s2.faa_temperature_k);
        debug!("Second snapshot: {:?}", s2);
        check_warming_rate(setpoint_k, &s1, &s2)?;

        ensure_live(cancel)?;
        self.write_setpoint(setpoint_k)
    }
}
