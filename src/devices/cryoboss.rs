use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::interlock::audit::AuditLog;
use crate::interlock::dwell::{Dwell, WallClockDwell};
use crate::interlock::Rejection;
use crate::telemetry::{ProtocolError, Snapshot};
use super::transport::Transport;

/// Largest response accepted from a single receive.
pub const FRAME_LIMIT: usize = 2048;

const QUERY_ALL: &str = "queryall";
const QUERY_HEADER: &str = "queryheader";

#[derive(Error, Debug)]
pub enum CryobossError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Setpoint rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Setpoint proposal cancelled; nothing was written")]
    Cancelled,

    #[error("Device not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CryobossError>;

/// Raw acknowledgement frame returned by the instrument for a setpoint write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    raw: Vec<u8>,
}

impl Acknowledgement {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }
}

/// Client session for the cryoboss ADR control software.
///
/// The protocol is strictly one request followed by one response, so the
/// stream sits behind a mutex and only one exchange is ever in flight.
/// Setpoint proposals additionally hold `proposal_lock` for their whole run.
pub struct Cryoboss<S = TcpStream> {
    connection: Mutex<Option<S>>,
    config: SessionConfig,
    pub(crate) dwell: Box<dyn Dwell>,
    pub(crate) proposal_lock: Mutex<()>,
    pub(crate) audit: Option<AuditLog>,
}

impl<S: Transport> Cryoboss<S> {
    pub fn with_stream(stream: S, config: SessionConfig) -> Self {
        info!(
            "Initializing cryoboss session for {}:{} (voltage divider installed: {})",
            config.host, config.port, config.voltage_divider_installed
        );
        let audit = config.audit_dir.clone().map(AuditLog::new);
        Cryoboss {
            connection: Mutex::new(Some(stream)),
            config,
            dwell: Box::new(WallClockDwell::default()),
            proposal_lock: Mutex::new(()),
            audit,
        }
    }

    /// Replace the quiescence timer used by setpoint proposals.
    pub fn with_dwell(mut self, dwell: impl Dwell + 'static) -> Self {
        self.dwell = Box::new(dwell);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn voltage_divider_installed(&self) -> bool {
        self.config.voltage_divider_installed
    }

    pub fn is_connected(&self) -> bool {
        self.lock_connection().is_some()
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<S>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the stream. Used once a response could not be decoded, since the
    /// session may no longer be aligned with the instrument's replies.
    pub(crate) fn disconnect(&self) {
        if self.lock_connection().take().is_some() {
            warn!("Dropped cryoboss connection; reconnect before the next request");
        }
    }

    /// Send `command` verbatim and read back exactly one response frame.
    ///
    /// Any failure drops the stream: after a partial exchange the framing can
    /// no longer be trusted.
    fn exchange(&self, command: &str) -> Result<Vec<u8>> {
        let mut guard = self.lock_connection();
        let Some(stream) = guard.as_mut() else {
            error!("Attempted to send '{}' but cryoboss is not connected", command);
            return Err(CryobossError::NotConnected);
        };

        let settle = self.config.frame_settle();
        let result = discard_stale(stream)
            .and_then(|_| send_command(stream, command))
            .and_then(|_| read_frame(stream, settle));
        if let Err(e) = &result {
            error!("Exchange '{}' failed, dropping connection: {}", command, e);
            *guard = None;
        }
        result
    }

    fn query_text(&self, command: &str) -> Result<String> {
        let frame = self.exchange(command)?;
        String::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8.into())
    }

    /// Query every telemetry field. Each call goes to the instrument.
    ///
    /// A response that fails to decode drops the connection.
    pub fn read_snapshot(&self) -> Result<Snapshot> {
        let result = self.query_text(QUERY_ALL).and_then(|values| {
            let header = self.query_text(QUERY_HEADER)?;
            Ok(Snapshot::decode(&values, &header)?)
        });
        match &result {
            Ok(snapshot) => debug!("Decoded snapshot with {} fields", snapshot.len()),
            Err(CryobossError::Protocol(e)) => {
                error!("Undecodable snapshot: {}", e);
                self.disconnect();
            }
            Err(_) => {}
        }
        result
    }

    /// Transmit the setpoint write. Only reachable through the interlock.
    pub(crate) fn write_setpoint(&self, setpoint_k: f64) -> Result<Acknowledgement> {
        let command = format!("pidset = {:.4}", setpoint_k);
        let raw = self.exchange(&command)?;
        info!("Setpoint write acknowledged: {}", String::from_utf8_lossy(&raw));
        Ok(Acknowledgement { raw })
    }
}

impl Cryoboss<TcpStream> {
    /// Open a TCP session, retrying the connect according to the config's
    /// reconnect policy.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let stream = open_with_backoff(&config)?;
        Ok(Self::with_stream(stream, config))
    }

    /// Replace the current stream with a fresh connection. Requests that
    /// failed are never replayed.
    pub fn reconnect(&self) -> Result<()> {
        let stream = open_with_backoff(&self.config)?;
        *self.lock_connection() = Some(stream);
        info!("Reconnected to cryoboss at {}:{}", self.config.host, self.config.port);
        Ok(())
    }
}

fn send_command<S: Write>(stream: &mut S, command: &str) -> Result<()> {
    debug!("Sending command to cryoboss: {}", command);
    stream.write_all(command.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn closed_by_remote() -> CryobossError {
    CryobossError::Connection(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "Connection closed by remote",
    ))
}

/// Throw away bytes left over from an earlier response so they are not read
/// as the reply to the next request.
fn discard_stale<S: Transport>(stream: &mut S) -> Result<()> {
    let mut buf = [0_u8; 256];
    let mut dropped = 0;
    loop {
        match stream.read_pending(&mut buf, Duration::ZERO)? {
            None => break,
            Some(0) => return Err(closed_by_remote()),
            Some(n) => dropped += n,
        }
    }
    if dropped > 0 {
        warn!("Discarded {} stale bytes before sending the next command", dropped);
    }
    Ok(())
}

/// Read one response: a blocking read for the first segment, then whatever
/// else arrives within the `settle` window.
fn read_frame<S: Transport>(stream: &mut S, settle: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; FRAME_LIMIT + 1];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(closed_by_remote());
    }
    let mut frame = buf[..n].to_vec();

    while frame.len() <= FRAME_LIMIT {
        match stream.read_pending(&mut buf, settle)? {
            None | Some(0) => break,
            Some(n) => frame.extend_from_slice(&buf[..n]),
        }
    }
    if frame.len() > FRAME_LIMIT {
        return Err(ProtocolError::FrameOverflow { limit: FRAME_LIMIT }.into());
    }
    debug!("Received {} byte frame from cryoboss", frame.len());
    Ok(frame)
}

fn open_stream(config: &SessionConfig) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                stream.set_read_timeout(Some(config.io_timeout()))?;
                stream.set_write_timeout(Some(config.io_timeout()))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No address found for {}", config.host),
        )
    }))
}

fn open_with_backoff(config: &SessionConfig) -> Result<TcpStream> {
    let attempts = config.reconnect.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        info!(
            "Attempting to connect to cryoboss at {}:{} (attempt {}/{})",
            config.host, config.port, attempt, attempts
        );
        match open_stream(config) {
            Ok(stream) => {
                info!("Connected to cryoboss at {}:{}", config.host, config.port);
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                let delay = config.reconnect.backoff(attempt);
                warn!("Connect failed: {}; retrying in {:?}", e, delay);
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                error!("Giving up connecting to cryoboss after {} attempts: {}", attempts, e);
                return Err(e.into());
            }
        }
    }
}
