//! In-memory stand-ins for the instrument used by unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::devices::{Cryoboss, Transport};
use crate::interlock::dwell::{CancelToken, Dwell, Interrupted};

const FIELD_NAMES: [&str; 20] = [
    "50 mK FAA Temperature",
    "1 K GGG Temperature",
    "3 K Stage Temperature",
    "60 K Stage Temperature",
    "PID Setpoint",
    "Magnet Current",
    "Power Supply Voltage",
    "Magnet Voltage",
    "Heat Switch",
    "Status",
    "Spare 10",
    "Spare 11",
    "Spare 12",
    "Spare 13",
    "Spare 14",
    "Spare 15",
    "Spare 16",
    "Spare 17",
    "Spare 18",
    "Spare 19",
];

/// `queryheader` response: a header row followed by one record per field.
pub fn header_frame() -> String {
    let mut frame = String::from("Name,Units,Description");
    for name in FIELD_NAMES {
        frame.push_str("\r\n");
        frame.push_str(name);
        frame.push_str(",K,telemetry");
    }
    frame
}

/// `queryall` response with the interlock fields set and fillers elsewhere.
pub fn values_frame(faa_k: f64, setpoint_k: f64, current_a: f64, voltage_v: f64) -> String {
    let mut tokens = vec![
        faa_k.to_string(),
        "1.02".to_string(),
        "3.41".to_string(),
        "58.7".to_string(),
        setpoint_k.to_string(),
        current_a.to_string(),
        voltage_v.to_string(),
        "0.12".to_string(),
        "OPEN".to_string(),
        "Regulating".to_string(),
    ];
    tokens.extend((10..20).map(|i| format!("{i}.5")));
    tokens.join(",")
}

pub type SentLog = Arc<Mutex<Vec<String>>>;

/// One segment of a reply. `late` segments only show up after the settle
/// window, i.e. they are still waiting when the next command goes out.
struct Segment {
    bytes: Vec<u8>,
    late: bool,
}

/// A stream that releases one scripted reply per write and records every
/// write. Each reply may arrive as several segments.
pub struct ScriptedStream {
    script: VecDeque<Vec<Segment>>,
    inbox: VecDeque<Segment>,
    sent: SentLog,
}

impl ScriptedStream {
    fn take_segment(&mut self, buf: &mut [u8]) -> usize {
        let Some(mut segment) = self.inbox.pop_front() else {
            return 0;
        };
        if segment.bytes.len() > buf.len() {
            let rest = segment.bytes.split_off(buf.len());
            self.inbox.push_front(Segment {
                bytes: rest,
                late: segment.late,
            });
        }
        buf[..segment.bytes.len()].copy_from_slice(&segment.bytes);
        segment.bytes.len()
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.take_segment(buf))
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(buf).into_owned());
        if let Some(reply) = self.script.pop_front() {
            self.inbox.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedStream {
    fn read_pending(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
        let ready = self
            .inbox
            .front()
            .is_some_and(|segment| wait.is_zero() || !segment.late);
        if !ready {
            return Ok(None);
        }
        Ok(Some(self.take_segment(buf)))
    }
}

#[derive(Default)]
pub struct InstrumentScript {
    replies: VecDeque<Vec<Segment>>,
}

impl InstrumentScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the two frames answering one `read_snapshot`.
    pub fn snapshot(self, faa_k: f64, setpoint_k: f64, current_a: f64, voltage_v: f64) -> Self {
        self.reply(values_frame(faa_k, setpoint_k, current_a, voltage_v).as_bytes())
            .reply(header_frame().as_bytes())
    }

    pub fn reply(self, frame: &[u8]) -> Self {
        self.segmented_reply(&[frame])
    }

    /// A reply delivered as several segments within the settle window.
    pub fn segmented_reply(mut self, segments: &[&[u8]]) -> Self {
        self.replies.push_back(
            segments
                .iter()
                .map(|bytes| Segment {
                    bytes: bytes.to_vec(),
                    late: false,
                })
                .collect(),
        );
        self
    }

    /// A reply whose `tail` arrives only after the settle window has passed.
    pub fn reply_with_late_tail(mut self, head: &[u8], tail: &[u8]) -> Self {
        self.replies.push_back(vec![
            Segment {
                bytes: head.to_vec(),
                late: false,
            },
            Segment {
                bytes: tail.to_vec(),
                late: true,
            },
        ]);
        self
    }

    pub fn into_stream(self) -> (ScriptedStream, SentLog) {
        let sent = SentLog::default();
        let stream = ScriptedStream {
            script: self.replies,
            inbox: VecDeque::new(),
            sent: Arc::clone(&sent),
        };
        (stream, sent)
    }
}

/// Dwell that records requested periods without sleeping.
#[derive(Clone, Default)]
pub struct RecordingDwell {
    periods: Arc<Mutex<Vec<Duration>>>,
    interrupt: bool,
}

impl RecordingDwell {
    pub fn interrupting() -> Self {
        Self {
            interrupt: true,
            ..Self::default()
        }
    }

    pub fn periods(&self) -> Vec<Duration> {
        self.periods.lock().unwrap().clone()
    }
}

impl Dwell for RecordingDwell {
    fn dwell(&self, period: Duration, cancel: &CancelToken) -> Result<(), Interrupted> {
        self.periods.lock().unwrap().push(period);
        if self.interrupt {
            cancel.cancel();
            return Err(Interrupted);
        }
        Ok(())
    }
}

pub fn scripted_client(
    script: InstrumentScript,
    voltage_divider_installed: bool,
) -> (Cryoboss<ScriptedStream>, SentLog, RecordingDwell) {
    scripted_client_with(script, voltage_divider_installed, RecordingDwell::default())
}

pub fn scripted_client_with(
    script: InstrumentScript,
    voltage_divider_installed: bool,
    dwell: RecordingDwell,
) -> (Cryoboss<ScriptedStream>, SentLog, RecordingDwell) {
    let (stream, sent) = script.into_stream();
    let mut config = SessionConfig::new("127.0.0.1", 1);
    config.voltage_divider_installed = voltage_divider_installed;
    let client = Cryoboss::with_stream(stream, config).with_dwell(dwell.clone());
    (client, sent, dwell)
}

pub fn sent(log: &SentLog) -> Vec<String> {
    log.lock().unwrap().clone()
}
