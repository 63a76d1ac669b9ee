use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Byte stream to the instrument.
///
/// On top of blocking `Read + Write`, the session needs to look for bytes that
/// are already waiting without blocking for a full I/O timeout: once to drain
/// stale data before a request, and once after each read to pick up the rest
/// of a response split across several segments.
pub trait Transport: Read + Write {
    /// Read bytes that arrive within `wait`. A zero `wait` only looks at what
    /// is already buffered. Returns `None` when nothing arrived and `Some(0)`
    /// when the peer closed the stream.
    fn read_pending(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>>;
}

impl Transport for TcpStream {
    fn read_pending(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<Option<usize>> {
        let result = if wait.is_zero() {
            self.set_nonblocking(true)?;
            let result = self.read(buf);
            self.set_nonblocking(false)?;
            result
        } else {
            let previous = self.read_timeout()?;
            self.set_read_timeout(Some(wait))?;
            let result = self.read(buf);
            self.set_read_timeout(previous)?;
            result
        };

        match result {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
