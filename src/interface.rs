//! The serial link to the programmer
//!
//! [Interface] owns the port, the session transcript, and the read-timeout
//! stack. Every byte that crosses the link is mirrored to the transcript, so
//! the layers above never touch the port directly.

use std::{
    io,
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{
    command::NORMAL_TIMEOUT,
    error::{ConnectionError, Error},
    transcript::{TranscriptLog, TRANSCRIPT_FILE},
};

/// Baud rate the programmer firmware listens at
pub const BAUD_RATE: u32 = 115_200;

/// How long to wait for in-flight bytes before closing the link
const EXIT_DRAIN_DELAY: Duration = Duration::from_millis(50);

/// Byte transport beneath [Interface].
///
/// Abstracts over [serialport::SerialPort] so the protocol layers can be
/// exercised against a scripted peer in tests.
pub trait RawPort: Send {
    /// Read up to `buf.len()` bytes, blocking for at most the current
    /// timeout. A timeout surfaces as [io::ErrorKind::TimedOut].
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` synchronously.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Current read timeout
    fn timeout(&self) -> Duration;

    /// Replace the read timeout
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// Number of bytes buffered by the OS but not yet read
    fn bytes_to_read(&self) -> Result<u32, ConnectionError>;
}

impl RawPort for Box<dyn SerialPort> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)?;
        io::Write::flush(self)
    }

    fn timeout(&self) -> Duration {
        SerialPort::timeout(self.as_ref())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        SerialPort::set_timeout(self.as_mut(), timeout)?;
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<u32, ConnectionError> {
        Ok(SerialPort::bytes_to_read(self.as_ref())?)
    }
}

/// The serial link to the programmer, with transcript mirroring and a
/// read-timeout stack.
pub struct Interface {
    port: Box<dyn RawPort>,
    transcript: TranscriptLog,
    saved_timeouts: Vec<Duration>,
}

impl Interface {
    /// Open `port_name` at `baud`, 8-N-1 without flow control, and create a
    /// fresh transcript file in the working directory.
    pub fn open(port_name: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(port_name, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(NORMAL_TIMEOUT)
            .open()
            .map_err(|source| Error::SerialNotFound {
                port: port_name.to_string(),
                source,
            })?;

        debug!("Opened serial port '{port_name}' at {baud} baud");

        let transcript = TranscriptLog::create(TRANSCRIPT_FILE).map_err(|source| Error::FileIo {
            path: TRANSCRIPT_FILE.into(),
            source,
        })?;

        Ok(Interface {
            port: Box::new(port),
            transcript,
            saved_timeouts: Vec::new(),
        })
    }

    /// Build an interface over an arbitrary transport. The transcript is
    /// written wherever `transcript` points.
    pub fn with_port(port: Box<dyn RawPort>, transcript: TranscriptLog) -> Self {
        Interface {
            port,
            transcript,
            saved_timeouts: Vec::new(),
        }
    }

    /// Write all of `bytes` and mirror them to the transcript.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.port.write_all(bytes)?;
        self.transcript.record_sent(bytes)?;
        Ok(())
    }

    /// Write the ASCII bytes of `text` followed by a single NUL terminator.
    pub fn write_nul_terminated(&mut self, text: &str) -> Result<(), Error> {
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(0x00);
        self.write_all(&frame)
    }

    /// Read a single byte, blocking for at most the current timeout.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => {
                    return Err(ConnectionError::Serial(
                        io::Error::from(io::ErrorKind::UnexpectedEof).into(),
                    )
                    .into())
                }
                Ok(_) => {
                    self.transcript.record_received(&buf)?;
                    return Ok(buf[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read exactly `buf.len()` bytes, looping internal reads until the
    /// buffer is full or the current timeout fires.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(ConnectionError::Serial(
                        io::Error::from(io::ErrorKind::UnexpectedEof).into(),
                    )
                    .into())
                }
                Ok(n) => {
                    self.transcript.record_received(&buf[filled..filled + n])?;
                    filled += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Replace the read timeout without touching the stack.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    /// Save the current read timeout and install `timeout` in its place.
    /// Every push must be matched by a [pop_read_timeout] before control
    /// leaves the operation that pushed.
    ///
    /// [pop_read_timeout]: Interface::pop_read_timeout
    pub fn push_read_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        let previous = self.port.timeout();
        self.port.set_timeout(timeout)?;
        self.saved_timeouts.push(previous);
        Ok(())
    }

    /// Restore the read timeout saved by the matching push.
    pub fn pop_read_timeout(&mut self) -> Result<(), Error> {
        let previous = self
            .saved_timeouts
            .pop()
            .ok_or(Error::InternalError("read-timeout stack underflow"))?;
        self.port.set_timeout(previous)?;
        Ok(())
    }

    /// Drain any buffered unread bytes into the transcript's discard record.
    pub fn discard_input(&mut self, exiting: bool) -> Result<(), Error> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(());
        }

        let mut drained = vec![0u8; pending];
        let mut filled = 0;
        while filled < pending {
            match self.port.read(&mut drained[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                // The OS told us the bytes were buffered; if they vanished
                // anyway there is nothing left to drain.
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        drained.truncate(filled);

        debug!("Discarding {} buffered byte(s)", drained.len());
        self.transcript.record_discarded(&drained, exiting)?;
        Ok(())
    }

    /// Catch any in-flight transmission, discard it, and close the
    /// transcript. Invoked on every exit path; failures are logged and
    /// swallowed because the session is over either way.
    pub fn cleanup_for_exit(&mut self) {
        sleep(EXIT_DRAIN_DELAY);
        if let Err(e) = self.discard_input(true) {
            debug!("Failed to drain serial input on exit: {e}");
        }
        if let Err(e) = self.transcript.close() {
            debug!("Failed to close transcript: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn timeout_stack_depth(&self) -> usize {
        self.saved_timeouts.len()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{collections::VecDeque, io, time::Duration};

    use tempfile::TempDir;

    use super::{Interface, RawPort};
    use crate::transcript::{TranscriptLog, TRANSCRIPT_FILE};

    /// A scripted peer: `garbage` models bytes sitting in the OS buffer at
    /// open (they are visible to `bytes_to_read` and get discarded), while
    /// `script` models everything the device transmits afterwards. An empty
    /// script reads as a timeout.
    pub(crate) struct MockPort {
        pub garbage: VecDeque<u8>,
        pub script: VecDeque<u8>,
        pub written: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
        timeout: Duration,
    }

    impl MockPort {
        pub fn new(script: impl Into<VecDeque<u8>>) -> Self {
            MockPort {
                garbage: VecDeque::new(),
                script: script.into(),
                written: Default::default(),
                timeout: Duration::from_millis(1),
            }
        }

        pub fn with_garbage(mut self, garbage: impl Into<VecDeque<u8>>) -> Self {
            self.garbage = garbage.into();
            self
        }

        /// Handle for inspecting everything the host wrote.
        pub fn written_handle(&self) -> std::sync::Arc<std::sync::Mutex<Vec<u8>>> {
            self.written.clone()
        }
    }

    impl RawPort for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let source = if !self.garbage.is_empty() {
                &mut self.garbage
            } else if !self.script.is_empty() {
                &mut self.script
            } else {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            };

            let mut n = 0;
            while n < buf.len() {
                match source.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), crate::error::ConnectionError> {
            self.timeout = timeout;
            Ok(())
        }

        fn bytes_to_read(&self) -> Result<u32, crate::error::ConnectionError> {
            Ok(self.garbage.len() as u32)
        }
    }

    /// Interface over a mock port, with the transcript parked in a tempdir.
    /// The returned `TempDir` must outlive the interface.
    pub(crate) fn mock_interface(port: MockPort) -> (Interface, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let transcript = TranscriptLog::create(dir.path().join(TRANSCRIPT_FILE)).unwrap();
        (Interface::with_port(Box::new(port), transcript), dir)
    }
}
