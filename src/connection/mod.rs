//! Establish and drive a session with the programmer
//!
//! The [Connection] struct layers the acknowledgement-oriented protocol on
//! top of [Interface]: the bootstrap handshake, the command/ACK exchange
//! with bounded retries, NAK diagnostics, and completion waits for
//! long-running device operations.

use std::{thread::sleep, time::Duration};

use log::{debug, info, warn};

use crate::{
    command::{CommandType, ACK, MAX_NAK_MESSAGE, NAK, NORMAL_TIMEOUT, NUL},
    error::{ConnectionError, Error, HexBytes, ResultExt},
    interface::Interface,
};

/// Bounded retry budget: an exchange is attempted at most `NUM_RETRIES + 1`
/// times before the run is aborted.
pub const NUM_RETRIES: usize = 2;

/// What the device broadcasts (at roughly 1 Hz) until the host acknowledges
const GREETING: &[u8] = b"WAITING\0";

/// How long to let the device settle after opening the port. Its first
/// transmissions after a reset are known to drop characters.
const SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// How long to wait for an overlapping repeat of the greeting the device may
/// already have queued when our ACK arrives.
const ABSORB_DELAY: Duration = Duration::from_millis(50);

/// The phase the protocol expects the device to be in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Bootstrapping,
    Idle,
    AwaitingAck,
    AwaitingEcho,
    AwaitingCompletion,
    Terminated,
}

/// An established session with the programmer
pub struct Connection {
    interface: Interface,
    state: SessionState,
}

impl Connection {
    pub fn new(interface: Interface) -> Self {
        Connection {
            interface,
            state: SessionState::Uninitialized,
        }
    }

    /// The protocol phase the connection is currently in
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Complete the initial handshake, leaving the device idle and ready
    /// for commands.
    ///
    /// The device broadcasts `WAITING\0` once per second until it sees our
    /// ACK. Bytes received before the first `W` are collected as a prelude
    /// and reported if the handshake fails; they occur when the broadcast
    /// was already in flight while the port was opening.
    pub fn bootstrap(&mut self) -> Result<(), Error> {
        self.state = SessionState::Bootstrapping;
        info!("Waiting for the programmer to announce itself...");

        sleep(SETTLE_DELAY);
        self.interface.discard_input(false)?;
        self.interface.set_read_timeout(NORMAL_TIMEOUT)?;

        let mut prelude = Vec::with_capacity(GREETING.len());
        let mut candidate = Vec::with_capacity(GREETING.len());
        loop {
            let byte = self.interface.read_byte()?;
            if candidate.is_empty() && byte != b'W' {
                prelude.push(byte);
            } else {
                candidate.push(byte);
            }
            if candidate.len() == GREETING.len()
                || prelude.len() == GREETING.len()
                || byte == NUL
            {
                break;
            }
        }

        if candidate != GREETING {
            return Err(ConnectionError::HandshakeFailed {
                prelude: HexBytes(prelude),
                candidate: HexBytes(candidate),
            }
            .into());
        }

        self.interface.write_all(&[ACK])?;

        // The device may have queued another greeting before our ACK
        // arrived; let it land and throw it away.
        sleep(ABSORB_DELAY);
        self.interface.discard_input(false)?;

        self.state = SessionState::Idle;
        info!("Connected");
        Ok(())
    }

    /// Send a command and wait for its acknowledgement, retrying after NAKs
    /// up to [NUM_RETRIES] times.
    ///
    /// A NAK means the device rejected the frame but is listening for a
    /// retransmission. Anything that is neither ACK nor NAK means host and
    /// device disagree about the protocol phase, which no retry can fix.
    pub fn send_command(&mut self, command: CommandType) -> Result<(), Error> {
        debug!("Sending {command} command");
        self.with_timeout(command.timeout(), |connection| {
            for attempt in 0..=NUM_RETRIES {
                if attempt > 0 {
                    debug!("Retrying {command} command (attempt {})", attempt + 1);
                }
                connection.interface.write_nul_terminated(command.wire_text())?;
                connection.state = SessionState::AwaitingAck;

                match connection.interface.read_byte()? {
                    ACK => {
                        connection.state = SessionState::Idle;
                        return Ok(());
                    }
                    NAK => {
                        let message = connection.read_nak_message()?;
                        warn!("Device rejected {command}: {}", message.trim());
                    }
                    byte => {
                        return Err(ConnectionError::UnexpectedResponse {
                            byte,
                            action: "waiting for a command acknowledgement",
                        }
                        .into())
                    }
                }
            }
            Err(ConnectionError::RetriesExhausted(command).into())
        })
        .for_command(command)
    }

    /// Wait for the terminal ACK of a long-running device operation, using
    /// the command's completion timeout.
    pub fn wait_for_completion(&mut self, command: CommandType) -> Result<(), Error> {
        self.state = SessionState::AwaitingCompletion;
        self.with_timeout(command.completion_timeout(), |connection| {
            match connection.interface.read_byte()? {
                ACK => {
                    connection.state = SessionState::Idle;
                    Ok(())
                }
                NAK => {
                    let message = connection.read_nak_message()?;
                    Err(ConnectionError::DeviceReported(message).into())
                }
                byte => Err(ConnectionError::UnexpectedResponse {
                    byte,
                    action: "waiting for an operation to complete",
                }
                .into()),
            }
        })
        .for_command(command)
    }

    /// Tell the device the session is over. It stops accepting commands.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.send_command(CommandType::Done)?;
        self.state = SessionState::Terminated;
        Ok(())
    }

    /// Read the NUL-terminated diagnostic string that follows a NAK byte.
    ///
    /// Consumes bytes until the terminator, or until [MAX_NAK_MESSAGE] bytes
    /// have arrived without one.
    pub(crate) fn read_nak_message(&mut self) -> Result<String, Error> {
        let mut payload = Vec::new();
        while payload.len() < MAX_NAK_MESSAGE {
            let byte = self.interface.read_byte()?;
            if byte == NUL {
                break;
            }
            payload.push(byte);
        }
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Run `f` with the read timeout replaced by `timeout`, restoring the
    /// previous value on every exit path.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut Connection) -> Result<T, Error>,
    {
        self.interface.push_read_timeout(timeout)?;
        let result = f(self);
        self.interface.pop_read_timeout()?;
        result
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.interface.write_all(bytes)
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8, Error> {
        self.interface.read_byte()
    }

    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.interface.read_exact(buf)
    }

    #[cfg(test)]
    pub(crate) fn timeout_stack_depth(&self) -> usize {
        self.interface.timeout_stack_depth()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Scoped release of the link: catch in-flight bytes, record them as
        // discarded, and flush the transcript, on success and failure alike.
        self.interface.cleanup_for_exit();
    }
}
