//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    path::PathBuf,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with the programmer")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing the chip")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Plan(#[from] PlanError),

    #[error("The serial port '{port}' could not be opened")]
    #[diagnostic(
        code(sstflash::serial_not_found),
        help("Make sure the programmer is connected and the port is not in use by another process")
    )]
    SerialNotFound {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to read '{}'", .path.display())]
    #[diagnostic(code(sstflash::file_io))]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("'{}' is {size} bytes, which does not fit in the {max}-byte flash", .path.display())]
    #[diagnostic(code(sstflash::image_too_large))]
    ImageTooLarge {
        path: PathBuf,
        size: u64,
        max: u32,
    },

    #[error("Sector index {index} is out of range (the chip has {sectors} sectors)")]
    #[diagnostic(code(sstflash::sector_out_of_range))]
    SectorOutOfRange { index: u32, sectors: u32 },

    #[error("Failed to read the operator's answer")]
    #[diagnostic(code(sstflash::console))]
    Console(#[source] io::Error),

    #[error("Internal error: {0}")]
    #[diagnostic(code(sstflash::internal))]
    InternalError(&'static str),
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(sstflash::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Timeout while running {0}command")]
    #[diagnostic(
        code(sstflash::timeout),
        help("Check the serial connection; the programmer may have been reset or unplugged")
    )]
    Timeout(TimedOutCommand),

    #[error("Received unexpected response byte {byte:#04x} while {action}")]
    #[diagnostic(
        code(sstflash::unexpected_response),
        help("Host and device have lost protocol sync; reset the programmer and try again")
    )]
    UnexpectedResponse { byte: u8, action: &'static str },

    #[error("The device reported an error: {}", .0.trim())]
    #[diagnostic(code(sstflash::device_error))]
    DeviceReported(String),

    #[error("The device kept rejecting the {0} command")]
    #[diagnostic(
        code(sstflash::retries_exhausted),
        help("The serial line is dropping or corrupting bytes; check wiring and baud rate")
    )]
    RetriesExhausted(CommandType),

    #[error("The device did not announce itself (bytes before 'W': {prelude}; announcement: {candidate})")]
    #[diagnostic(
        code(sstflash::handshake_failed),
        help("Reset the programmer so it restarts its WAITING broadcast, then run again")
    )]
    HandshakeFailed {
        prelude: HexBytes,
        candidate: HexBytes,
    },
}

/// The command during which a timeout occurred, if known. Used to enrich
/// [ConnectionError::Timeout] after the fact via [ResultExt::for_command].
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(c: CommandType) -> Self {
        TimedOutCommand { command: Some(c) }
    }
}

/// Bytes rendered as space-separated hex, for handshake diagnostics
#[derive(Debug, Clone)]
pub struct HexBytes(pub Vec<u8>);

impl Display for HexBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(none)");
        }
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum PlanError {
    #[error("Malformed instruction '{line}' in '{}'", .path.display())]
    #[diagnostic(
        code(sstflash::plan::parse),
        help("Instructions look like '0x1000 firmware.bin'; lines starting with '#' are comments")
    )]
    Parse { line: String, path: PathBuf },

    #[error("'{}' (ending at {end:#x}) overlaps '{}' (starting at {start:#x})", .a.display(), .b.display())]
    #[diagnostic(
        code(sstflash::plan::overlap),
        help("Pass --allow-overlap to let later instructions overwrite earlier ones")
    )]
    Overlap {
        a: PathBuf,
        end: u32,
        b: PathBuf,
        start: u32,
    },

    #[error("'{}' is empty", .0.display())]
    #[diagnostic(code(sstflash::plan::empty_file))]
    EmptyFile(PathBuf),

    #[error("Address {address:#x} is outside the {flash_size}-byte flash")]
    #[diagnostic(code(sstflash::plan::address_out_of_range))]
    AddressOutOfRange { address: u32, flash_size: u32 },

    #[error("'{}' ({len} bytes at {address:#x}) extends past the end of the {flash_size}-byte flash", .path.display())]
    #[diagnostic(code(sstflash::plan::too_large))]
    TooLarge {
        path: PathBuf,
        len: u64,
        address: u32,
        flash_size: u32,
    },

    #[error("Failed to read '{}'", .path.display())]
    #[diagnostic(code(sstflash::plan::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            ConnectionError::Timeout(TimedOutCommand::default())
        }
        _ => ConnectionError::Serial(err.into()),
    }
}

pub(crate) trait ResultExt {
    /// mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
