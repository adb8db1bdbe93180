//! Commands understood by the programmer firmware

use std::time::Duration;

use strum::Display;

/// Positive acknowledgement byte
pub const ACK: u8 = 0x06;
/// Negative acknowledgement byte, followed by a NUL-terminated diagnostic
pub const NAK: u8 = 0x15;
/// Terminator for commands and NAK diagnostics
pub const NUL: u8 = 0x00;

/// Maximum length of a NAK diagnostic, terminator included. The firmware
/// truncates its messages to this length; the cap on the host side defends
/// against a misbehaving device streaming an unterminated payload.
pub const MAX_NAK_MESSAGE: usize = 256;

/// Read timeout for ordinary command/response exchanges
pub const NORMAL_TIMEOUT: Duration = Duration::from_millis(2000);
/// Read timeout while the device is busy programming a sector
pub const EXTENDED_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Commands are sent as ASCII strings followed by a single NUL terminator.
/// The device replies with ACK, or with NAK and a diagnostic message.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommandType {
    /// Program one 4096-byte sector; the command is followed by the
    /// index/data dialogue of [`Flasher::program_sector`].
    ///
    /// [`Flasher::program_sector`]: crate::flasher::Flasher::program_sector
    ProgramSector,
    /// Erase the entire chip after an interactive confirmation round trip
    EraseChip,
    /// Tell the device the session is over; it stops accepting commands
    Done,
}

impl CommandType {
    /// The ASCII command string as it appears on the wire, terminator
    /// excluded.
    pub fn wire_text(&self) -> &'static str {
        match self {
            CommandType::ProgramSector => "PROGRAMSECTOR",
            CommandType::EraseChip => "ERASECHIP",
            CommandType::Done => "DONE",
        }
    }

    /// Read timeout for the command's ACK/NAK exchange
    pub fn timeout(&self) -> Duration {
        NORMAL_TIMEOUT
    }

    /// Read timeout while waiting for the device to report that the
    /// operation behind the command has completed.
    ///
    /// Sector programming needs the longer window: the device erases and
    /// reprograms the sector byte-by-byte before it acknowledges. A chip
    /// erase, counter-intuitively, completes within the normal window on
    /// every SST39SF variant.
    pub fn completion_timeout(&self) -> Duration {
        match self {
            CommandType::ProgramSector => EXTENDED_TIMEOUT,
            _ => NORMAL_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_text_is_nul_free_ascii() {
        for cmd in [
            CommandType::ProgramSector,
            CommandType::EraseChip,
            CommandType::Done,
        ] {
            let text = cmd.wire_text();
            assert!(text.is_ascii());
            assert!(!text.as_bytes().contains(&NUL));
        }
    }

    #[test]
    fn only_sector_programming_uses_the_extended_window() {
        assert_eq!(
            CommandType::ProgramSector.completion_timeout(),
            EXTENDED_TIMEOUT
        );
        assert_eq!(CommandType::EraseChip.completion_timeout(), NORMAL_TIMEOUT);
        assert_eq!(CommandType::Done.completion_timeout(), NORMAL_TIMEOUT);
    }
}
