//! A library and application for programming SST39SF-family parallel NOR
//! flash chips through a microcontroller-based serial programmer.
//!
//! The programmer firmware speaks a small acknowledgement-oriented protocol
//! over the serial line: commands are NUL-terminated ASCII strings, every
//! exchange is confirmed with an ACK (0x06) or rejected with a NAK (0x15)
//! followed by a diagnostic message, and bulk data is verified by having the
//! device echo it back before committing it to flash.
//!
//! [Connection] owns the serial line and implements the protocol;
//! [Flasher] builds on it to provide the three user-facing operations:
//! whole-chip erase, straight binary writes starting at address 0, and
//! plan-driven writes of multiple files at arbitrary addresses.
//!
//! [Connection]: connection::Connection
//! [Flasher]: flasher::Flasher

pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod plan;
pub mod progress;
pub mod transcript;

pub use self::error::Error;

/// Logging utilities
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
