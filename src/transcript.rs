//! Byte-level transcript of a programming session
//!
//! Every byte that crosses the serial line is appended to a transcript file,
//! rendered as hex groups with an ASCII gutter. Sent bytes occupy the left
//! column and received bytes the right column, so the file reads like a
//! two-party conversation. Bytes drained from the OS input buffer without
//! being consumed by the protocol are recorded between explicit discard
//! banners.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

/// Name of the transcript file, created fresh in the working directory on
/// every run.
pub const TRANSCRIPT_FILE: &str = "ArduinoDriver.log";

/// Bytes per transcript line
const GROUP_SIZE: usize = 8;

/// Column at which received-byte groups start
const RECEIVED_COLUMN: usize = 40;

#[derive(Copy, Clone, PartialEq, Eq)]
enum Direction {
    Sent,
    Received,
}

/// Append-only transcript writer.
///
/// One partial group per direction is buffered so that consecutive
/// single-byte operations coalesce into 8-byte lines. At most one of the two
/// buffers is ever non-empty: traffic in the opposite direction flushes the
/// pending group first. This ordering rule is what keeps the two columns an
/// accurate serialisation of the conversation.
pub struct TranscriptLog {
    sink: BufWriter<File>,
    sent: Vec<u8>,
    received: Vec<u8>,
}

impl TranscriptLog {
    /// Create (or truncate) the transcript file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(TranscriptLog {
            sink: BufWriter::new(file),
            sent: Vec::with_capacity(GROUP_SIZE),
            received: Vec::with_capacity(GROUP_SIZE),
        })
    }

    /// Record bytes written to the device.
    pub fn record_sent(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.record(Direction::Sent, bytes)
    }

    /// Record bytes read from the device.
    pub fn record_received(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.record(Direction::Received, bytes)
    }

    /// Record bytes drained from the input buffer without being consumed.
    pub fn record_discarded(&mut self, bytes: &[u8], exiting: bool) -> io::Result<()> {
        self.flush_pending()?;

        if exiting {
            writeln!(self.sink, "Discarded on exit:")?;
        } else {
            writeln!(self.sink, "Discarded:")?;
        }
        for group in bytes.chunks(GROUP_SIZE) {
            writeln!(self.sink, "    {}", render_group(group))?;
        }
        writeln!(self.sink, "End discard.")
    }

    /// Write out whichever direction buffer is non-empty (at most one is).
    pub fn flush(&mut self) -> io::Result<()> {
        self.flush_pending()?;
        self.sink.flush()
    }

    /// Flush buffered bytes and the underlying file.
    pub fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sink.get_ref().sync_all()
    }

    fn record(&mut self, direction: Direction, bytes: &[u8]) -> io::Result<()> {
        // A group for the opposite direction must hit the file before any
        // byte of ours is buffered, or the columns would reorder the
        // conversation.
        match direction {
            Direction::Sent if !self.received.is_empty() => self.write_group(Direction::Received)?,
            Direction::Received if !self.sent.is_empty() => self.write_group(Direction::Sent)?,
            _ => {}
        }

        for &byte in bytes {
            match direction {
                Direction::Sent => self.sent.push(byte),
                Direction::Received => self.received.push(byte),
            }
            let len = match direction {
                Direction::Sent => self.sent.len(),
                Direction::Received => self.received.len(),
            };
            if len == GROUP_SIZE {
                self.write_group(direction)?;
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> io::Result<()> {
        if !self.sent.is_empty() {
            self.write_group(Direction::Sent)?;
        }
        if !self.received.is_empty() {
            self.write_group(Direction::Received)?;
        }
        Ok(())
    }

    fn write_group(&mut self, direction: Direction) -> io::Result<()> {
        match direction {
            Direction::Sent => {
                let line = render_group(&self.sent);
                self.sent.clear();
                writeln!(self.sink, "{line}")
            }
            Direction::Received => {
                let line = render_group(&self.received);
                self.received.clear();
                writeln!(self.sink, "{:width$}{line}", "", width = RECEIVED_COLUMN)
            }
        }
    }
}

impl Drop for TranscriptLog {
    fn drop(&mut self) {
        // Dropping buffered bytes on exit would falsify the record.
        let _ = self.flush();
    }
}

fn render_group(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02X}")).collect();
    let ascii: String = bytes
        .iter()
        .map(|&b| {
            if (0x20..=0x7E).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    // Pad the hex field to a full group so the ASCII gutter lines up.
    format!("{:23}  {}", hex.join(" "), ascii)
}
