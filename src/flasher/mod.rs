//! High-level flash operations
//!
//! [Flasher] drives the programmer through [Connection]: programming single
//! sectors with echo verification, streaming whole binaries, executing
//! sector plans, and the interactive chip erase.

use std::{
    fs::{self, File},
    io::BufReader,
    path::Path,
};

use log::{debug, info, warn};

use crate::{
    command::{CommandType, ACK, NAK, NORMAL_TIMEOUT},
    connection::{Connection, SessionState, NUM_RETRIES},
    error::{ConnectionError, Error, ResultExt},
    interface::Interface,
    plan::{read_fill, SectorImage, SectorPlan},
    progress::ProgressCallbacks,
};

/// Flash size of the SST39SF020A in bytes. The 010A and 040 variants halve
/// and double this; the sector size is the same across the family.
pub const FLASH_SIZE: u32 = 262_144;
/// Size of one flash sector in bytes, the smallest erasable unit
pub const SECTOR_SIZE: usize = 4096;
/// Number of sectors on the chip
pub const NUM_SECTORS: u32 = FLASH_SIZE / SECTOR_SIZE as u32;

/// The prompt the device sends before it is willing to erase the chip
const CONFIRM_PROMPT: &[u8] = b"CONFIRM?\0";

/// How an erase request ended
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseOutcome {
    /// The chip was erased and the device acknowledged completion
    Erased,
    /// The operator declined; the device returned to idle without erasing
    Declined,
}

/// Connection to a programmer with an SST39SF chip attached
pub struct Flasher {
    connection: Connection,
}

impl Flasher {
    /// Run the bootstrap handshake over `interface` and wrap the resulting
    /// session.
    pub fn connect(interface: Interface) -> Result<Self, Error> {
        let mut connection = Connection::new(interface);
        connection.bootstrap()?;
        Ok(Flasher { connection })
    }

    #[cfg(test)]
    pub(crate) fn from_connection(connection: Connection) -> Self {
        Flasher { connection }
    }

    /// Get the underlying session
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Program one 4096-byte sector.
    ///
    /// The dialogue verifies both halves by echo: the device echoes the
    /// 2-byte little-endian sector index and later the full sector body, and
    /// the host confirms each with ACK or rejects it with NAK for a bounded
    /// number of retransmissions. Only after both echoes match does the
    /// device erase and program the sector.
    pub fn program_sector(&mut self, index: u16, image: &SectorImage) -> Result<(), Error> {
        if u32::from(index) >= NUM_SECTORS {
            return Err(Error::SectorOutOfRange {
                index: u32::from(index),
                sectors: NUM_SECTORS,
            });
        }

        debug!("Programming sector {index}");
        self.connection.send_command(CommandType::ProgramSector)?;

        self.connection
            .with_timeout(NORMAL_TIMEOUT, |connection| {
                exchange_sector_index(connection, index)?;
                exchange_sector_data(connection, index, image.as_bytes())
            })
            .for_command(CommandType::ProgramSector)
            .flashing()?;

        self.connection
            .wait_for_completion(CommandType::ProgramSector)
            .flashing()
    }

    /// Erase the entire chip.
    ///
    /// After the command is acknowledged the device asks for confirmation;
    /// `confirm` supplies the operator's answer. Declining is not an error:
    /// the device returns to idle and the session continues.
    pub fn erase_chip<F>(&mut self, confirm: F) -> Result<EraseOutcome, Error>
    where
        F: FnOnce() -> Result<bool, Error>,
    {
        self.connection.send_command(CommandType::EraseChip)?;

        let mut prompt = [0u8; 9];
        self.connection
            .with_timeout(NORMAL_TIMEOUT, |connection| {
                connection.read_exact(&mut prompt)?;
                Ok(())
            })
            .for_command(CommandType::EraseChip)?;
        if prompt != *CONFIRM_PROMPT {
            let unexpected = prompt
                .iter()
                .zip(CONFIRM_PROMPT)
                .find(|(got, want)| got != want)
                .map(|(&got, _)| got)
                .unwrap_or(prompt[0]);
            return Err(ConnectionError::UnexpectedResponse {
                byte: unexpected,
                action: "waiting for the erase confirmation prompt",
            }
            .into());
        }

        if !confirm()? {
            self.connection.write_all(&[NAK])?;
            info!("Erase declined; the chip was left untouched");
            return Ok(EraseOutcome::Declined);
        }

        self.connection.write_all(&[ACK])?;
        info!("Erasing chip...");
        self.connection
            .wait_for_completion(CommandType::EraseChip)
            .flashing()?;
        info!("Chip erased");
        Ok(EraseOutcome::Erased)
    }

    /// Validate that `path` holds between 1 byte and [FLASH_SIZE] bytes,
    /// returning its length.
    pub fn check_image_len(path: &Path) -> Result<u64, Error> {
        let len = fs::metadata(path)
            .map_err(|source| Error::FileIo {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        if len == 0 {
            return Err(crate::error::PlanError::EmptyFile(path.to_path_buf()).into());
        }
        if len > u64::from(FLASH_SIZE) {
            return Err(Error::ImageTooLarge {
                path: path.to_path_buf(),
                size: len,
                max: FLASH_SIZE,
            });
        }
        Ok(len)
    }

    /// Stream a binary file to the flash starting at address 0.
    ///
    /// Whole sectors are programmed in ascending order; a trailing partial
    /// sector is zero-padded to the full 4096 bytes.
    pub fn write_bin(
        &mut self,
        path: &Path,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let len = Self::check_image_len(path)?;
        let file = File::open(path).map_err(|source| Error::FileIo {
            path: path.to_path_buf(),
            source,
        })?;

        let sectors = len.div_ceil(SECTOR_SIZE as u64) as u32;
        info!(
            "Writing {len} byte(s) from '{}' ({sectors} sector(s))",
            path.display()
        );

        if let Some(cb) = progress.as_mut() {
            cb.init(0, sectors as usize);
        }

        let mut reader = BufReader::new(file);
        for index in 0..sectors {
            let mut image = SectorImage::new();
            let filled = read_fill(&mut reader, image.as_mut_bytes()).map_err(|source| {
                Error::FileIo {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            if filled < SECTOR_SIZE && index != sectors - 1 {
                return Err(Error::InternalError(
                    "short read from the image file before its final sector",
                ));
            }

            self.program_sector(index as u16, &image)?;
            if let Some(cb) = progress.as_mut() {
                cb.update(index as usize + 1);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }
        Ok(())
    }

    /// Program every sector image in `plan`, in ascending index order.
    pub fn write_plan(
        &mut self,
        plan: &SectorPlan,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        info!("Writing {} sector(s)", plan.len());
        if let Some(cb) = progress.as_mut() {
            let start = plan
                .iter()
                .next()
                .map(|(index, _)| u32::from(index) * SECTOR_SIZE as u32)
                .unwrap_or(0);
            cb.init(start, plan.len());
        }

        for (done, (index, image)) in plan.iter().enumerate() {
            self.program_sector(index, image)?;
            if let Some(cb) = progress.as_mut() {
                cb.update(done + 1);
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }
        Ok(())
    }

    /// End the session: the device acknowledges DONE and stops accepting
    /// commands.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.connection.finish()
    }
}

/// Send the sector index and verify the device's echo, rejecting mismatched
/// echoes with NAK for up to [NUM_RETRIES] retransmissions.
fn exchange_sector_index(connection: &mut Connection, index: u16) -> Result<(), Error> {
    let index_bytes = index.to_le_bytes();

    for attempt in 0..=NUM_RETRIES {
        connection.write_all(&index_bytes)?;
        connection.set_state(SessionState::AwaitingAck);

        match connection.read_byte()? {
            ACK => {}
            NAK => {
                // The device rejected the index outright (out of range) and
                // has returned to idle; retransmission cannot help.
                let message = connection.read_nak_message()?;
                return Err(ConnectionError::DeviceReported(message).into());
            }
            byte => {
                return Err(ConnectionError::UnexpectedResponse {
                    byte,
                    action: "waiting for the sector index acknowledgement",
                }
                .into())
            }
        }

        connection.set_state(SessionState::AwaitingEcho);
        let mut echo = [0u8; 2];
        connection.read_exact(&mut echo)?;
        let echoed = u16::from_le_bytes(echo);

        if echoed == index {
            connection.write_all(&[ACK])?;
            return Ok(());
        }

        warn!(
            "Device echoed sector index {echoed} instead of {index} (attempt {})",
            attempt + 1
        );
        connection.write_all(&[NAK])?;
    }

    Err(ConnectionError::RetriesExhausted(CommandType::ProgramSector).into())
}

/// Send the sector body and verify the device's 4096-byte echo, rejecting
/// mismatches with NAK for up to [NUM_RETRIES] retransmissions.
fn exchange_sector_data(
    connection: &mut Connection,
    index: u16,
    data: &[u8],
) -> Result<(), Error> {
    for attempt in 0..=NUM_RETRIES {
        connection.write_all(data)?;

        connection.set_state(SessionState::AwaitingEcho);
        let mut echo = vec![0u8; data.len()];
        connection.read_exact(&mut echo)?;

        if echo == data {
            connection.write_all(&[ACK])?;
            return Ok(());
        }

        warn!(
            "Device echo of sector {index} data did not match (attempt {})",
            attempt + 1
        );
        connection.write_all(&[NAK])?;
    }

    Err(ConnectionError::RetriesExhausted(CommandType::ProgramSector).into())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::interface::mock::{mock_interface, MockPort};

    fn flasher_over(port: MockPort) -> (Flasher, tempfile::TempDir) {
        let (interface, dir) = mock_interface(port);
        let mut connection = Connection::new(interface);
        connection.set_state(SessionState::Idle);
        (Flasher::from_connection(connection), dir)
    }

    /// The device's responses for one complete, happy sector programming
    /// dialogue: command ACK, index ACK + echo, body echo, completion ACK.
    fn happy_sector_script(index: u16, data: &[u8]) -> Vec<u8> {
        let mut script = vec![ACK, ACK];
        script.extend_from_slice(&index.to_le_bytes());
        script.extend_from_slice(data);
        script.push(ACK);
        script
    }

    #[test]
    fn programs_a_sector_with_matching_echoes() {
        let image = SectorImage::new();
        let port = MockPort::new(happy_sector_script(5, image.as_bytes()));
        let written = port.written_handle();
        let (mut flasher, _dir) = flasher_over(port);

        flasher.program_sector(5, &image).unwrap();

        let mut expected = b"PROGRAMSECTOR\0".to_vec();
        expected.extend_from_slice(&[0x05, 0x00]);
        expected.push(ACK);
        expected.extend_from_slice(image.as_bytes());
        expected.push(ACK);
        assert_eq!(written.lock().unwrap().as_slice(), expected.as_slice());
        assert_eq!(flasher.connection().timeout_stack_depth(), 0);
    }

    #[test]
    fn recovers_from_a_corrupted_index_echo() {
        let image = SectorImage::new();
        let mut script = vec![ACK]; // command
        script.extend_from_slice(&[ACK, 0x06, 0x00]); // wrong echo for index 5
        script.extend_from_slice(&[ACK, 0x05, 0x00]); // correct echo on retry
        script.extend_from_slice(image.as_bytes());
        script.push(ACK);

        let port = MockPort::new(script);
        let written = port.written_handle();
        let (mut flasher, _dir) = flasher_over(port);

        flasher.program_sector(5, &image).unwrap();

        // Exactly one host-sent NAK: the rejection of the corrupt echo.
        let written = written.lock().unwrap();
        assert_eq!(written.iter().filter(|&&b| b == NAK).count(), 1);
        assert_eq!(flasher.connection().timeout_stack_depth(), 0);
    }

    #[test]
    fn recovers_from_a_corrupted_data_echo() {
        let image = SectorImage::new();
        let mut corrupt = image.as_bytes().to_vec();
        corrupt[100] = 0xFF;

        let mut script = vec![ACK, ACK, 0x03, 0x00];
        script.extend_from_slice(&corrupt);
        script.extend_from_slice(image.as_bytes());
        script.push(ACK);

        let (mut flasher, _dir) = flasher_over(MockPort::new(script));
        flasher.program_sector(3, &image).unwrap();
    }

    #[test]
    fn aborts_when_the_device_rejects_the_index() {
        let mut script = vec![ACK, NAK];
        script.extend_from_slice(b"index out of range\0");

        let (mut flasher, _dir) = flasher_over(MockPort::new(script));
        let err = flasher.program_sector(5, &SectorImage::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::Flashing(ConnectionError::DeviceReported(_))
        ));
        assert_eq!(flasher.connection().timeout_stack_depth(), 0);
    }

    #[test]
    fn gives_up_after_repeated_echo_corruption() {
        let image = SectorImage::new();
        let mut script = vec![ACK];
        for _ in 0..=NUM_RETRIES {
            script.extend_from_slice(&[ACK, 0xEE, 0xEE]);
        }

        let (mut flasher, _dir) = flasher_over(MockPort::new(script));
        let err = flasher.program_sector(5, &image).unwrap_err();
        assert!(matches!(
            err,
            Error::Flashing(ConnectionError::RetriesExhausted(CommandType::ProgramSector))
        ));
        assert_eq!(flasher.connection().timeout_stack_depth(), 0);
    }

    #[test]
    fn rejects_out_of_range_sector_indices_before_any_traffic() {
        let port = MockPort::new(vec![]);
        let written = port.written_handle();
        let (mut flasher, _dir) = flasher_over(port);

        let err = flasher
            .program_sector(NUM_SECTORS as u16, &SectorImage::new())
            .unwrap_err();
        assert!(matches!(err, Error::SectorOutOfRange { .. }));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn erase_declined_sends_nak_and_reports_declined() {
        let mut script = vec![ACK];
        script.extend_from_slice(CONFIRM_PROMPT);

        let port = MockPort::new(script);
        let written = port.written_handle();
        let (mut flasher, _dir) = flasher_over(port);

        let outcome = flasher.erase_chip(|| Ok(false)).unwrap();
        assert_eq!(outcome, EraseOutcome::Declined);
        assert_eq!(*written.lock().unwrap().last().unwrap(), NAK);
    }

    #[test]
    fn erase_confirmed_waits_for_completion() {
        let mut script = vec![ACK];
        script.extend_from_slice(CONFIRM_PROMPT);
        script.push(ACK);

        let port = MockPort::new(script);
        let written = port.written_handle();
        let (mut flasher, _dir) = flasher_over(port);

        let outcome = flasher.erase_chip(|| Ok(true)).unwrap();
        assert_eq!(outcome, EraseOutcome::Erased);
        assert_eq!(*written.lock().unwrap().last().unwrap(), ACK);
    }

    #[test]
    fn erase_aborts_on_a_garbled_confirmation_prompt() {
        let mut script = vec![ACK];
        script.extend_from_slice(b"CONFURM?\0");

        let (mut flasher, _dir) = flasher_over(MockPort::new(script));
        let err = flasher.erase_chip(|| Ok(true)).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::UnexpectedResponse { byte: b'U', .. })
        ));
    }

    #[test]
    fn write_bin_pads_the_trailing_sector_with_zeroes() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("app.bin");
        let mut contents = vec![0x11u8; SECTOR_SIZE];
        contents.extend_from_slice(&[0x22; 10]);
        fs::write(&image_path, &contents).unwrap();

        let mut sector1 = vec![0x22u8; 10];
        sector1.resize(SECTOR_SIZE, 0);

        let mut script = happy_sector_script(0, &contents[..SECTOR_SIZE]);
        script.extend_from_slice(&happy_sector_script(1, &sector1));

        let port = MockPort::new(script);
        let written = port.written_handle();
        let (mut flasher, _tmp) = flasher_over(port);

        flasher.write_bin(&image_path, None).unwrap();

        // The padded tail went over the wire as a full sector.
        let written = written.lock().unwrap();
        let tail = &written[written.len() - 1 - SECTOR_SIZE..written.len() - 1];
        assert_eq!(&tail[..10], &[0x22; 10]);
        assert!(tail[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_bin_rejects_images_larger_than_the_flash() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("huge.bin");
        fs::write(&image_path, vec![0u8; FLASH_SIZE as usize + 1]).unwrap();

        let port = MockPort::new(vec![]);
        let written = port.written_handle();
        let (mut flasher, _tmp) = flasher_over(port);

        let err = flasher.write_bin(&image_path, None).unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge { .. }));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn write_bin_rejects_empty_images() {
        let dir = tempdir().unwrap();
        let image_path = dir.path().join("empty.bin");
        fs::write(&image_path, b"").unwrap();

        let (mut flasher, _tmp) = flasher_over(MockPort::new(vec![]));
        let err = flasher.write_bin(&image_path, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Plan(crate::error::PlanError::EmptyFile(_))
        ));
    }

    #[test]
    fn write_plan_programs_sectors_in_ascending_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, [0xAA; 8]).unwrap();
        fs::write(&b, [0xBB; 8]).unwrap();

        let instructions = vec![
            crate::plan::Instruction {
                address: 0x2000, // sector 2 listed first
                path: a,
            },
            crate::plan::Instruction {
                address: 0x0,
                path: b,
            },
        ];
        let plan = crate::plan::build_plan(&instructions, false).unwrap();

        let mut sector0 = vec![0xBBu8; 8];
        sector0.resize(SECTOR_SIZE, 0);
        let mut sector2 = vec![0xAAu8; 8];
        sector2.resize(SECTOR_SIZE, 0);

        let mut script = happy_sector_script(0, &sector0);
        script.extend_from_slice(&happy_sector_script(2, &sector2));

        let port = MockPort::new(script);
        let written = port.written_handle();
        let (mut flasher, _tmp) = flasher_over(port);

        flasher.write_plan(&plan, None).unwrap();

        // Sector 0's index bytes must be transmitted before sector 2's.
        let written = written.lock().unwrap();
        let cmd = b"PROGRAMSECTOR\0";
        let first = written.windows(cmd.len()).position(|w| w == cmd).unwrap();
        assert_eq!(&written[first + cmd.len()..][..2], &[0x00, 0x00]);
    }
}
