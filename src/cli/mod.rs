//! Types and functions for the command-line interface
//!
//! The contents of this module are intended for use by the [sstflash]
//! command-line application, and are likely not of much use otherwise.
//!
//! [sstflash]: https://crates.io/crates/sstflash

use std::path::PathBuf;

use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::Result;

use crate::{
    error::{Error, PlanError},
    flasher::{EraseOutcome, Flasher},
    interface::{Interface, BAUD_RATE},
    plan,
    progress::ProgressCallbacks,
};

/// Establish a connection with the programmer
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port the programmer is connected to
    #[arg(short = 'p', long)]
    pub port: String,
    /// Baud rate at which to communicate with the programmer
    #[arg(short = 'b', long)]
    pub baud: Option<u32>,
}

/// Write a binary image to the flash starting at address 0
#[derive(Debug, Args)]
pub struct WriteBinArgs {
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    /// Binary image to write
    pub image: PathBuf,
}

/// Program a set of binaries at the addresses listed in a plan file
#[derive(Debug, Args)]
pub struct WritePlanArgs {
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    /// Plan file: one `0xADDRESS path` instruction per line
    pub plan: PathBuf,
    /// Permit instructions to overlap; later instructions win
    #[arg(short = 'o', long)]
    pub allow_overlap: bool,
}

/// Erase the flash chip
#[derive(Debug, Args)]
pub struct EraseFlashArgs {
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Open the serial port and run the bootstrap handshake.
pub fn connect(args: &ConnectArgs) -> Result<Flasher> {
    info!("Serial port: '{}'", args.port);
    let interface = Interface::open(&args.port, args.baud.unwrap_or(BAUD_RATE))?;
    Ok(Flasher::connect(interface)?)
}

/// Write a binary image starting at address 0
pub fn write_bin(args: WriteBinArgs) -> Result<()> {
    // Reject unusable images before opening the port.
    Flasher::check_image_len(&args.image)?;

    let mut flasher = connect(&args.connect_args)?;
    flasher.write_bin(&args.image, Some(&mut CliProgress::default()))?;
    flasher.finish()?;
    info!("Flashing has completed!");

    Ok(())
}

/// Execute a plan file
pub fn write_plan(args: WritePlanArgs) -> Result<()> {
    // The plan is fully built and validated before any device traffic.
    let instructions = plan::parse_plan_file(&args.plan)?;
    if instructions.is_empty() {
        return Err(PlanError::EmptyFile(args.plan).into());
    }
    let sector_plan = plan::build_plan(&instructions, args.allow_overlap)?;

    let mut flasher = connect(&args.connect_args)?;
    flasher.write_plan(&sector_plan, Some(&mut CliProgress::default()))?;
    flasher.finish()?;
    info!("Flashing has completed!");

    Ok(())
}

/// Erase the chip after interactive confirmation
pub fn erase_flash(args: EraseFlashArgs) -> Result<()> {
    let mut flasher = connect(&args.connect_args)?;

    let outcome = flasher.erase_chip(|| {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Erase the entire chip?")
            .interact()
            .map_err(|e| match e {
                dialoguer::Error::IO(source) => Error::Console(source),
            })
    })?;

    if outcome == EraseOutcome::Erased {
        info!("Erasing has completed!");
    }
    flasher.finish()?;

    Ok(())
}

/// Sector-granular progress bar for flash operations
#[derive(Default)]
pub struct CliProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, _addr: u32, total: usize) {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {pos:>3}/{len:3} sectors")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        self.bar = Some(ProgressBar::new(total as u64).with_style(style));
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}
