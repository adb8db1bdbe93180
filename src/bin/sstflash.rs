use clap::{Parser, Subcommand};
use log::LevelFilter;
use miette::Result;
use sstflash::{
    cli::{erase_flash, write_bin, write_plan, EraseFlashArgs, WriteBinArgs, WritePlanArgs},
    logging::initialize_logger,
};

/// Main CLI parser.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Erase the flash chip entirely
    ///
    /// The device asks for confirmation before it touches the chip;
    /// answering no leaves the flash untouched and is not an error.
    EraseFlash(EraseFlashArgs),
    /// Write a binary image to the flash starting at address 0
    ///
    /// The image is programmed sector by sector in ascending order. If its
    /// length is not a multiple of the 4096-byte sector size, the final
    /// sector is padded with zeroes.
    WriteBin(WriteBinArgs),
    /// Program a set of binaries at the addresses listed in a plan file
    ///
    /// Each plan-file line pairs a hexadecimal flash address with the path
    /// of a binary to place there; lines starting with '#' are comments.
    /// Files landing in the same sector are coalesced into one sector
    /// image. Overlapping files abort the run unless '--allow-overlap' is
    /// given, in which case later instructions win.
    WritePlan(WritePlanArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();

    match cli.subcommand {
        Commands::EraseFlash(args) => erase_flash(args),
        Commands::WriteBin(args) => write_bin(args),
        Commands::WritePlan(args) => write_plan(args),
    }
}
