use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pcimage-util")]
#[command(about = "partclone image utility", long_about = None)]
pub struct Cli {
    /// Log library activity (repeat for more detail)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check one or more images for consistency
    Info {
        /// Paths to the images
        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,
    },

    /// Report which image type recognizes a file
    Probe {
        /// Path to the image
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    /// Write the device held by an image to a file
    Export {
        /// Path to the image
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Apply changes from this overlay
        #[arg(long, value_name = "CF")]
        overlay: Option<PathBuf>,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Write blocks from a file into the overlay of an image
    Patch {
        /// Path to the image
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// First block to replace
        #[arg(short, long, value_name = "N")]
        block: u64,

        /// File holding the replacement blocks
        #[arg(short, long, value_name = "FILE")]
        from: PathBuf,

        /// Overlay to write (defaults to <IMAGE>.cf)
        #[arg(long, value_name = "CF")]
        overlay: Option<PathBuf>,
    },
}
