mod cli;

use clap::Parser;
use cli::{Cli, Command};
use pcimage::{OpenMode, OpenOptions};
use pcimage_util::{ConsoleProgress, ExportProgress, Report, SilentProgress};
use snafu::{ResultExt, Snafu, ensure};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Top-level application errors for pcimage-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("cannot inspect image"))]
    Inspect {
        source: pcimage_util::InspectError,
    },

    #[snafu(display("{count} of {total} images have problems"))]
    Problems { count: usize, total: usize },

    #[snafu(display("cannot probe '{}'", path.display()))]
    Probe {
        path: PathBuf,
        source: pcimage::Error,
    },

    #[snafu(display("cannot open image '{}'", path.display()))]
    OpenImage {
        path: PathBuf,
        source: pcimage::Error,
    },

    #[snafu(display("failed to export image"))]
    Export {
        source: pcimage_util::ExportError,
    },

    #[snafu(display("cannot read '{}'", path.display()))]
    ReadPatch {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to patch image"))]
    Patch { source: pcimage_util::PatchError },

    #[snafu(display("failed to close image"))]
    Close { source: pcimage::Error },

    #[snafu(display("cannot install the log subscriber"))]
    Logging {
        source: tracing_subscriber::util::TryInitError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    match cli.command {
        Command::Info { images } => cmd_info(&images),
        Command::Probe { image } => cmd_probe(&image),
        Command::Export {
            image,
            output,
            overlay,
            quiet,
        } => cmd_export(&image, &output, overlay.as_deref(), quiet),
        Command::Patch {
            image,
            block,
            from,
            overlay,
        } => cmd_patch(&image, block, &from, overlay.as_deref()),
    }
}

/// Logs go to stderr. `RUST_LOG` takes precedence over `-v`.
fn init_logging(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .try_init()
        .context(LoggingSnafu)
}

fn cmd_info(images: &[PathBuf]) -> Result<()> {
    let results = pcimage_util::inspect_all(images);
    let total = results.len();
    let mut failed: usize = 0;

    for (i, result) in results.into_iter().enumerate() {
        if i > 0 {
            println!();
        }

        match result {
            Ok(report) => {
                print_report(&report);

                if !report.is_ok() {
                    failed += 1;
                }
            }
            Err(e) if total > 1 => {
                eprintln!("!!! {e}");
                failed += 1;
            }
            Err(e) => return Err(e).context(InspectSnafu),
        }
    }

    ensure!(
        failed == 0,
        ProblemsSnafu {
            count: failed,
            total
        }
    );

    Ok(())
}

fn print_report(report: &Report) {
    let desc = &report.descriptor;
    let stats = &report.stats;

    println!("Image: {}", report.path.display());
    println!();
    println!("Version:        {}", desc.head.version);

    if !desc.head.creator.is_empty() {
        println!("Creator:        {}", desc.head.creator);
    }

    println!("Filesystem:     {}", desc.fs.fs_type);
    println!("Block Size:     {} bytes", desc.fs.block_size);
    println!("Device Size:    {} bytes", desc.fs.device_size);
    println!("Total Blocks:   {}", desc.fs.total_blocks);
    println!("Checksum:       {:?}", desc.options.checksum_mode);
    println!("Bitmap Mode:    {:?}", desc.options.bitmap_mode);
    println!(
        "Bitmap:         {} used, {} unused, {} anomalous",
        stats.used, stats.unused, stats.anomalous
    );

    for anomaly in &stats.anomalies {
        println!(
            "  block {:>12}  value 0x{:02X}",
            anomaly.block, anomaly.value
        );
    }

    if let Some(last) = stats.last_used {
        println!("Last Used:      {last}");
    }

    println!("Data Start:     0x{:X}", report.data_offset);
    println!("Record Size:    {} bytes", report.record_size);
    println!("File Size:      {} bytes", report.file_size);
    println!(
        "Records:        {} ({} bytes partial)",
        report.records, report.partial
    );

    if report.is_ok() {
        println!("OK");
        return;
    }

    for problem in &report.problems {
        println!("  {problem}");
    }

    println!(
        "!!! {}: {} problems",
        report.path.display(),
        report.problems.len()
    );
}

fn cmd_probe(path: &Path) -> Result<()> {
    let kind = pcimage::probe_any(path).context(ProbeSnafu { path })?;

    println!("{}: {kind}", path.display());
    Ok(())
}

fn cmd_export(image: &Path, output: &Path, overlay: Option<&Path>, quiet: bool) -> Result<()> {
    let mut options = OpenOptions::new();

    // An existing overlay is applied; a missing one is not an error.
    if let Some(overlay) = overlay {
        options.mode(OpenMode::ReadWrite).overlay(overlay);
    }

    let mut handle = pcimage::open_any(image, &options).context(OpenImageSnafu { path: image })?;

    if !quiet {
        println!("Exporting {} to {}...", image.display(), output.display());
    }

    let start = std::time::Instant::now();

    let summary = if quiet {
        export_with(handle.as_mut(), output, &SilentProgress)?
    } else {
        export_with(handle.as_mut(), output, &ConsoleProgress::new())?
    };

    handle.close().context(CloseSnafu)?;

    if !quiet {
        println!(
            "Done in {:.2}s ({} of {} blocks hold data).",
            start.elapsed().as_secs_f64(),
            summary.written,
            summary.blocks
        );
    }

    Ok(())
}

fn export_with<P: ExportProgress>(
    image: &mut dyn pcimage::BlockImage,
    output: &Path,
    progress: &P,
) -> Result<pcimage_util::ExportSummary> {
    pcimage_util::export(image, output, progress).context(ExportSnafu)
}

fn cmd_patch(image: &Path, block: u64, from: &Path, overlay: Option<&Path>) -> Result<()> {
    let data = std::fs::read(from).context(ReadPatchSnafu { path: from })?;
    let mut options = OpenOptions::new();

    options.mode(OpenMode::ReadWrite);

    if let Some(overlay) = overlay {
        options.overlay(overlay);
    }

    let mut handle = pcimage::open_any(image, &options).context(OpenImageSnafu { path: image })?;
    let count = pcimage_util::patch(handle.as_mut(), block, &data).context(PatchSnafu)?;

    handle.close().context(CloseSnafu)?;

    println!("Patched {count} blocks starting at #{block}.");
    Ok(())
}
