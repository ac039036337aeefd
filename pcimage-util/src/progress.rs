use std::path::Path;

/// Trait for receiving export progress updates.
///
/// All methods take `&self` so a reporter can be shared by reference.
pub trait ExportProgress: Send + Sync {
    /// Called once before the first block.
    fn start(&self, _output: &Path, _total_blocks: u64, _block_size: u32) {}

    /// Called after each batch of blocks has been processed.
    fn advance(&self, _blocks: u64) {}

    /// Called when every block has been exported.
    fn completed(&self, _written: u64) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ExportProgress for SilentProgress {}

/// Console progress reporter using an indicatif progress bar.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ExportProgress for ConsoleProgress {
    fn start(&self, _output: &Path, total_blocks: u64, _block_size: u32) {
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(total_blocks);
        self.bar.set_position(0);

        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} blocks [{elapsed_precise}, {eta} left]")
        {
            self.bar.set_style(style.progress_chars("━╸─"));
        }

        self.bar.reset();
    }

    fn advance(&self, blocks: u64) {
        self.bar.inc(blocks);
    }

    fn completed(&self, written: u64) {
        let total = self.bar.position();
        self.bar.finish_and_clear();
        println!("Export complete ({total} blocks, {written} with data).");
    }
}
