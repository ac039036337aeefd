//! Library for inspecting, exporting and patching partclone images.
//!
//! This crate builds tooling on top of [`pcimage`]: a consistency report for
//! partclone images, export of the virtual block device to a plain file, and
//! writing replacement blocks into an overlay.
//!
//! # Example
//!
//! ```no_run
//! use pcimage_util::inspect;
//!
//! let report = inspect("sda1.img".as_ref()).expect("cannot inspect image");
//!
//! for problem in &report.problems {
//!     eprintln!("{problem}");
//! }
//! ```
//!
//! # Custom progress reporting
//!
//! You can implement the [`ExportProgress`] trait to receive progress updates
//! during export.

pub mod export;
pub mod inspect;
pub mod patch;
pub mod progress;

pub use self::export::{ExportError, ExportSummary, export};
pub use self::inspect::{InspectError, Problem, Report, inspect, inspect_all};
pub use self::patch::{PatchError, patch};
pub use self::progress::{ExportProgress, SilentProgress};

#[cfg(feature = "cli")]
pub use self::progress::ConsoleProgress;
