//! Paired video and audio streams: combined progress, join barrier and merge.

pub mod compile;
pub mod coordinator;
pub mod progress;

pub use compile::{CompileJob, FfmpegCompiler, MediaCompiler};
pub use coordinator::{DualStreamCoordinator, SideOutcome};
pub use progress::{PairProgress, Side};
