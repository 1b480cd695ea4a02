//! Encoder invocation for relay sessions

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, FfmpegCommand, HlsPolicy};

use std::process::Command;

use crate::session::OutputPaths;
use crate::source::SourceLocator;

/// Builds the process that transcodes one source into one output directory.
///
/// The manager only needs a ready-to-spawn command; what program runs and
/// with which arguments is up to the implementation.
pub trait EncoderCommand: Send + Sync + 'static {
    fn build(&self, source: &SourceLocator, output: &OutputPaths) -> Command;
}
