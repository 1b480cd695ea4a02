//! Startup checks for the relay
//!
//! Preflight checks run before the HTTP listener opens:
//! - The encoder binary runs and reports a parseable version
//! - The encoder was built with the codecs every session needs
//! - The output root exists and holds nothing from a previous run

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::info;

use crate::cleaner::{sweep_stale_outputs, CleanupError};

/// Codecs the HLS pipeline encodes with
pub const REQUIRED_CODECS: &[&str] = &["libx264", "aac"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Encoder {program} lacks required codec {codec}")]
    MissingCodec { program: String, codec: String },

    #[error("Cannot prepare output root {path}: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot clear stale outputs: {0}")]
    Sweep(#[from] CleanupError),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Whether `codec` appears as an encoder name in `-encoders` output.
///
/// Listing rows look like ` V....D libx264  libx264 H.264 ...`: a flags
/// column followed by the encoder name.
pub fn encoder_listed(encoders_output: &str, codec: &str) -> bool {
    encoders_output.lines().any(|line| {
        let mut columns = line.split_whitespace();
        matches!((columns.next(), columns.next()), (Some(_), Some(name)) if name == codec)
    })
}

/// Check that `program -version` runs and reports a version
///
/// # Returns
/// * `Ok(major)` - major version of the encoder
/// * `Err(StartupError::EncoderUnavailable)` - binary missing or unparseable
pub fn check_encoder_available(program: &str) -> Result<u32, StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} -version failed; is it installed and in PATH? Error: {}",
            program, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::EncoderUnavailable(format!(
            "Could not parse version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Check that the encoder can produce H.264 and AAC
pub fn check_required_codecs(program: &str) -> Result<(), StartupError> {
    let output = Command::new(program)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!("{} -encoders failed: {}", program, e))
        })?;

    let listing = String::from_utf8_lossy(&output.stdout);
    for codec in REQUIRED_CODECS {
        if !encoder_listed(&listing, codec) {
            return Err(StartupError::MissingCodec {
                program: program.to_string(),
                codec: codec.to_string(),
            });
        }
    }
    Ok(())
}

/// Run the encoder checks in order: version, then codecs
pub fn run_startup_checks(program: &str) -> Result<(), StartupError> {
    let major = check_encoder_available(program)?;
    check_required_codecs(program)?;
    info!(program, major, "encoder available");
    Ok(())
}

/// Create the output root and remove session directories left by a previous run.
pub async fn prepare_output_root(root: &Path) -> Result<(), StartupError> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|source| StartupError::OutputRoot {
            path: root.to_path_buf(),
            source,
        })?;
    sweep_stale_outputs(root).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_multiline() {
        let output = r#"ffmpeg version n6.1-5-g1234567 Copyright (c) 2000-2023
built with gcc 12.2.0
configuration: --enable-gpl --enable-libx264"#;
        assert_eq!(parse_ffmpeg_version(output), Some(6));
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_encoder_listed() {
        let listing = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264 / AVC\n A....D aac                  AAC (Advanced Audio Coding)\n";
        assert!(encoder_listed(listing, "libx264"));
        assert!(encoder_listed(listing, "aac"));
        assert!(!encoder_listed(listing, "libx265"));
        // Substrings of a description do not count
        assert!(!encoder_listed(listing, "H.264"));
    }

    #[test]
    fn test_missing_encoder_is_reported() {
        let err = check_encoder_available("/nonexistent/ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::EncoderUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/ffmpeg"));
    }

    #[tokio::test]
    async fn test_prepare_output_root_creates_and_sweeps() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("hls_streams");

        prepare_output_root(&root).await.unwrap();
        assert!(root.is_dir());

        std::fs::create_dir_all(root.join("4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b")).unwrap();
        prepare_output_root(&root).await.unwrap();
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }
}
