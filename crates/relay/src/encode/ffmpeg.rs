//! FFmpeg HLS encoder module
//!
//! Builds ffmpeg invocations that pull a live RTSP/RTMP source and write a
//! rolling low-latency HLS playlist with fMP4 segments.

use std::path::Path;
use std::process::Command;

use hls_relay_config::EncoderConfig;

use super::EncoderCommand;
use crate::session::OutputPaths;
use crate::source::SourceLocator;

/// Segment file pattern inside a session's output directory
const SEGMENT_PATTERN: &str = "segment_%03d.m4s";

/// Transcoding policy shared by every session.
///
/// Codec choices are fixed; the rates and HLS window come from config so all
/// sessions behave the same way.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsPolicy {
    pub video_bitrate: String,
    pub audio_bitrate: String,
    /// Frames between forced keyframes
    pub keyframe_interval: u32,
    pub segment_seconds: u32,
    pub playlist_size: u32,
}

impl HlsPolicy {
    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self {
            video_bitrate: cfg.video_bitrate.clone(),
            audio_bitrate: cfg.audio_bitrate.clone(),
            keyframe_interval: cfg.keyframe_interval,
            segment_seconds: cfg.segment_seconds,
            playlist_size: cfg.playlist_size,
        }
    }
}

impl Default for HlsPolicy {
    fn default() -> Self {
        Self::from_config(&EncoderConfig::default())
    }
}

/// Build an ffmpeg command for one session
///
/// Creates a Command configured with:
/// - Input options chosen by the source scheme (TCP interleaving for RTSP)
/// - libx264 veryfast/zerolatency video at a bounded bitrate
/// - Forced keyframes at a fixed frame interval, scene-cut disabled
/// - AAC stereo audio
/// - HLS output rooted at the session's output directory
///
/// # Arguments
/// * `program` - Encoder binary name or path
/// * `source` - Validated source locator
/// * `output` - Session output directory and playlist path
/// * `policy` - Bitrates and HLS window
pub fn build_ffmpeg_command(
    program: &str,
    source: &SourceLocator,
    output: &OutputPaths,
    policy: &HlsPolicy,
) -> Command {
    let mut cmd = Command::new(program);

    cmd.args(["-hide_banner", "-loglevel", "info", "-nostats", "-nostdin"]);

    // Input
    if source.scheme().wants_reliable_transport() {
        cmd.arg("-rtsp_transport").arg("tcp");
    }
    cmd.arg("-i").arg(source.url());

    // Video
    cmd.args(["-c:v", "libx264"]);
    cmd.args(["-preset", "veryfast"]);
    cmd.args(["-tune", "zerolatency"]);
    cmd.args(["-pix_fmt", "yuv420p"]);
    cmd.args(["-profile:v", "main"]);
    cmd.arg("-b:v").arg(&policy.video_bitrate);
    cmd.arg("-x264opts").arg(format!(
        "keyint={0}:min-keyint={0}:no-scenecut",
        policy.keyframe_interval
    ));

    // Audio
    cmd.args(["-c:a", "aac"]);
    cmd.arg("-b:a").arg(&policy.audio_bitrate);
    cmd.args(["-ar", "44100"]);
    cmd.args(["-ac", "2"]);

    // HLS output
    cmd.args(["-f", "hls"]);
    cmd.arg("-hls_time").arg(policy.segment_seconds.to_string());
    cmd.arg("-hls_list_size").arg(policy.playlist_size.to_string());
    cmd.args(["-hls_flags", "delete_segments+append_list"]);
    cmd.args(["-hls_segment_type", "fmp4"]);
    cmd.arg("-hls_segment_filename")
        .arg(segment_template(&output.dir));
    cmd.arg(&output.manifest);

    cmd
}

fn segment_template(dir: &Path) -> std::path::PathBuf {
    dir.join(SEGMENT_PATTERN)
}

/// Production encoder: ffmpeg with the configured policy.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: String,
    policy: HlsPolicy,
}

impl FfmpegCommand {
    pub fn new(program: impl Into<String>, policy: HlsPolicy) -> Self {
        Self {
            program: program.into(),
            policy,
        }
    }

    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self::new(cfg.program.clone(), HlsPolicy::from_config(cfg))
    }
}

impl EncoderCommand for FfmpegCommand {
    fn build(&self, source: &SourceLocator, output: &OutputPaths) -> Command {
        build_ffmpeg_command(&self.program, source, output, &self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn paths() -> OutputPaths {
        OutputPaths::for_session(Path::new("/srv/hls"), SessionId::new(), "index.m3u8")
    }

    #[test]
    fn test_rtsp_gets_tcp_transport_before_input() {
        let source = SourceLocator::parse("rtsp://cam1/stream").unwrap();
        let cmd = build_ffmpeg_command("ffmpeg", &source, &paths(), &HlsPolicy::default());
        let args = get_command_args(&cmd);

        assert!(has_flag_with_value(&args, "-rtsp_transport", "tcp"));
        let transport = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(transport < input, "input options must precede -i");
    }

    #[test]
    fn test_rtmp_has_no_transport_hint() {
        let source = SourceLocator::parse("rtmp://ingest/live/abc").unwrap();
        let cmd = build_ffmpeg_command("ffmpeg", &source, &paths(), &HlsPolicy::default());
        let args = get_command_args(&cmd);

        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
        assert!(has_flag_with_value(&args, "-i", "rtmp://ingest/live/abc"));
    }

    #[test]
    fn test_manifest_is_last_argument() {
        let source = SourceLocator::parse("rtsp://cam1/stream").unwrap();
        let output = paths();
        let cmd = build_ffmpeg_command("ffmpeg", &source, &output, &HlsPolicy::default());
        let args = get_command_args(&cmd);

        assert_eq!(args.last().map(String::as_str), output.manifest.to_str());
        assert!(has_flag_with_value(
            &args,
            "-hls_segment_filename",
            output.dir.join("segment_%03d.m4s").to_str().unwrap()
        ));
    }

    #[test]
    fn test_default_policy_flags() {
        let source = SourceLocator::parse("rtsp://cam1/stream").unwrap();
        let cmd = build_ffmpeg_command("ffmpeg", &source, &paths(), &HlsPolicy::default());
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-tune", "zerolatency"));
        assert!(has_flag_with_value(&args, "-b:v", "500k"));
        assert!(has_flag_with_value(&args, "-x264opts", "keyint=30:min-keyint=30:no-scenecut"));
        assert!(has_flag_with_value(&args, "-f", "hls"));
        assert!(has_flag_with_value(&args, "-hls_time", "2"));
        assert!(has_flag_with_value(&args, "-hls_list_size", "5"));
        assert!(has_flag_with_value(&args, "-hls_segment_type", "fmp4"));
        assert!(args.iter().any(|a| a == "-nostdin"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Same source, same directory, same policy: same command.
        #[test]
        fn prop_command_is_deterministic(
            host in "[a-z0-9]{1,12}",
            path in "[a-zA-Z0-9_/]{1,20}",
            rtsp in proptest::bool::ANY,
            segment in 1u32..10,
            list_size in 1u32..20,
            keyint in 1u32..120,
        ) {
            let scheme = if rtsp { "rtsp" } else { "rtmp" };
            let source = SourceLocator::parse(&format!("{}://{}/{}", scheme, host, path)).unwrap();
            let output = paths();
            let policy = HlsPolicy {
                video_bitrate: "800k".to_string(),
                audio_bitrate: "96k".to_string(),
                keyframe_interval: keyint,
                segment_seconds: segment,
                playlist_size: list_size,
            };

            let first =
                get_command_args(&build_ffmpeg_command("ffmpeg", &source, &output, &policy));
            let second =
                get_command_args(&build_ffmpeg_command("ffmpeg", &source, &output, &policy));
            prop_assert_eq!(&first, &second);

            let hls_time = segment.to_string();
            let hls_list_size = list_size.to_string();
            let x264opts = format!("keyint={0}:min-keyint={0}:no-scenecut", keyint);
            prop_assert!(has_flag_with_value(&first, "-hls_time", &hls_time));
            prop_assert!(has_flag_with_value(&first, "-hls_list_size", &hls_list_size));
            prop_assert!(has_flag_with_value(&first, "-x264opts", &x264opts));
            prop_assert_eq!(rtsp, first.iter().any(|a| a == "-rtsp_transport"));
        }
    }
}
