//! Transcoding policy and the ffmpeg-backed compressor pool.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use worker_pool::{PoolError, TaskHandler};

use crate::pipeline::messages::{
    CompressionJob, CompressionOutcome, CompressionSuccess, MediaMetadata, StageFailure,
};

/// Codecs that play everywhere we care about; anything else is transcoded.
const ACCEPTED_CODECS: [&str; 4] = ["h264", "avc", "hevc", "h265"];

/// Container extensions browsers handle directly.
const ACCEPTED_CONTAINERS: [&str; 2] = ["mp4", "mkv"];

/// A stream already this close to the target bitrate is not worth redoing.
const BITRATE_TOLERANCE: f64 = 1.2;

/// Output is never wider than this; narrower inputs keep their size.
const MAX_OUTPUT_WIDTH: u32 = 1920;

/// Audio settings for transcoded output.
const AUDIO_BITRATE: &str = "128k";

/// Clamp policy for the transcode target bitrate.
///
/// Never exceed the original (no upscaling), aim for `target_max`, but never
/// go below half the original so badly overcompressed output is impossible.
pub fn clamp_bitrate(orig_bitrate: u32, target_max: u32) -> u32 {
    (orig_bitrate / 2).max(target_max.min(orig_bitrate))
}

/// Decide whether a probed video needs a transcode pass.
///
/// Returns `None` when the original is already fine (accepted codec and
/// container, bitrate at or under the tolerance band around `target_max`).
/// Otherwise returns the human-readable reason and the clamped bitrate to
/// encode at.
pub fn transcode_plan(metadata: &MediaMetadata, target_max: u32) -> Option<(String, u32)> {
    let new_bitrate = clamp_bitrate(metadata.bitrate, target_max);

    let bitrate_fine =
        new_bitrate >= metadata.bitrate || f64::from(metadata.bitrate) <= f64::from(target_max) * BITRATE_TOLERANCE;
    let codec_fine = ACCEPTED_CODECS.contains(&metadata.codec.as_str());
    let container_fine = metadata
        .src
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ACCEPTED_CONTAINERS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false);

    if bitrate_fine && codec_fine && container_fine {
        return None;
    }

    let reason = if !codec_fine {
        format!("codec '{}' needs conversion", metadata.codec)
    } else if !container_fine {
        "container needs conversion".to_string()
    } else {
        format!(
            "bitrate {} exceeds target {}, transcoding at {}",
            metadata.bitrate, target_max, new_bitrate
        )
    };
    Some((reason, new_bitrate))
}

/// Abstraction over the transcoding tool, for tests without ffmpeg.
///
/// Both success and failure are ordinary outcomes here; a job only escalates
/// to a pool error when results can no longer be delivered at all.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, job: &CompressionJob) -> CompressionOutcome;
}

/// Real transcoder that shells out to ffmpeg.
pub struct FfmpegTranscoder {
    ffmpeg: String,
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        }
    }

    fn failure(job: &CompressionJob, msg: &str, details: String) -> CompressionOutcome {
        CompressionOutcome::Failed(StageFailure {
            src: job.src.clone(),
            owner: job.owner.clone(),
            msg: msg.to_string(),
            details,
        })
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

/// ffmpeg arguments for one job. Width is capped, height follows rounded to
/// a multiple of 8, audio is normalized to stereo AAC.
pub fn build_ffmpeg_args(src: &Path, dst: &Path, video_bitrate: u32) -> Vec<String> {
    [
        "-nostdin",
        "-hide_banner",
        "-nostats",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain([
        src.display().to_string(),
        "-map".into(),
        "0".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "faster".into(),
        "-vf".into(),
        format!("scale='min({MAX_OUTPUT_WIDTH},iw)':-8"),
        "-b:v".into(),
        video_bitrate.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-ac".into(),
        "2".into(),
        "-b:a".into(),
        AUDIO_BITRATE.into(),
        "-movflags".into(),
        "+faststart".into(),
        dst.display().to_string(),
    ])
    .collect()
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, job: &CompressionJob) -> CompressionOutcome {
        if !job.src.is_file() {
            return Self::failure(
                job,
                "Transcoding failed.",
                format!("source '{}' does not exist", job.src.display()),
            );
        }
        // The destination is a fresh unique name; finding it occupied means
        // something else wrote there and overwriting could destroy data.
        if job.dst.exists() {
            return Self::failure(
                job,
                "Transcoding failed.",
                format!("destination '{}' already exists", job.dst.display()),
            );
        }

        let args = build_ffmpeg_args(&job.src, &job.dst, job.video_bitrate);
        tracing::info!(
            video_hash = %job.video_hash,
            bitrate = job.video_bitrate,
            "transcoding with: {} {}",
            self.ffmpeg,
            args.join(" ")
        );

        let output = match Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                return Self::failure(
                    job,
                    "Transcoding failed.",
                    format!("failed to spawn {}: {e}", self.ffmpeg),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Self::failure(
                job,
                "Transcoding failed.",
                format!("ffmpeg exited with {}: {}", output.status, tail(&stderr, 2048)),
            );
        }
        if !job.dst.is_file() {
            return Self::failure(
                job,
                "Transcoding failed.",
                "ffmpeg reported success but produced no output file".to_string(),
            );
        }

        CompressionOutcome::Ok(CompressionSuccess {
            dst: job.dst.clone(),
            video_hash: job.video_hash.clone(),
            owner: job.owner.clone(),
            stdout,
            stderr,
        })
    }
}

/// Last `limit` bytes of a log, for error details that stay readable.
fn tail(text: &str, limit: usize) -> &str {
    match text.char_indices().rev().nth(limit) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Worker-pool handler running transcode jobs.
pub struct CompressorHandler {
    transcoder: std::sync::Arc<dyn Transcoder>,
    out: mpsc::UnboundedSender<CompressionOutcome>,
}

impl CompressorHandler {
    pub fn new(
        transcoder: std::sync::Arc<dyn Transcoder>,
        out: mpsc::UnboundedSender<CompressionOutcome>,
    ) -> Self {
        Self { transcoder, out }
    }
}

#[async_trait]
impl TaskHandler<CompressionJob> for CompressorHandler {
    async fn handle(&self, job: CompressionJob) -> std::result::Result<(), PoolError> {
        let outcome = self.transcoder.transcode(&job).await;
        match &outcome {
            CompressionOutcome::Ok(_) => {
                tracing::info!(video_hash = %job.video_hash, "transcode finished");
            }
            CompressionOutcome::Failed(failure) => {
                tracing::warn!(
                    video_hash = %job.video_hash,
                    error = %failure.details,
                    "transcode failed"
                );
            }
        }

        self.out
            .send(outcome)
            .map_err(|_| PoolError::ChannelClosed("compression results"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TARGET: u32 = 2_500_000;

    fn metadata(codec: &str, bitrate: u32, src: &str) -> MediaMetadata {
        MediaMetadata {
            src: PathBuf::from(src),
            owner: "alice".to_string(),
            codec: codec.to_string(),
            duration: 10.0,
            fps: 30.0,
            total_frames: 300,
            bitrate,
            raw_metadata: "{}".to_string(),
        }
    }

    #[test]
    fn clamp_never_exceeds_original() {
        assert_eq!(clamp_bitrate(1_000_000, TARGET), 1_000_000);
    }

    #[test]
    fn clamp_targets_max_for_moderate_overage() {
        assert_eq!(clamp_bitrate(4_000_000, TARGET), 2_500_000);
    }

    #[test]
    fn clamp_floors_at_half_original() {
        // 10 Mbps halves to 5 Mbps instead of dropping all the way to target.
        assert_eq!(clamp_bitrate(10_000_000, TARGET), 5_000_000);
    }

    #[test]
    fn accepted_codec_and_bitrate_skips_transcode() {
        assert!(transcode_plan(&metadata("h264", 2_000_000, "/v/clip.mp4"), TARGET).is_none());
        assert!(transcode_plan(&metadata("hevc", 1_000_000, "/v/clip.mkv"), TARGET).is_none());
    }

    #[test]
    fn bitrate_within_tolerance_skips_transcode() {
        // 1.2x target is inside the band.
        assert!(transcode_plan(&metadata("h264", 2_900_000, "/v/clip.mp4"), TARGET).is_none());
    }

    #[test]
    fn high_bitrate_triggers_transcode() {
        let (reason, bitrate) =
            transcode_plan(&metadata("h264", 8_000_000, "/v/clip.mp4"), TARGET).unwrap();
        assert!(reason.contains("bitrate"));
        assert_eq!(bitrate, 4_000_000); // half of original, above target
    }

    #[test]
    fn foreign_codec_triggers_transcode() {
        let (reason, bitrate) =
            transcode_plan(&metadata("vp9", 1_000_000, "/v/clip.mp4"), TARGET).unwrap();
        assert!(reason.contains("vp9"));
        assert_eq!(bitrate, 1_000_000); // low bitrate still never raised
    }

    #[test]
    fn foreign_container_triggers_transcode() {
        let (reason, _) =
            transcode_plan(&metadata("h264", 1_000_000, "/v/clip.avi"), TARGET).unwrap();
        assert!(reason.contains("container"));
    }

    #[test]
    fn ffmpeg_args_shape() {
        let args = build_ffmpeg_args(
            Path::new("/v/ab/orig/clip.mp4"),
            Path::new("/v/ab/out.mp4"),
            3_000_000,
        );
        assert_eq!(args.first().map(String::as_str), Some("-nostdin"));
        assert_eq!(args.last().map(String::as_str), Some("/v/ab/out.mp4"));
        let bv = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[bv + 1], "3000000");
        assert!(args.iter().any(|a| a.contains("min(1920,iw)")));
        assert!(!args.iter().any(|a| a == "-y")); // never overwrite
    }
}
