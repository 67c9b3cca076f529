//! Metadata probing via ffprobe.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use worker_pool::{PoolError, TaskHandler};

use crate::pipeline::messages::{MediaMetadata, MetadataOutcome, MetadataRequest, StageFailure};
use crate::{Error, Result};

/// Abstraction over the probing tool, so tests can run the pipeline without
/// ffprobe on the machine.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, request: &MetadataRequest) -> Result<MediaMetadata>;
}

/// Real prober that shells out to ffprobe.
pub struct FfprobeProber {
    ffprobe: String,
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self {
            ffprobe: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, request: &MetadataRequest) -> Result<MediaMetadata> {
        let src = &request.src;
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(src)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::metadata(format!("failed to spawn {}: {e}", self.ffprobe)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::metadata(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::metadata(format!("unparseable ffprobe output: {e}")))?;

        let file_size = std::fs::metadata(src)?.len();
        extract_metadata(&json, request, file_size)
    }
}

/// Pull the fields the pipeline needs out of raw ffprobe JSON.
///
/// Some containers omit fields the pipeline needs, so each one has a
/// fallback chain. Frame count and frame rate can each be derived from the
/// other (via duration), but at least one of them must be probed directly;
/// deriving both would mean inventing numbers out of thin air.
pub fn extract_metadata(
    json: &serde_json::Value,
    request: &MetadataRequest,
    file_size: u64,
) -> Result<MediaMetadata> {
    let streams = json["streams"]
        .as_array()
        .ok_or_else(|| Error::metadata("no streams in ffprobe output"))?;
    let video = streams
        .iter()
        .find(|s| s["codec_type"].as_str() == Some("video"))
        .ok_or_else(|| Error::metadata("file contains no video stream"))?;
    let format = &json["format"];

    let codec = video["codec_name"]
        .as_str()
        .ok_or_else(|| Error::metadata("video stream has no codec name"))?
        .to_lowercase();

    // Duration: stream first, then container.
    let duration = parse_str_f64(&video["duration"])
        .or_else(|| parse_str_f64(&format["duration"]))
        .ok_or_else(|| Error::metadata("no duration in stream or container"))?;
    if duration <= 0.0 {
        return Err(Error::metadata(format!("non-positive duration {duration}")));
    }

    let probed_fps = video["avg_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate)
        .or_else(|| video["r_frame_rate"].as_str().and_then(parse_frame_rate));
    let probed_frames = parse_str_u64(&video["nb_frames"]);

    let (fps, total_frames) = match (probed_fps, probed_frames) {
        (Some(fps), Some(frames)) => (fps, frames),
        (Some(fps), None) => (fps, (duration * fps).round() as u64),
        (None, Some(frames)) => (frames as f64 / duration, frames),
        (None, None) => {
            return Err(Error::metadata(
                "neither frame rate nor frame count in probe output",
            ));
        }
    };

    // Bitrate: stream, then container, then estimate from size and duration.
    let bitrate = parse_str_u64(&video["bit_rate"])
        .or_else(|| parse_str_u64(&format["bit_rate"]))
        .unwrap_or_else(|| ((file_size as f64) * 8.0 / duration) as u64);
    let bitrate = u32::try_from(bitrate)
        .map_err(|_| Error::metadata(format!("implausible bitrate {bitrate}")))?;

    Ok(MediaMetadata {
        src: request.src.clone(),
        owner: request.owner.clone(),
        codec,
        duration,
        fps,
        total_frames,
        bitrate,
        raw_metadata: json.to_string(),
    })
}

/// ffprobe encodes numbers as JSON strings; accept either form.
fn parse_str_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn parse_str_u64(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Parse a frame rate like `30000/1001` or `25`. Returns `None` for the
/// `0/0` placeholder ffprobe emits on streams without a known rate.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate > 0.0).then_some(rate)
}

/// Worker-pool handler that probes submissions and reports outcomes back to
/// the dispatcher.
pub struct MetadataHandler {
    prober: std::sync::Arc<dyn MediaProber>,
    out: mpsc::UnboundedSender<MetadataOutcome>,
}

impl MetadataHandler {
    pub fn new(
        prober: std::sync::Arc<dyn MediaProber>,
        out: mpsc::UnboundedSender<MetadataOutcome>,
    ) -> Self {
        Self { prober, out }
    }
}

#[async_trait]
impl TaskHandler<MetadataRequest> for MetadataHandler {
    async fn handle(&self, request: MetadataRequest) -> std::result::Result<(), PoolError> {
        let outcome = match self.prober.probe(&request).await {
            Ok(metadata) => {
                tracing::debug!(
                    file = %request.src.display(),
                    codec = %metadata.codec,
                    bitrate = metadata.bitrate,
                    "probe ok"
                );
                MetadataOutcome::Ok(metadata)
            }
            Err(e) => {
                tracing::warn!(file = %request.src.display(), error = %e, "probe failed");
                MetadataOutcome::Failed(StageFailure {
                    src: request.src,
                    owner: request.owner,
                    msg: "Could not read video metadata.".to_string(),
                    details: e.to_string(),
                })
            }
        };

        self.out
            .send(outcome)
            .map_err(|_| PoolError::ChannelClosed("metadata results"))
    }
}
