//! Message contracts between pipeline stages.
//!
//! These are plain data carried over queues and channels; no stage reaches
//! into another stage's state. Paths always travel with the owner they were
//! submitted under so any stage can produce a complete [`UserResult`].

use std::path::PathBuf;

use serde::Serialize;

/// Request to probe a submitted file.
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    /// Absolute path of the submitted file, still at its submission location.
    pub src: PathBuf,
    /// User id the submission is attributed to.
    pub owner: String,
}

/// Technical metadata extracted from a media file.
#[derive(Debug, Clone)]
pub struct MediaMetadata {
    pub src: PathBuf,
    pub owner: String,
    /// Video codec name as reported by the prober (e.g. `h264`, `hevc`).
    pub codec: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Frames per second.
    pub fps: f64,
    /// Total frame count.
    pub total_frames: u64,
    /// Video bitrate in bits per second.
    pub bitrate: u32,
    /// Full prober output (JSON), stored verbatim for audits.
    pub raw_metadata: String,
}

/// A stage failure tied to a specific submission.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub src: PathBuf,
    pub owner: String,
    /// Short user-facing message.
    pub msg: String,
    /// Technical detail for diagnostics.
    pub details: String,
}

/// Outcome of the metadata stage for one submission.
#[derive(Debug, Clone)]
pub enum MetadataOutcome {
    Ok(MediaMetadata),
    Failed(StageFailure),
}

/// A transcoding job for the compressor pool.
#[derive(Debug, Clone)]
pub struct CompressionJob {
    /// Source file, already committed under `videos/<hash>/orig/`.
    pub src: PathBuf,
    /// Destination the transcoder must create. Must not exist yet.
    pub dst: PathBuf,
    /// Target video bitrate in bits per second.
    pub video_bitrate: u32,
    pub video_hash: String,
    pub owner: String,
}

/// Successful transcode, with the captured encoder logs.
#[derive(Debug, Clone)]
pub struct CompressionSuccess {
    pub dst: PathBuf,
    pub video_hash: String,
    pub owner: String,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of one compression job.
#[derive(Debug, Clone)]
pub enum CompressionOutcome {
    Ok(CompressionSuccess),
    Failed(StageFailure),
}

/// Work item for the ingestion pool.
///
/// A single tagged input makes the two entry points explicit instead of a
/// pair of optional arguments that must never both be set.
#[derive(Debug, Clone)]
pub enum IngestTask {
    /// A probe finished (or failed); decide the submission's fate.
    Metadata(MetadataOutcome),
    /// A transcode finished; finalize the playable artifact.
    Compression(CompressionSuccess),
}

/// A user-facing result message, the pipeline's only output.
#[derive(Debug, Clone, Serialize)]
pub struct UserResult {
    pub success: bool,
    /// Path the submission arrived as; empty for results produced after the
    /// original file has been committed (e.g. transcode completion).
    pub orig_file: PathBuf,
    /// Video hash, when one was computed before the result was produced.
    pub video_hash: Option<String>,
    pub owner: String,
    /// Short human-readable message.
    pub msg: String,
    /// Technical detail, mostly for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl UserResult {
    pub fn success(owner: &str, msg: impl Into<String>) -> Self {
        Self {
            success: true,
            orig_file: PathBuf::new(),
            video_hash: None,
            owner: owner.to_string(),
            msg: msg.into(),
            details: None,
        }
    }

    pub fn failure(owner: &str, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            orig_file: PathBuf::new(),
            video_hash: None,
            owner: owner.to_string(),
            msg: msg.into(),
            details: None,
        }
    }

    pub fn with_file(mut self, src: impl Into<PathBuf>) -> Self {
        self.orig_file = src.into();
        self
    }

    pub fn with_hash(mut self, video_hash: impl Into<String>) -> Self {
        self.video_hash = Some(video_hash.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
