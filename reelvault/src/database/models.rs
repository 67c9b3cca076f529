//! Database models.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A committed video, keyed by its content-derived hash.
///
/// Created exactly once per hash on first successful ingestion. The only
/// later mutation is setting `recompression_done`; deletion happens through
/// out-of-scope admin action, which the pipeline must tolerate.
#[derive(Debug, Clone, FromRow)]
pub struct VideoRecord {
    /// Content-derived identifier; also the directory name under `videos/`.
    pub video_hash: String,
    /// Owner's user id, from the upload request.
    pub added_by_userid: String,
    /// Owner's display name.
    pub added_by_username: String,
    /// Filename the video arrived with.
    pub orig_filename: String,
    /// Total frame count from the probe.
    pub total_frames: i64,
    /// Duration in seconds.
    pub duration: f64,
    /// Frame rate, stored as text to preserve exact rational values.
    pub fps: String,
    /// Raw probe output (JSON), kept for audits.
    pub raw_metadata: Option<String>,
    /// When the row was created.
    pub added_time: DateTime<Utc>,
    /// Set once transcoding has produced the playable artifact.
    pub recompression_done: Option<DateTime<Utc>>,
}
