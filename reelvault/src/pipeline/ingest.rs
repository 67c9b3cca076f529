//! Ingestion: identity, dedup, commit and cleanup.
//!
//! This is the only stage that mutates the library or the database. It gets
//! two kinds of work: metadata outcomes for fresh submissions and compression
//! successes for already-committed videos. Whatever happens, a submission
//! always ends as at least one [`UserResult`] and never as a file leaked in
//! a half-committed state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;
use worker_pool::{PoolError, TaskHandler, TaskQueue};

use crate::database::{VideoRecord, VideoRepository};
use crate::pipeline::compressor::transcode_plan;
use crate::pipeline::identity::compute_video_hash;
use crate::pipeline::messages::{
    CompressionJob, CompressionSuccess, IngestTask, MediaMetadata, MetadataOutcome, UserResult,
};
use crate::{Error, Result};

/// Name of the playable artifact inside a video's directory.
const PLAYABLE_NAME: &str = "video.mp4";

/// Subdirectory holding the untouched original.
const ORIG_SUBDIR: &str = "orig";

pub struct IngestHandler {
    repo: Arc<dyn VideoRepository>,
    videos_dir: PathBuf,
    rejected_dir: PathBuf,
    target_video_bitrate: u32,
    compress_queue: Arc<TaskQueue<CompressionJob>>,
    results: mpsc::UnboundedSender<UserResult>,
}

impl IngestHandler {
    pub fn new(
        repo: Arc<dyn VideoRepository>,
        videos_dir: PathBuf,
        rejected_dir: PathBuf,
        target_video_bitrate: u32,
        compress_queue: Arc<TaskQueue<CompressionJob>>,
        results: mpsc::UnboundedSender<UserResult>,
    ) -> Self {
        Self {
            repo,
            videos_dir,
            rejected_dir,
            target_video_bitrate,
            compress_queue,
            results,
        }
    }

    fn send(&self, result: UserResult) -> std::result::Result<(), PoolError> {
        if result.success {
            tracing::info!(owner = %result.owner, msg = %result.msg, "ingest result");
        } else {
            tracing::error!(
                owner = %result.owner,
                msg = %result.msg,
                details = result.details.as_deref().unwrap_or(""),
                "ingest result"
            );
        }
        self.results
            .send(result)
            .map_err(|_| PoolError::ChannelClosed("user results"))
    }

    /// Handle a metadata outcome for a fresh submission, including all of its
    /// failure paths. Always produces exactly one result.
    async fn on_metadata(&self, outcome: MetadataOutcome) -> UserResult {
        match outcome {
            MetadataOutcome::Failed(failure) => {
                let mut result = UserResult::failure(&failure.owner, failure.msg)
                    .with_file(&failure.src)
                    .with_details(failure.details);
                if let Err(e) = self.reject_file(&failure.src, None) {
                    result = append_cleanup_error(result, &e);
                }
                result
            }
            MetadataOutcome::Ok(metadata) => {
                let mut video_hash = None;
                match self.commit(&metadata, &mut video_hash).await {
                    Ok(result) => result,
                    Err(e) => {
                        let mut result = UserResult::failure(&metadata.owner, "Could not add video.")
                            .with_file(&metadata.src)
                            .with_details(e.to_string());
                        if let Some(hash) = &video_hash {
                            result = result.with_hash(hash.clone());
                        }
                        if let Err(cleanup) =
                            self.reject_file(&metadata.src, video_hash.as_deref())
                        {
                            result = append_cleanup_error(result, &cleanup);
                        }
                        result
                    }
                }
            }
        }
    }

    /// Take a probed submission all the way to a committed video (or to a
    /// duplicate verdict). `video_hash` is filled in as soon as the identity
    /// is known so the caller can clean up the right places on error.
    async fn commit(
        &self,
        metadata: &MediaMetadata,
        video_hash: &mut Option<String>,
    ) -> Result<UserResult> {
        let src = &metadata.src;
        if !src.is_file() {
            return Err(Error::other(format!(
                "submission '{}' vanished before ingestion",
                src.display()
            )));
        }

        let hash = compute_video_hash(src, &metadata.owner)?;
        let dir = self.videos_dir.join(&hash);

        if dir.exists() {
            match self.repo.get_video(&hash).await? {
                Some(existing) => {
                    return if existing.added_by_userid == metadata.owner {
                        // Same owner, same content: drop the fresh copy, the
                        // committed one stays untouched.
                        std::fs::remove_file(src)?;
                        Ok(UserResult::success(&metadata.owner, "You already have this video.")
                            .with_file(src)
                            .with_hash(hash))
                    } else {
                        Err(Error::IdentityConflict {
                            video_hash: hash,
                            owner: metadata.owner.clone(),
                        })
                    };
                }
                None => {
                    // Directory without a row is debris from an interrupted
                    // run. Reclaim it and ingest as new.
                    tracing::warn!(
                        video_hash = %hash,
                        dir = %dir.display(),
                        "found stale video directory with no database row, deleting"
                    );
                    std::fs::remove_dir_all(&dir)?;
                }
            }
        }

        let file_name = src
            .file_name()
            .ok_or_else(|| Error::other(format!("no file name in '{}'", src.display())))?;
        let orig_dir = dir.join(ORIG_SUBDIR);
        // From here on the directory is ours; record the hash so a failed
        // commit cleans up this directory and nobody else's.
        *video_hash = Some(hash.clone());
        std::fs::create_dir(&dir)?;
        std::fs::create_dir(&orig_dir)?;

        let committed = orig_dir.join(file_name);
        if committed.exists() {
            return Err(Error::other(format!(
                "'{}' already occupied in fresh video directory",
                committed.display()
            )));
        }
        std::fs::rename(src, &committed)?;
        if !committed.is_file() {
            return Err(Error::other(format!(
                "move to '{}' silently failed",
                committed.display()
            )));
        }

        self.repo
            .add_video(&VideoRecord {
                video_hash: hash.clone(),
                added_by_userid: metadata.owner.clone(),
                added_by_username: metadata.owner.clone(),
                orig_filename: file_name.to_string_lossy().into_owned(),
                total_frames: metadata.total_frames as i64,
                duration: metadata.duration,
                fps: format_fps(metadata.fps),
                raw_metadata: Some(metadata.raw_metadata.clone()),
                added_time: Utc::now(),
                recompression_done: None,
            })
            .await?;

        match transcode_plan(metadata, self.target_video_bitrate) {
            Some((reason, bitrate)) => {
                let dst = dir.join(format!("temp_{}.mp4", Uuid::new_v4()));
                tracing::info!(video_hash = %hash, reason = %reason, "queueing transcode");
                self.compress_queue.push(CompressionJob {
                    src: committed,
                    dst,
                    video_bitrate: bitrate,
                    video_hash: hash.clone(),
                    owner: metadata.owner.clone(),
                });
                Ok(
                    UserResult::success(&metadata.owner, "Video added. Transcoding started.")
                        .with_file(src)
                        .with_hash(hash)
                        .with_details(reason),
                )
            }
            None => {
                // Original is directly playable as-is. `video.mp4` is only
                // ever the product of a transcode; readers rely on its
                // presence to tell the two cases apart.
                Ok(
                    UserResult::success(&metadata.owner, "Video added.")
                        .with_file(src)
                        .with_hash(hash),
                )
            }
        }
    }

    /// Finalize a transcoded video. One submission may yield several results
    /// here: finalization sub-steps that fail are reported individually, and
    /// the transcode success itself is always reported last.
    async fn on_compression(&self, success: CompressionSuccess) -> Vec<UserResult> {
        let mut results = Vec::new();
        let dir = self.videos_dir.join(&success.video_hash);

        if let Err(e) = store_transcoder_logs(&dir, &success.stdout, &success.stderr) {
            results.push(
                UserResult::failure(&success.owner, "Could not store transcoder logs.")
                    .with_hash(success.video_hash.clone())
                    .with_details(e.to_string()),
            );
        }

        match self.switch_playable(&dir, &success.dst) {
            Ok(()) => {
                if let Err(e) = self.repo.set_video_recompressed(&success.video_hash).await {
                    results.push(
                        UserResult::failure(
                            &success.owner,
                            "Could not mark video as transcoded.",
                        )
                        .with_hash(success.video_hash.clone())
                        .with_details(e.to_string()),
                    );
                }
            }
            Err(e) => {
                results.push(
                    UserResult::failure(&success.owner, "Could not activate transcoded video.")
                        .with_hash(success.video_hash.clone())
                        .with_details(e.to_string()),
                );
            }
        }

        results.push(
            UserResult::success(&success.owner, "Transcoding finished.")
                .with_hash(success.video_hash.clone()),
        );
        results
    }

    /// Point `video.mp4` at `target` atomically. The link is created under a
    /// temporary name first so readers only ever see the old artifact or the
    /// new one, never a missing file.
    fn switch_playable(&self, dir: &Path, target: &Path) -> Result<()> {
        if !target.is_file() {
            return Err(Error::other(format!(
                "playable target '{}' does not exist",
                target.display()
            )));
        }
        let link_target = target.strip_prefix(dir).unwrap_or(target);
        let tmp = dir.join(format!(".{}.{}", PLAYABLE_NAME, Uuid::new_v4()));
        symlink_file(link_target, &tmp)?;
        std::fs::rename(&tmp, dir.join(PLAYABLE_NAME))?;
        Ok(())
    }

    /// Move a failed submission out of the way, leaving no trace in the
    /// library. With a known hash the original goes to `rejected/<hash>/` and
    /// the video directory is removed; without one the raw file goes straight
    /// under `rejected/`.
    ///
    /// Every step checks its postcondition: a cleanup that claims success
    /// while the debris is still there would corrupt later ingests of the
    /// same hash.
    fn reject_file(&self, src: &Path, video_hash: Option<&str>) -> Result<()> {
        let step = |what: &str, e: std::io::Error| Error::cleanup(format!("{what}: {e}"));

        if let Some(hash) = video_hash {
            let dir = self.videos_dir.join(hash);
            if dir.exists() {
                let file_name = src
                    .file_name()
                    .ok_or_else(|| Error::cleanup(format!("no file name in '{}'", src.display())))?;
                let committed = dir.join(ORIG_SUBDIR).join(file_name);

                if committed.is_file() {
                    let reject_dir = self.rejected_dir.join(hash);
                    std::fs::create_dir_all(&reject_dir)
                        .map_err(|e| step("creating rejection directory", e))?;
                    let dst = reject_dir.join(file_name);
                    if dst.exists() {
                        return Err(Error::cleanup(format!(
                            "rejection target '{}' already occupied",
                            dst.display()
                        )));
                    }
                    std::fs::rename(&committed, &dst)
                        .map_err(|e| step("moving original to rejected", e))?;
                    if committed.exists() || !dst.is_file() {
                        return Err(Error::cleanup(format!(
                            "moving '{}' to rejected did not take effect",
                            committed.display()
                        )));
                    }
                }

                std::fs::remove_dir_all(&dir)
                    .map_err(|e| step("removing video directory", e))?;
                if dir.exists() {
                    return Err(Error::cleanup(format!(
                        "video directory '{}' still present after removal",
                        dir.display()
                    )));
                }
            }
        }

        // If the file never made it out of its submission location (or there
        // was no hash to begin with), move it aside as-is.
        if src.is_file() {
            std::fs::create_dir_all(&self.rejected_dir)
                .map_err(|e| step("creating rejection directory", e))?;
            let file_name = src
                .file_name()
                .ok_or_else(|| Error::cleanup(format!("no file name in '{}'", src.display())))?;
            let dst = self.rejected_dir.join(file_name);
            if dst.exists() {
                return Err(Error::cleanup(format!(
                    "rejection target '{}' already occupied",
                    dst.display()
                )));
            }
            std::fs::rename(src, &dst).map_err(|e| step("moving file to rejected", e))?;
            if src.exists() || !dst.is_file() {
                return Err(Error::cleanup(format!(
                    "moving '{}' to rejected did not take effect",
                    src.display()
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler<IngestTask> for IngestHandler {
    async fn handle(&self, task: IngestTask) -> std::result::Result<(), PoolError> {
        match task {
            IngestTask::Metadata(outcome) => {
                let result = self.on_metadata(outcome).await;
                self.send(result)
            }
            IngestTask::Compression(success) => {
                for result in self.on_compression(success).await {
                    self.send(result)?;
                }
                Ok(())
            }
        }
    }
}

fn append_cleanup_error(mut result: UserResult, e: &Error) -> UserResult {
    let mut details = result.details.take().unwrap_or_default();
    if !details.is_empty() {
        details.push_str("; ");
    }
    details.push_str(&format!("cleanup also failed: {e}"));
    result.details = Some(details);
    result
}

/// Keep whole-number frame rates short, fractional ones precise.
fn format_fps(fps: f64) -> String {
    if (fps - fps.round()).abs() < f64::EPSILON {
        format!("{}", fps.round() as u64)
    } else {
        format!("{fps:.3}")
    }
}

fn store_transcoder_logs(dir: &Path, stdout: &str, stderr: &str) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::other(format!(
            "video directory '{}' is gone",
            dir.display()
        )));
    }
    std::fs::write(dir.join("ffmpeg.stdout.txt"), stdout)?;
    std::fs::write(dir.join("ffmpeg.stderr.txt"), stderr)?;
    Ok(())
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
