//! Video repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::database::models::VideoRecord;
use crate::{Error, Result};

/// Narrow persistence interface the pipeline depends on.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Insert a new video row. Fails if the hash already exists.
    async fn add_video(&self, video: &VideoRecord) -> Result<()>;

    /// Look up a video by hash. `None` if no row exists.
    async fn get_video(&self, video_hash: &str) -> Result<Option<VideoRecord>>;

    /// Set the recompression timestamp to now.
    ///
    /// Returns `NotFound` if the row has vanished in the meantime (a user or
    /// admin may delete videos while the pipeline is working on them).
    async fn set_video_recompressed(&self, video_hash: &str) -> Result<()>;
}

/// SQLx implementation of [`VideoRepository`].
pub struct SqlxVideoRepository {
    pool: SqlitePool,
}

impl SqlxVideoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VideoRepository for SqlxVideoRepository {
    async fn add_video(&self, video: &VideoRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO videos (video_hash, added_by_userid, added_by_username, orig_filename, \
             total_frames, duration, fps, raw_metadata, added_time, recompression_done) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&video.video_hash)
        .bind(&video.added_by_userid)
        .bind(&video.added_by_username)
        .bind(&video.orig_filename)
        .bind(video.total_frames)
        .bind(video.duration)
        .bind(&video.fps)
        .bind(&video.raw_metadata)
        .bind(video.added_time.to_rfc3339())
        .bind(video.recompression_done.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_video(&self, video_hash: &str) -> Result<Option<VideoRecord>> {
        let video =
            sqlx::query_as::<_, VideoRecord>("SELECT * FROM videos WHERE video_hash = ?")
                .bind(video_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(video)
    }

    async fn set_video_recompressed(&self, video_hash: &str) -> Result<()> {
        let result = sqlx::query("UPDATE videos SET recompression_done = ? WHERE video_hash = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(video_hash)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("video", video_hash));
        }
        Ok(())
    }
}
