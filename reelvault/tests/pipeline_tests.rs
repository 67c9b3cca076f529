//! End-to-end pipeline tests with scripted probe and transcode doubles.
//!
//! The real prober and transcoder shell out to ffprobe/ffmpeg; these tests
//! swap in doubles so the full dispatcher, queues, pools and filesystem
//! behavior run without external tools.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use reelvault::config::IngestConfig;
use reelvault::database::{
    init_pool, run_migrations, SqlxVideoRepository, VideoRecord, VideoRepository,
};
use reelvault::pipeline::{
    compute_video_hash, CompressionJob, CompressionOutcome, CompressionSuccess, Dispatcher,
    MediaMetadata, MediaProber, MetadataRequest, StageFailure, SubmitHandle, Transcoder,
    UserResult,
};
use reelvault::Error;

/// Prober double returning a fixed codec and bitrate, or a scripted error.
struct ScriptedProber {
    codec: &'static str,
    bitrate: u32,
    fail_with: Option<&'static str>,
}

impl ScriptedProber {
    fn ok(codec: &'static str, bitrate: u32) -> Arc<Self> {
        Arc::new(Self {
            codec,
            bitrate,
            fail_with: None,
        })
    }

    fn failing(details: &'static str) -> Arc<Self> {
        Arc::new(Self {
            codec: "",
            bitrate: 0,
            fail_with: Some(details),
        })
    }
}

#[async_trait]
impl MediaProber for ScriptedProber {
    async fn probe(&self, request: &MetadataRequest) -> reelvault::Result<MediaMetadata> {
        if let Some(details) = self.fail_with {
            return Err(Error::metadata(details));
        }
        Ok(MediaMetadata {
            src: request.src.clone(),
            owner: request.owner.clone(),
            codec: self.codec.to_string(),
            duration: 10.0,
            fps: 30.0,
            total_frames: 300,
            bitrate: self.bitrate,
            raw_metadata: "{}".to_string(),
        })
    }
}

/// Transcoder double that writes a marker file on success.
struct ScriptedTranscoder {
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedTranscoder {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn transcode(&self, job: &CompressionJob) -> CompressionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return CompressionOutcome::Failed(StageFailure {
                src: job.src.clone(),
                owner: job.owner.clone(),
                msg: "Transcoding failed.".to_string(),
                details: "scripted encoder failure".to_string(),
            });
        }
        std::fs::write(&job.dst, b"transcoded bytes").expect("write transcode output");
        CompressionOutcome::Ok(CompressionSuccess {
            dst: job.dst.clone(),
            video_hash: job.video_hash.clone(),
            owner: job.owner.clone(),
            stdout: "scripted encoder stdout".to_string(),
            stderr: String::new(),
        })
    }
}

struct Harness {
    config: IngestConfig,
    repo: Arc<SqlxVideoRepository>,
    submit: SubmitHandle,
    results: mpsc::UnboundedReceiver<UserResult>,
    token: CancellationToken,
    /// Staging area for explicit submissions. Kept out of `incoming/` so the
    /// monitor never races the test for the same file.
    uploads_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

impl Harness {
    async fn start(prober: Arc<dyn MediaProber>, transcoder: Arc<dyn Transcoder>) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = IngestConfig {
            data_dir: tmp.path().to_path_buf(),
            max_workers: 2,
            poll_interval_secs: 0.05,
            resubmit_delay_secs: 0.5,
            ..Default::default()
        };
        let uploads_dir = tmp.path().join("uploads");
        for dir in [
            config.incoming_dir(),
            config.videos_dir(),
            config.rejected_dir(),
            uploads_dir.clone(),
        ] {
            std::fs::create_dir_all(dir).expect("data dirs");
        }

        let pool = init_pool(&config.database_url()).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        let repo = Arc::new(SqlxVideoRepository::new(pool));

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            config.clone(),
            repo.clone(),
            prober,
            transcoder,
            results_tx,
            token.clone(),
        );
        let submit = dispatcher.submit_handle();
        tokio::spawn(dispatcher.run());

        Self {
            config,
            repo,
            submit,
            results: results_rx,
            token,
            uploads_dir,
            _tmp: tmp,
        }
    }

    /// Write a file into the staging area for an explicit submission.
    fn stage_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.uploads_dir.join(name);
        std::fs::write(&path, contents).expect("write staged file");
        path
    }

    /// Write a file into `incoming/` for the monitor to find.
    fn drop_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.config.incoming_dir().join(name);
        std::fs::write(&path, contents).expect("write incoming file");
        path
    }

    async fn next_result(&mut self) -> UserResult {
        timeout(Duration::from_secs(5), self.results.recv())
            .await
            .expect("timed out waiting for a result")
            .expect("results channel closed")
    }

    async fn expect_no_result(&mut self) {
        let extra = timeout(Duration::from_millis(400), self.results.recv()).await;
        assert!(extra.is_err(), "unexpected extra result: {:?}", extra);
    }

    fn video_dir(&self, hash: &str) -> PathBuf {
        self.config.videos_dir().join(hash)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn playable_bytes(dir: &Path) -> Vec<u8> {
    std::fs::read(dir.join("video.mp4")).expect("read video.mp4")
}

#[tokio::test]
async fn high_bitrate_video_is_committed_and_transcoded() {
    let transcoder = ScriptedTranscoder::ok();
    let mut h = Harness::start(ScriptedProber::ok("hevc", 8_000_000), transcoder.clone()).await;

    let src = h.stage_file("clip.mp4", b"raw hevc bytes");
    let hash = compute_video_hash(&src, "alice").expect("hash");
    h.submit.submit(src.clone(), "alice");

    let added = h.next_result().await;
    assert!(added.success);
    assert_eq!(added.msg, "Video added. Transcoding started.");
    assert_eq!(added.video_hash.as_deref(), Some(hash.as_str()));

    let done = h.next_result().await;
    assert!(done.success);
    assert_eq!(done.msg, "Transcoding finished.");

    let dir = h.video_dir(&hash);
    assert!(!src.exists(), "submission should have been consumed");
    assert_eq!(
        std::fs::read(dir.join("orig").join("clip.mp4")).expect("read original"),
        b"raw hevc bytes"
    );
    assert_eq!(playable_bytes(&dir), b"transcoded bytes");
    assert!(dir.join("ffmpeg.stdout.txt").is_file());
    assert!(dir.join("ffmpeg.stderr.txt").is_file());
    assert_eq!(transcoder.call_count(), 1);

    let record = h.repo.get_video(&hash).await.expect("query").expect("row");
    assert_eq!(record.added_by_userid, "alice");
    assert_eq!(record.orig_filename, "clip.mp4");
    assert!(record.recompression_done.is_some());
}

#[tokio::test]
async fn compliant_video_skips_transcoding() {
    let transcoder = ScriptedTranscoder::ok();
    let mut h = Harness::start(ScriptedProber::ok("h264", 2_000_000), transcoder.clone()).await;

    let src = h.stage_file("fine.mp4", b"already fine bytes");
    let hash = compute_video_hash(&src, "alice").expect("hash");
    h.submit.submit(src, "alice");

    let added = h.next_result().await;
    assert!(added.success);
    assert_eq!(added.msg, "Video added.");
    h.expect_no_result().await;

    // Only the committed original; video.mp4 appears solely as the product
    // of a transcode, and none happened here.
    let dir = h.video_dir(&hash);
    assert_eq!(
        std::fs::read(dir.join("orig").join("fine.mp4")).expect("original"),
        b"already fine bytes"
    );
    assert!(!dir.join("video.mp4").exists());
    assert_eq!(transcoder.call_count(), 0);

    let record = h.repo.get_video(&hash).await.expect("query").expect("row");
    assert!(record.recompression_done.is_none());
}

#[tokio::test]
async fn unreadable_file_lands_in_rejected() {
    let mut h = Harness::start(
        ScriptedProber::failing("no video stream found"),
        ScriptedTranscoder::ok(),
    )
    .await;

    let src = h.stage_file("not_a_video.txt", b"plain text");
    h.submit.submit(src.clone(), "alice");

    let result = h.next_result().await;
    assert!(!result.success);
    assert_eq!(result.msg, "Could not read video metadata.");
    assert!(result
        .details
        .as_deref()
        .unwrap_or("")
        .contains("no video stream"));

    assert!(!src.exists());
    let rejected = h.config.rejected_dir().join("not_a_video.txt");
    assert_eq!(std::fs::read(rejected).expect("rejected file"), b"plain text");
    // Nothing was committed.
    assert!(std::fs::read_dir(h.config.videos_dir())
        .expect("videos")
        .next()
        .is_none());
}

#[tokio::test]
async fn resubmitting_same_video_is_idempotent() {
    let mut h =
        Harness::start(ScriptedProber::ok("h264", 2_000_000), ScriptedTranscoder::ok()).await;

    let src = h.stage_file("clip.mp4", b"some bytes");
    let hash = compute_video_hash(&src, "alice").expect("hash");
    h.submit.submit(src, "alice");
    assert!(h.next_result().await.success);

    // Same name, same content, same owner again.
    let src = h.stage_file("clip.mp4", b"some bytes");
    h.submit.submit(src.clone(), "alice");

    let result = h.next_result().await;
    assert!(result.success);
    assert_eq!(result.msg, "You already have this video.");
    assert_eq!(result.video_hash.as_deref(), Some(hash.as_str()));

    // The fresh copy is gone and the committed video is untouched.
    assert!(!src.exists());
    let dir = h.video_dir(&hash);
    assert_eq!(
        std::fs::read(dir.join("orig").join("clip.mp4")).expect("original"),
        b"some bytes"
    );
    assert!(h.repo.get_video(&hash).await.expect("query").is_some());
}

#[tokio::test]
async fn hash_collision_with_other_owner_leaves_existing_video_intact() {
    let mut h =
        Harness::start(ScriptedProber::ok("h264", 2_000_000), ScriptedTranscoder::ok()).await;

    let src = h.stage_file("clip.mp4", b"bob's bytes");
    let hash = compute_video_hash(&src, "bob").expect("hash");

    // Somebody else already holds this hash.
    let dir = h.video_dir(&hash);
    std::fs::create_dir_all(dir.join("orig")).expect("existing dir");
    std::fs::write(dir.join("orig").join("other.mp4"), b"mallory's bytes")
        .expect("existing file");
    h.repo
        .add_video(&VideoRecord {
            video_hash: hash.clone(),
            added_by_userid: "mallory".to_string(),
            added_by_username: "mallory".to_string(),
            orig_filename: "other.mp4".to_string(),
            total_frames: 1,
            duration: 1.0,
            fps: "30".to_string(),
            raw_metadata: None,
            added_time: chrono::Utc::now(),
            recompression_done: None,
        })
        .await
        .expect("seed row");

    h.submit.submit(src.clone(), "bob");
    let result = h.next_result().await;
    assert!(!result.success);
    assert!(result
        .details
        .as_deref()
        .unwrap_or("")
        .contains("Identity conflict"));

    // The existing video and its row survived; bob's file moved aside.
    assert_eq!(
        std::fs::read(dir.join("orig").join("other.mp4")).expect("existing original"),
        b"mallory's bytes"
    );
    let record = h.repo.get_video(&hash).await.expect("query").expect("row");
    assert_eq!(record.added_by_userid, "mallory");
    assert!(!src.exists());
    assert!(h.config.rejected_dir().join("clip.mp4").is_file());
}

#[tokio::test]
async fn stale_directory_without_row_is_reclaimed() {
    let mut h =
        Harness::start(ScriptedProber::ok("h264", 2_000_000), ScriptedTranscoder::ok()).await;

    let src = h.stage_file("clip.mp4", b"fresh bytes");
    let hash = compute_video_hash(&src, "alice").expect("hash");

    // Debris from an interrupted run: directory on disk, no database row.
    let dir = h.video_dir(&hash);
    std::fs::create_dir_all(dir.join("orig")).expect("stale dir");
    std::fs::write(dir.join("orig").join("leftover.mp4"), b"stale").expect("stale file");

    h.submit.submit(src, "alice");
    let result = h.next_result().await;
    assert!(result.success, "stale dir should not block ingestion: {:?}", result);
    assert_eq!(result.msg, "Video added.");

    // Reingested cleanly: the debris is gone, the fresh original is in.
    assert!(!dir.join("orig").join("leftover.mp4").exists());
    assert_eq!(
        std::fs::read(dir.join("orig").join("clip.mp4")).expect("original"),
        b"fresh bytes"
    );
    assert!(h.repo.get_video(&hash).await.expect("query").is_some());
}

#[tokio::test]
async fn failed_transcode_keeps_committed_original() {
    let transcoder = ScriptedTranscoder::failing();
    let mut h = Harness::start(ScriptedProber::ok("vp9", 1_000_000), transcoder.clone()).await;

    let src = h.stage_file("clip.mp4", b"vp9 bytes");
    let hash = compute_video_hash(&src, "alice").expect("hash");
    h.submit.submit(src, "alice");

    let added = h.next_result().await;
    assert!(added.success);
    assert_eq!(added.msg, "Video added. Transcoding started.");

    let failed = h.next_result().await;
    assert!(!failed.success);
    assert_eq!(failed.msg, "Transcoding failed.");
    assert!(failed
        .details
        .as_deref()
        .unwrap_or("")
        .contains("scripted encoder failure"));

    // The commit stands; only the playable artifact is missing.
    let dir = h.video_dir(&hash);
    assert_eq!(
        std::fs::read(dir.join("orig").join("clip.mp4")).expect("original"),
        b"vp9 bytes"
    );
    assert!(!dir.join("video.mp4").exists());
    let record = h.repo.get_video(&hash).await.expect("query").expect("row");
    assert!(record.recompression_done.is_none());
}

#[tokio::test]
async fn occupied_rejection_target_reports_cleanup_failure() {
    let mut h = Harness::start(
        ScriptedProber::failing("no video stream found"),
        ScriptedTranscoder::ok(),
    )
    .await;

    // The rejection slot for this name is already taken; moving the new
    // failure there would overwrite evidence, so cleanup must refuse.
    std::fs::write(h.config.rejected_dir().join("broken.mp4"), b"earlier reject")
        .expect("occupy rejection slot");

    let src = h.stage_file("broken.mp4", b"new broken bytes");
    h.submit.submit(src.clone(), "alice");

    let result = h.next_result().await;
    assert!(!result.success);
    let details = result.details.as_deref().unwrap_or("");
    assert!(details.contains("no video stream"), "primary error kept: {details}");
    assert!(details.contains("cleanup also failed"), "cleanup appended: {details}");
    assert!(details.contains("already occupied"), "cleanup cause named: {details}");

    // The upload sits at exactly one location (its submission path) and the
    // earlier rejected file was left alone.
    assert_eq!(std::fs::read(&src).expect("still staged"), b"new broken bytes");
    assert_eq!(
        std::fs::read(h.config.rejected_dir().join("broken.mp4")).expect("old reject"),
        b"earlier reject"
    );
}

#[tokio::test]
async fn monitor_attributes_found_files_to_default_owner() {
    let mut h =
        Harness::start(ScriptedProber::ok("h264", 2_000_000), ScriptedTranscoder::ok()).await;

    // No explicit submission: the monitor has to find the file on its own.
    let src = h.drop_file("dropped.mp4", b"dropped in by hand");

    let result = h.next_result().await;
    assert!(result.success);
    assert_eq!(result.owner, "admin");
    assert!(!src.exists());
}
