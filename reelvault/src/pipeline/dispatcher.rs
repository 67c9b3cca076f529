//! Dispatcher: owns the queues and pools, routes messages between them.
//!
//! Routing is the dispatcher's whole job. It never touches files or the
//! database itself; every decision here is a pure function of the message
//! being routed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use worker_pool::{default_worker_count, TaskQueue, WorkerPool, WorkerPoolConfig};

use crate::config::IngestConfig;
use crate::database::VideoRepository;
use crate::pipeline::compressor::{CompressorHandler, Transcoder};
use crate::pipeline::ingest::IngestHandler;
use crate::pipeline::messages::{
    CompressionJob, CompressionOutcome, IngestTask, MetadataOutcome, MetadataRequest, UserResult,
};
use crate::pipeline::monitor::IncomingMonitor;
use crate::pipeline::probe::{MediaProber, MetadataHandler};
use crate::Result;

/// How long an idle pool worker sleeps between queue checks.
const POOL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cloneable handle for submitting files into the pipeline with an explicit
/// owner (e.g. from an upload endpoint). Files dropped into the incoming
/// directory go through the monitor instead and get the configured default
/// owner.
#[derive(Clone)]
pub struct SubmitHandle {
    queue: Arc<TaskQueue<MetadataRequest>>,
}

impl SubmitHandle {
    pub fn submit(&self, src: PathBuf, owner: impl Into<String>) {
        self.queue.push(MetadataRequest {
            src,
            owner: owner.into(),
        });
    }
}

pub struct Dispatcher {
    config: IngestConfig,
    repo: Arc<dyn VideoRepository>,
    prober: Arc<dyn MediaProber>,
    transcoder: Arc<dyn Transcoder>,
    results: mpsc::UnboundedSender<UserResult>,
    token: CancellationToken,
    metadata_queue: Arc<TaskQueue<MetadataRequest>>,
}

impl Dispatcher {
    pub fn new(
        config: IngestConfig,
        repo: Arc<dyn VideoRepository>,
        prober: Arc<dyn MediaProber>,
        transcoder: Arc<dyn Transcoder>,
        results: mpsc::UnboundedSender<UserResult>,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            repo,
            prober,
            transcoder,
            results,
            token,
            metadata_queue: TaskQueue::new(),
        }
    }

    pub fn submit_handle(&self) -> SubmitHandle {
        SubmitHandle {
            queue: self.metadata_queue.clone(),
        }
    }

    fn workers(&self) -> usize {
        if self.config.max_workers == 0 {
            default_worker_count()
        } else {
            self.config.max_workers
        }
    }

    fn pool(&self, name: &'static str) -> WorkerPool {
        WorkerPool::with_parent_token(
            name,
            WorkerPoolConfig {
                workers: self.workers(),
                poll_interval: POOL_POLL_INTERVAL,
            },
            &self.token,
        )
    }

    /// Run the pipeline until the cancellation token fires, then stop the
    /// monitor and the pools and drain nothing further.
    pub async fn run(self) -> Result<()> {
        let compress_queue: Arc<TaskQueue<CompressionJob>> = TaskQueue::new();
        let ingest_queue: Arc<TaskQueue<IngestTask>> = TaskQueue::new();

        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<PathBuf>();
        let (metadata_tx, mut metadata_rx) = mpsc::unbounded_channel::<MetadataOutcome>();
        let (compress_tx, mut compress_rx) = mpsc::unbounded_channel::<CompressionOutcome>();

        let monitor = IncomingMonitor::new(
            self.config.incoming_dir(),
            self.config.poll_interval(),
            self.config.resubmit_delay(),
            incoming_tx,
            self.token.child_token(),
        );
        // The monitor only returns early on a fatal error. An unwatched
        // incoming directory must not masquerade as an idle pipeline, so its
        // death takes everything down.
        let monitor_token = self.token.clone();
        let monitor_handle = tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                tracing::error!(error = %e, "incoming monitor failed");
                monitor_token.cancel();
            }
        });

        let metadata_pool = self.pool("metadata");
        metadata_pool.start(
            self.metadata_queue.clone(),
            Arc::new(MetadataHandler::new(self.prober.clone(), metadata_tx)),
        );

        let compressor_pool = self.pool("compressor");
        compressor_pool.start(
            compress_queue.clone(),
            Arc::new(CompressorHandler::new(self.transcoder.clone(), compress_tx)),
        );

        let ingest_pool = self.pool("ingest");
        ingest_pool.start(
            ingest_queue.clone(),
            Arc::new(IngestHandler::new(
                self.repo.clone(),
                self.config.videos_dir(),
                self.config.rejected_dir(),
                self.config.target_video_bitrate,
                compress_queue.clone(),
                self.results.clone(),
            )),
        );

        tracing::info!(workers = self.workers(), "pipeline running");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(path) = incoming_rx.recv() => {
                    // Monitor finds files, never owners; attribution comes
                    // from configuration.
                    self.metadata_queue.push(MetadataRequest {
                        src: path,
                        owner: self.config.default_owner.clone(),
                    });
                }
                Some(outcome) = metadata_rx.recv() => {
                    ingest_queue.push(IngestTask::Metadata(outcome));
                }
                Some(outcome) = compress_rx.recv() => match outcome {
                    CompressionOutcome::Ok(success) => {
                        ingest_queue.push(IngestTask::Compression(success));
                    }
                    CompressionOutcome::Failed(failure) => {
                        // Nothing for ingestion to do; the committed video
                        // stays as it was, the user just hears about it.
                        tracing::error!(
                            file = %failure.src.display(),
                            details = %failure.details,
                            "compression failed"
                        );
                        let result = UserResult::failure(&failure.owner, failure.msg)
                            .with_file(failure.src)
                            .with_details(failure.details);
                        if self.results.send(result).is_err() {
                            tracing::warn!("user results channel closed");
                        }
                    }
                },
            }
        }

        tracing::info!("pipeline shutting down");
        metadata_pool.stop().await;
        compressor_pool.stop().await;
        ingest_pool.stop().await;

        if let Err(e) = monitor_handle.await {
            tracing::error!(error = %e, "incoming monitor panicked");
        }
        tracing::info!("pipeline stopped");
        Ok(())
    }
}
