//! The video ingest pipeline.
//!
//! Stages are wired together by the [`Dispatcher`]: the incoming-directory
//! monitor feeds the metadata pool, metadata results feed the ingestion pool,
//! and the ingestion pool decides whether a compression round trip is needed.
//! Every stage converts its failures into result messages; the only
//! user-visible output is a stream of [`UserResult`]s.

pub mod compressor;
pub mod dispatcher;
pub mod identity;
pub mod ingest;
pub mod messages;
pub mod monitor;
pub mod probe;

pub use compressor::{CompressorHandler, FfmpegTranscoder, Transcoder};
pub use dispatcher::{Dispatcher, SubmitHandle};
pub use identity::compute_video_hash;
pub use ingest::IngestHandler;
pub use messages::{
    CompressionJob, CompressionOutcome, CompressionSuccess, IngestTask, MediaMetadata,
    MetadataOutcome, MetadataRequest, StageFailure, UserResult,
};
pub use monitor::IncomingMonitor;
pub use probe::{FfprobeProber, MediaProber, MetadataHandler};
