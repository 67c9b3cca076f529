//! Repository traits and sqlx implementations.

mod video;

pub use video::{SqlxVideoRepository, VideoRepository};
