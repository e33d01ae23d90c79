//! Persistence collaborators: the job status store and the artifact store.

pub mod memory;
pub mod redis_backend;
pub mod retry;
pub mod s3_backend;
pub mod traits;

pub use memory::{MemoryArtifactStore, MemoryStatusStore};
pub use redis_backend::RedisStatusStore;
pub use retry::RetryPolicy;
pub use s3_backend::S3ArtifactStore;
pub use traits::{ArtifactStore, BucketCreation, StatusStore};
