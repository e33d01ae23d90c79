//! Download jobs: model, status lifecycle, unit of work, and the processor
//! and pool that drive them.

pub mod model;
pub mod pool;
pub mod processor;
pub mod producer;
pub mod state;
pub mod work;

pub use model::{Backoff, DeliveredJob, DownloadPayload, JobId, JobOptions, JobOutcome};
pub use pool::{PoolSettings, PoolStats, WorkerPool, WorkerPoolHandle};
pub use processor::{JobProcessor, ProcessorDeps, ProcessorSettings};
pub use producer::JobProducer;
pub use state::{JobStatus, StatusRecord, StatusUpdate};
pub use work::{SimulatedDownload, UnitOfWork, WorkOutput, WorkRequest};
