//! Encode Queue
//!
//! Long-running encode-job server: persistent job queue, resource-aware
//! scheduling of external encoder processes, and a framed RPC protocol that
//! keeps connected clients in sync.

pub mod catalog;
pub mod concurrency;
pub mod encode;
pub mod hash;
pub mod hook;
pub mod job;
pub mod probe;
pub mod profile;
pub mod queue;
pub mod resource;
pub mod rpc;
pub mod scan;
pub mod scheduler;
pub mod server;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use encode_queue_config as config;
pub use encode_queue_config::Config;
pub use catalog::{Catalog, DataPaths, ServiceSetting, Setting};
pub use concurrency::{derive_parallelism, MAX_PARALLELISM};
pub use encode::{CommandEncoder, EncodeError, Encoder};
pub use job::{AddMode, Job, JobId, JobState};
pub use probe::{CommandProber, Prober};
pub use profile::{AutoSelectProfile, Profile};
pub use queue::QueueManager;
pub use resource::{Reservation, ResourceManager, ResourceRequest};
pub use rpc::{ClientMessage, ServerConnection, ServerMessage, TransportError};
pub use scheduler::{ScheduledQueue, WorkerPool};
pub use server::{Collaborators, EncodeServer, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use status::{new_shared_status, SharedStatus, StatusSnapshot, SystemMetrics};
pub use status_server::{create_status_router, run_status_server, StatusServerError};
pub use store::{QueueSnapshot, StoreError};
