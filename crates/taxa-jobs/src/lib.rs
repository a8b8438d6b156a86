//! # taxa-jobs
//!
//! Queue-driven execution of taxon work: resolving names, merging
//! duplicates, resyncing parents and synonyms, harvesting occurrences.
//!
//! A [`JobWorker`] claims jobs of the types it has handlers for, runs each
//! under a timeout and records the result on the job row. Registry and
//! database failures requeue the job while retries remain; bad payloads
//! fail it outright.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taxa_jobs::{JobWorker, MergeDuplicatesHandler, WorkerConfig};
//!
//! let handle = JobWorker::new(Arc::new(db.jobs.clone()), WorkerConfig::from_env())
//!     .with_handler(MergeDuplicatesHandler::new(merge_engine))
//!     .with_wake(db.jobs.job_notify())
//!     .spawn();
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! ```

pub mod handler;
pub mod handlers;
pub mod worker;

pub use handler::{JobContext, JobHandler, JobResult};
pub use handlers::{
    HarvestOccurrencesHandler, HarvestPayload, MergeDuplicatesHandler, MergePayload,
    ResolvePayload, ResolveTaxonHandler, ResyncParentHandler, ResyncSynonymHandler, TaxonPayload,
};
pub use worker::{Dispatch, JobWorker, WorkerConfig, WorkerHandle};
