//! # User Metrics Common Library
//!
//! Shared metric-computation pipeline for the metric classes and the
//! metrics API:
//! - Cohort resolution (expressions and tag names to subject id sets)
//! - Parallel batch execution of per-subject workers
//! - Request signature cache with key-path to route inversion
//! - Warehouse access and configuration loading

pub mod cache;
pub mod cohort;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod request;

pub use cache::SignatureCache;
pub use cohort::{CohortResolver, MemberLookup, SubjectId, SubjectIdSet};
pub use error::{Error, Result};
pub use executor::{BatchExecutor, BatchWorker, HandleSource};
pub use pipeline::{MetricPipeline, Served};
pub use request::{RequestSignature, SignatureSchema};
