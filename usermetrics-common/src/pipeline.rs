//! Metric computation pipeline
//!
//! cache lookup -> cohort resolution -> batch execution -> cache store.
//! A request whose signature cannot be cached still gets its computed value.

use crate::cache::SignatureCache;
use crate::cohort::{CohortResolver, MemberLookup, SubjectId};
use crate::executor::{BatchExecutor, BatchWorker, HandleSource};
use crate::request::RequestSignature;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a request was answered
#[derive(Debug, Clone, PartialEq)]
pub enum Served<V> {
    /// Returned from the signature cache
    Cached(V),
    /// Computed now
    Computed(V),
}

impl<V> Served<V> {
    pub fn value(&self) -> &V {
        match self {
            Served::Cached(v) | Served::Computed(v) => v,
        }
    }

    pub fn into_value(self) -> V {
        match self {
            Served::Cached(v) | Served::Computed(v) => v,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Served::Cached(_))
    }
}

/// Wires resolver, executor and cache together for one value type
pub struct MetricPipeline<L, V> {
    resolver: CohortResolver<L>,
    executor: BatchExecutor,
    cache: Arc<SignatureCache<V>>,
}

impl<L: MemberLookup, V: Clone> MetricPipeline<L, V> {
    pub fn new(lookup: L, executor: BatchExecutor, cache: Arc<SignatureCache<V>>) -> Self {
        Self {
            resolver: CohortResolver::new(lookup),
            executor,
            cache,
        }
    }

    pub fn resolver(&self) -> &CohortResolver<L> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<SignatureCache<V>> {
        &self.cache
    }

    /// Serve `signature`, computing it with `worker` on a cache miss.
    ///
    /// `aggregate` turns the merged per-subject results into the cached value.
    pub async fn serve<W, H, F>(
        &self,
        signature: &RequestSignature,
        worker: Arc<W>,
        shared: Arc<W::Shared>,
        handles: Arc<H>,
        aggregate: F,
    ) -> Result<Served<V>>
    where
        W: BatchWorker<Item = SubjectId>,
        H: HandleSource<Handle = W::Handle>,
        F: FnOnce(Vec<W::Output>) -> V,
    {
        match self.cache.fetch(signature).await {
            Ok(Some(value)) => {
                debug!("Cache hit for {:?}", signature);
                return Ok(Served::Cached(value));
            }
            Ok(None) => {}
            Err(e) if e.is_soft_reject() => warn!("Request cannot be cached: {}", e),
            Err(e) => return Err(e),
        }

        let cohort = signature
            .present("cohort_expr")
            .ok_or_else(|| Error::InvalidSignature {
                field: "cohort_expr".to_string(),
            })?;

        let subjects = self.resolver.resolve(cohort).await?;
        info!("Cohort {} resolved to {} subjects", cohort, subjects.len());

        let results = self
            .executor
            .execute(subjects.into_vec(), worker, shared, handles)
            .await?;

        let value = aggregate(results);
        self.cache.store_or_log(signature, value.clone()).await;
        Ok(Served::Computed(value))
    }
}
