//! Work dispatch across instances
//!
//! Items are split into one contiguous batch per instance. Each batch is
//! worked through in order by its own worker, and all workers run
//! concurrently. Results come back grouped by batch, batch 0 first, no
//! matter which worker finished first.
//!
//! # Example
//!
//! ```ignore
//! use torpool::{PoolError, WorkContext, WorkFunction};
//!
//! struct FetchIp;
//!
//! #[async_trait::async_trait]
//! impl WorkFunction<String> for FetchIp {
//!     type Output = String;
//!
//!     async fn call(&self, ctx: &WorkContext<'_>, url: String) -> Result<String, PoolError> {
//!         Ok(ctx.session().get(&url).send().await?.text().await?)
//!     }
//! }
//!
//! let batches = pool.dispatch(urls, &FetchIp).await;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn, Instrument};

use crate::config::RotationPolicy;
use crate::error::{PoolError, Result};
use crate::pool::TorPool;
use crate::session::TorSession;

/// Split `items` into `n` contiguous batches in original order
///
/// Batch sizes differ by at most one; the first `len % n` batches carry the
/// extra item. `n == 0` is treated as 1.
pub fn partition<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let base = items.len() / n;
    let extra = items.len() % n;

    let mut items = items.into_iter();
    (0..n)
        .map(|i| {
            let size = base + usize::from(i < extra);
            items.by_ref().take(size).collect()
        })
        .collect()
}

/// The caller-supplied unit of work
///
/// Called once per item, concurrently across instances but never
/// concurrently within one instance. Shared state the implementation
/// touches is its own to synchronize.
#[async_trait]
pub trait WorkFunction<T: Send>: Send + Sync {
    type Output: Send;

    async fn call(&self, ctx: &WorkContext<'_>, item: T) -> Result<Self::Output>;
}

/// What a work function knows about the worker running it
pub struct WorkContext<'a> {
    pool: &'a TorPool,
    index: usize,
    session: TorSession,
}

impl<'a> WorkContext<'a> {
    /// Instance this worker owns
    pub fn index(&self) -> usize {
        self.index
    }

    /// Session routed through this worker's instance
    pub fn session(&self) -> &TorSession {
        &self.session
    }

    /// Rotate this worker's instance now
    pub async fn renew_identity(&self) -> Result<Duration> {
        self.pool.renew_identity(self.index).await
    }
}

/// Results of one worker, in the order of its batch
#[derive(Debug)]
pub struct BatchResult<O> {
    pub index: usize,
    pub results: Vec<Result<O>>,
}

impl<O> BatchResult<O> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Flatten batch results back into input order
pub fn flatten<O>(batches: Vec<BatchResult<O>>) -> Vec<Result<O>> {
    batches.into_iter().flat_map(|b| b.results).collect()
}

impl TorPool {
    /// Run `work` over `items`, one worker per instance
    ///
    /// Blocks until every worker is done. A failing item does not stop its
    /// worker; the error becomes that item's result.
    #[instrument(skip_all, fields(items = items.len(), instances = self.len()))]
    pub async fn dispatch<T, W>(&self, items: Vec<T>, work: &W) -> Vec<BatchResult<W::Output>>
    where
        T: Send,
        W: WorkFunction<T>,
    {
        let batches = partition(items, self.len());

        let workers = batches.into_iter().enumerate().map(|(index, batch)| {
            self.run_worker(index, batch, work)
                .instrument(tracing::debug_span!("worker", index))
        });

        join_all(workers).await
    }

    async fn run_worker<T, W>(&self, index: usize, batch: Vec<T>, work: &W) -> BatchResult<W::Output>
    where
        T: Send,
        W: WorkFunction<T>,
    {
        let mut results = Vec::with_capacity(batch.len());
        debug!(index, items = batch.len(), "Worker started");

        for item in batch {
            let result = self.run_item(index, item, work).await;
            if let Err(e) = &result {
                warn!(index, error = %e, "Work item failed");
            }
            results.push(result);
        }

        debug!(index, "Worker finished");
        BatchResult { index, results }
    }

    async fn run_item<T, W>(&self, index: usize, item: T, work: &W) -> Result<W::Output>
    where
        T: Send,
        W: WorkFunction<T>,
    {
        let dispatch = &self.config().dispatch;
        let session = self.session(index)?;

        if dispatch.rotation == RotationPolicy::BeforeEachItem {
            self.renew_identity_with_retry(index, &dispatch.rotation_retry)
                .await?;
        }

        let ctx = WorkContext {
            pool: self,
            index,
            session,
        };

        match dispatch.item_timeout {
            Some(limit) => tokio::time::timeout(limit, work.call(&ctx, item))
                .await
                .map_err(|_| PoolError::Timeout(limit))?,
            None => work.call(&ctx, item).await,
        }
    }
}
