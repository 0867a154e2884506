//! Per-render query deduplication.
//!
//! One [`QueryDeduplicator`] lives for exactly one dashboard render. The first chart
//! asking for a signature spawns the query and stores a [`Shared`] handle to it;
//! every later chart with the same signature awaits that handle instead of issuing
//! its own query. Check and insert happen under one lock with no await in between,
//! so concurrently polled charts cannot both miss.

use crate::caches::CacheOutcome;
use crate::query::{QueryError, QuerySignature, Row};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Result of one unique query, shared by every chart that asked for it.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub rows: Arc<Vec<Row>>,
    pub cache: CacheOutcome,
    pub query_time: Duration,
}

/// What a single chart observed when resolving its signature.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub output: QueryOutput,
    /// True when another chart in this render had already requested the signature.
    pub deduplicated: bool,
}

type SharedQuery = Shared<BoxFuture<'static, Result<QueryOutput, QueryError>>>;

pub struct QueryDeduplicator {
    in_flight: Mutex<HashMap<QuerySignature, SharedQuery>>,
    unique: AtomicUsize,
    deduplicated: AtomicUsize,
}

impl fmt::Debug for QueryDeduplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDeduplicator")
            .field("in_flight", &self.len())
            .field("unique", &self.unique_queries())
            .field("deduplicated", &self.deduplicated_queries())
            .finish()
    }
}

impl Default for QueryDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryDeduplicator {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            unique: AtomicUsize::new(0),
            deduplicated: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QuerySignature, SharedQuery>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the rows for `signature`, running `compute` only if no chart in this
    /// render has asked for the signature yet.
    ///
    /// The query runs on its own task: it completes (and populates the shared cache)
    /// even if every waiter is dropped. A failure is delivered to every waiter.
    pub async fn resolve<F, Fut>(
        &self,
        signature: &QuerySignature,
        compute: F,
    ) -> Result<Resolved, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<QueryOutput, QueryError>> + Send + 'static,
    {
        let (shared, deduplicated) = {
            let mut in_flight = self.lock();
            match in_flight.entry(signature.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), true),
                Entry::Vacant(entry) => {
                    let handle = tokio::spawn(compute());
                    let shared = async move {
                        match handle.await {
                            Ok(result) => result,
                            Err(e) => Err(QueryError::Aborted(e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    entry.insert(shared.clone());
                    (shared, false)
                }
            }
        };

        if deduplicated {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(signature = %signature, "dedup: joining in-flight query");
        } else {
            self.unique.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(signature = %signature, "dedup: executing query");
        }

        let output = shared.await?;
        Ok(Resolved {
            output,
            deduplicated,
        })
    }

    /// Number of distinct signatures requested so far.
    pub fn unique_queries(&self) -> usize {
        self.unique.load(Ordering::Relaxed)
    }

    /// Number of requests served by an already-requested signature.
    pub fn deduplicated_queries(&self) -> usize {
        self.deduplicated.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for QueryDeduplicator {
    fn drop(&mut self) {
        let in_flight = self.in_flight.get_mut().unwrap_or_else(PoisonError::into_inner);
        let cleared = in_flight.len();
        in_flight.clear();
        tracing::trace!(cleared, "dedup: render scope released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use serde_json::json;

    fn sig(s: &str) -> QuerySignature {
        serde_json::from_value(json!(s)).unwrap()
    }

    fn rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("measure_value".to_string(), json!(i));
                row
            })
            .collect()
    }

    fn output(n: i64) -> QueryOutput {
        QueryOutput {
            rows: Arc::new(rows(n)),
            cache: CacheOutcome::Miss,
            query_time: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_execute_once() {
        let dedup = QueryDeduplicator::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let signature = sig("abc");

        let requests = (0..8).map(|_| {
            let executions = executions.clone();
            dedup.resolve(&signature, move || async move {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(output(3))
            })
        });
        let results: Vec<_> = join_all(requests).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.unique_queries(), 1);
        assert_eq!(dedup.deduplicated_queries(), 7);

        let resolved: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(resolved.iter().filter(|r| !r.deduplicated).count(), 1);
        let first = &resolved[0].output.rows;
        assert!(resolved.iter().all(|r| Arc::ptr_eq(first, &r.output.rows)));
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_distinct_signatures_execute_separately() {
        let dedup = QueryDeduplicator::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b", "a", "c", "b"] {
            let executions = executions.clone();
            dedup
                .resolve(&sig(name), move || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(output(1))
                })
                .await
                .unwrap();
        }

        assert_eq!(executions.load(Ordering::SeqCst), 3);
        assert_eq!(dedup.unique_queries(), 3);
        assert_eq!(dedup.deduplicated_queries(), 2);
        assert_eq!(dedup.len(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_shared_by_all_waiters() {
        let dedup = QueryDeduplicator::new();
        let signature = sig("broken");

        let requests = (0..3).map(|_| {
            dedup.resolve(&signature, || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(QueryError::Execution("relation does not exist".to_string()))
            })
        });
        let results = join_all(requests).await;

        assert_eq!(dedup.unique_queries(), 1);
        for result in results {
            let err = result.unwrap_err();
            assert!(matches!(err, QueryError::Execution(ref m) if m.contains("does not exist")));
        }
    }

    #[tokio::test]
    async fn test_panicking_query_reports_aborted() {
        let dedup = QueryDeduplicator::new();
        let result = dedup
            .resolve(&sig("panics"), || async {
                if true {
                    panic!("executor bug");
                }
                Ok(output(0))
            })
            .await;

        assert!(matches!(result, Err(QueryError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_query_runs_to_completion_after_render_is_dropped() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        {
            let dedup = QueryDeduplicator::new();
            let slow = sig("slow");
            let pending = dedup.resolve(&slow, move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = done_tx.send(());
                Ok(output(1))
            });
            // Poll once so the query is spawned, then abandon the render.
            let _ = futures::poll!(Box::pin(pending));
            assert_eq!(dedup.len(), 1);
        }

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("query should finish")
            .expect("sender should not be dropped");
    }
}
