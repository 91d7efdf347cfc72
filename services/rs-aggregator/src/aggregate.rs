//!
//! src/aggregate.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Fan-out over a set of identifiers: one upstream call per identifier,
//! all in flight at once, joined before returning. Failures degrade to
//! omission and are only visible through the counts
//!

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::errors::AggregatorError;
use crate::types::Identifier;

/// Outcome of a single upstream call
#[derive(Debug)]
pub enum FetchResult<T> {
    Ok(T),
    Failed(AggregatorError)
}

impl<T> From<Result<T, AggregatorError>> for FetchResult<T> {
    fn from(r: Result<T, AggregatorError>) -> Self {
        match r {
            Ok(v) => FetchResult::Ok(v),
            Err(e) => FetchResult::Failed(e)
        }
    }
}

#[derive(Debug)]
pub struct AggregateResult<T> {
    pub values: HashMap<Identifier, T>,
    pub requested: usize,
    pub succeeded: usize,
    pub failed: Vec<Identifier>
}

impl<T> AggregateResult<T> {
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.requested
    }
}

/// Distinct identifiers in a stable order
pub fn distinct(ids: &[Identifier]) -> Vec<Identifier> {
    ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Runs `fetch` once per distinct identifier concurrently and waits for all
/// of them. No concurrency cap here, callers bound the width via batch size
pub async fn aggregate<T, F, Fut>(ids: &[Identifier], fetch: F) -> AggregateResult<T>
where
    F: Fn(Identifier) -> Fut,
    Fut: Future<Output = FetchResult<T>>
{
    let ids = distinct(ids);
    let requested = ids.len();

    let outcomes = join_all(
        ids.iter().cloned().map(|id| {
            let call = fetch(id.clone());
            async move { (id, call.await) }
        })
    ).await;

    let mut values = HashMap::with_capacity(requested);
    let mut failed = Vec::new();
    for (id, outcome) in outcomes {
        match outcome {
            FetchResult::Ok(v) => {
                values.insert(id, v);
            }
            FetchResult::Failed(e) => {
                warn!(id = %id, error = %e, "aggregate.fetch.failed");
                failed.push(id);
            }
        }
    }

    let succeeded = values.len();
    debug!(requested, succeeded, "aggregate.done");
    AggregateResult { values, requested, succeeded, failed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ids(raw: &[&str]) -> Vec<Identifier> {
        raw.iter().map(|s| Identifier::from(*s)).collect()
    }

    #[tokio::test]
    async fn failures_are_omitted_and_counted() {
        let requested = ids(&["a", "b", "c", "d", "e"]);
        let result = aggregate(&requested, |id| async move {
            if id.as_str() == "b" || id.as_str() == "d" {
                FetchResult::Failed(AggregatorError::UpstreamUnavailable("down".into()))
            } else {
                FetchResult::Ok(id.as_str().to_uppercase())
            }
        }).await;

        assert_eq!(result.requested, 5);
        assert_eq!(result.succeeded, 3);
        assert!(!result.is_complete());
        let mut keys: Vec<_> = result.values.keys().map(|k| k.as_str()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "c", "e"]);
        assert_eq!(result.values[&Identifier::from("c")], "C");
        assert_eq!(result.failed, ids(&["b", "d"]));
    }

    #[tokio::test]
    async fn all_calls_are_in_flight_together() {
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let requested = ids(&["a", "b", "c", "d"]);
        let result = aggregate(&requested, |_id| {
            let inflight = inflight.clone();
            let peak = peak.clone();
            async move {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                FetchResult::Ok(())
            }
        }).await;

        assert!(result.is_complete());
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn slow_calls_are_waited_for() {
        let requested = ids(&["fast", "slow"]);
        let result = aggregate(&requested, |id| async move {
            if id.as_str() == "slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            FetchResult::Ok(id.as_str().len())
        }).await;
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.values[&Identifier::from("slow")], 4);
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_fetched_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let requested = ids(&["a", "a", "b"]);
        let result = aggregate(&requested, |_id| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                FetchResult::Ok(1)
            }
        }).await;
        assert_eq!(result.requested, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let result: AggregateResult<()> = aggregate(&[], |_id| async {
            FetchResult::Ok(())
        }).await;
        assert_eq!(result.requested, 0);
        assert!(result.is_complete());
    }
}
