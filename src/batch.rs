//! Batch execution: fan out a set of requests concurrently and aggregate
//! partial success (spec.md §4.F "Batch execution").

use crate::executor::{ExecuteOptions, Executor};
use crate::request::Request;
use crate::response::AggregateResponse;

/// `executeBatch(requests, options)`. Every member runs through the same
/// `Executor::execute` path (cache, dedup, retry, interceptors all still
/// apply per-member); failures do not cancel siblings (spec.md §4.F).
pub async fn execute_batch<T>(
    executor: &Executor,
    requests: &[Request<T>],
    options: ExecuteOptions,
) -> AggregateResponse<T>
where
    T: Send + Sync + 'static,
{
    let mut futures = Vec::with_capacity(requests.len());
    for request in requests {
        futures.push(executor.execute(request, options.clone()));
    }

    let responses = futures_util::future::join_all(futures).await;

    let errors = responses.iter().filter_map(|r| r.exception.clone()).collect();

    AggregateResponse::from_results(responses, errors)
}
