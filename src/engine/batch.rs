//! Concurrent fan-out/fan-in of HTTP actions for `$http.batch`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::executor::{ActionRequest, HttpExecutor, HttpResponse};
use crate::error::{HttpError, HttpResult};

/// Run every request as its own task on the executor's shared client and wait
/// for all of them. Outcomes come back in input order; a failed entry never
/// affects the others. Cancelling `cancel` aborts whatever is still in flight.
pub async fn run_batch(
    executor: Arc<HttpExecutor>,
    requests: Vec<ActionRequest>,
    cancel: CancellationToken,
) -> Vec<HttpResult<HttpResponse>> {
    let slots: Arc<Mutex<Vec<Option<HttpResult<HttpResponse>>>>> =
        Arc::new(Mutex::new(vec![None; requests.len()]));

    let mut tasks = JoinSet::new();
    for (index, request) in requests.into_iter().enumerate() {
        let executor = executor.clone();
        let slots = slots.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let outcome = executor.execute(request, &cancel).await;
            slots.lock()[index] = Some(outcome);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "batch request task failed");
        }
    }

    let mut slots = slots.lock();
    slots
        .drain(..)
        .map(|slot| slot.unwrap_or_else(|| Err(HttpError::Transport("request task did not complete".to_string()))))
        .collect()
}
