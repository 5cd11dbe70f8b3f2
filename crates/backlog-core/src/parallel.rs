//! Bounded fan-out for independent units of work.
//!
//! Units run as spawned tokio tasks gated by a semaphore; results come back
//! in input order regardless of completion order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

/// Run `f(index, item)` for every item with at most `max_concurrent`
/// in flight.
///
/// Returns `(index, result)` pairs sorted by index. A task that panics is
/// logged and left out of the output.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, max_concurrent: usize, f: F) -> Vec<(usize, R)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let results: Arc<Mutex<Vec<(usize, R)>>> = Arc::new(Mutex::new(Vec::with_capacity(items.len())));

    let mut tasks = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let sem = Arc::clone(&sem);
        let results = Arc::clone(&results);
        let fut = f(idx, item);
        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let out = fut.await;
            results.lock().await.push((idx, out));
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            warn!(code = "unit_task_failed", error = %e, "unit task did not complete");
        }
    }

    let mut out = std::mem::take(&mut *results.lock().await);
    out.sort_by_key(|(idx, _)| *idx);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn results_come_back_in_input_order() {
        let items: Vec<u64> = vec![30, 10, 20, 0];
        let out = run_bounded(items, 4, |idx, ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            idx * 10
        })
        .await;
        assert_eq!(out, vec![(0, 0), (1, 10), (2, 20), (3, 30)]);
    }

    #[tokio::test]
    async fn respects_concurrency_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<()> = vec![(); 8];
        let out = run_bounded(items, 2, |_, ()| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(out.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_limit_still_makes_progress() {
        let out = run_bounded(vec![1, 2], 0, |_, x| async move { x + 1 }).await;
        assert_eq!(out, vec![(0, 2), (1, 3)]);
    }
}
