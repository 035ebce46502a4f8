//! Bounded fan-out with a countdown barrier.
//!
//! Workers are scoped threads pulling item indices from a shared counter.
//! Every task reports exactly one result through the channel, panics
//! included, and the caller blocks until all `items.len()` results have
//! arrived. Results come back in input order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, error};

use crate::error::SyncError;

/// Run `task` over `items` on at most `workers` threads.
pub fn run_bounded<T, R, F>(items: &[T], workers: usize, task: F) -> Vec<Result<R, SyncError>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R, SyncError> + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, Result<R, SyncError>)>();

    let mut slots: Vec<Option<Result<R, SyncError>>> = (0..total).map(|_| None).collect();

    thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let task = &task;
            scope.spawn(move || {
                loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    if idx >= total {
                        break;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| task(&items[idx]))).unwrap_or_else(|payload| {
                        let message = panic_message(payload.as_ref());
                        error!(worker, item = idx, panic = %message, "Task panicked");
                        Err(SyncError::TaskPanicked(message))
                    });
                    if tx.send((idx, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        // countdown: exactly one result per item
        let mut remaining = total;
        while remaining > 0 {
            match rx.recv() {
                Ok((idx, result)) => {
                    slots[idx] = Some(result);
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }
        debug!(total, workers, "Pool drained");
    });

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(SyncError::TaskPanicked("result lost".to_string()))))
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
