//! Bounded fan-out of batch work over a fixed worker pool.
//!
//! Tasks flow through a bounded crossbeam channel so enumeration never runs
//! far ahead of the workers. Results are collected unordered; after a worker
//! reports an error no new tasks are fed, but everything already queued is
//! still drained so partial progress can be reported.

use crossbeam_channel::{bounded, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Split items into batches of at most `size` elements.
pub fn batches<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(<[T]>::to_vec).collect()
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    workers: usize,
    queue_capacity: usize,
}

impl Coordinator {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            queue_capacity: workers * 2,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `work` over all tasks on the worker pool. Returns the unordered
    /// results plus the first error, if any; results gathered before the
    /// error are kept.
    pub fn run<T, R, E, F>(&self, tasks: impl IntoIterator<Item = T>, work: F) -> (Vec<R>, Option<E>)
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Result<R, E> + Sync,
    {
        let (task_tx, task_rx) = bounded::<T>(self.queue_capacity);
        let (result_tx, result_rx) = unbounded::<Result<R, E>>();
        let failed = AtomicBool::new(false);
        let work = &work;
        let failed = &failed;

        thread::scope(|scope| {
            for _ in 0..self.workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    for task in task_rx.iter() {
                        let result = work(task);
                        if result.is_err() {
                            failed.store(true, Ordering::Release);
                        }
                        if result_tx.send(result).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(task_rx);
            drop(result_tx);

            for task in tasks {
                if failed.load(Ordering::Acquire) {
                    break;
                }
                if task_tx.send(task).is_err() {
                    break;
                }
            }
            drop(task_tx);

            let mut results = Vec::new();
            let mut error = None;
            for outcome in result_rx.iter() {
                match outcome {
                    Ok(result) => results.push(result),
                    Err(err) if error.is_none() => error = Some(err),
                    Err(_) => {}
                }
            }
            (results, error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_sizes() {
        let split = batches(&[1, 2, 3, 4, 5], 2);
        assert_eq!(split, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_batches_zero_size_is_one() {
        let split = batches(&[1, 2], 0);
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn test_run_collects_all_results() {
        let coordinator = Coordinator::new(4);
        let (mut results, error) =
            coordinator.run(0..100, |n: i32| Ok::<_, String>(n * 2));
        assert!(error.is_none());
        results.sort_unstable();
        let expected: Vec<i32> = (0..100).map(|n| n * 2).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_run_single_worker() {
        let coordinator = Coordinator::new(1);
        let (results, error) = coordinator.run(0..10, |n: i32| Ok::<_, String>(n));
        assert!(error.is_none());
        assert_eq!(results.len(), 10);
    }

    #[test]
    fn test_run_keeps_partial_results_on_error() {
        let coordinator = Coordinator::new(2);
        let (results, error) = coordinator.run(0..10, |n: i32| {
            if n == 3 {
                Err(format!("task {n} failed"))
            } else {
                Ok(n)
            }
        });
        assert_eq!(error.as_deref(), Some("task 3 failed"));
        assert!(!results.contains(&3));
        assert!(results.len() < 10);
    }

    #[test]
    fn test_run_stops_feeding_after_error() {
        let coordinator = Coordinator::new(1);
        let (results, error) = coordinator.run(0..1_000_000, |n: i64| {
            if n == 0 {
                Err("first task failed".to_string())
            } else {
                Ok(n)
            }
        });
        assert!(error.is_some());
        // the bounded queue caps how many tasks were already in flight
        assert!(results.len() <= 4);
    }
}
