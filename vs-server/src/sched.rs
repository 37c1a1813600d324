// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A single-thread cooperative scheduler. Bus messages and delayed
//! callbacks all run here, one at a time, so lifecycle callbacks never race
//! each other.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Cmd {
    Task(Task),
    Timer { id: u64, deadline: Instant, task: Task },
    Cancel(u64),
    Shutdown,
}

pub struct Scheduler {
    handle: SchedHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct SchedHandle {
    tx: Sender<Cmd>,
    ids: Arc<AtomicU64>,
}

/// Cancels a pending timer. Dropping the handle leaves the timer armed.
pub struct TimerHandle {
    id: u64,
    tx: Sender<Cmd>,
}

impl TimerHandle {
    pub fn cancel(self) {
        self.tx.send(Cmd::Cancel(self.id)).ok();
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("sched".into())
            .spawn(move || run_loop(rx))
            .expect("failed to spawn scheduler thread");

        Self {
            handle: SchedHandle {
                tx,
                ids: Arc::new(AtomicU64::new(1)),
            },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> SchedHandle {
        self.handle.clone()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.tx.send(Cmd::Shutdown).ok();
            thread.join().ok();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedHandle {
    /// Runs `task` on the scheduler thread as soon as possible.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.tx.send(Cmd::Task(Box::new(task))).ok();
    }

    /// Runs `task` on the scheduler thread after `delay`.
    pub fn after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.ids.fetch_add(1, AtomicOrdering::Relaxed);
        self.tx
            .send(Cmd::Timer {
                id,
                deadline: Instant::now() + delay,
                task: Box::new(task),
            })
            .ok();

        TimerHandle {
            id,
            tx: self.tx.clone(),
        }
    }
}

struct TimerEntry {
    deadline: Instant,
    id: u64,
}

// BinaryHeap is a max-heap; reverse to pop the earliest deadline first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

fn run_loop(rx: Receiver<Cmd>) {
    let mut heap: BinaryHeap<TimerEntry> = BinaryHeap::new();
    let mut pending: HashMap<u64, Task> = HashMap::new();

    loop {
        let timeout = heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(250));

        match rx.recv_timeout(timeout) {
            Ok(Cmd::Task(task)) => task(),
            Ok(Cmd::Timer { id, deadline, task }) => {
                pending.insert(id, task);
                heap.push(TimerEntry { deadline, id });
            }
            Ok(Cmd::Cancel(id)) => {
                pending.remove(&id);
            }
            Ok(Cmd::Shutdown) => {
                trace!("scheduler shutting down");
                return;
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        while let Some(entry) = heap.peek() {
            if entry.deadline > now {
                break;
            }

            let entry = heap.pop().unwrap();
            // Cancelled timers leave a stale heap entry behind.
            if let Some(task) = pending.remove(&entry.id) {
                task();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_spawn_runs_in_order() {
        let sched = Scheduler::new();
        let handle = sched.handle();

        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        for i in 0..10 {
            let log = log.clone();
            handle.spawn(move || log.lock().unwrap().push(i));
        }
        handle.spawn(move || {
            done_tx.send(()).unwrap();
        });

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_timer_ordering() {
        let sched = Scheduler::new();
        let handle = sched.handle();

        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let log1 = log.clone();
        let log2 = log.clone();
        handle.after(Duration::from_millis(60), move || {
            log1.lock().unwrap().push("late");
            done_tx.send(()).unwrap();
        });
        handle.after(Duration::from_millis(10), move || {
            log2.lock().unwrap().push("early")
        });

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn test_timer_cancel() {
        let sched = Scheduler::new();
        let handle = sched.handle();

        let fired = Arc::new(Mutex::new(false));
        let fired_clone = fired.clone();
        let timer = handle.after(Duration::from_millis(30), move || {
            *fired_clone.lock().unwrap() = true;
        });
        timer.cancel();

        std::thread::sleep(Duration::from_millis(100));
        assert!(!*fired.lock().unwrap());
    }
}
