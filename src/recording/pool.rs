// Shared write-behind worker pool with per-camera serial queues
//
// Each camera submits its write jobs to its own SerialQueue. A queue is put on
// the pool's ready channel only while it is not already scheduled, so at most
// one job per camera is ever in flight and jobs run in submission order. After
// each job a queue with more work goes to the back of the ready channel, which
// serves cameras round-robin.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::session::{RecordingError, Result};

/// A unit of work run on a pool thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Arc<SerialQueue>),
    Shutdown,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    /// On the ready channel or running
    scheduled: bool,
}

/// Ordered job queue for one camera
pub struct SerialQueue {
    name: String,
    ready: Sender<Message>,
    state: Mutex<QueueState>,
}

impl SerialQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job behind everything already submitted. Returns the number of
    /// jobs waiting after this one was added.
    pub fn submit(self: &Arc<Self>, job: Job) -> Result<usize> {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        let depth = state.jobs.len();

        if !state.scheduled {
            state.scheduled = true;
            if self.ready.send(Message::Run(self.clone())).is_err() {
                state.scheduled = false;
                state.jobs.pop_back();
                return Err(RecordingError::WorkerUnavailable);
            }
        }

        Ok(depth)
    }

    /// Jobs waiting to run (excluding the one in flight)
    pub fn depth(&self) -> usize {
        self.state.lock().jobs.len()
    }

    fn run_next(self: &Arc<Self>) {
        let job = {
            let mut state = self.state.lock();
            match state.jobs.pop_front() {
                Some(job) => job,
                None => {
                    state.scheduled = false;
                    return;
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("[Pool] Job for {} panicked", self.name);
        }

        let mut state = self.state.lock();
        if state.jobs.is_empty() {
            state.scheduled = false;
        } else if self.ready.send(Message::Run(self.clone())).is_err() {
            log::warn!(
                "[Pool] Pool stopped with {} jobs pending for {}",
                state.jobs.len(),
                self.name
            );
            state.jobs.clear();
            state.scheduled = false;
        }
    }
}

/// Fixed set of writer threads shared by all cameras
pub struct WorkerPool {
    ready: Sender<Message>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` workers (at least one)
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let (ready, inbox) = crossbeam_channel::unbounded::<Message>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let inbox = inbox.clone();
            let handle = std::thread::Builder::new()
                .name(format!("camrig-writer-{}", index))
                .spawn(move || worker_loop(inbox));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    let mut partial = Self { ready, workers };
                    partial.shutdown();
                    return Err(e);
                }
            }
        }

        log::info!("[Pool] Started {} writer threads", threads);
        Ok(Self { ready, workers })
    }

    /// Create a serial queue served by this pool
    pub fn queue(&self, name: impl Into<String>) -> Arc<SerialQueue> {
        Arc::new(SerialQueue {
            name: name.into(),
            ready: self.ready.clone(),
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop all workers once the work already on the ready channel has run.
    /// Jobs a queue requeues after that point are discarded.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in 0..self.workers.len() {
            let _ = self.ready.send(Message::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("[Pool] Writer thread panicked");
            }
        }
        log::info!("[Pool] Stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inbox: Receiver<Message>) {
    for message in inbox.iter() {
        match message {
            Message::Run(queue) => queue.run_next(),
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Gauge {
        active: AtomicUsize,
        max: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                max: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_job_in_flight_per_queue_in_order() {
        let pool = WorkerPool::new(4).unwrap();
        let global = Gauge::new();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let mut per_queue = Vec::new();
        for q in 0..3 {
            let queue = pool.queue(format!("cam{}", q));
            let gauge = Gauge::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..20 {
                let gauge = gauge.clone();
                let global = global.clone();
                let order = order.clone();
                let done = done_tx.clone();
                queue
                    .submit(Box::new(move || {
                        gauge.enter();
                        global.enter();
                        std::thread::sleep(Duration::from_millis(2));
                        order.lock().push(i);
                        global.leave();
                        gauge.leave();
                        let _ = done.send(());
                    }))
                    .unwrap();
            }
            per_queue.push((queue, gauge, order));
        }

        for _ in 0..60 {
            done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }

        for (queue, gauge, order) in &per_queue {
            assert_eq!(gauge.max.load(Ordering::SeqCst), 1, "{}", queue.name());
            assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
            assert_eq!(queue.depth(), 0);
        }
        assert!(global.max.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn busy_queue_does_not_starve_another() {
        let pool = WorkerPool::new(1).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let busy = pool.queue("busy");
        for i in 0..50 {
            let log = log.clone();
            busy.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(2));
                log.lock().push(format!("busy{}", i));
            }))
            .unwrap();
        }

        let quiet = pool.queue("quiet");
        let quiet_log = log.clone();
        quiet
            .submit(Box::new(move || {
                quiet_log.lock().push("quiet".to_string());
                let _ = done_tx.send(());
            }))
            .unwrap();

        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let position = log.lock().iter().position(|s| s == "quiet").unwrap();
        assert!(position < 10, "quiet job ran at position {}", position);
    }

    #[test]
    fn panicking_job_does_not_kill_the_queue() {
        let pool = WorkerPool::new(1).unwrap();
        let queue = pool.queue("cam0");
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        queue.submit(Box::new(|| panic!("boom"))).unwrap();
        queue
            .submit(Box::new(move || {
                let _ = done_tx.send(());
            }))
            .unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new(2).unwrap();
        let queue = pool.queue("cam0");
        pool.shutdown();
        drop(pool);
        assert!(matches!(
            queue.submit(Box::new(|| {})),
            Err(RecordingError::WorkerUnavailable)
        ));
        assert_eq!(queue.depth(), 0);
    }
}
