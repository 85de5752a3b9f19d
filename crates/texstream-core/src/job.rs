//! Job System
//!
//! Background thread pool for work that runs decoupled from the frame.
//! Features:
//! - Dedicated worker threads fed from shared injector queues
//! - Priority classes (High/Critical jobs are taken before Normal/Low)
//! - Completion handles with blocking wait
//! - Inline execution on the caller when no workers are configured

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};

/// Job priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    /// Low priority background tasks
    Low = 0,
    /// Normal priority tasks
    #[default]
    Normal = 1,
    /// High priority tasks (render-critical)
    High = 2,
    /// Critical tasks (must complete this frame)
    Critical = 3,
}

impl JobPriority {
    fn is_urgent(self) -> bool {
        self >= JobPriority::High
    }
}

#[derive(Debug, Default)]
struct Completion {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Completion {
    fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.signal.notify_all();
    }
}

/// Handle to a submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    completion: Arc<Completion>,
    id: u64,
}

impl JobHandle {
    /// Check if the job has completed
    pub fn is_complete(&self) -> bool {
        *self.completion.done.lock()
    }

    /// Get the job ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block the calling thread until the job has run
    ///
    /// Only safe to call when a worker (or another thread calling
    /// [`JobSystem::process_jobs`]) will pick the job up.
    pub fn wait(&self) {
        let mut done = self.completion.done.lock();
        while !*done {
            self.completion.signal.wait(&mut done);
        }
    }

    /// Block for at most `timeout`, returning whether the job completed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.completion.done.lock();
        if !*done {
            self.completion.signal.wait_for(&mut done, timeout);
        }
        *done
    }
}

/// A job that can be executed by the job system
pub trait Job: Send + 'static {
    /// Execute the job
    fn execute(&mut self);

    /// Get the job name for debugging
    fn name(&self) -> &str {
        "unnamed_job"
    }
}

/// Wrapper for closure-based jobs
struct ClosureJob<F: FnOnce() + Send + 'static> {
    func: Option<F>,
    name: &'static str,
}

impl<F: FnOnce() + Send + 'static> Job for ClosureJob<F> {
    fn execute(&mut self) {
        if let Some(func) = self.func.take() {
            func();
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Internal job wrapper with metadata
struct JobWrapper {
    job: Box<dyn Job>,
    priority: JobPriority,
    completion: Arc<Completion>,
}

impl JobWrapper {
    fn run(mut self) {
        {
            let _span =
                tracing::debug_span!("job", name = self.job.name(), priority = ?self.priority)
                    .entered();
            let job = &mut self.job;
            if panic::catch_unwind(AssertUnwindSafe(|| job.execute())).is_err() {
                log::error!("Job '{}' panicked", self.job.name());
            }
        }
        // Waiters are released even when the job panicked.
        self.completion.complete();
    }
}

/// Queues shared between the submitting threads and the workers
struct JobQueue {
    urgent: Injector<JobWrapper>,
    normal: Injector<JobWrapper>,
    /// Jobs pushed but not yet taken; guarded together with the condvar
    pending: Mutex<usize>,
    job_available: Condvar,
    shutdown: AtomicBool,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            urgent: Injector::new(),
            normal: Injector::new(),
            pending: Mutex::new(0),
            job_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push(&self, wrapper: JobWrapper) {
        let mut pending = self.pending.lock();
        *pending += 1;
        if wrapper.priority.is_urgent() {
            self.urgent.push(wrapper);
        } else {
            self.normal.push(wrapper);
        }
        self.job_available.notify_one();
    }

    fn pop(&self) -> Option<JobWrapper> {
        let wrapper = steal(&self.urgent).or_else(|| steal(&self.normal))?;
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        Some(wrapper)
    }
}

fn steal(injector: &Injector<JobWrapper>) -> Option<JobWrapper> {
    loop {
        match injector.steal() {
            Steal::Success(wrapper) => return Some(wrapper),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn worker_loop(queue: Arc<JobQueue>) {
    loop {
        if let Some(wrapper) = queue.pop() {
            wrapper.run();
            continue;
        }

        let mut pending = queue.pending.lock();
        if *pending == 0 {
            if queue.shutdown.load(Ordering::Acquire) {
                break;
            }
            queue.job_available.wait(&mut pending);
        }
    }
}

/// Background job system
pub struct JobSystem {
    queue: Arc<JobQueue>,
    workers: Vec<ThreadHandle<()>>,
    /// Job counter for IDs
    job_counter: AtomicU64,
}

impl JobSystem {
    /// Create a new job system with the specified number of worker threads
    ///
    /// With zero workers nothing runs until a caller drives the queue through
    /// [`JobSystem::process_jobs`] or [`JobSystem::wait_for`].
    pub fn new(num_workers: usize) -> Self {
        let queue = Arc::new(JobQueue::new());
        let mut workers = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker_queue = queue.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("texstream-worker-{index}"))
                .spawn(move || worker_loop(worker_queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    log::error!("Failed to spawn job worker {}: {}", index, err);
                    break;
                }
            }
        }

        Self {
            queue,
            workers,
            job_counter: AtomicU64::new(0),
        }
    }

    /// Get the number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Submit a job to the system
    pub fn submit<J: Job>(&self, job: J, priority: JobPriority) -> JobHandle {
        let id = self.job_counter.fetch_add(1, Ordering::Relaxed);
        let completion = Arc::new(Completion::default());

        self.queue.push(JobWrapper {
            job: Box::new(job),
            priority,
            completion: completion.clone(),
        });

        JobHandle { completion, id }
    }

    /// Submit a closure as a job
    pub fn submit_fn<F>(&self, name: &'static str, priority: JobPriority, func: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(ClosureJob { func: Some(func), name }, priority)
    }

    /// Process jobs on the current thread (for main thread execution)
    pub fn process_jobs(&self, max_jobs: usize) -> usize {
        let mut processed = 0;
        while processed < max_jobs {
            match self.queue.pop() {
                Some(wrapper) => {
                    wrapper.run();
                    processed += 1;
                }
                None => break,
            }
        }
        processed
    }

    /// Wait for a job to complete, helping with queued work meanwhile
    pub fn wait_for(&self, handle: &JobHandle) {
        while !handle.is_complete() {
            if self.process_jobs(1) == 0 {
                handle.wait_timeout(Duration::from_millis(1));
            }
        }
    }

    /// Wait for all submitted jobs to be taken off the queue
    pub fn wait_all(&self) {
        while self.pending_jobs() > 0 {
            if self.process_jobs(16) == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Jobs submitted but not yet picked up
    pub fn pending_jobs(&self) -> usize {
        *self.queue.pending.lock()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);

        {
            let _pending = self.queue.pending.lock();
            self.queue.job_available.notify_all();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CounterJob {
        counter: Arc<AtomicU32>,
    }

    impl Job for CounterJob {
        fn execute(&mut self) {
            self.counter.fetch_add(1, Ordering::Relaxed);
        }

        fn name(&self) -> &str {
            "counter_job"
        }
    }

    #[test]
    fn test_job_system_creation() {
        let job_system = JobSystem::new(4);
        assert_eq!(job_system.num_workers(), 4);
    }

    #[test]
    fn test_job_submission_and_execution() {
        let job_system = JobSystem::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        let handle = job_system.submit(
            CounterJob { counter: counter.clone() },
            JobPriority::Normal,
        );

        job_system.wait_for(&handle);
        assert!(handle.is_complete());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_closure_job() {
        let job_system = JobSystem::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let handle = job_system.submit_fn("increment", JobPriority::Normal, move || {
            counter_clone.fetch_add(5, Ordering::Relaxed);
        });

        job_system.wait_for(&handle);
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_blocking_wait_on_worker() {
        let job_system = JobSystem::new(1);
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let handle = job_system.submit_fn("sleepy", JobPriority::Normal, move || {
            std::thread::sleep(Duration::from_millis(10));
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        handle.wait();
        assert!(handle.is_complete());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_inline_without_workers() {
        let job_system = JobSystem::new(0);
        let counter = Arc::new(AtomicU32::new(0));

        let handle = job_system.submit(
            CounterJob { counter: counter.clone() },
            JobPriority::Normal,
        );
        assert!(!handle.is_complete());
        assert_eq!(job_system.pending_jobs(), 1);

        job_system.wait_for(&handle);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(job_system.pending_jobs(), 0);
    }

    #[test]
    fn test_urgent_jobs_run_first() {
        let job_system = JobSystem::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let low_order = order.clone();
        job_system.submit_fn("low", JobPriority::Low, move || low_order.lock().push("low"));
        let critical_order = order.clone();
        job_system.submit_fn("critical", JobPriority::Critical, move || {
            critical_order.lock().push("critical")
        });

        assert_eq!(job_system.process_jobs(8), 2);
        assert_eq!(*order.lock(), vec!["critical", "low"]);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let job_system = JobSystem::new(1);
        let handle = job_system.submit_fn("boom", JobPriority::Normal, || panic!("boom"));
        job_system.wait_for(&handle);
        assert!(handle.is_complete());

        let counter = Arc::new(AtomicU32::new(0));
        let after = job_system.submit(CounterJob { counter: counter.clone() }, JobPriority::Normal);
        job_system.wait_for(&after);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wait_all() {
        let job_system = JobSystem::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| job_system.submit(CounterJob { counter: counter.clone() }, JobPriority::Low))
            .collect();

        job_system.wait_all();
        for handle in &handles {
            job_system.wait_for(handle);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }
}
