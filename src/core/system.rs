use super::{Shared, WorkerHook};
use super::sync::{Arc, Ordering};
use super::job::{Category, JobRef};
use super::queue::JobQueue;
use super::signal::Signal;
use super::shutdown::{Shutdown, ShutdownHandle};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobSystemId(pub(crate) u32);

/// A reference to a job system.
///
/// This is the explicit context object that every call site goes through;
/// there is no ambient global instance. Clones share the same system.
#[derive(Clone)]
pub struct JobSystem {
    pub(crate) shared: Arc<Shared>,
}

impl JobSystem {
    pub fn builder() -> JobSystemBuilder {
        JobSystemBuilder {
            num_categories: 4,
            num_threads: 3,
            job_capacity: 1024,
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Allocate a job in the `Waiting` state, with one dependency (the
    /// creator's own dispatch) and one reference (the returned handle).
    ///
    /// Returns `None` for an out-of-range category, or when the job pool is
    /// exhausted.
    pub fn create<F>(&self, category: Category, work: F) -> Option<JobRef>
    where
        F: FnOnce() + Send + 'static,
    {
        use crate::pool::BlockAlloc;
        use super::job::Job;

        if category.index() >= self.shared.queues.len() {
            return None;
        }

        let job = Job::new(category, Box::new(work), Arc::clone(&self.shared));
        let ptr = unsafe { self.shared.job_pool.create(job) };
        if ptr.is_null() {
            return None;
        }

        Some(JobRef::from_raw(ptr))
    }

    /// The queue backing `category`, or `None` if the category is
    /// out of range.
    pub fn get_queue(&self, category: Category) -> Option<Arc<JobQueue>> {
        self.shared.queue(category).cloned()
    }

    /// Bind a signal to a category: every enqueue into that category's queue
    /// broadcasts on the signal. Out-of-range categories are a no-op.
    pub fn bind_signal(&self, category: Category, signal: Arc<Signal>) {
        self.shared.bind_signal(category, signal);
    }

    /// Stop the worker threads. Each worker drains its subscribed queues one
    /// final time before exiting; queues no worker subscribes to (e.g. a main
    /// thread category) are still the caller's to drain.
    pub fn shut_down(&self) -> ShutdownHandle {
        Shutdown::begin_shut_down(Arc::clone(&self.shared))
    }

    pub fn id(&self) -> JobSystemId {
        self.shared.id
    }

    pub fn num_worker_threads(&self) -> u32 {
        self.shared.num_workers
    }

    pub fn num_categories(&self) -> u32 {
        self.shared.queues.len() as u32
    }

    /// Total number of jobs executed so far, across all threads.
    pub fn jobs_executed(&self) -> u64 {
        self.shared.stats.jobs_executed.load(Ordering::Relaxed)
    }
}

pub struct JobSystemBuilder {
    pub(crate) num_categories: u32,
    pub(crate) num_threads: u32,
    pub(crate) job_capacity: u32,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String>,
    pub(crate) stack_size: Option<usize>,
}

impl JobSystemBuilder {
    /// Number of category queues. `Category::GENERIC` must exist, so the
    /// count is at least one.
    pub fn with_categories(mut self, num_categories: u32) -> Self {
        self.num_categories = num_categories.max(1);

        self
    }

    /// Number of dedicated worker threads servicing `Category::GENERIC`.
    /// Zero is allowed: all consumption then happens through caller-driven
    /// `JobConsumer`s.
    pub fn with_worker_threads(mut self, num_threads: u32) -> Self {
        self.num_threads = num_threads;

        self
    }

    /// Capacity of the job pool, i.e. the maximum number of jobs alive at
    /// once.
    pub fn with_job_capacity(mut self, job_capacity: u32) -> Self {
        self.job_capacity = job_capacity.max(1);

        self
    }

    pub fn with_start_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        JobSystemBuilder {
            start_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_exit_handler<F>(self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        JobSystemBuilder {
            exit_handler: Some(Box::new(handler)),
            ..self
        }
    }

    pub fn with_thread_names<F>(self, handler: F) -> Self
    where F: Fn(u32) -> String + 'static
    {
        JobSystemBuilder {
            name_handler: Box::new(handler),
            ..self
        }
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    pub fn build(self) -> JobSystem {
        crate::core::init(self)
    }
}
