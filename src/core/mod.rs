pub mod job;
pub mod queue;
pub mod signal;
pub mod consumer;
pub mod system;
pub mod shutdown;
/// basic std::sync types reexported here so that we can hook loom into them
/// for testing.
pub mod sync;

use std::time::Duration;

use sync::{Arc, Mutex, Ordering, AtomicU64, thread};

use crate::pool::LockFreeBlockPool;

use job::{Category, Job};
use queue::JobQueue;
use signal::Signal;
use consumer::JobConsumer;
use system::{JobSystem, JobSystemBuilder, JobSystemId};
use shutdown::Shutdown;

// Use std's atomic type explicitly here because loom's doesn't support static
// initialization.
static NEXT_SYSTEM_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

// Upper bound on how long a worker sleeps between queue checks. A broadcast
// that lands between a worker's empty-queue check and its wait would
// otherwise be lost until the next dispatch.
const WORKER_WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Data shared by every handle to the system and by all worker threads.
///
/// This is the category registry: one queue per category and an optional
/// wake signal bound to each.
pub(crate) struct Shared {
    /// Number of dedicated worker threads.
    pub num_workers: u32,
    /// One FIFO of job handles per category.
    pub queues: Vec<Arc<JobQueue>>,
    /// Optional wake signal per category, broadcast on every enqueue.
    signals: Vec<Mutex<Option<Arc<Signal>>>>,
    /// Fixed-size pool the jobs themselves are allocated from.
    pub job_pool: LockFreeBlockPool,
    /// state and logic to handle shutting down.
    pub shutdown: Shutdown,
    /// A unique ID per system to sanity-check in debugging sessions that
    /// work isn't crossing systems when there are several of them.
    pub id: JobSystemId,
    pub stats: SystemStats,
    // A few hooks to register work
    handlers: WorkerHooks,
}

impl Shared {
    pub fn queue(&self, category: Category) -> Option<&Arc<JobQueue>> {
        self.queues.get(category.index())
    }

    pub fn signal(&self, category: Category) -> Option<Arc<Signal>> {
        let slot = self.signals.get(category.index())?;
        slot.lock().unwrap().clone()
    }

    pub fn bind_signal(&self, category: Category, signal: Arc<Signal>) {
        if let Some(slot) = self.signals.get(category.index()) {
            *slot.lock().unwrap() = Some(signal);
        }
    }

    /// Broadcast on every bound signal. Used to get sleeping workers to
    /// re-check the shutdown flag.
    pub fn signal_all_bound(&self) {
        for slot in &self.signals {
            if let Some(signal) = &*slot.lock().unwrap() {
                signal.signal_all();
            }
        }
    }
}

pub(crate) struct SystemStats {
    pub jobs_executed: AtomicU64,
}

pub(crate) fn init(params: JobSystemBuilder) -> JobSystem {
    let num_categories = params.num_categories as usize;
    let num_threads = params.num_threads as usize;

    let mut queues = Vec::with_capacity(num_categories);
    let mut signals = Vec::with_capacity(num_categories);
    for _ in 0..num_categories {
        queues.push(Arc::new(JobQueue::new()));
        signals.push(Mutex::new(None));
    }

    let shared = Arc::new(Shared {
        num_workers: num_threads as u32,
        queues,
        signals,

        job_pool: LockFreeBlockPool::new(
            std::mem::size_of::<Job>(),
            params.job_capacity,
        ),

        shutdown: Shutdown::new(num_threads as u32),

        id: JobSystemId(NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed)),

        stats: SystemStats {
            jobs_executed: AtomicU64::new(0),
        },

        handlers: WorkerHooks {
            start: params.start_handler,
            exit: params.exit_handler,
        },
    });

    // Workers service the generic category and are woken through its signal.
    shared.bind_signal(Category::GENERIC, Arc::new(Signal::new()));

    for i in 0..num_threads {
        let mut worker = Worker {
            shared: Arc::clone(&shared),
            index: i as u32,
        };

        let mut builder = thread::Builder::new()
            .name((params.name_handler)(i as u32));

        if let Some(stack_size) = params.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let _ = builder.spawn(move || {
            profiling::register_thread!("Worker");

            worker.run();

        }).unwrap();
    }

    JobSystem { shared }
}

struct Worker {
    shared: Arc<Shared>,
    index: u32,
}

impl Worker {
    fn run(&mut self) {
        let shared = Arc::clone(&self.shared);

        if let Some(handler) = &shared.handlers.start {
            handler.run(self.index);
        }

        let system = JobSystem { shared: Arc::clone(&shared) };
        let mut consumer = JobConsumer::new();
        consumer.add_category(&system, Category::GENERIC);

        let signal = shared.signal(Category::GENERIC);

        while !shared.shutdown.is_shutting_down() {
            consumer.consume_all_jobs();

            match &signal {
                // The wait is bounded so that a broadcast landing right after
                // the consume pass can't strand this worker.
                Some(signal) => { signal.wait_for(WORKER_WAKE_INTERVAL); }
                None => thread::yield_now(),
            }
        }

        // Shutdown phase: drain whatever was dispatched before the flag was
        // set, then count ourselves out.

        consumer.consume_all_jobs();

        if let Some(handler) = &shared.handlers.exit {
            handler.run(self.index);
        }

        shared.shutdown.worker_has_shut_down();
    }
}

pub(crate) struct WorkerHooks {
    start: Option<Box<dyn WorkerHook>>,
    exit: Option<Box<dyn WorkerHook>>,
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::BlockAlloc;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;

    // 1000 children each bump a counter, a final job depends on all of them.
    // The final callback must observe every child's side effect.
    #[test]
    fn dependency_fan_in() {
        const CHILDREN: u32 = 1000;

        let system = JobSystem::builder()
            .with_worker_threads(4)
            .with_job_capacity(2048)
            .build();

        let counter = Arc::new(AtomicU32::new(0));
        let observed = Arc::new(AtomicU32::new(0));

        let final_job = {
            let counter = Arc::clone(&counter);
            let observed = Arc::clone(&observed);
            system.create(Category::GENERIC, move || {
                observed.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
            }).unwrap()
        };

        let mut children = Vec::with_capacity(CHILDREN as usize);
        for _ in 0..CHILDREN {
            let counter = Arc::clone(&counter);
            let child = system.create(Category::GENERIC, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap();

            final_job.dependent_on(&child);
            children.push(child);
        }

        for child in children {
            child.dispatch_and_release();
        }

        final_job.dispatch();
        final_job.wait(None);

        assert_eq!(observed.load(Ordering::SeqCst), CHILDREN);

        system.shut_down().wait();
    }

    // Creating and immediately releasing a job must not run its callback,
    // and must hand the job's block back to the pool exactly once.
    #[test]
    fn create_then_release_never_runs() {
        let system = JobSystem::builder()
            .with_worker_threads(0)
            .build();

        let ran = Arc::new(AtomicBool::new(false));

        {
            let ran = Arc::clone(&ran);
            let job = system.create(Category::GENERIC, move || {
                ran.store(true, Ordering::SeqCst);
            }).unwrap();
            drop(job);
        }

        let carved = system.shared.job_pool.alloc_count();
        assert!(carved >= 1);

        // The freed block is reused, not re-carved.
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            let job = system.create(Category::GENERIC, move || {
                ran.store(true, Ordering::SeqCst);
            }).unwrap();
            drop(job);
        }
        assert_eq!(system.shared.job_pool.alloc_count(), carved);

        assert!(!ran.load(Ordering::SeqCst));

        system.shut_down().wait();
    }

    // With work pending in both subscribed categories, the category
    // registered first is serviced first.
    #[test]
    fn consumer_registration_order() {
        let system = JobSystem::builder()
            .with_worker_threads(0)
            .build();

        let order = Arc::new(Mutex::new(Vec::new()));

        for (category, tag) in [(Category::IO, "io"), (Category::MAIN, "main")] {
            let order = Arc::clone(&order);
            let job = system.create(category, move || {
                order.lock().unwrap().push(tag);
            }).unwrap();
            job.dispatch_and_release();
        }

        let mut consumer = JobConsumer::new();
        consumer.add_category(&system, Category::MAIN);
        consumer.add_category(&system, Category::IO);
        // Duplicate registration is a no-op.
        consumer.add_category(&system, Category::MAIN);

        assert!(consumer.consume_job());
        assert_eq!(*order.lock().unwrap(), ["main"]);

        assert_eq!(consumer.consume_all_jobs(), 1);
        assert_eq!(*order.lock().unwrap(), ["main", "io"]);

        assert!(!consumer.consume_job());

        system.shut_down().wait();
    }

    // Waiting with a consumer drains the queues cooperatively instead of
    // spinning, even with no worker threads at all.
    #[test]
    fn cooperative_wait() {
        let system = JobSystem::builder()
            .with_worker_threads(0)
            .build();

        let counter = Arc::new(AtomicU32::new(0));

        let final_job = {
            let counter = Arc::clone(&counter);
            system.create(Category::MAIN, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap()
        };

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let child = system.create(Category::MAIN, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap();
            final_job.dependent_on(&child);
            child.dispatch_and_release();
        }

        let mut consumer = JobConsumer::new();
        consumer.add_category(&system, Category::MAIN);

        final_job.dispatch();
        final_job.wait_and_release(Some(&mut consumer));

        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert_eq!(system.jobs_executed(), 11);

        system.shut_down().wait();
    }

    // Chained dependencies resolve in order: a -> b -> c.
    #[test]
    fn dependency_chain() {
        let system = JobSystem::builder()
            .with_worker_threads(2)
            .build();

        let order = Arc::new(Mutex::new(Vec::new()));

        let mut jobs = Vec::new();
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            jobs.push(system.create(Category::GENERIC, move || {
                order.lock().unwrap().push(tag);
            }).unwrap());
        }

        // c waits on b, b waits on a.
        jobs[2].dependent_on(&jobs[1]);
        jobs[1].dependent_on(&jobs[0]);

        let c = jobs.pop().unwrap();
        let b = jobs.pop().unwrap();
        let a = jobs.pop().unwrap();

        // Dispatch in reverse so nothing runs before its dependency resolves.
        c.dispatch();
        b.dispatch_and_release();
        a.dispatch_and_release();

        c.wait_and_release(None);

        assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);

        system.shut_down().wait();
    }

    // Jobs dispatched right before shut_down still run: workers drain their
    // queues one final time before exiting.
    #[test]
    fn shutdown_drains_pending_work() {
        for _ in 0..20 {
            let system = JobSystem::builder()
                .with_worker_threads(2)
                .build();

            let counter = Arc::new(AtomicU32::new(0));

            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                system.create(Category::GENERIC, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }).unwrap().dispatch_and_release();
            }

            system.shut_down().wait();

            assert_eq!(counter.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn invalid_category_is_rejected() {
        let system = JobSystem::builder()
            .with_categories(2)
            .with_worker_threads(0)
            .build();

        assert!(system.create(Category(2), || {}).is_none());
        assert!(system.get_queue(Category(7)).is_none());
        // Binding a signal to a category the system doesn't have is a no-op.
        system.bind_signal(Category(7), Arc::new(Signal::new()));

        system.shut_down().wait();
    }

    // A signal bound to a non-generic category wakes a caller-driven loop.
    #[test]
    fn bound_signal_wakes_render_consumer() {
        let system = JobSystem::builder()
            .with_worker_threads(0)
            .build();

        let signal = Arc::new(Signal::new());
        system.bind_signal(Category::RENDER, Arc::clone(&signal));

        let done = Arc::new(AtomicBool::new(false));

        let render_thread = {
            let system = system.clone();
            let signal = Arc::clone(&signal);
            let done = Arc::clone(&done);
            thread::Builder::new().name("Render".into()).spawn(move || {
                let mut consumer = JobConsumer::new();
                consumer.add_category(&system, Category::RENDER);

                let mut executed = 0;
                while !done.load(Ordering::SeqCst) {
                    executed += consumer.consume_all_jobs();
                    signal.wait_for(Duration::from_millis(10));
                }
                executed += consumer.consume_all_jobs();
                executed
            }).unwrap()
        };

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            system.create(Category::RENDER, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap().dispatch_and_release();
        }

        while system.jobs_executed() < 50 {
            thread::yield_now();
        }
        done.store(true, Ordering::SeqCst);
        signal.signal_all();

        assert_eq!(render_thread.join().unwrap(), 50);
        assert_eq!(counter.load(Ordering::SeqCst), 50);

        system.shut_down().wait();
    }

    // consume_for returns as soon as a dequeue fails, not after the budget.
    #[test]
    fn consume_for_stops_on_empty() {
        let system = JobSystem::builder()
            .with_worker_threads(0)
            .build();

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            system.create(Category::MAIN, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }).unwrap().dispatch_and_release();
        }

        let mut consumer = JobConsumer::new();
        consumer.add_category(&system, Category::MAIN);

        let start = std::time::Instant::now();
        let processed = consumer.consume_for(Duration::from_secs(60));
        assert_eq!(processed, 10);
        assert!(start.elapsed() < Duration::from_secs(60));

        system.shut_down().wait();
    }
}
