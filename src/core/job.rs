use crate::sync::{fence, Ordering, AtomicI32, AtomicU32, AtomicPtr, Arc, thread};
use crate::pool::BlockAlloc;

use crossbeam_utils::Backoff;

use std::cell::UnsafeCell;
use std::mem;

use super::Shared;
use super::consumer::JobConsumer;

/// The scheduling class of a job. Each category maps to one queue and,
/// optionally, one wake signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Category(pub u32);

impl Category {
    pub const GENERIC: Category = Category(0);
    pub const MAIN: Category = Category(1);
    pub const IO: Category = Category(2);
    pub const RENDER: Category = Category(3);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle of a job. Transitions are monotonic and single-directional:
/// `Waiting -> Enqueued -> Running -> Finished`. There is no cancelled state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum JobState {
    /// Created, still gated by unresolved dependencies.
    Waiting = 0,
    /// Dependency count reached zero; sitting in its category's queue.
    Enqueued = 1,
    /// Picked up by a consumer, callback in progress.
    Running = 2,
    /// Callback returned and dependents were notified. Terminal.
    Finished = 3,
}

impl JobState {
    fn from_u32(value: u32) -> JobState {
        match value {
            0 => JobState::Waiting,
            1 => JobState::Enqueued,
            2 => JobState::Running,
            3 => JobState::Finished,
            _ => unreachable!("invalid job state {}", value),
        }
    }
}

/// A reference-counted unit of deferred work.
///
/// Jobs are allocated from the system's block pool and live until their last
/// handle drops. The dependency counter starts at one (the creator's own
/// `dispatch`) and gains one per `dependent_on` edge; the job is enqueued when
/// it reaches zero.
pub(crate) struct Job {
    category: Category,
    state: AtomicU32,
    // Calls to dispatch remaining before the job can be enqueued.
    deps: AtomicI32,
    // Handles still alive. The job's block is returned to the pool at zero.
    refs: AtomicI32,
    work: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    // Jobs waiting on this one. Drained exactly once, when this job finishes.
    dependents: DependentList,
    pub(crate) shared: Arc<Shared>,
}

impl Job {
    pub(crate) fn new(
        category: Category,
        work: Box<dyn FnOnce() + Send>,
        shared: Arc<Shared>,
    ) -> Self {
        Job {
            category,
            state: AtomicU32::new(JobState::Waiting as u32),
            deps: AtomicI32::new(1),
            refs: AtomicI32::new(1),
            work: UnsafeCell::new(Some(work)),
            dependents: DependentList::new(),
            shared,
        }
    }

    fn set_state(&self, new_state: JobState) {
        let prev = self.state.swap(new_state as u32, Ordering::Release);
        debug_assert!(
            prev < new_state as u32,
            "job state must only move forward: {:?} -> {:?}",
            JobState::from_u32(prev),
            new_state,
        );
    }
}

/// A counted handle to a [`Job`].
///
/// Cloning the handle acquires a reference, dropping it releases one; the
/// last drop destroys the job and returns its block to the system's pool.
/// These handle operations are the only memory-safety mechanism: the
/// dependents list, the category queue and the creator each own one.
pub struct JobRef {
    job: *const Job,
}

unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

impl JobRef {
    pub(crate) fn from_raw(job: *const Job) -> JobRef {
        debug_assert!(!job.is_null());
        JobRef { job }
    }

    #[inline]
    fn job(&self) -> &Job {
        unsafe { &*self.job }
    }

    pub fn category(&self) -> Category {
        self.job().category
    }

    pub fn state(&self) -> JobState {
        JobState::from_u32(self.job().state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state() == JobState::Finished
    }

    /// Register this job as waiting on `parent`.
    ///
    /// Caller contract: only valid while `parent` has not yet reached a
    /// dependency count of zero, i.e. before (or racing with) its first
    /// dispatch. This is not detected at runtime in release builds.
    pub fn dependent_on(&self, parent: &JobRef) {
        debug_assert!(
            parent.job().deps.load(Ordering::Relaxed) > 0,
            "dependent_on called after the parent was already dispatched"
        );

        self.job().deps.fetch_add(1, Ordering::AcqRel);
        // The clone is the edge's extra reference; it is released when the
        // parent finishes and drains its dependents.
        parent.job().dependents.push(self.clone());
    }

    /// Resolve one dependency. When the count reaches zero the job is pushed
    /// onto its category's queue and the bound signal (if any) wakes waiters.
    pub fn dispatch(&self) {
        profiling::scope!("dispatch");

        let job = self.job();

        let deps = job.deps.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(deps >= 0, "job dispatched more times than it had dependencies");
        if deps > 0 {
            return;
        }

        job.set_state(JobState::Enqueued);

        // The queue's reference is taken before the push becomes visible, so
        // a consumer finishing the job immediately can't release it out from
        // under us.
        let queue_ref = self.clone();

        let queue = &job.shared.queues[job.category.index()];
        queue.enqueue(queue_ref);

        if let Some(signal) = job.shared.signal(job.category) {
            signal.signal_all();
        }
    }

    /// `dispatch` followed by releasing the caller's reference.
    pub fn dispatch_and_release(self) {
        self.dispatch();
    }

    /// Busy-poll until the job is finished.
    ///
    /// This is deliberately a spin, not an OS-level block: when a consumer is
    /// supplied, each iteration first tries to service one job from the
    /// consumer's subscribed queues, which both makes the wait useful and can
    /// end up executing the awaited job itself.
    pub fn wait(&self, mut consumer: Option<&mut JobConsumer>) {
        profiling::scope!("wait");

        let backoff = Backoff::new();
        while !self.is_finished() {
            if let Some(consumer) = consumer.as_mut() {
                if consumer.consume_job() {
                    backoff.reset();
                    continue;
                }
            }

            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// `wait` followed by releasing the caller's reference.
    pub fn wait_and_release(self, consumer: Option<&mut JobConsumer>) {
        self.wait(consumer);
    }

    /// Run the job to completion. Called by whichever consumer dequeued it.
    pub(crate) fn execute(&self) {
        profiling::scope!("execute_job");

        let job = self.job();

        job.set_state(JobState::Running);

        let work = unsafe { (*job.work.get()).take() };
        debug_assert!(work.is_some(), "job executed twice");

        let abort = AbortIfPanic;
        if let Some(work) = work {
            work();
        }
        mem::forget(abort);

        job.set_state(JobState::Finished);

        // Drained exactly once: pop_all atomically detaches the whole list,
        // so a pooled job reused later can't re-notify stale dependents.
        job.dependents.pop_all(&mut |dependent| {
            // Dropping the handle afterwards balances the reference taken in
            // dependent_on.
            dependent.dispatch();
        });

        job.shared.stats.jobs_executed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Clone for JobRef {
    fn clone(&self) -> Self {
        self.job().refs.fetch_add(1, Ordering::Acquire);
        JobRef { job: self.job }
    }
}

impl Drop for JobRef {
    fn drop(&mut self) {
        let refs = self.job().refs.fetch_sub(1, Ordering::Release) - 1;
        debug_assert!(refs >= 0);
        if refs > 0 {
            return;
        }

        // Synchronize with every other release before tearing the job down.
        fence(Ordering::Acquire);

        unsafe {
            // The pool outlives the job as long as the Shared handle does, so
            // keep one alive across the teardown.
            let shared = Arc::clone(&(*self.job).shared);
            let ptr = self.job as *mut Job;
            std::ptr::drop_in_place(ptr);
            shared.job_pool.free(ptr as *mut u8);
        }
    }
}

struct AbortIfPanic;

impl Drop for AbortIfPanic {
    fn drop(&mut self) {
        eprintln!("job panicked; aborting");
        std::process::abort();
    }
}

/// A lock-free list of the handles of jobs waiting on this one.
///
/// Pushes contend with each other (and, per the caller contract on
/// `dependent_on`, should not race the drain), while `pop_all` detaches the
/// entire list in one swap so it can only ever be drained once.
pub(crate) struct DependentList {
    first: AtomicPtr<DependentNode>,
}

struct DependentNode {
    job: JobRef,
    next: *mut DependentNode,
}

impl DependentList {
    pub fn new() -> Self {
        DependentList {
            first: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn push(&self, job: JobRef) {
        let node = Box::into_raw(Box::new(DependentNode {
            job,
            next: std::ptr::null_mut(),
        }));

        loop {
            let first = self.first.load(Ordering::Acquire);
            unsafe { (*node).next = first };

            if self.first.compare_exchange(
                first,
                node,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ).is_ok() {
                break;
            }
        }
    }

    pub fn pop_all(&self, cb: &mut dyn FnMut(JobRef)) {
        // Atomically detach the whole chain, then walk it exclusively.
        let mut node = self.first.swap(std::ptr::null_mut(), Ordering::SeqCst);

        while !node.is_null() {
            let DependentNode { job, next } = *unsafe { Box::from_raw(node) };
            cb(job);
            node = next;
        }
    }
}

impl Drop for DependentList {
    fn drop(&mut self) {
        // A job released without ever finishing still owns references to its
        // dependents; let them go instead of leaking.
        self.pop_all(&mut |_job| {});
    }
}
