//! A categorized job scheduler with dependency graphs, backed by pooled
//! block allocators.
//!
//! The scheduler revolves around a few pieces:
//! - [`JobSystem`]: the explicit context object owning one FIFO queue per
//!   [`Category`] and an optional wake [`Signal`] bound to each.
//! - [`JobRef`]: a counted handle to a unit of work. Jobs carry a dependency
//!   counter; wiring edges with `dependent_on` gates a job's enqueue until
//!   every parent has finished.
//! - [`JobConsumer`]: a worker-thread-local (or stack-local) puller that
//!   services its subscribed category queues in registration order.
//! - [`pool`]: the fixed-block-size allocator family (single-threaded,
//!   mutex-protected, and lock-free tagged-index variants) that the job
//!   system allocates its jobs from.
//!
//! Dispatching a job decrements its dependency counter; at zero the job is
//! pushed onto its category's queue and the bound signal wakes consumers. A
//! consumer pops the job, runs it, and cascades dispatches to its dependents.

mod core;
pub mod pool;

pub use crate::core::job::{Category, JobRef, JobState};
pub use crate::core::queue::{ConcurrentQueue, JobQueue};
pub use crate::core::signal::Signal;
pub use crate::core::consumer::JobConsumer;
pub use crate::core::system::{JobSystem, JobSystemBuilder, JobSystemId};
pub use crate::core::shutdown::ShutdownHandle;
pub use crate::core::WorkerHook;
pub use crate::core::sync;

pub use crossbeam_utils::CachePadded;
