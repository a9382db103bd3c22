use std::time::{Duration, Instant};

use crate::sync::Arc;

use super::job::Category;
use super::queue::JobQueue;
use super::system::JobSystem;

/// A lightweight, possibly stack-local puller of jobs.
///
/// A consumer lists the category queues it services, in registration order.
/// That order is the tie-break when several subscribed queues have work: the
/// earliest registered category wins. This is priority-by-registration-order,
/// not fairness.
///
/// Consumers hold no job state of their own; creating one per worker loop (or
/// on the stack around a `JobRef::wait` call) is the expected usage.
pub struct JobConsumer {
    queues: Vec<(Category, Arc<JobQueue>)>,
}

impl JobConsumer {
    pub fn new() -> Self {
        JobConsumer { queues: Vec::new() }
    }

    /// Subscribe to a category's queue. Registering the same category twice
    /// is a no-op, as is registering a category the system doesn't have.
    pub fn add_category(&mut self, system: &JobSystem, category: Category) {
        if self.queues.iter().any(|(registered, _)| *registered == category) {
            return;
        }

        if let Some(queue) = system.get_queue(category) {
            self.queues.push((category, queue));
        }
    }

    /// Dequeue and run one job to completion.
    ///
    /// Queues are tried in registration order; returns false if all of them
    /// were empty.
    pub fn consume_job(&mut self) -> bool {
        for (_, queue) in &self.queues {
            if let Some(job) = queue.dequeue() {
                job.execute();
                // Dropping `job` here releases the queue's reference.
                return true;
            }
        }

        false
    }

    /// Run jobs until every subscribed queue comes up empty once. Returns the
    /// number of jobs processed.
    pub fn consume_all_jobs(&mut self) -> u32 {
        let mut count = 0;
        while self.consume_job() {
            count += 1;
        }

        count
    }

    /// Run jobs until a dequeue fails or the time budget is exceeded,
    /// whichever comes first. An empty queue ends the call immediately rather
    /// than spinning out the rest of the budget.
    pub fn consume_for(&mut self, budget: Duration) -> u32 {
        let start = Instant::now();

        let mut count = 0;
        while start.elapsed() < budget {
            if !self.consume_job() {
                break;
            }
            count += 1;
        }

        count
    }
}

impl Default for JobConsumer {
    fn default() -> Self {
        JobConsumer::new()
    }
}
