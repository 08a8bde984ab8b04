//! Reusable job instances, shelved by class
//!
//! Pulse volume makes job allocation a measurable cost; monitors that
//! re-mint the same probe every interval can recycle instead. Every
//! returned job is reset before shelving, and the reset is verified: a
//! stale `enqueue_time` on a reused instance would poison the queue's
//! wait statistics.

use dashmap::DashMap;

use crate::job::{Job, JobClass};
use crate::types::{CoreError, Result};

/// Per-class shelf of reset job instances
pub struct JobFreelist {
    shelves: DashMap<JobClass, Vec<Box<dyn Job>>>,
    max_per_class: usize,
}

impl JobFreelist {
    pub fn new(max_per_class: usize) -> Self {
        Self {
            shelves: DashMap::new(),
            max_per_class,
        }
    }

    /// Pop a reusable instance of `class`, if any is shelved.
    pub fn get(&self, class: JobClass) -> Option<Box<dyn Job>> {
        self.shelves.get_mut(&class).and_then(|mut shelf| shelf.pop())
    }

    /// Reset and shelve a finished job. Returns false when the class
    /// shelf is full and the job was dropped instead.
    ///
    /// A job whose `reset` leaves timestamps in place has broken the
    /// reuse contract; it is refused with `InvalidJob` rather than
    /// shelved, since its next trip through a queue would corrupt the
    /// wait statistics.
    pub fn put(&self, mut job: Box<dyn Job>) -> Result<bool> {
        job.reset();
        if job.enqueue_time().is_some() || job.start_time().is_some() {
            return Err(CoreError::InvalidJob(format!(
                "job {} reset left timestamps in place",
                job.id()
            )));
        }
        let mut shelf = self.shelves.entry(job.class()).or_default();
        if shelf.len() >= self.max_per_class {
            return Ok(false);
        }
        shelf.push(job);
        Ok(true)
    }

    /// Shelved instances of `class`
    pub fn len(&self, class: JobClass) -> usize {
        self.shelves.get(&class).map_or(0, |shelf| shelf.len())
    }

    pub fn is_empty(&self) -> bool {
        JobClass::ALL.iter().all(|class| self.len(*class) == 0)
    }
}
