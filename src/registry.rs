//! The job registry: canonical identifier → job.

use crate::{
    error::{Result, StrataError},
    job::Job,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

/// Registers jobs by canonical identifier and resolves lookups.
///
/// Registration happens during the configuration phase and is thread-safe;
/// afterwards the registry is read-mostly and reads never block each other.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job; identifier collisions are fatal.
    pub fn register(&self, job: Arc<Job>) -> Result<()> {
        let id = job.id().to_string();
        let mut jobs = self.jobs.write().expect("job registry lock poisoned");
        if jobs.contains_key(&id) {
            return Err(StrataError::DuplicateJob(id));
        }
        trace!(job = %id, "registered job");
        jobs.insert(id, job);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().expect("job registry lock poisoned").get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.read().expect("job registry lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().expect("job registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all registered jobs, sorted by identifier.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let jobs = self.jobs.read().expect("job registry lock poisoned");
        let mut jobs: Vec<_> = jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id().to_string());
        jobs
    }
}
