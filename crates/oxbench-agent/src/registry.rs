use crate::error::{AgentError, Result};
use crate::job::Job;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory store of the jobs known to this agent.
///
/// Ids are handed out from an atomic counter starting at 1 and are never
/// reused, even after the job is removed. Only [`JobRegistry::add`] can fail;
/// lookups of unknown ids degrade to `None`.
///
/// # Examples
///
/// ```
/// use oxbench_agent::job::Job;
/// use oxbench_agent::registry::JobRegistry;
/// use oxbench_common::types::{JobOptions, OperatingSystem};
///
/// let registry = JobRegistry::new();
/// let job = registry
///     .add(Job::new("json", OperatingSystem::Linux, JobOptions::default()))
///     .unwrap();
/// assert_eq!(job.id(), 1);
/// assert!(registry.find(1).is_some());
/// assert!(registry.remove(1).is_some());
/// assert!(registry.find(1).is_none());
/// ```
pub struct JobRegistry {
    jobs: RwLock<HashMap<u64, Arc<Job>>>,
    next_id: AtomicU64,
    allowed_domains: Vec<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_allowed_domains(Vec::new())
    }

    pub fn with_allowed_domains(allowed_domains: Vec<String>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allowed_domains,
        }
    }

    /// Domains collaborators validate job supplied URLs against.
    pub fn allowed_domains(&self) -> &[String] {
        &self.allowed_domains
    }

    /// Registers `job` under a fresh id and returns the shared handle.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidArgument`] if the job already has an id.
    pub fn add(&self, mut job: Job) -> Result<Arc<Job>> {
        if job.id() != 0 {
            return Err(AgentError::InvalidArgument(format!(
                "job already has id {}, new jobs must have id 0",
                job.id()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        job.assign_id(id);
        let job = Arc::new(job);

        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&job));

        tracing::info!(job_id = id, service = %job.service(), os = %job.operating_system(), "Job registered");
        Ok(job)
    }

    pub fn find(&self, id: u64) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of all registered jobs, ordered by id.
    pub fn get_all(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id());
        jobs
    }

    /// Removes a job and raises its ending signal, so any telemetry session
    /// bound to it starts shutting down.
    pub fn remove(&self, id: u64) -> Option<Arc<Job>> {
        let removed = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        match &removed {
            Some(job) => {
                job.mark_ending();
                tracing::info!(job_id = id, "Job removed");
            }
            None => tracing::debug!(job_id = id, "Remove of unknown job ignored"),
        }
        removed
    }

    /// Stores `job` under its id. Passing the instance that is already
    /// stored is a no-op; unassigned jobs are ignored.
    ///
    /// A replaced instance leaves the registry, so its ending signal is
    /// raised just as [`JobRegistry::remove`] would.
    pub fn update(&self, job: Arc<Job>) {
        let id = job.id();
        if id == 0 {
            tracing::debug!("Update of unregistered job ignored");
            return;
        }

        let replaced = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if jobs.get(&id).is_some_and(|stored| Arc::ptr_eq(stored, &job)) {
                return;
            }
            jobs.insert(id, job)
        };

        if let Some(old) = replaced {
            old.mark_ending();
        }
        tracing::debug!(job_id = id, "Job updated");
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use oxbench_common::types::{JobOptions, OperatingSystem};
    use std::collections::HashSet;
    use std::thread;

    fn job(service: &str) -> Job {
        Job::new(service, OperatingSystem::Linux, JobOptions::default())
    }

    fn job_with_id(id: u64) -> Job {
        Job::from_definition(JobDefinition {
            id,
            service: "preassigned".to_string(),
            ..JobDefinition::default()
        })
    }

    #[test]
    fn ids_start_at_one_and_are_not_reused() {
        let registry = JobRegistry::new();
        let a = registry.add(job("a")).unwrap();
        let b = registry.add(job("b")).unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));

        registry.remove(b.id());
        let c = registry.add(job("c")).unwrap();
        assert_eq!(c.id(), 3);
    }

    #[test]
    fn add_with_preassigned_id_fails_and_leaves_registry_unchanged() {
        let registry = JobRegistry::new();
        registry.add(job("a")).unwrap();

        let err = registry.add(job_with_id(7)).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
        assert_eq!(registry.len(), 1);
        assert!(registry.find(7).is_none());

        // the failed call does not consume an id
        assert_eq!(registry.add(job("b")).unwrap().id(), 2);
    }

    #[test]
    fn concurrent_adds_get_unique_ids() {
        let registry = Arc::new(JobRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| registry.add(job(&format!("t{t}-{i}"))).unwrap().id())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids increase per caller");
            for id in ids {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 400);
        assert_eq!(registry.len(), 400);
        assert_eq!(all.iter().copied().max(), Some(400));
    }

    #[test]
    fn unknown_ids_are_absent() {
        let registry = JobRegistry::new();
        assert!(registry.find(42).is_none());
        assert!(registry.remove(42).is_none());
        assert!(registry.remove(42).is_none());
    }

    #[test]
    fn remove_then_find_is_absent_and_signals_ending() {
        let registry = JobRegistry::new();
        let job = registry.add(job("a")).unwrap();
        assert!(!job.is_ending());

        let removed = registry.remove(job.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &job));
        assert!(job.is_ending());
        assert!(registry.find(job.id()).is_none());
    }

    #[test]
    fn get_all_is_a_snapshot() {
        let registry = JobRegistry::new();
        for name in ["a", "b", "c"] {
            registry.add(job(name)).unwrap();
        }

        let snapshot = registry.get_all();
        registry.remove(2);
        registry.add(job("d")).unwrap();

        let ids: Vec<u64> = snapshot.iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let ids: Vec<u64> = registry.get_all().iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn update_with_same_instance_is_a_no_op() {
        let registry = JobRegistry::new();
        let stored = registry.add(job("a")).unwrap();

        registry.update(Arc::clone(&stored));
        assert!(Arc::ptr_eq(&registry.find(1).unwrap(), &stored));
    }

    #[test]
    fn update_with_distinct_instance_replaces_entry() {
        let registry = JobRegistry::new();
        let stored = registry.add(job("a")).unwrap();

        let replacement = Arc::new(job_with_id(stored.id()));
        registry.update(Arc::clone(&replacement));

        let found = registry.find(stored.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &replacement));
        assert_eq!(found.service(), "preassigned");
        assert_eq!(registry.len(), 1);

        // the replaced instance is gone from the registry
        assert!(stored.is_ending());
        assert!(!replacement.is_ending());
        registry.remove(stored.id());
        assert!(replacement.is_ending());
    }

    #[test]
    fn update_with_same_instance_keeps_it_running() {
        let registry = JobRegistry::new();
        let stored = registry.add(job("a")).unwrap();
        registry.update(Arc::clone(&stored));
        assert!(!stored.is_ending());
    }

    #[test]
    fn update_ignores_unassigned_job() {
        let registry = JobRegistry::new();
        registry.update(Arc::new(job("a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn allowed_domains_are_exposed() {
        let registry = JobRegistry::with_allowed_domains(vec!["example.com".to_string()]);
        assert_eq!(registry.allowed_domains(), ["example.com".to_string()]);
    }
}
