//! Process-wide LRU of warm deciders, keyed by run id.
//!
//! Sticky execution depends on this: the server routes a run's next task to
//! the worker holding its warm decider, which then replays only the new
//! events. The cache is the single mutable structure shared across worker
//! threads; one mutex guards the map, the LRU order, and the
//! "in-processing" pin set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;
use windward_types::task::WorkflowTask;

use crate::decider::Decider;
use crate::error::DeciderError;

struct CacheInner {
    max_entries: usize,
    entries: HashMap<String, Decider>,
    /// Front = most recently used.
    lru: VecDeque<String>,
    /// Runs currently being processed; never evicted.
    processing: HashSet<String>,
}

pub struct DeciderCache {
    inner: Mutex<CacheInner>,
}

impl DeciderCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                max_entries,
                entries: HashMap::new(),
                lru: VecDeque::new(),
                processing: HashSet::new(),
            }),
        }
    }

    /// Fetch the warm decider for a task, or build one with `create`.
    ///
    /// A task carrying history from event 1 unconditionally discards any
    /// cached decider: the server only sends full history when the sticky
    /// state is not to be trusted.
    pub fn get_or_create(
        &self,
        task: &WorkflowTask,
        create: impl FnOnce() -> Decider,
    ) -> Result<Decider, DeciderError> {
        let run_id = task.execution.run_id.clone();
        let mut inner = self.inner.lock().expect("decider cache lock");
        inner.processing.insert(run_id.clone());

        if task.starts_at_history_begin() {
            if let Some(mut stale) = inner.entries.remove(&run_id) {
                debug!(run_id = %run_id, "full history arrived; discarding cached decider");
                inner.lru.retain(|r| r != &run_id);
                stale.close();
            }
            return Ok(create());
        }

        match inner.entries.remove(&run_id) {
            Some(decider) => {
                inner.lru.retain(|r| r != &run_id);
                Ok(decider)
            }
            None => Ok(create()),
        }
    }

    /// Unpin a run after its task finished processing.
    pub fn mark_processing_done(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("decider cache lock");
        inner.processing.remove(run_id);
    }

    /// Return a decider to the cache, evicting over the size bound.
    pub fn add_to_cache(&self, run_id: &str, decider: Decider) {
        let mut inner = self.inner.lock().expect("decider cache lock");
        inner.entries.insert(run_id.to_string(), decider);
        inner.lru.retain(|r| r != run_id);
        inner.lru.push_front(run_id.to_string());

        while inner.entries.len() > inner.max_entries {
            let Some(victim) = pick_eviction_victim(&inner, None) else {
                break;
            };
            evict(&mut inner, &victim);
        }
    }

    /// Drop a run's cached state entirely.
    pub fn invalidate(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("decider cache lock");
        evict(&mut inner, &run_id.to_string());
    }

    /// Force-evict the least recently used entry that is not pinned, to
    /// reclaim memory when the worker is saturated. Returns whether an
    /// entry was freed.
    pub fn evict_any_not_in_processing(&self, except_run_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("decider cache lock");
        match pick_eviction_victim(&inner, Some(except_run_id)) {
            Some(victim) => {
                evict(&mut inner, &victim);
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("decider cache lock").entries.len()
    }
}

fn pick_eviction_victim(inner: &CacheInner, except: Option<&str>) -> Option<String> {
    inner
        .lru
        .iter()
        .rev()
        .find(|run_id| {
            !inner.processing.contains(run_id.as_str()) && Some(run_id.as_str()) != except
        })
        .cloned()
}

fn evict(inner: &mut CacheInner, run_id: &String) {
    if let Some(mut decider) = inner.entries.remove(run_id) {
        debug!(run_id = %run_id, "evicting cached decider");
        decider.close();
    }
    inner.lru.retain(|r| r != run_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::DeciderConfig;
    use crate::testing::TestHistoryBuilder;
    use windward_types::WorkflowExecution;

    fn decider(run_id: &str) -> Decider {
        Decider::new(
            WorkflowExecution::new("wf", run_id),
            "Test",
            crate::context::workflow_fn(|_ctx| async {
                Ok(crate::state::WorkflowExitValue::Normal(None))
            }),
            DeciderConfig::default(),
        )
    }

    fn full_task(run_id: &str) -> WorkflowTask {
        let mut t = TestHistoryBuilder::default();
        t.add_workflow_started("Test");
        t.add_workflow_task_scheduled_and_started();
        t.as_workflow_task(&WorkflowExecution::new("wf", run_id))
            .unwrap()
    }

    fn partial_task(run_id: &str) -> WorkflowTask {
        let mut task = full_task(run_id);
        task.history.retain(|e| e.event_id >= 2);
        task
    }

    #[test]
    fn full_history_discards_the_cached_decider() {
        let cache = DeciderCache::new(4);
        cache.add_to_cache("r1", decider("r1"));
        assert_eq!(cache.size(), 1);

        let fresh = cache.get_or_create(&full_task("r1"), || decider("r1")).unwrap();
        // The stale entry is gone and a new decider was built.
        assert_eq!(cache.size(), 0);
        drop(fresh);
    }

    #[test]
    fn partial_history_reuses_the_cached_decider() {
        let cache = DeciderCache::new(4);
        cache.add_to_cache("r1", decider("r1"));
        let _warm = cache
            .get_or_create(&partial_task("r1"), || panic!("should hit the cache"))
            .unwrap();
        assert_eq!(cache.size(), 0); // checked out while processing
    }

    #[test]
    fn lru_bound_evicts_down_to_capacity() {
        let cache = DeciderCache::new(2);
        cache.add_to_cache("r1", decider("r1"));
        cache.add_to_cache("r2", decider("r2"));
        cache.add_to_cache("r3", decider("r3"));
        assert_eq!(cache.size(), 2);

        assert!(cache.evict_any_not_in_processing("none"));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn pinned_entries_survive_forced_eviction() {
        let cache = DeciderCache::new(4);
        // Pin r1 by starting to process it.
        let task = partial_task("r1");
        let d = cache.get_or_create(&task, || decider("r1")).unwrap();
        cache.add_to_cache("r1", d);

        assert!(!cache.evict_any_not_in_processing("other"));
        cache.mark_processing_done("r1");
        assert!(cache.evict_any_not_in_processing("other"));
        assert_eq!(cache.size(), 0);
    }
}
