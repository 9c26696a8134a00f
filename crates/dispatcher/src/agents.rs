use std::{
    fmt,
    num::NonZeroUsize,
    sync::Arc,
};

use errors::ErrorMetadata;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::{
    metrics::log_fallback_overfill,
    DispatchStats,
    FallbackPolicy,
};

/// Index of an agent in the configured agent list.
pub type AgentId = usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Agent {
    pub id: AgentId,
    pub address: String,
}

/// How [`AgentTable::acquire`] arrived at its agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The placement cache mapped the key to an agent under the ceiling.
    PlacementCache,
    /// A random draw found an agent under the ceiling.
    RandomDraw,
    /// Every agent was at the ceiling and the fallback policy picked one
    /// anyway.
    Overfill,
}

struct TableState {
    load: Vec<usize>,
    placement: Option<LruCache<String, AgentId>>,
}

/// The fixed agent pool with its in-flight counters and the placement cache.
///
/// Counters and placement entries share one lock: reading a mapping, checking
/// the mapped agent's load and incrementing it happen in a single critical
/// section, so two dispatches can never both observe room for one slot.
pub struct AgentTable {
    agents: Vec<Agent>,
    ceiling: usize,
    fallback_policy: FallbackPolicy,
    state: Mutex<TableState>,
}

impl AgentTable {
    pub fn new(
        addresses: Vec<String>,
        ceiling: usize,
        fallback_policy: FallbackPolicy,
        placement_capacity: Option<NonZeroUsize>,
    ) -> Arc<Self> {
        let agents: Vec<_> = addresses
            .into_iter()
            .enumerate()
            .map(|(id, address)| Agent { id, address })
            .collect();
        let state = TableState {
            load: vec![0; agents.len()],
            placement: placement_capacity.map(LruCache::new),
        };
        Arc::new(Self {
            agents,
            ceiling,
            fallback_policy,
            state: Mutex::new(state),
        })
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn address(&self, id: AgentId) -> Option<&str> {
        self.agents.get(id).map(|agent| agent.address.as_str())
    }

    pub fn load(&self, id: AgentId) -> usize {
        self.state.lock().load.get(id).copied().unwrap_or(0)
    }

    pub fn loads(&self) -> Vec<usize> {
        self.state.lock().load.clone()
    }

    pub fn placement_len(&self) -> usize {
        self.state
            .lock()
            .placement
            .as_ref()
            .map_or(0, |cache| cache.len())
    }

    pub fn placement_of(&self, key: &str) -> Option<AgentId> {
        self.state
            .lock()
            .placement
            .as_ref()
            .and_then(|cache| cache.peek(key).copied())
    }

    /// Takes a slot on `id` if it is under the ceiling.
    pub fn try_acquire(self: &Arc<Self>, id: AgentId) -> Option<LoadGuard> {
        let mut state = self.state.lock();
        let load = state.load.get_mut(id)?;
        if *load >= self.ceiling {
            return None;
        }
        *load += 1;
        Some(LoadGuard::new(self.clone(), id))
    }

    /// Takes a slot on `id` regardless of the ceiling.
    #[cfg(any(test, feature = "testing"))]
    pub fn force_acquire(self: &Arc<Self>, id: AgentId) -> LoadGuard {
        self.state.lock().load[id] += 1;
        LoadGuard::new(self.clone(), id)
    }

    /// Picks an agent for a dispatch and takes a slot on it.
    ///
    /// With a placement key and an active placement cache, a mapped agent
    /// under the ceiling wins. Otherwise agents are drawn at random without
    /// replacement until one is under the ceiling; if none is, the fallback
    /// policy decides. A random selection is recorded under the placement key.
    pub fn acquire(
        self: &Arc<Self>,
        placement_key: Option<&str>,
        stats: &DispatchStats,
    ) -> anyhow::Result<(LoadGuard, Selection)> {
        anyhow::ensure!(
            !self.agents.is_empty(),
            ErrorMetadata::bad_request("Unreachable", "No agents are configured")
        );
        let mut state = self.state.lock();
        let TableState { load, placement } = &mut *state;

        let placement_key = placement_key.filter(|_| placement.is_some());
        if let (Some(key), Some(cache)) = (placement_key, placement.as_mut()) {
            if let Some(&id) = cache.get(key) {
                if load[id] < self.ceiling {
                    load[id] += 1;
                    stats.record_placement_cache_hit();
                    return Ok((LoadGuard::new(self.clone(), id), Selection::PlacementCache));
                }
                stats.record_load_rejected();
            }
        }

        let mut order: Vec<AgentId> = (0..self.agents.len()).collect();
        order.shuffle(&mut rand::rng());
        let (id, selection) = match order.iter().find(|&&id| load[id] < self.ceiling) {
            Some(&id) => (id, Selection::RandomDraw),
            None => {
                let id = match self.fallback_policy {
                    FallbackPolicy::LastDraw => order[order.len() - 1],
                    FallbackPolicy::LeastLoaded => (0..load.len())
                        .min_by_key(|&id| (load[id], id))
                        .unwrap_or(0),
                };
                log_fallback_overfill();
                tracing::debug!(
                    "All {} agents at ceiling {}, overfilling agent {id}",
                    self.agents.len(),
                    self.ceiling
                );
                (id, Selection::Overfill)
            },
        };
        load[id] += 1;
        if let (Some(key), Some(cache)) = (placement_key, placement.as_mut()) {
            cache.put(key.to_owned(), id);
            stats.record_placement_miss();
        }
        Ok((LoadGuard::new(self.clone(), id), selection))
    }

    fn release(&self, id: AgentId) {
        let mut state = self.state.lock();
        let load = &mut state.load[id];
        debug_assert!(*load > 0, "Released agent {id} with no load");
        *load = load.saturating_sub(1);
    }
}

impl fmt::Debug for AgentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTable")
            .field("agents", &self.agents)
            .field("ceiling", &self.ceiling)
            .field("load", &self.loads())
            .finish()
    }
}

/// One in-flight dispatch to an agent. Dropping the guard gives the slot
/// back, whichever way the dispatch ended.
#[must_use]
pub struct LoadGuard {
    table: Arc<AgentTable>,
    id: AgentId,
}

impl LoadGuard {
    fn new(table: Arc<AgentTable>, id: AgentId) -> Self {
        Self { table, id }
    }

    pub fn agent_id(&self) -> AgentId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.table.agents[self.id].address
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

impl fmt::Debug for LoadGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadGuard").field("agent", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::Arc,
    };

    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;

    use super::{
        AgentTable,
        Selection,
    };
    use crate::{
        DispatchStats,
        FallbackPolicy,
    };

    fn table(agents: usize, ceiling: usize, placement: Option<usize>) -> Arc<AgentTable> {
        AgentTable::new(
            (0..agents).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect(),
            ceiling,
            FallbackPolicy::LastDraw,
            placement.and_then(NonZeroUsize::new),
        )
    }

    #[test]
    fn test_guard_returns_counter_to_prior_value() -> anyhow::Result<()> {
        let table = table(4, 6, None);
        let stats = DispatchStats::default();
        let (guard, selection) = table.acquire(None, &stats)?;
        assert_eq!(selection, Selection::RandomDraw);
        assert_eq!(table.load(guard.agent_id()), 1);
        assert_eq!(table.loads().iter().sum::<usize>(), 1);
        drop(guard);
        assert_eq!(table.loads(), vec![0; 4]);
        Ok(())
    }

    #[test]
    fn test_empty_table_is_unreachable() {
        let table = table(0, 6, None);
        let err = table.acquire(None, &DispatchStats::default()).unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "Unreachable");
    }

    #[test]
    fn test_try_acquire_respects_ceiling() {
        let table = table(2, 2, None);
        let a = table.try_acquire(1).unwrap();
        let b = table.try_acquire(1).unwrap();
        assert!(table.try_acquire(1).is_none());
        assert!(table.try_acquire(7).is_none());
        drop(a);
        let c = table.try_acquire(1).unwrap();
        assert_eq!(table.load(1), 2);
        drop((b, c));
        assert_eq!(table.load(1), 0);
    }

    #[test]
    fn test_random_draw_finds_the_only_free_agent() -> anyhow::Result<()> {
        let table = table(4, 1, None);
        let stats = DispatchStats::default();
        let _held: Vec<_> = [0, 1, 3].into_iter().map(|id| table.force_acquire(id)).collect();
        for _ in 0..20 {
            let (guard, selection) = table.acquire(None, &stats)?;
            assert_eq!(guard.agent_id(), 2);
            assert_eq!(selection, Selection::RandomDraw);
        }
        Ok(())
    }

    #[test]
    fn test_last_draw_overfills_when_all_at_ceiling() -> anyhow::Result<()> {
        let table = table(3, 1, None);
        let stats = DispatchStats::default();
        let _held: Vec<_> = (0..3).map(|id| table.force_acquire(id)).collect();
        let (guard, selection) = table.acquire(None, &stats)?;
        assert_eq!(selection, Selection::Overfill);
        assert_eq!(table.load(guard.agent_id()), 2);
        Ok(())
    }

    #[test]
    fn test_least_loaded_overfills_lowest_counter() -> anyhow::Result<()> {
        let table = AgentTable::new(
            vec!["a:1".into(), "b:1".into(), "c:1".into()],
            1,
            FallbackPolicy::LeastLoaded,
            None,
        );
        let stats = DispatchStats::default();
        let _held = [
            table.force_acquire(0),
            table.force_acquire(0),
            table.force_acquire(1),
            table.force_acquire(2),
            table.force_acquire(2),
        ];
        let (guard, selection) = table.acquire(None, &stats)?;
        assert_eq!(selection, Selection::Overfill);
        assert_eq!(guard.agent_id(), 1);
        Ok(())
    }

    #[test]
    fn test_placement_sticks_until_overloaded() -> anyhow::Result<()> {
        let table = table(4, 6, Some(5));
        let stats = DispatchStats::default();
        let (first, selection) = table.acquire(Some("echo"), &stats)?;
        assert_eq!(selection, Selection::RandomDraw);
        let chosen = first.agent_id();
        drop(first);
        assert_eq!(table.placement_of("echo"), Some(chosen));
        for _ in 0..7 {
            let (guard, selection) = table.acquire(Some("echo"), &stats)?;
            assert_eq!(selection, Selection::PlacementCache);
            assert_eq!(guard.agent_id(), chosen);
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.placement_cache_hits, 7);
        assert_eq!(snapshot.placement_misses, 1);

        let _held: Vec<_> = (0..6).map(|_| table.force_acquire(chosen)).collect();
        let (guard, selection) = table.acquire(Some("echo"), &stats)?;
        assert_eq!(selection, Selection::RandomDraw);
        assert_ne!(guard.agent_id(), chosen);
        assert_eq!(table.placement_of("echo"), Some(guard.agent_id()));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.load_rejected, 1);
        assert_eq!(snapshot.placement_misses, 2);
        Ok(())
    }

    #[test]
    fn test_placement_cache_is_bounded() -> anyhow::Result<()> {
        let table = table(4, 6, Some(3));
        let stats = DispatchStats::default();
        for i in 0..10 {
            let _ = table.acquire(Some(&format!("fn-{i}")), &stats)?;
            assert!(table.placement_len() <= 3);
        }
        assert_eq!(table.placement_len(), 3);
        Ok(())
    }

    #[test]
    fn test_concurrent_acquires_never_exceed_ceiling() {
        let table = table(4, 3, Some(5));
        let stats = Arc::new(DispatchStats::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let key = if i % 2 == 0 { "even" } else { "odd" };
                        let (guard, _) = table.acquire(Some(key), &stats).unwrap();
                        // 8 threads each hold at most one guard; with 12
                        // slots available the ceiling is never forced.
                        assert!(table.load(guard.agent_id()) <= 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.loads(), vec![0; 4]);
    }
}
