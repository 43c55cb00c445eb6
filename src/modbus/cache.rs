//! Register cache.
//!
//! The only cross-task shared state in the daemon (SPEC_FULL.md / base spec
//! §5): each Scan Loop owns and writes its own blocks exclusively, while
//! readers (the Feature Registry, the MQTT Plane) take cheap immutable
//! snapshots that never block a concurrent write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

/// Identifies one register block within one unit on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub unit_id: u8,
    pub start: u16,
}

struct BlockEntry {
    values: Arc<[u16]>,
    generation: u64,
    last_read_at: Instant,
}

/// `(unit_id, address) -> u16` store, mutated only by block-level replace.
pub struct RegisterCache {
    blocks: RwLock<HashMap<BlockKey, BlockEntry>>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Replace an entire block's values atomically, bumping its generation
    /// counter. Called only by the Scan Loop that owns `unit_id`/`start`.
    pub async fn update_block(&self, unit_id: u8, start: u16, values: Vec<u16>) -> u64 {
        let key = BlockKey { unit_id, start };
        let mut blocks = self.blocks.write().await;
        let generation = blocks.get(&key).map(|e| e.generation + 1).unwrap_or(0);
        blocks.insert(
            key,
            BlockEntry {
                values: Arc::from(values.into_boxed_slice()),
                generation,
                last_read_at: Instant::now(),
            },
        );
        generation
    }

    /// A cheap clone of the current values for one block, or `None` if the
    /// block has never been read.
    pub async fn snapshot(&self, unit_id: u8, start: u16) -> Option<Arc<[u16]>> {
        let blocks = self.blocks.read().await;
        blocks.get(&BlockKey { unit_id, start }).map(|e| e.values.clone())
    }

    pub async fn generation(&self, unit_id: u8, start: u16) -> Option<u64> {
        let blocks = self.blocks.read().await;
        blocks.get(&BlockKey { unit_id, start }).map(|e| e.generation)
    }

    pub async fn last_read_at(&self, unit_id: u8, start: u16) -> Option<Instant> {
        let blocks = self.blocks.read().await;
        blocks.get(&BlockKey { unit_id, start }).map(|e| e.last_read_at)
    }

    /// A single register's current value, found by scanning whichever
    /// cached block contains `address`. Blocks are few per unit, so a
    /// linear scan is the simplest correct approach.
    pub async fn value(&self, unit_id: u8, address: u16) -> Option<u16> {
        let blocks = self.blocks.read().await;
        blocks.iter().find_map(|(key, entry)| {
            if key.unit_id != unit_id {
                return None;
            }
            let len = entry.values.len() as u16;
            if address >= key.start && address < key.start + len {
                Some(entry.values[(address - key.start) as usize])
            } else {
                None
            }
        })
    }
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_then_read_back() {
        let cache = RegisterCache::new();
        cache.update_block(1, 100, vec![10, 20, 30]).await;
        assert_eq!(cache.value(1, 100).await, Some(10));
        assert_eq!(cache.value(1, 101).await, Some(20));
        assert_eq!(cache.value(1, 102).await, Some(30));
        assert_eq!(cache.value(1, 103).await, None);
        assert_eq!(cache.value(2, 100).await, None);
    }

    #[tokio::test]
    async fn generation_bumps_on_update() {
        let cache = RegisterCache::new();
        let g0 = cache.update_block(1, 0, vec![1]).await;
        let g1 = cache.update_block(1, 0, vec![2]).await;
        assert_eq!(g0, 0);
        assert_eq!(g1, 1);
    }

    #[tokio::test]
    async fn snapshot_is_independent_of_later_writes() {
        let cache = RegisterCache::new();
        cache.update_block(1, 0, vec![1, 2, 3]).await;
        let snap = cache.snapshot(1, 0).await.unwrap();
        cache.update_block(1, 0, vec![9, 9, 9]).await;
        assert_eq!(&*snap, &[1, 2, 3]);
    }
}
