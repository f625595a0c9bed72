//! 三连接组（上传、下载、main）的归属表。
//!
//! # 教案式说明
//! - **意图 (Why)**：配对完成后三条 Line 彼此引用，任何一条都可能率先结束；
//!   把它们收进同一个组对象，各 Line 的 chain state 只保存 [`GroupKey`]，
//!   拆除时由 [`GroupArena::dissolve`] 一次性取出整组，不会出现“拆了一半”的组；
//! - **逻辑 (How)**：每个工作线程一个 `Slab`，键附带代际号，槽位复用后旧键立即失效；
//! - **契约 (What)**：组只由其所在线程访问；以失效键访问属于逻辑错误，直接 panic。

use parking_lot::Mutex;
use slab::Slab;
use spark_tunnel::WorkerId;

/// 组句柄：所属线程、槽位与代际。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupKey {
    worker: WorkerId,
    slot: usize,
    generation: u64,
}

impl GroupKey {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }
}

struct Entry<G> {
    generation: u64,
    group: G,
}

struct Shard<G> {
    slots: Slab<Entry<G>>,
    next_generation: u64,
}

pub struct GroupArena<G> {
    shards: Vec<Mutex<Shard<G>>>,
}

impl<G> GroupArena<G> {
    pub fn new(workers: usize) -> Self {
        Self {
            shards: (0..workers)
                .map(|_| {
                    Mutex::new(Shard {
                        slots: Slab::new(),
                        next_generation: 0,
                    })
                })
                .collect(),
        }
    }

    pub fn insert(&self, worker: WorkerId, group: G) -> GroupKey {
        let mut shard = self.shards[worker].lock();
        let generation = shard.next_generation;
        shard.next_generation += 1;
        let slot = shard.slots.insert(Entry { generation, group });
        GroupKey {
            worker,
            slot,
            generation,
        }
    }

    /// 就地访问组；闭包持锁执行，不得调用链路。
    ///
    /// # Panics
    /// 组已被拆除时 panic。
    pub fn with<R>(&self, key: GroupKey, f: impl FnOnce(&mut G) -> R) -> R {
        let mut shard = self.shards[key.worker].lock();
        match shard.slots.get_mut(key.slot) {
            Some(entry) if entry.generation == key.generation => f(&mut entry.group),
            _ => panic!("half-duplex group {key:?} is gone"),
        }
    }

    /// 取出整组，之后 `key` 失效。
    ///
    /// # Panics
    /// 组已被拆除时 panic：同一组只能拆除一次。
    pub fn dissolve(&self, key: GroupKey) -> G {
        let mut shard = self.shards[key.worker].lock();
        let live = shard
            .slots
            .get(key.slot)
            .is_some_and(|entry| entry.generation == key.generation);
        assert!(live, "half-duplex group {key:?} dissolved twice");
        shard.slots.remove(key.slot).group
    }

    pub fn contains(&self, key: GroupKey) -> bool {
        self.shards[key.worker]
            .lock()
            .slots
            .get(key.slot)
            .is_some_and(|entry| entry.generation == key.generation)
    }

    /// 所有线程上存活的组数。
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slot_invalidates_old_key() {
        let arena = GroupArena::new(1);
        let first = arena.insert(0, "first");
        assert_eq!(arena.dissolve(first), "first");
        let second = arena.insert(0, "second");

        assert!(!arena.contains(first));
        assert!(arena.contains(second));
        assert_eq!(arena.with(second, |group| *group), "second");
    }

    #[test]
    #[should_panic(expected = "dissolved twice")]
    fn double_dissolve_panics() {
        let arena = GroupArena::new(2);
        let key = arena.insert(1, ());
        arena.dissolve(key);
        arena.dissolve(key);
    }

    #[test]
    fn groups_are_counted_across_workers() {
        let arena = GroupArena::new(3);
        arena.insert(0, 1u8);
        let key = arena.insert(2, 2u8);
        assert_eq!(arena.len(), 2);
        assert_eq!(key.worker(), 2);
        arena.dissolve(key);
        assert_eq!(arena.len(), 1);
    }
}
