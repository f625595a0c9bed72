use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::pooled_buffer::{BufferRecycler, PooledBuffer};

/// 默认租借容量，覆盖绝大多数单次读写的负载大小。
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// `BufferPool` 是单个工作线程的缓冲来源，基于自由链表（Free List）复用 `BytesMut`。
///
/// # 模块角色（Why）
/// - 隧道链的每一级都会生成或转发负载，若每次都向堆申请内存，吞吐会被分配器拖垮；
/// - 借助 [`PooledBuffer`] 的 `Drop` 钩子自动回收，调用方只需“拿来用、用完丢”，
///   不必在错误路径上额外记账。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用容量足够的块；
/// - `PoolMetrics` 以原子计数跟踪 `allocated_bytes`、`available_bytes`、`active_leases` 等指标，
///   测试可据此证明“每个负载恰好释放一次”；
/// - 池句柄可廉价克隆（`Arc`），克隆体共享同一自由链表。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态由自旋锁与原子量保护，允许缓冲在其它线程被释放；
/// - **后置条件**：[`acquire_with`](Self::acquire_with) 返回的缓冲长度为 0，容量不小于请求值。
///
/// # 设计权衡（Trade-offs）
/// - 自旋锁的临界区只包含一次 `Vec` 查找或压栈，远短于一次线程切换，选用 `spin::Mutex` 足够；
/// - [`shrink_to_fit`](Self::shrink_to_fit) 采用“清空自由链表”的简单策略，便于压测后归还峰值内存。
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl BufferPool {
    /// 创建空池，`default_capacity` 为 [`acquire`](Self::acquire) 使用的租借容量。
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(default_capacity.max(1))),
        }
    }

    /// 以默认容量租借一个空缓冲。
    pub fn acquire(&self) -> PooledBuffer {
        self.acquire_with(self.inner.default_capacity)
    }

    /// 租借一个容量至少为 `min_capacity` 的空缓冲。
    pub fn acquire_with(&self, min_capacity: usize) -> PooledBuffer {
        let raw = self.inner.acquire_buffer(min_capacity);
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        PooledBuffer::new(raw, recycler)
    }

    /// 租借缓冲并写入 `data` 的副本。
    pub fn copy_from_slice(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.acquire_with(data.len().max(self.inner.default_capacity));
        buffer.put_slice(data);
        buffer
    }

    /// 清空自由链表，返回归还给系统的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    /// 读取当前统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl core::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferPool")
            .field("default_capacity", &self.inner.default_capacity)
            .field("stats", &self.inner.snapshot())
            .finish()
    }
}

/// 缓冲池的统计快照。
///
/// - `active_leases`：尚未归还的缓冲数量，测试中用于断言“无泄漏、无重复释放”；
/// - `total_leases`：累计租借次数，配合 `pool_misses` 观察自由链表命中率；
/// - `free_slots`：自由链表中待复用的块数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub total_leases: usize,
    pub pool_misses: usize,
    pub free_slots: usize,
}

struct PoolInner {
    default_capacity: usize,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity,
            free_list: Mutex::new(Vec::new()),
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足容量的 `BytesMut`。
    fn acquire_buffer(&self, min_capacity: usize) -> BytesMut {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|buf| buf.capacity() >= min_capacity)
                .map(|index| list.swap_remove(index))
        };

        let mut buffer = match reused {
            Some(buf) => {
                self.metrics.decrease_available(buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(min_capacity);
                self.metrics.increase_on_new_allocation(buf.capacity());
                buf
            }
        };
        buffer.clear();
        self.metrics.increase_active_leases();
        buffer
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::capacity).sum();
        list.clear();
        self.metrics.decrease_on_shrink(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_slots = self.free_list.lock().len();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            resident_bytes: self.metrics.resident_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Acquire),
            total_leases: self.metrics.total_leases.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
            free_slots,
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, mut buffer: BytesMut) {
        buffer.clear();
        let capacity = buffer.capacity();
        self.metrics.increase_available(capacity);
        self.free_list.lock().push(buffer);
        self.metrics.decrease_active_leases();
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    resident_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    total_leases: AtomicUsize,
    pool_misses: AtomicUsize,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.resident_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        saturating_sub(&self.allocated_bytes, capacity);
        saturating_sub(&self.resident_bytes, capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::AcqRel);
        self.total_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        let _ = self
            .active_leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(prev.saturating_sub(1))
            });
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusable_capacity_returns_to_pool() {
        let pool = BufferPool::new(64);
        {
            let mut writable = pool.acquire();
            assert!(writable.capacity() >= 64);
            writable.put_slice(&[1, 2, 3, 4]);
        }
        let snapshot = pool.statistics();
        assert!(snapshot.available_bytes >= 64);
        assert_eq!(snapshot.active_leases, 0);
        {
            let _second = pool.acquire_with(16);
            assert_eq!(pool.statistics().active_leases, 1);
        }
        let after = pool.statistics();
        assert_eq!(after.pool_misses, 1, "第二次租借应命中自由链表");
        assert_eq!(after.allocated_bytes, snapshot.allocated_bytes);
    }

    #[test]
    fn shrink_releases_free_list() {
        let pool = BufferPool::new(32);
        drop(pool.acquire());
        drop(pool.acquire_with(128));
        let before = pool.statistics();
        assert_eq!(before.free_slots, 2, "128 字节的请求无法复用 32 字节的块");
        let reclaimed = pool.shrink_to_fit();
        assert!(reclaimed >= 32);
        let after = pool.statistics();
        assert_eq!(after.free_slots, 0);
        assert_eq!(after.available_bytes, 0);
    }
}
