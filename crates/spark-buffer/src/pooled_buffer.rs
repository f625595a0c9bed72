use std::{fmt, mem, ops::Deref, sync::Arc};

use bytes::{Buf, BytesMut};

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - [`BufferPool`](crate::BufferPool) 只负责“租借”，缓冲在何处、何时结束生命周期由调用链决定；
/// - 通过该接口在 [`PooledBuffer`] 的 `Drop` 阶段统一通知池，
///   避免在隧道各级的错误路径上散落回收逻辑。
///
/// # 契约定义（What）
/// - `buffer`：本次租约持有的底层 `BytesMut`，可能已经被 `advance` 过；
/// - **前置条件**：实现必须线程安全且不得 panic，否则 `Drop` 路径上的 panic 将导致进程中止；
/// - **后置条件**：每个租约恰好回调一次。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 归还一块缓冲。
    fn reclaim(&self, buffer: BytesMut);
}

/// `PooledBuffer` 是在隧道链中流动的负载缓冲。
///
/// # 角色定位（Why）
/// - 半双工握手需要“剥离前缀”“前插头部”“合并半包”三类操作，
///   它们都在同一块可写内存上完成，避免重新分配；
/// - 所有权唯一：缓冲不可克隆，随 `Context` 移动，最终由唯一的消费者丢弃并回池。
///
/// # 契约说明（What）
/// - [`advance`](Self::advance) 丢弃前缀，越界时 panic（与 `bytes::Buf::advance` 一致）；
/// - [`prepend`](Self::prepend) 在原地挪动数据，只有容量不足时才扩容；
/// - [`append`](Self::append) 消耗另一个缓冲，被消耗的一方立即回到其所属池。
pub struct PooledBuffer {
    buf: BytesMut,
    recycler: Arc<dyn BufferRecycler>,
}

impl PooledBuffer {
    pub(crate) fn new(buf: BytesMut, recycler: Arc<dyn BufferRecycler>) -> Self {
        Self { buf, recycler }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// 在尾部追加字节。
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 丢弃前 `count` 字节。
    pub fn advance(&mut self, count: usize) {
        assert!(
            count <= self.buf.len(),
            "advance out of range: {count} > {}",
            self.buf.len()
        );
        self.buf.advance(count);
    }

    /// 在头部插入 `prefix`，原有内容整体后移。
    pub fn prepend(&mut self, prefix: &[u8]) {
        if prefix.is_empty() {
            return;
        }
        let body_len = self.buf.len();
        self.buf.resize(body_len + prefix.len(), 0);
        self.buf.copy_within(0..body_len, prefix.len());
        self.buf[..prefix.len()].copy_from_slice(prefix);
    }

    /// 合并另一个缓冲的内容到尾部，`other` 随即归还。
    pub fn append(&mut self, other: PooledBuffer) {
        self.buf.extend_from_slice(other.as_slice());
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        self.recycler.reclaim(buf);
    }
}
