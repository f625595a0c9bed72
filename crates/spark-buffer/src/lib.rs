//! `spark-buffer` 为隧道数据面提供按工作线程划分的字节缓冲池。
//!
//! # 模块定位（Why）
//! - 每个工作线程持有一个 [`BufferPool`]，负载在链路各级之间以 [`PooledBuffer`] 的形式移动，
//!   从而避免逐包向系统申请内存。
//! - 缓冲在任何退出路径（正常消费、错误丢弃、队列清空）上都必须回到池中，
//!   因此回收动作挂在 `Drop` 上，调用方无需显式归还。
//!
//! # 设计概要（How）
//! - `pool` 模块维护基于 `spin::Mutex<Vec<BytesMut>>` 的自由链表与原子统计；
//! - `pooled_buffer` 模块实现 `PooledBuffer`，提供追加、前插、合并、前移等半双工协议所需的操作；
//! - 通过 [`BufferRecycler`] trait 将“归还”显式化，池与缓冲之间只通过该接口耦合。
//!
//! # 契约（What）
//! - 所有公开类型均满足 `Send + Sync + 'static`，可以随 `Context` 跨线程移动；
//! - 缓冲跨线程后仍会回到其出生的池，统计口径以池为单位。

mod pool;
mod pooled_buffer;

pub use pool::{BufferPool, DEFAULT_BUFFER_CAPACITY, PoolStats};
pub use pooled_buffer::{BufferRecycler, PooledBuffer};
