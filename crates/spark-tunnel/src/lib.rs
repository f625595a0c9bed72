//! `spark-tunnel`：隧道链的数据面原语。
//!
//! # 模块定位（Why）
//! - 隧道链由若干 stage 线性组成，负责把双向字节流逐级转换（复用、分帧、协议翻译）；
//! - 本 crate 提供所有 stage 共用的底座：连接身份 [`Line`]、在途消息 [`Context`]、
//!   逐级转发 [`Chain`]/[`Hop`]、跨线程移交 [`PipeLine`] 以及工作线程调度 [`Scheduler`]。
//!
//! # 设计概要（How）
//! - 每个工作线程一个事件循环；Line 与其上的状态归属单一线程，
//!   跨线程只通过 [`Scheduler::post`] 投递任务；
//! - 背压以 [`FlowControl`] trait 表达，注册在 Line 的上下两侧；
//! - 负载缓冲来自 `spark-buffer`，任何退出路径上丢弃 Context 即归还缓冲。
//!
//! # 模块索引
//! - [`line`] / [`context`]：原语；
//! - [`chain`]：stage trait 与链；
//! - [`pipe_line`] / [`context_queue`]：跨线程管道与其队列；
//! - [`scheduler`] / [`worker_pool`] / [`runtime`]：调度与资源；
//! - [`config`] / [`error`] / [`observability`]：配置、错误与日志；
//! - [`test_stubs`]：确定性测试桩。

pub mod chain;
pub mod config;
pub mod context;
pub mod context_queue;
pub mod error;
pub mod line;
pub mod observability;
pub mod pipe_line;
pub mod runtime;
pub mod scheduler;
pub mod test_stubs;
pub mod worker_pool;

pub use chain::{Chain, ChainBuilder, Hop, StageHandle, Tunnel};
pub use config::RuntimeConfig;
pub use context::{Context, Message};
pub use context_queue::ContextQueue;
pub use error::TunnelError;
pub use line::{FlowControl, Line, LineLock, PipeEnd, WorkerId};
pub use pipe_line::PipeLine;
pub use runtime::Runtime;
pub use scheduler::{Scheduler, Task, WorkerGuard, current_worker, enter_worker};
pub use spark_buffer::{BufferPool, PooledBuffer};
pub use worker_pool::WorkerPool;
