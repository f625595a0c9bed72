//! 运行时资源：调度器与每个工作线程的缓冲池。

use std::sync::Arc;

use spark_buffer::BufferPool;

use crate::{
    config::RuntimeConfig,
    error::TunnelError,
    line::WorkerId,
    scheduler::{Scheduler, Task, check_worker},
};

/// 隧道链共享的运行时句柄，克隆代价为几次原子加。
///
/// # 教案式说明
/// - **意图 (Why)**：stage 在处理 Context 时需要两样外部资源：当前线程的缓冲池，
///   以及向其它线程投递任务的能力；集中在一个句柄中，避免每个 stage 各自持有；
/// - **契约 (What)**：缓冲池数量与调度器的工作线程数一致，按 [`WorkerId`] 索引。
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    pools: Arc<[BufferPool]>,
    config: Arc<RuntimeConfig>,
}

impl Runtime {
    /// 以 `config` 为调度器的每个工作线程创建缓冲池。
    ///
    /// # Errors
    /// 配置校验失败，或 `config.workers` 与调度器的线程数不一致。
    pub fn new(scheduler: Arc<dyn Scheduler>, config: RuntimeConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        if config.workers != scheduler.workers() {
            return Err(TunnelError::InvalidConfig {
                field: "workers",
                reason: format!(
                    "configured {} workers but the scheduler runs {}",
                    config.workers,
                    scheduler.workers()
                ),
            });
        }
        let pools = (0..config.workers)
            .map(|_| BufferPool::new(config.buffer_capacity))
            .collect();
        Ok(Self {
            scheduler,
            pools,
            config: Arc::new(config),
        })
    }

    pub fn workers(&self) -> usize {
        self.pools.len()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `worker` 的缓冲池。
    ///
    /// # Panics
    /// 编号越界时 panic：Line 只能在本运行时的线程上创建。
    pub fn pool(&self, worker: WorkerId) -> &BufferPool {
        &self.pools[worker]
    }

    pub fn pools(&self) -> &[BufferPool] {
        &self.pools
    }

    pub fn post(&self, worker: WorkerId, task: Task) -> Result<(), TunnelError> {
        check_worker(worker, self.workers())?;
        self.scheduler.post(worker, task)
    }
}
