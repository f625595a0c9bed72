//! 工作线程调度抽象。
//!
//! ## 核心意图（Why）
//! - 隧道核心只需要一种跨线程能力：把一段任务投递到指定工作线程的事件循环，
//!   由该线程异步、恰好执行一次；
//! - 将其抽象为 [`Scheduler`] 后，生产环境使用 [`WorkerPool`](crate::WorkerPool)，
//!   测试使用确定性的 [`ManualScheduler`](crate::test_stubs::ManualScheduler)。
//!
//! ## 契约（What）
//! - 同一工作线程上的任务按投递顺序执行；不同线程之间无顺序保证；
//! - 任务执行期间 [`current_worker`] 返回该线程编号，用于校验 Line 的线程归属。

use std::cell::Cell;

use crate::{error::TunnelError, line::WorkerId};

/// 投递到工作线程的任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 跨线程任务投递接口。
pub trait Scheduler: Send + Sync + 'static {
    /// 工作线程数量，编号为 `0..workers()`。
    fn workers(&self) -> usize;

    /// 将 `task` 投递到 `worker`。
    ///
    /// # Errors
    /// - 编号越界返回 [`TunnelError::UnknownWorker`]；
    /// - 目标线程已停止返回 [`TunnelError::WorkerUnavailable`]，任务被丢弃。
    fn post(&self, worker: WorkerId, task: Task) -> Result<(), TunnelError>;
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// 当前线程正在扮演的工作线程编号；不在任何工作线程上时为 `None`。
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// 进入工作线程上下文，守卫析构时恢复之前的值。
pub fn enter_worker(worker: WorkerId) -> WorkerGuard {
    let previous = CURRENT_WORKER.with(|cell| cell.replace(Some(worker)));
    WorkerGuard { previous }
}

/// [`enter_worker`] 返回的守卫。
#[must_use = "the worker context ends when the guard is dropped"]
pub struct WorkerGuard {
    previous: Option<WorkerId>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|cell| cell.set(self.previous));
    }
}

pub(crate) fn check_worker(worker: WorkerId, workers: usize) -> Result<(), TunnelError> {
    if worker >= workers {
        return Err(TunnelError::UnknownWorker { worker, workers });
    }
    Ok(())
}
