//! 基于 OS 线程的工作线程池：每个线程独占一个 `crossbeam-channel` 任务队列。
//!
//! ## 逻辑（How）
//! - [`WorkerPool::spawn`] 为每个编号创建无界通道与命名线程 `spark-worker-{n}`；
//! - 线程循环接收 [`WorkerCommand`]，执行任务或在收到 `Stop` 后退出；
//! - [`WorkerPool::shutdown`] 向所有线程发送 `Stop`，[`WorkerPool::join`] 等待线程退出。
//!
//! ## 风险（Trade-offs）
//! - `Stop` 之前已入队的任务仍会执行；`Stop` 之后入队的任务随接收端析构被丢弃，
//!   其中持有的 `Context` 会正常释放缓冲。

use std::{
    mem,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    error::TunnelError,
    line::WorkerId,
    scheduler::{Scheduler, Task, check_worker, enter_worker},
};

enum WorkerCommand {
    Run(Task),
    Stop,
}

/// 线程池句柄。
pub struct WorkerPool {
    senders: Vec<Sender<WorkerCommand>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// 启动 `workers` 个工作线程。
    pub fn spawn(workers: usize) -> Result<Arc<Self>, TunnelError> {
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, rx) = crossbeam_channel::unbounded::<WorkerCommand>();
            let handle = thread::Builder::new()
                .name(format!("spark-worker-{worker}"))
                .spawn(move || run_worker(worker, rx))
                .map_err(|source| TunnelError::WorkerSpawn { worker, source })?;
            senders.push(tx);
            handles.push(handle);
        }

        Ok(Arc::new(Self {
            senders,
            handles: Mutex::new(handles),
        }))
    }

    /// 通知所有工作线程在处理完已入队任务后退出。
    pub fn shutdown(&self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerCommand::Stop);
        }
    }

    /// 等待所有工作线程退出；不得在工作线程内部调用。
    pub fn join(&self) {
        let handles = mem::take(&mut *self.handles.lock());
        for handle in handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                error!(thread = ?name, "worker thread panicked");
            }
        }
    }
}

impl Scheduler for WorkerPool {
    fn workers(&self) -> usize {
        self.senders.len()
    }

    fn post(&self, worker: WorkerId, task: Task) -> Result<(), TunnelError> {
        check_worker(worker, self.senders.len())?;
        self.senders[worker]
            .send(WorkerCommand::Run(task))
            .map_err(|_| TunnelError::WorkerUnavailable { worker })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(worker: WorkerId, rx: Receiver<WorkerCommand>) {
    let _context = enter_worker(worker);
    debug!(worker, "worker started");
    for command in rx.iter() {
        match command {
            WorkerCommand::Run(task) => task(),
            WorkerCommand::Stop => break,
        }
    }
    debug!(worker, "worker stopped");
}
