//! # 隧道链：线性排列的 stage 与逐级转发
//!
//! ## 核心意图（Why）
//! - 每个隧道 stage 只关心“收到一条 Context 后做什么”，至于下一级是谁、如何跨线程，
//!   由链与 [`Hop`] 负责；
//! - 序号 0 的 stage 最靠近传输层，上行（up）序号递增，下行（down）序号递减。
//!
//! ## 契约（What）
//! - stage 的序号同时作为 Line 上 chain state 的槽位键（[`Hop::index`]）；
//! - 越过链两端的 Context 被丢弃并记录 debug 日志；
//! - 处于 Pipe-Line 一端的 Line，其跨线程方向由 [`Hop::route_up_pipe`] 与
//!   [`Hop::send_down`] 自动改道。

use std::sync::Arc;

use spark_buffer::BufferPool;
use tracing::debug;

use crate::{
    context::Context,
    error::TunnelError,
    line::{Line, PipeEnd, WorkerId},
    pipe_line::PipeLine,
    runtime::Runtime,
    scheduler::Task,
};

/// 隧道 stage。
///
/// # 契约
/// - 两个方法都在 `ctx.line` 所属的工作线程上调用；
/// - 实现必须消费 `ctx`：转发、转换或丢弃（丢弃时缓冲自动回池）；
/// - 实现可以在调用下一级后发现 Line 已被销毁，需要检查存活时先 [`Line::lock`]。
pub trait Tunnel: Send + Sync + 'static {
    /// 用于日志的 stage 名称。
    fn name(&self) -> &'static str;

    /// 处理来自下方（靠近传输层）的 Context。
    fn up_stream(&self, hop: &Hop<'_>, ctx: Context);

    /// 处理来自上方的 Context。
    fn down_stream(&self, hop: &Hop<'_>, ctx: Context);
}

/// 组装完成的隧道链。
pub struct Chain {
    stages: Vec<Arc<dyn Tunnel>>,
    runtime: Runtime,
}

impl Chain {
    pub fn builder(runtime: Runtime) -> ChainBuilder {
        ChainBuilder {
            stages: Vec::new(),
            runtime,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// `index` 处 stage 的视角。
    pub fn hop(self: &Arc<Self>, index: usize) -> Hop<'_> {
        Hop { chain: self, index }
    }

    /// 将 `ctx` 交给 `index` 处 stage 的上行入口。
    pub fn up_stream(self: &Arc<Self>, index: usize, ctx: Context) {
        match self.stages.get(index) {
            Some(stage) => stage.up_stream(&self.hop(index), ctx),
            None => debug!(
                line = ctx.line.id(),
                kind = ctx.kind(),
                "context passed the top of the chain; dropped"
            ),
        }
    }

    /// 将 `ctx` 交给 `index` 处 stage 的下行入口。
    pub fn down_stream(self: &Arc<Self>, index: usize, ctx: Context) {
        match self.stages.get(index) {
            Some(stage) => stage.down_stream(&self.hop(index), ctx),
            None => debug!(
                line = ctx.line.id(),
                kind = ctx.kind(),
                "context addressed to a missing stage; dropped"
            ),
        }
    }
}

/// 按从下到上的顺序登记 stage。
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Tunnel>>,
    runtime: Runtime,
}

impl ChainBuilder {
    pub fn stage(mut self, stage: Arc<dyn Tunnel>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Arc<Chain> {
        Arc::new(Chain {
            stages: self.stages,
            runtime: self.runtime,
        })
    }
}

/// stage 在链中的位置，以及向相邻 stage 转发的入口。
#[derive(Clone, Copy)]
pub struct Hop<'a> {
    chain: &'a Arc<Chain>,
    index: usize,
}

impl Hop<'_> {
    /// 本 stage 的序号，亦即 chain state 的槽位键。
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn runtime(&self) -> &Runtime {
        &self.chain.runtime
    }

    pub fn pool(&self, worker: WorkerId) -> &BufferPool {
        self.chain.runtime.pool(worker)
    }

    pub fn post(&self, worker: WorkerId, task: Task) -> Result<(), TunnelError> {
        self.chain.runtime.post(worker, task)
    }

    /// 转发给上一级。
    pub fn next_up(&self, ctx: Context) {
        self.chain.up_stream(self.index + 1, ctx);
    }

    /// 转发给下一级；位于链底时丢弃。
    pub fn next_down(&self, ctx: Context) {
        match self.index.checked_sub(1) {
            Some(below) => self.chain.down_stream(below, ctx),
            None => debug!(
                line = ctx.line.id(),
                kind = ctx.kind(),
                "context passed the bottom of the chain; dropped"
            ),
        }
    }

    /// 重新进入本 stage 的上行入口。
    pub fn reenter_up(&self, ctx: Context) {
        self.chain.up_stream(self.index, ctx);
    }

    /// 下行发送；若 Line 是管道的目标端，则经管道送回发起线程。
    pub fn send_down(&self, ctx: Context) {
        match ctx.line.pipe() {
            Some((pipe, PipeEnd::Right)) => pipe.write_rtl(ctx),
            _ => self.next_down(ctx),
        }
    }

    /// 若 Line 的上行已移交给其它线程，则写入管道并返回 `None`；否则原样返回。
    pub fn route_up_pipe(&self, ctx: Context) -> Option<Context> {
        match ctx.line.pipe() {
            Some((pipe, PipeEnd::Left)) => {
                pipe.write_ltr(ctx);
                None
            }
            _ => Some(ctx),
        }
    }

    /// 将 `line` 的后续上行移交给 `target` 线程上的本 stage。
    pub fn pipe_to(&self, line: &Line, target: WorkerId) -> Result<(), TunnelError> {
        PipeLine::open(self, line, target)
    }

    /// 可跨线程保存的 stage 句柄。
    pub fn handle(&self) -> StageHandle {
        StageHandle {
            chain: self.chain.clone(),
            index: self.index,
        }
    }
}

/// [`Hop`] 的自有版本，供投递到其它线程的任务使用。
#[derive(Clone)]
pub struct StageHandle {
    chain: Arc<Chain>,
    index: usize,
}

impl StageHandle {
    pub fn hop(&self) -> Hop<'_> {
        self.chain.hop(self.index)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.chain.runtime
    }
}
