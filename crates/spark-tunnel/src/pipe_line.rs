//! # Pipe-Line：把一条连接的后续处理移交给另一个工作线程
//!
//! ## 核心意图（Why）
//! - 半双工的两个物理连接可能被不同工作线程接受，而配对必须在同一线程上完成；
//! - 管道让“发起线程”上的 Line（左端）继续由原传输层驱动，同时在“目标线程”上
//!   创建一条新 Line（右端），交给同一 stage 继续处理，二者之间只通过调度器投递任务交流。
//!
//! ## 逻辑（How）
//! - 左→右（ltr）：左端的上行 Context 进入 `ltr` 队列，目标线程的排空任务把它们改挂到右端 Line，
//!   重新进入 stage 的上行入口；
//! - 右→左（rtl）：stage 在右端下行发送的 Context 进入 `rtl` 队列，发起线程的排空任务把它们
//!   改挂到左端 Line，交给 stage 的下一级；
//! - 任一方向出现 `Fin` 时原子地置位 `closed`，此后两个方向都不再接收新的 Context；
//!   两端各自释放一次引用（`refc` 从 2 递减），归零时清空残留队列，负载随之回池；
//! - 流控跨线程转发：左端上侧的暂停在目标线程暂停右端上侧，右端下侧的暂停在发起线程暂停左端下侧；
//!   任一队列达到高水位时暂停其生产者，排空后恢复。
//!
//! ## 契约（What）
//! - 左端的方法只在发起线程调用，右端的方法只在目标线程调用；
//! - 右端 Line 的创建与销毁都由管道负责，stage 只需像对待普通连接一样处理它。

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    chain::{Hop, StageHandle},
    context::Context,
    context_queue::ContextQueue,
    error::TunnelError,
    line::{FlowControl, Line, PipeEnd, WorkerId},
    scheduler::check_worker,
};

pub struct PipeLine {
    stage: StageHandle,
    left_worker: WorkerId,
    right_worker: WorkerId,
    left_line: Line,
    right_line: Mutex<Option<Line>>,
    closed: AtomicBool,
    refc: AtomicUsize,
    left_open: AtomicBool,
    right_open: AtomicBool,
    ltr: Mutex<ContextQueue>,
    rtl: Mutex<ContextQueue>,
    ltr_throttled: AtomicBool,
    rtl_throttled: AtomicBool,
}

impl PipeLine {
    /// 在发起线程上建立管道，并向 `target` 投递右端的创建任务。
    pub(crate) fn open(hop: &Hop<'_>, line: &Line, target: WorkerId) -> Result<(), TunnelError> {
        let runtime = hop.runtime();
        check_worker(target, runtime.workers())?;
        let config = runtime.config();
        let pipe = Arc::new(Self {
            stage: hop.handle(),
            left_worker: line.worker(),
            right_worker: target,
            left_line: line.clone(),
            right_line: Mutex::new(None),
            closed: AtomicBool::new(false),
            refc: AtomicUsize::new(2),
            left_open: AtomicBool::new(true),
            right_open: AtomicBool::new(true),
            ltr: Mutex::new(ContextQueue::new(
                config.queue_capacity,
                config.pipe_high_watermark,
            )),
            rtl: Mutex::new(ContextQueue::new(
                config.queue_capacity,
                config.pipe_high_watermark,
            )),
            ltr_throttled: AtomicBool::new(false),
            rtl_throttled: AtomicBool::new(false),
        });

        line.bind_pipe(pipe.clone(), PipeEnd::Left);
        line.setup_up_side(Arc::new(PipeFlow {
            pipe: Arc::downgrade(&pipe),
            end: PipeEnd::Left,
        }));

        let opener = pipe.clone();
        if let Err(err) = runtime.post(target, Box::new(move || opener.open_right())) {
            line.unbind_pipe();
            line.done_up_side();
            return Err(err);
        }
        debug!(
            line = line.id(),
            from = pipe.left_worker,
            to = target,
            "line piped to another worker"
        );
        Ok(())
    }

    pub fn left_worker(&self) -> WorkerId {
        self.left_worker
    }

    pub fn right_worker(&self) -> WorkerId {
        self.right_worker
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 左端上行写入。
    pub fn write_ltr(self: &Arc<Self>, ctx: Context) {
        let is_fin = ctx.is_fin();
        if is_fin {
            if self.closed.swap(true, Ordering::AcqRel) {
                drop(ctx);
                self.release_left();
                return;
            }
        } else if self.is_closed() {
            trace!(line = ctx.line.id(), kind = ctx.kind(), "pipe closed; context dropped");
            return;
        }

        let (was_empty, saturated) = {
            let mut queue = self.ltr.lock();
            let was_empty = queue.is_empty();
            queue.push(ctx);
            (was_empty, queue.is_saturated())
        };
        if was_empty {
            self.post(self.right_worker, |pipe| pipe.drain_ltr());
        }
        if is_fin {
            self.release_left();
        } else if saturated && !self.ltr_throttled.swap(true, Ordering::AcqRel) {
            self.left_line.pause_down_side();
        }
    }

    /// 右端下行写入。
    pub fn write_rtl(self: &Arc<Self>, ctx: Context) {
        let is_fin = ctx.is_fin();
        if is_fin {
            if self.closed.swap(true, Ordering::AcqRel) {
                drop(ctx);
                self.detach_right();
                return;
            }
        } else if self.is_closed() {
            trace!(line = ctx.line.id(), kind = ctx.kind(), "pipe closed; context dropped");
            return;
        }

        let (was_empty, saturated) = {
            let mut queue = self.rtl.lock();
            let was_empty = queue.is_empty();
            queue.push(ctx);
            (was_empty, queue.is_saturated())
        };
        if was_empty {
            self.post(self.left_worker, |pipe| pipe.drain_rtl());
        }
        if is_fin {
            self.detach_right();
        } else if saturated && !self.rtl_throttled.swap(true, Ordering::AcqRel) {
            let right = self.right_line.lock().clone();
            if let Some(right) = right {
                right.pause_up_side();
            }
        }
    }

    fn open_right(self: &Arc<Self>) {
        let line = Line::new(self.right_worker);
        line.bind_pipe(self.clone(), PipeEnd::Right);
        line.setup_down_side(Arc::new(PipeFlow {
            pipe: Arc::downgrade(self),
            end: PipeEnd::Right,
        }));
        *self.right_line.lock() = Some(line.clone());
        trace!(
            left = self.left_line.id(),
            right = line.id(),
            worker = self.right_worker,
            "pipe right end opened"
        );

        let _pin = line.lock();
        self.stage.hop().reenter_up(Context::init(line.clone()));
    }

    fn drain_ltr(self: &Arc<Self>) {
        let hop = self.stage.hop();
        loop {
            let next = self.ltr.lock().pop();
            let Some(ctx) = next else { break };
            if !self.right_open.load(Ordering::Acquire) {
                continue;
            }
            let right = self.right_line.lock().clone();
            let Some(right) = right else { continue };
            let is_fin = ctx.is_fin();
            hop.reenter_up(ctx.switch_line(right));
            if is_fin {
                self.right_open.store(false, Ordering::Release);
                self.release_right();
            }
        }
        if self.ltr_throttled.swap(false, Ordering::AcqRel) {
            self.post(self.left_worker, |pipe| {
                if pipe.left_open.load(Ordering::Acquire) {
                    pipe.left_line.resume_down_side();
                }
            });
        }
    }

    fn drain_rtl(self: &Arc<Self>) {
        let hop = self.stage.hop();
        loop {
            let next = self.rtl.lock().pop();
            let Some(ctx) = next else { break };
            if !self.left_open.load(Ordering::Acquire) {
                continue;
            }
            let ctx = ctx.switch_line(self.left_line.clone());
            if ctx.is_fin() {
                self.release_left();
            }
            hop.next_down(ctx);
        }
        if self.rtl_throttled.swap(false, Ordering::AcqRel) {
            self.post(self.right_worker, |pipe| {
                let right = pipe.right_line.lock().clone();
                if let Some(right) = right {
                    right.resume_up_side();
                }
            });
        }
    }

    /// 右端不再接收 Context；Line 的销毁推迟到 stage 的当前调用返回之后。
    fn detach_right(self: &Arc<Self>) {
        if self.right_open.swap(false, Ordering::AcqRel) {
            self.post(self.right_worker, |pipe| pipe.release_right());
        }
    }

    fn release_left(&self) {
        if !self.left_open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.left_line.unbind_pipe();
        self.left_line.done_up_side();
        trace!(line = self.left_line.id(), "pipe left end released");
        self.release_ref();
    }

    fn release_right(&self) {
        let right = self.right_line.lock().take();
        let Some(right) = right else { return };
        right.unbind_pipe();
        right.done_down_side();
        right.destroy();
        trace!(line = right.id(), "pipe right end released");
        self.release_ref();
    }

    fn release_ref(&self) {
        if self.refc.fetch_sub(1, Ordering::AcqRel) == 1 {
            let dropped = self.ltr.lock().clear() + self.rtl.lock().clear();
            debug!(
                left = self.left_line.id(),
                dropped, "pipe line closed on both ends"
            );
        }
    }

    fn relay_flow(self: &Arc<Self>, from: PipeEnd, pause: bool) {
        match from {
            PipeEnd::Left => self.post(self.right_worker, move |pipe| {
                let right = pipe.right_line.lock().clone();
                if let Some(right) = right {
                    if pause {
                        right.pause_up_side();
                    } else {
                        right.resume_up_side();
                    }
                }
            }),
            PipeEnd::Right => self.post(self.left_worker, move |pipe| {
                if !pipe.left_open.load(Ordering::Acquire) {
                    return;
                }
                if pause {
                    pipe.left_line.pause_down_side();
                } else {
                    pipe.left_line.resume_down_side();
                }
            }),
        }
    }

    fn post(self: &Arc<Self>, worker: WorkerId, task: impl FnOnce(&Arc<PipeLine>) + Send + 'static) {
        let pipe = self.clone();
        if let Err(err) = self
            .stage
            .runtime()
            .post(worker, Box::new(move || task(&pipe)))
        {
            warn!(worker, error = %err, "pipe line task dropped");
        }
    }
}

struct PipeFlow {
    pipe: Weak<PipeLine>,
    end: PipeEnd,
}

impl FlowControl for PipeFlow {
    fn pause(&self) {
        if let Some(pipe) = self.pipe.upgrade() {
            pipe.relay_flow(self.end, true);
        }
    }

    fn resume(&self) {
        if let Some(pipe) = self.pipe.upgrade() {
            pipe.relay_flow(self.end, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        chain::Chain,
        config::RuntimeConfig,
        runtime::Runtime,
        scheduler::enter_worker,
        test_stubs::{ManualScheduler, RecordingTunnel},
    };

    #[test]
    #[traced_test]
    fn open_and_close_are_logged() {
        let scheduler = ManualScheduler::new(2);
        let runtime =
            Runtime::new(scheduler.clone(), RuntimeConfig::with_workers(2)).expect("构建运行时失败");
        let chain = Chain::builder(runtime)
            .stage(RecordingTunnel::transport())
            .stage(RecordingTunnel::upstream())
            .build();
        let line = Line::new(0);

        {
            let _worker = enter_worker(0);
            chain.hop(1).pipe_to(&line, 1).expect("建立管道失败");
            assert!(logs_contain("line piped to another worker"));
            let routed = chain.hop(1).route_up_pipe(Context::fin(line.clone()));
            assert!(routed.is_none(), "左端的 Fin 应写入管道");
        }
        assert!(!line.is_up_piped());
        line.destroy();

        scheduler.run_pending();
        assert!(logs_contain("pipe line closed on both ends"));
    }
}
