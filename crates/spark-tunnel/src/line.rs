//! # Line：连接端点的身份、存活与流控
//!
//! ## 核心意图（Why）
//! - 隧道链中的每一级都以 [`Line`] 识别“同一条连接”，并在其上挂载本级的连接状态（chain state）；
//! - 背压通过 `pause/resume` 在 Line 的上侧（up side）与下侧（down side）之间传递，
//!   由注册方实现 [`FlowControl`] 决定如何响应。
//!
//! ## 契约（What）
//! - Line 归属于创建时指定的工作线程；流控调用与状态读写只应发生在该线程；
//! - 下游 stage 可以在任意一次链路调用中销毁 Line，因此“调用链路之后再检查存活”
//!   必须在 [`Line::lock`] 返回的守卫存续期间完成；
//! - [`Line::destroy`] 恰好调用一次，且在此之前已注册的上下侧流控都必须 `done`。
//!
//! ## 风险提示（Trade-offs）
//! - `pause/resume` 是幂等的单比特开关，不做引用计数；多个来源同时暂停时，
//!   任一来源的恢复都会解除暂停。

use std::{
    any::Any,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{pipe_line::PipeLine, scheduler::current_worker};

/// 工作线程编号。
pub type WorkerId = usize;

static NEXT_LINE_ID: AtomicU64 = AtomicU64::new(1);

/// 流控回调接口，由 Line 某一侧的持有者实现。
///
/// - `pause`：请求持有者暂停向该 Line 推送数据；
/// - `resume`：解除暂停。
///
/// 两个方法都在 Line 所属线程上同步调用，实现不得阻塞。
pub trait FlowControl: Send + Sync + 'static {
    fn pause(&self);
    fn resume(&self);
}

/// Pipe-Line 在 Line 上占据的端。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeEnd {
    /// 发起移交的一端：上行数据经管道送往对端线程。
    Left,
    /// 管道在目标线程上创建的一端：下行数据经管道送回发起线程。
    Right,
}

#[derive(Default)]
struct FlowSide {
    handler: Mutex<Option<Arc<dyn FlowControl>>>,
    paused: AtomicBool,
}

impl FlowSide {
    fn setup(&self, handler: Arc<dyn FlowControl>) {
        *self.handler.lock() = Some(handler);
    }

    fn done(&self) {
        self.handler.lock().take();
        self.paused.store(false, Ordering::Release);
    }

    fn is_registered(&self) -> bool {
        self.handler.lock().is_some()
    }

    fn pause(&self) {
        if self.paused.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.pause();
        }
    }

    fn resume(&self) {
        if !self.paused.swap(false, Ordering::AcqRel) {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.resume();
        }
    }
}

struct PipeBinding {
    pipe: Arc<PipeLine>,
    end: PipeEnd,
}

struct LineInner {
    id: u64,
    worker: WorkerId,
    alive: AtomicBool,
    pins: AtomicUsize,
    up: FlowSide,
    down: FlowSide,
    states: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
    pipe: Mutex<Option<PipeBinding>>,
}

/// 连接端点句柄，克隆代价为一次原子加。
///
/// # 教案式说明
/// - **意图 (Why)**：把“连接是谁、是否还活着、各级挂了什么状态”收敛到一个可共享的句柄上，
///   让跨级、跨线程传递的 `Context` 只需携带它；
/// - **逻辑 (How)**：内部为 `Arc<LineInner>`；存活标志为原子布尔，chain state 按 stage 序号存放在
///   `Vec<Option<Box<dyn Any + Send>>>` 中，读写时短暂持锁，不跨越任何链路调用；
/// - **契约 (What)**：相等性按身份判定（同一次 [`Line::new`] 的克隆彼此相等）；
///   内存由引用计数回收，`destroy` 只改变逻辑存活状态并清理挂载物。
#[derive(Clone)]
pub struct Line(Arc<LineInner>);

impl Line {
    /// 创建绑定到 `worker` 的新 Line。
    pub fn new(worker: WorkerId) -> Self {
        Self(Arc::new(LineInner {
            id: NEXT_LINE_ID.fetch_add(1, Ordering::Relaxed),
            worker,
            alive: AtomicBool::new(true),
            pins: AtomicUsize::new(0),
            up: FlowSide::default(),
            down: FlowSide::default(),
            states: Mutex::new(Vec::new()),
            pipe: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn worker(&self) -> WorkerId {
        self.0.worker
    }

    pub fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::Acquire)
    }

    /// 钉住 Line，守卫存续期间可安全地在链路调用之后检查 [`is_alive`](Self::is_alive)。
    pub fn lock(&self) -> LineLock {
        self.0.pins.fetch_add(1, Ordering::AcqRel);
        LineLock { line: self.clone() }
    }

    /// 当前未释放的 [`LineLock`] 数量。
    pub fn pin_count(&self) -> usize {
        self.0.pins.load(Ordering::Acquire)
    }

    /// 标记 Line 结束。
    ///
    /// # Panics
    /// 重复销毁属于调用方的逻辑错误，直接 panic。
    pub fn destroy(&self) {
        let was_alive = self.0.alive.swap(false, Ordering::AcqRel);
        assert!(was_alive, "line {} destroyed twice", self.0.id);
        debug_assert!(
            !self.0.up.is_registered() && !self.0.down.is_registered(),
            "line {} destroyed before its up/down sides were done",
            self.0.id
        );
        let leftover = {
            let mut states = self.0.states.lock();
            let occupied = states.iter().filter(|slot| slot.is_some()).count();
            states.clear();
            occupied
        };
        debug_assert_eq!(
            leftover, 0,
            "line {} destroyed while a stage still holds state",
            self.0.id
        );
        self.0.pipe.lock().take();
        tracing::trace!(line = self.0.id, worker = self.0.worker, "line destroyed");
    }

    /// 注册上侧流控：下方调用 [`pause_up_side`](Self::pause_up_side) 时回调 `handler`。
    pub fn setup_up_side(&self, handler: Arc<dyn FlowControl>) {
        self.0.up.setup(handler);
    }

    /// 注册下侧流控：上方调用 [`pause_down_side`](Self::pause_down_side) 时回调 `handler`。
    pub fn setup_down_side(&self, handler: Arc<dyn FlowControl>) {
        self.0.down.setup(handler);
    }

    pub fn done_up_side(&self) {
        self.0.up.done();
    }

    pub fn done_down_side(&self) {
        self.0.down.done();
    }

    pub fn pause_up_side(&self) {
        self.assert_owner();
        self.0.up.pause();
    }

    pub fn resume_up_side(&self) {
        self.assert_owner();
        self.0.up.resume();
    }

    pub fn pause_down_side(&self) {
        self.assert_owner();
        self.0.down.pause();
    }

    pub fn resume_down_side(&self) {
        self.assert_owner();
        self.0.down.resume();
    }

    pub fn is_up_side_paused(&self) -> bool {
        self.0.up.paused.load(Ordering::Acquire)
    }

    pub fn is_down_side_paused(&self) -> bool {
        self.0.down.paused.load(Ordering::Acquire)
    }

    /// 为 `stage` 挂载连接状态。
    ///
    /// # Panics
    /// 槽位已被占用时 panic：同一 stage 对同一 Line 只能持有一份状态。
    pub fn set_state<T: Any + Send>(&self, stage: usize, state: T) {
        let mut states = self.0.states.lock();
        if states.len() <= stage {
            states.resize_with(stage + 1, || None);
        }
        assert!(
            states[stage].is_none(),
            "line {} already holds state for stage {stage}",
            self.0.id
        );
        states[stage] = Some(Box::new(state));
    }

    /// 取走 `stage` 的连接状态。
    ///
    /// # Panics
    /// 槽位中的类型与 `T` 不符时 panic。
    pub fn take_state<T: Any + Send>(&self, stage: usize) -> Option<T> {
        let boxed = {
            let mut states = self.0.states.lock();
            states.get_mut(stage).and_then(Option::take)
        }?;
        match boxed.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(_) => panic!(
                "line {} holds state of an unexpected type for stage {stage}",
                self.0.id
            ),
        }
    }

    /// 就地读写 `stage` 的连接状态；闭包在持锁期间执行，不得调用链路。
    pub fn with_state<T: Any + Send, R>(
        &self,
        stage: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut states = self.0.states.lock();
        let slot = states.get_mut(stage)?.as_mut()?;
        (**slot).downcast_mut::<T>().map(f)
    }

    pub fn has_state(&self, stage: usize) -> bool {
        self.0
            .states
            .lock()
            .get(stage)
            .is_some_and(Option::is_some)
    }

    /// 上行是否经管道送往其它线程。
    pub fn is_up_piped(&self) -> bool {
        self.pipe_end() == Some(PipeEnd::Left)
    }

    /// 下行是否经管道送回其它线程。
    pub fn is_down_piped(&self) -> bool {
        self.pipe_end() == Some(PipeEnd::Right)
    }

    pub fn pipe_end(&self) -> Option<PipeEnd> {
        self.0.pipe.lock().as_ref().map(|binding| binding.end)
    }

    pub(crate) fn pipe(&self) -> Option<(Arc<PipeLine>, PipeEnd)> {
        self.0
            .pipe
            .lock()
            .as_ref()
            .map(|binding| (binding.pipe.clone(), binding.end))
    }

    pub(crate) fn bind_pipe(&self, pipe: Arc<PipeLine>, end: PipeEnd) {
        let mut slot = self.0.pipe.lock();
        assert!(slot.is_none(), "line {} is already piped", self.0.id);
        *slot = Some(PipeBinding { pipe, end });
    }

    pub(crate) fn unbind_pipe(&self) {
        self.0.pipe.lock().take();
    }

    fn assert_owner(&self) {
        debug_assert!(
            current_worker().is_none_or(|worker| worker == self.0.worker),
            "line {} (worker {}) used from worker {:?}",
            self.0.id,
            self.0.worker,
            current_worker()
        );
    }
}

impl PartialEq for Line {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Line {}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.0.id)
            .field("worker", &self.0.worker)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// [`Line::lock`] 返回的守卫，析构时解除钉住。
pub struct LineLock {
    line: Line,
}

impl LineLock {
    pub fn line(&self) -> &Line {
        &self.line
    }
}

impl Drop for LineLock {
    fn drop(&mut self) {
        self.line.0.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
