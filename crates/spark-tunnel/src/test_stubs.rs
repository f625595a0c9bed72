//! 测试桩：确定性调度器与记录型 stage。
//!
//! ## 核心意图（Why）
//! - 跨线程配对、管道移交等场景若依赖真实线程，断言只能靠等待与重试；
//!   [`ManualScheduler`] 把“投递”变成按线程排队，由测试线程显式执行，结果可复现；
//! - [`RecordingTunnel`] 放在被测 stage 的上下两侧，记录它收到的每条 Context，
//!   并模拟传输层（收到 `Fin` 即销毁 Line）或上游（可拒绝 `Init`）。

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    chain::{Hop, Tunnel},
    context::{Context, Message},
    error::TunnelError,
    line::{Line, WorkerId},
    scheduler::{Scheduler, Task, check_worker, enter_worker},
};

/// 每个工作线程一条 FIFO，由测试线程调用 [`run_pending`](Self::run_pending) 执行。
pub struct ManualScheduler {
    queues: Vec<Mutex<VecDeque<Task>>>,
    posted: Vec<AtomicUsize>,
}

impl ManualScheduler {
    pub fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
            posted: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        })
    }

    /// 累计投递到 `worker` 的任务数。
    pub fn posted(&self, worker: WorkerId) -> usize {
        self.posted[worker].load(Ordering::Acquire)
    }

    /// 尚未执行的任务数。
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.queues[worker].lock().len()
    }

    /// 执行 `worker` 上当前排队的任务（含执行过程中新投递到该线程的任务），返回执行数。
    pub fn run_worker(&self, worker: WorkerId) -> usize {
        let _context = enter_worker(worker);
        let mut executed = 0;
        loop {
            let next = self.queues[worker].lock().pop_front();
            let Some(task) = next else { break };
            task();
            executed += 1;
        }
        executed
    }

    /// 轮流执行所有线程，直到全部队列为空。
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        loop {
            let round: usize = (0..self.queues.len())
                .map(|worker| self.run_worker(worker))
                .sum();
            if round == 0 {
                return executed;
            }
            executed += round;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn workers(&self) -> usize {
        self.queues.len()
    }

    fn post(&self, worker: WorkerId, task: Task) -> Result<(), TunnelError> {
        check_worker(worker, self.queues.len())?;
        self.queues[worker].lock().push_back(task);
        self.posted[worker].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// 被记录的消息内容；负载被复制后立即回池。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Payload(Vec<u8>),
    Init,
    Est,
    Fin,
}

/// 一次记录。
#[derive(Clone, Debug)]
pub struct Event {
    pub line: Line,
    pub message: Recorded,
    pub first: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StubRole {
    /// 位于链底：透传上行，记录下行，`Fin` 时销毁 Line。
    Transport,
    /// 位于链顶：记录上行，透传下行，可拒绝 `Init`。
    Upstream,
}

/// 记录型 stage。
pub struct RecordingTunnel {
    role: StubRole,
    events: Mutex<Vec<Event>>,
    /// 仍会放行的 `Init` 数，`usize::MAX` 表示不限。
    init_budget: AtomicUsize,
}

impl RecordingTunnel {
    /// 模拟传输层的链底桩。
    pub fn transport() -> Arc<Self> {
        Arc::new(Self::with_role(StubRole::Transport))
    }

    /// 模拟上游的链顶桩。
    pub fn upstream() -> Arc<Self> {
        Arc::new(Self::with_role(StubRole::Upstream))
    }

    fn with_role(role: StubRole) -> Self {
        Self {
            role,
            events: Mutex::new(Vec::new()),
            init_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// 之后收到的 `Init` 都以下行 `Fin` 拒绝。
    pub fn reject_init(&self, reject: bool) {
        let budget = if reject { 0 } else { usize::MAX };
        self.init_budget.store(budget, Ordering::Release);
    }

    /// 再放行 `count` 个 `Init`，之后的全部拒绝。
    pub fn accept_inits(&self, count: usize) {
        self.init_budget.store(count, Ordering::Release);
    }

    fn admit_init(&self) -> bool {
        self.init_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                left => Some(left - 1),
            })
            .is_ok()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// `line` 上的全部记录。
    pub fn events_for(&self, line: &Line) -> Vec<Recorded> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.line == *line)
            .map(|event| event.message.clone())
            .collect()
    }

    /// `line` 上收到的 `Fin` 次数。
    pub fn fin_count(&self, line: &Line) -> usize {
        self.count(line, &Recorded::Fin)
    }

    pub fn count(&self, line: &Line, message: &Recorded) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.line == *line && event.message == *message)
            .count()
    }

    /// 按到达顺序收到 `Init` 的 Line。
    pub fn initiated_lines(&self) -> Vec<Line> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.message == Recorded::Init)
            .map(|event| event.line.clone())
            .collect()
    }

    /// `line` 上收到的负载，按到达顺序拼接。
    pub fn payload_bytes(&self, line: &Line) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.line == *line)
            .filter_map(|event| match &event.message {
                Recorded::Payload(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    fn record(&self, ctx: Context) -> Line {
        let Context {
            line,
            message,
            first,
        } = ctx;
        let message = match message {
            Message::Payload(buffer) => Recorded::Payload(buffer.to_vec()),
            Message::Init => Recorded::Init,
            Message::Est => Recorded::Est,
            Message::Fin => Recorded::Fin,
        };
        self.events.lock().push(Event {
            line: line.clone(),
            message,
            first,
        });
        line
    }
}

impl Tunnel for RecordingTunnel {
    fn name(&self) -> &'static str {
        match self.role {
            StubRole::Transport => "recording-transport",
            StubRole::Upstream => "recording-upstream",
        }
    }

    fn up_stream(&self, hop: &Hop<'_>, ctx: Context) {
        match self.role {
            StubRole::Transport => hop.next_up(ctx),
            StubRole::Upstream => {
                let is_init = matches!(ctx.message, Message::Init);
                let line = self.record(ctx);
                if is_init && !self.admit_init() {
                    hop.next_down(Context::fin(line));
                }
            }
        }
    }

    fn down_stream(&self, hop: &Hop<'_>, ctx: Context) {
        match self.role {
            StubRole::Transport => {
                let is_fin = ctx.is_fin();
                let line = self.record(ctx);
                if is_fin {
                    line.destroy();
                }
            }
            StubRole::Upstream => hop.next_down(ctx),
        }
    }
}
