//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总隧道运行时在“链外”可能遇到的失败：配置解析、线程创建、跨线程投递；
//! - 链内的失败（协议违例、上游拒绝）不走该类型，而是以 `Fin` 信号沿链路传播。
//!
//! ## 设计要求（What）
//! - 通过 `thiserror` 派生 `std::error::Error`，便于调用方以 `?` 传播；
//! - 变体携带足以定位问题的上下文（线程号、字段名），不附带大对象。

use thiserror::Error;

use crate::line::WorkerId;

/// 隧道运行时错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：让宿主在启动阶段就能区分“配置写错”与“系统资源不足”；
/// - **契约 (What)**：所有变体均满足 `Send + Sync + 'static`，可跨线程传递；
/// - **风险 (Trade-offs)**：`WorkerUnavailable` 出现在运行期通常意味着宿主已开始关停，
///   调用方应丢弃待投递的任务而非重试。
#[derive(Debug, Error)]
pub enum TunnelError {
    /// 配置文本无法解析为 TOML。
    #[error("failed to parse runtime configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 配置字段取值不合法。
    #[error("invalid configuration field `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// 工作线程编号超出调度器范围。
    #[error("worker {worker} is out of range (runtime has {workers} workers)")]
    UnknownWorker { worker: WorkerId, workers: usize },

    /// 目标工作线程已经停止接收任务。
    #[error("worker {worker} no longer accepts tasks")]
    WorkerUnavailable { worker: WorkerId },

    /// 创建工作线程失败。
    #[error("failed to spawn worker {worker}: {source}")]
    WorkerSpawn {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },

    /// [`install`](crate::observability::install) 已经执行过。
    #[error("tunnel tracing has already been installed")]
    TracingAlreadyInstalled,

    /// 全局 tracing 订阅器已被其它组件安装。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    /// 设置全局订阅器失败。
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}
