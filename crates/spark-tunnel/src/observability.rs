//! 日志安装入口：为宿主进程装配 `fmt + EnvFilter` 订阅器。
//!
//! ## 核心意图（Why）
//! - 隧道链在配对、移交、拆除等关键节点都会输出结构化事件（字段 `line`、`worker`、`hash`），
//!   宿主只需在启动时调用一次 [`install`] 即可看到它们；
//! - 过滤规则取自 `RUST_LOG`，未设置时默认 `info`，排障时可按模块打开 `debug`/`trace`。
//!
//! ## 契约（What）
//! - 多次调用返回 [`TunnelError::TracingAlreadyInstalled`]；
//! - 若宿主已经自行设置全局订阅器，返回 [`TunnelError::SubscriberAlreadySet`] 且不做任何修改。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

use crate::error::TunnelError;

static INSTALL_STATE: OnceLock<()> = OnceLock::new();

/// 安装全局 tracing 订阅器。
pub fn install() -> Result<(), TunnelError> {
    if INSTALL_STATE.get().is_some() {
        return Err(TunnelError::TracingAlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TunnelError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALL_STATE
        .set(())
        .map_err(|_| TunnelError::TracingAlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
