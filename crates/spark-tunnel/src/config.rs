//! 运行时配置：工作线程数、管道队列水位与缓冲池默认容量。
//!
//! ## 使用方式（How）
//! - 宿主可直接使用 [`RuntimeConfig::default`]，或从 TOML 文本加载：
//!   ```toml
//!   workers = 4
//!   pipe_high_watermark = 64
//!   ```
//! - 缺省字段沿用默认值（`#[serde(default)]`），加载后统一经过 [`RuntimeConfig::validate`]。

use std::{num::NonZeroUsize, thread};

use serde::Deserialize;

use crate::error::TunnelError;

/// `ContextQueue` 的初始容量。
pub const DEFAULT_QUEUE_CAPACITY: usize = 25;
/// Pipe-Line 单向队列暂停生产者的深度。
pub const DEFAULT_PIPE_HIGH_WATERMARK: usize = 64;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// 工作线程数量，同时决定缓冲池与配对表分片的数量。
    pub workers: usize,
    /// 队列初始容量。
    pub queue_capacity: usize,
    /// 跨线程管道的高水位。
    pub pipe_high_watermark: usize,
    /// 缓冲池的默认租借容量。
    pub buffer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pipe_high_watermark: DEFAULT_PIPE_HIGH_WATERMARK,
            buffer_capacity: spark_buffer::DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// 固定工作线程数量的配置，其余字段取默认值。
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, TunnelError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 拒绝会让运行时无法工作的取值。
    pub fn validate(&self) -> Result<(), TunnelError> {
        ensure_positive("workers", self.workers)?;
        ensure_positive("queue_capacity", self.queue_capacity)?;
        ensure_positive("pipe_high_watermark", self.pipe_high_watermark)?;
        ensure_positive("buffer_capacity", self.buffer_capacity)?;
        Ok(())
    }
}

fn ensure_positive(field: &'static str, value: usize) -> Result<(), TunnelError> {
    if value == 0 {
        return Err(TunnelError::InvalidConfig {
            field,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(())
}
