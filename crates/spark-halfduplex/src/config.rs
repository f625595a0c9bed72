//! 半双工服务端配置。
//!
//! ```toml
//! max_buffering = 131070
//! table_shards = 8
//! ```
//! 缺省字段取默认值；`table_shards` 缺省时按工作线程数分片。

use serde::Deserialize;

use crate::error::HalfDuplexError;

/// 配对前单条连接可缓存的最大字节数。
pub const DEFAULT_MAX_BUFFERING: usize = 131_070;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HalfDuplexServerConfig {
    /// 超过该长度时丢弃待配对连接上缓存的负载，连接保持等待。
    pub max_buffering: usize,
    /// 配对表分片数；`None` 表示每个工作线程一个分片。
    pub table_shards: Option<usize>,
}

impl Default for HalfDuplexServerConfig {
    fn default() -> Self {
        Self {
            max_buffering: DEFAULT_MAX_BUFFERING,
            table_shards: None,
        }
    }
}

impl HalfDuplexServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, HalfDuplexError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HalfDuplexError> {
        if self.table_shards == Some(0) {
            return Err(HalfDuplexError::InvalidConfig {
                field: "table_shards",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// 结合工作线程数得出实际分片数。
    pub fn shards_for(&self, workers: usize) -> usize {
        self.table_shards.unwrap_or(workers).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_worker_count() {
        let config = HalfDuplexServerConfig::from_toml_str("").expect("解析配置失败");
        assert_eq!(config.max_buffering, DEFAULT_MAX_BUFFERING);
        assert_eq!(config.shards_for(6), 6);
    }

    #[test]
    fn explicit_shards_override_workers() {
        let config =
            HalfDuplexServerConfig::from_toml_str("table_shards = 16\nmax_buffering = 10")
                .expect("解析配置失败");
        assert_eq!(config.shards_for(2), 16);
        assert_eq!(config.max_buffering, 10);
    }

    #[test]
    fn zero_shards_rejected() {
        let err = HalfDuplexServerConfig::from_toml_str("table_shards = 0")
            .expect_err("零分片应被拒绝");
        assert!(matches!(
            err,
            HalfDuplexError::InvalidConfig {
                field: "table_shards",
                ..
            }
        ));
    }
}
