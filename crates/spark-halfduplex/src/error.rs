//! 半双工协议的错误域。
//!
//! 链路上的协议违例（重复 id、上游拒绝）以 `Fin` 信号表达，不经过这里；
//! 本类型只覆盖“链外”的失败：头部解码与配置加载。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalfDuplexError {
    /// 可用字节不足以构成 8 字节关联头。
    #[error("correlation header needs 8 bytes, got {len}")]
    ShortHeader { len: usize },

    /// 配置文本无法解析为 TOML。
    #[error("failed to parse half-duplex configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 配置字段取值不合法。
    #[error("invalid half-duplex configuration field `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}
