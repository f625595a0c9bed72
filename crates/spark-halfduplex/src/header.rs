//! 8 字节关联头的编解码。
//!
//! ## 线格式（What）
//! ```text
//!  byte 0          bytes 1..8
//! +-+-------+-------------------------------+
//! |D| id[62..56] |        id[55..0]          |
//! +-+-------+-------------------------------+
//! ```
//! - 大端序；byte 0 的最高位为方向位（0 = 上传，1 = 下载）；
//! - 其余 63 位为关联 id，两条物理连接使用同一个值；
//! - 头部之后的字节全部是逻辑负载。

use crate::error::HalfDuplexError;

/// 关联头长度。
pub const HEADER_LEN: usize = 8;

/// 关联 id 的有效位。
pub const HASH_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

const DIRECTION_BIT: u8 = 0x80;

/// 物理连接在逻辑连接中承担的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CorrelationHeader {
    pub direction: Direction,
    pub hash: u64,
}

impl CorrelationHeader {
    /// 构造头部，`hash` 的最高位被丢弃。
    pub fn new(direction: Direction, hash: u64) -> Self {
        Self {
            direction,
            hash: hash & HASH_MASK,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = self.hash.to_be_bytes();
        if self.direction == Direction::Download {
            bytes[0] |= DIRECTION_BIT;
        }
        bytes
    }

    /// 从 `bytes` 开头解析头部，不消耗输入。
    pub fn decode(bytes: &[u8]) -> Result<Self, HalfDuplexError> {
        let Some(head) = bytes.first_chunk::<HEADER_LEN>() else {
            return Err(HalfDuplexError::ShortHeader { len: bytes.len() });
        };
        let mut raw = *head;
        let direction = if raw[0] & DIRECTION_BIT == 0 {
            Direction::Upload
        } else {
            Direction::Download
        };
        raw[0] &= !DIRECTION_BIT;
        Ok(Self {
            direction,
            hash: u64::from_be_bytes(raw),
        })
    }
}

/// 为一条逻辑连接生成 63 位随机关联 id。
pub fn random_hash() -> u64 {
    rand::random::<u64>() & HASH_MASK
}
