//! # Context：链路上流动的一条消息
//!
//! ## 契约（What）
//! - 一个 [`Context`] 要么携带负载（来自缓冲池的 [`PooledBuffer`]），要么携带控制信号
//!   （`Init` / `Est` / `Fin`），二者互斥，由 [`Message`] 的枚举结构保证；
//! - `first` 标记逻辑连接上的首条负载，只对负载有意义；
//! - Context 被恰好一个接收者消费；丢弃即释放，负载缓冲随之回池。

use std::fmt;

use spark_buffer::PooledBuffer;

use crate::line::Line;

/// Context 的内容。
pub enum Message {
    /// 数据负载。
    Payload(PooledBuffer),
    /// 新连接建立，沿上行方向传播。
    Init,
    /// 对端确认连接可用，沿下行方向传播。
    Est,
    /// 连接结束；两个方向均可出现。
    Fin,
}

/// 一条在途消息。
pub struct Context {
    pub line: Line,
    pub message: Message,
    pub first: bool,
}

impl Context {
    pub fn payload(line: Line, payload: PooledBuffer) -> Self {
        Self {
            line,
            message: Message::Payload(payload),
            first: false,
        }
    }

    pub fn init(line: Line) -> Self {
        Self::signal(line, Message::Init)
    }

    pub fn est(line: Line) -> Self {
        Self::signal(line, Message::Est)
    }

    pub fn fin(line: Line) -> Self {
        Self::signal(line, Message::Fin)
    }

    fn signal(line: Line, message: Message) -> Self {
        Self {
            line,
            message,
            first: false,
        }
    }

    /// 标记为逻辑连接的首条消息。
    pub fn with_first(mut self) -> Self {
        self.first = true;
        self
    }

    /// 换到另一条 Line 上继续传递，内容不变。
    pub fn switch_line(mut self, line: Line) -> Self {
        self.line = line;
        self
    }

    pub fn is_fin(&self) -> bool {
        matches!(self.message, Message::Fin)
    }

    pub fn is_payload(&self) -> bool {
        matches!(self.message, Message::Payload(_))
    }

    /// 用于日志的消息类别。
    pub fn kind(&self) -> &'static str {
        match self.message {
            Message::Payload(_) => "payload",
            Message::Init => "init",
            Message::Est => "est",
            Message::Fin => "fin",
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Context");
        debug.field("line", &self.line.id()).field("kind", &self.kind());
        if let Message::Payload(buffer) = &self.message {
            debug.field("len", &buffer.len());
        }
        debug.field("first", &self.first).finish()
    }
}
