//! 等待投递的 Context 队列。
//!
//! 队列本身不设硬上限；`high_watermark` 只用于告诉生产者“该暂停了”，
//! 由调用方据此触发背压。清空或析构队列时，其中的负载缓冲随 Context 一并回池。

use std::collections::VecDeque;

use crate::{
    config::{DEFAULT_PIPE_HIGH_WATERMARK, DEFAULT_QUEUE_CAPACITY},
    context::Context,
};

pub struct ContextQueue {
    items: VecDeque<Context>,
    high_watermark: usize,
}

impl Default for ContextQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_PIPE_HIGH_WATERMARK)
    }
}

impl ContextQueue {
    pub fn new(capacity: usize, high_watermark: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            high_watermark: high_watermark.max(1),
        }
    }

    pub fn push(&mut self, ctx: Context) {
        self.items.push_back(ctx);
    }

    pub fn pop(&mut self) -> Option<Context> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 深度达到高水位。
    pub fn is_saturated(&self) -> bool {
        self.items.len() >= self.high_watermark
    }

    /// 丢弃全部排队的 Context，返回丢弃数量。
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
