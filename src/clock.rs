//! 逻辑时钟，为缓存槽的淘汰提供"最近使用"时间戳

use core::sync::atomic::{AtomicU64, Ordering};

/// 单调递增的逻辑时钟计数。
///
/// 计数由外部定时协作者（内核中为时钟中断，测试中为测试代码）
/// 通过 [`tick`](Ticks::tick) 推进；缓冲区缓存只读取它，
/// 作为淘汰候选之间的比较依据，不影响正确性。
pub struct Ticks(AtomicU64);

impl Ticks {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// 推进一个时钟滴答，返回推进后的值。
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 读取当前滴答数。
    pub fn now(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}
