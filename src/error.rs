//! 内核核心的错误类型

use thiserror::Error;

/// 不可恢复的资源耗尽错误。
///
/// 与页分配器可恢复的 `None`（调用方可重试或降级）不同，
/// 这里的变体表示配置或负载层面的失败：按约定顶层调用者
/// 应将其视为致命错误并终止运行，库本身不提供阻塞等待的回退路径。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernError {
    /// 缓冲区缓存的有界淘汰扫描在可达范围内找不到任何可复用的缓存槽。
    #[error("bget: no buffers reachable from bucket {bucket}")]
    NoBuf { bucket: usize },
}
