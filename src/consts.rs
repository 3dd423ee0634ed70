//! 内核核心的固定配置常量

/// 系统支持的最大处理器核心（hart）数量，
/// 同时也是页分配器的分片数量：每个核心独占一个分片。
pub const NCPU: usize = 8;

/// 物理页大小（字节）。
pub const PGSIZE: usize = 4096;

/// 文件系统块层相关的常量。
pub mod fs {
    /// 缓冲区缓存中的缓存槽总数。
    pub const NBUF: usize = 30;

    /// 磁盘块大小（字节），一次设备传输恰好搬运一个块。
    pub const BSIZE: usize = 1024;

    /// 缓冲区缓存的哈希桶数量，`hash(blockno) = blockno % NBUCKET`。
    pub const NBUCKET: usize = 7;
}
