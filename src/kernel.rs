//! 内核状态的顶层上下文，完成资源管理核心的初始化

use std::sync::Arc;

use crate::clock::Ticks;
use crate::driver::BlockDevice;
use crate::fs::Bcache;
use crate::mm::Kmem;

/// 资源管理核心的上下文对象。
///
/// 页分配器与块缓存互不依赖，是由同一设计习惯统一的两个对等组件：
/// 把共享资源池切成各自上锁的分片以减少争用，并为分片局部耗尽
/// 定义跨分片的回退协议。两者在这里一次性构造完成，
/// 初始化顺序显式可见，便于隔离测试。
pub struct Kernel {
    pub kmem: Kmem,
    pub bcache: Bcache,
    pub ticks: Arc<Ticks>,
}

impl Kernel {
    /// # 功能说明
    /// 构造并初始化整个核心，对应裸机内核主核的启动路径：
    /// 先建立页池并逐页建立空闲链表，再建立块缓存。
    ///
    /// # 参数
    /// - `npages`: 页池总页数；
    /// - `disk`: 块设备协作者。
    ///
    /// # 返回值
    /// 就绪的 `Kernel` 上下文；此后各操作通过该值调用。
    pub fn new(npages: usize, disk: Arc<dyn BlockDevice>) -> Self {
        log::info!("mpkern is booting");
        let ticks = Arc::new(Ticks::new());
        let kmem = Kmem::new(npages);
        kmem.kinit();
        let bcache = Bcache::new(disk, Arc::clone(&ticks));
        log::info!("mpkern: core ready");
        Self {
            kmem,
            bcache,
            ticks,
        }
    }
}
