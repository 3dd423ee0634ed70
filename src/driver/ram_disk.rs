//! 内存块设备，测试与演示用

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crate::driver::BlockDevice;
use crate::fs::BufData;
use crate::spinlock::SpinLock;

/// 以稀疏映射存放块内容的内存设备。
///
/// 未写过的块读出全零。可配置一段人为的传输延迟，
/// 用于在并发测试中拉宽竞争窗口。
pub struct RamDisk {
    blocks: SpinLock<HashMap<(u32, u32), Box<[u8; crate::consts::fs::BSIZE]>>>,
    delay: Option<Duration>,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            blocks: SpinLock::new(HashMap::new(), "ram_disk"),
            delay: None,
        }
    }

    /// 每次传输前睡眠 `delay`，模拟慢速设备。
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            blocks: SpinLock::new(HashMap::new(), "ram_disk"),
            delay: Some(delay),
        }
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) {
        // 模拟传输耗时；睡眠放在锁外，持自旋锁睡眠会拖住其他核心
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let mut blocks = self.blocks.lock();
        if writing {
            blocks.insert((dev, blockno), Box::new(*data.bytes()));
        } else {
            match blocks.get(&(dev, blockno)) {
                Some(block) => data.bytes_mut().copy_from_slice(&block[..]),
                None => data.bytes_mut().fill(0),
            }
        }
    }
}
