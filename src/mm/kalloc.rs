//! 物理页分配器，按处理器核心分片以消除公共路径上的锁争用
//!
//! 每个核心独占一个带锁的空闲页栈；本核心路径只碰本核心的锁，
//! 本分片耗尽时按固定顺序逐个查看兄弟分片，任何时刻至多持有
//! 一把分片锁，因此分配器天然无死锁。

use array_macro::array;

use core::ptr::{self, NonNull};
use core::slice;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

use crate::consts::{NCPU, PGSIZE};
use crate::cpu::{self, IntrGuard};
use crate::mm::pg_round_down;
use crate::spinlock::SpinLock;

/// 释放路径写入整页的哨兵字节，使悬挂引用的读取立即现形。
pub const FREE_JUNK: u8 = 1;

/// 分配路径写入整页的哨兵字节，使未初始化读取立即现形。
pub const ALLOC_JUNK: u8 = 5;

/// 单个分片的空闲页栈：空闲顺序无关紧要，栈即足够。
/// 栈里存放的是页帧编号而不是裸地址。
struct FreeList {
    frames: Vec<u32>,
}

impl FreeList {
    const fn new() -> Self {
        Self { frames: Vec::new() }
    }
}

/// 分片式物理页分配器。
///
/// `Kmem` 持有一块页对齐的连续内存区（模拟的物理页池）和
/// `NCPU` 个独立上锁的空闲页分片。所有分片空闲页与所有已分配
/// 页面之和恒等于页池总量；任何页帧任一时刻只属于一个分片
/// 或一个持有者。
///
/// # 字段说明
/// - `shards`: 每核心一个的空闲页分片，各自由自旋锁保护；
/// - `base`: 页池起始地址，页对齐；
/// - `npages`: 页池中的总页数。
pub struct Kmem {
    shards: [SpinLock<FreeList>; NCPU],
    base: NonNull<u8>,
    npages: usize,
}

/// Raw pointers are automatically thread-unsafe.
/// See doc https://doc.rust-lang.org/nomicon/send-and-sync.html.
unsafe impl Send for Kmem {}
unsafe impl Sync for Kmem {}

impl Kmem {
    /// # 功能说明
    /// 创建一个管理 `npages` 个物理页的分配器。
    /// 只分配页池内存本身，不做任何切分；空闲链表由 [`kinit`](Kmem::kinit)
    /// 通过逐页调用释放路径建立。
    ///
    /// # 参数
    /// - `npages`: 页池总页数，必须大于 0。
    ///
    /// # 可能的错误
    /// - `npages` 为 0 或布局非法时 panic（配置错误）；
    /// - 底层内存不足时走 `handle_alloc_error` 终止。
    pub fn new(npages: usize) -> Self {
        if npages == 0 {
            panic!("kmem: empty page pool");
        }
        let layout = match Layout::from_size_align(npages * PGSIZE, PGSIZE) {
            Ok(l) => l,
            Err(_) => panic!("kmem: bad pool layout"),
        };
        let raw = unsafe { alloc(layout) };
        let base = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        debug_assert_eq!(pg_round_down(base.as_ptr() as usize), base.as_ptr() as usize);
        Self {
            shards: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
            base,
            npages,
        }
    }

    /// # 功能说明
    /// 把整个页池逐页交给释放路径，建立初始空闲链表。
    /// 与运行期释放走同一条代码路径，因此所有页都落在
    /// 调用该函数的核心的分片中。
    ///
    /// # 安全性
    /// 仅应在启动时调用一次；重复调用会使页帧在分片间重复记账。
    pub fn kinit(&self) {
        self.free_range(0, self.npages);
        log::info!(
            "kmem: {} pages across {} shards, seeded on hart {}",
            self.npages,
            NCPU,
            cpu::cpu_id()
        );
    }

    /// 释放 `[start, end)` 范围内的每一个页帧。
    fn free_range(&self, start: usize, end: usize) {
        for frame in start..end {
            self.free(Page {
                frame: frame as u32,
                kmem: self,
            });
        }
    }

    /// # 功能说明
    /// 归还一个物理页。页面内容先被哨兵字节覆写，
    /// 然后其页帧被压入**调用核心**的分片空闲栈。
    ///
    /// # 流程解释
    /// 1. 校验页帧确实属于本分配器的页池（越界即契约违规）；
    /// 2. 覆写整页为 `FREE_JUNK`，使释放后的访问可检测；
    /// 3. 关闭抢占，取当前核心编号；
    /// 4. 在该核心分片的锁下压栈。
    ///
    /// # 参数
    /// - `page`: 要归还的页句柄，调用后所有权回到分配器。
    ///
    /// # 可能的错误
    /// - 页句柄不属于本页池时 panic（`"kfree"`），这是调用方
    ///   编程错误，不作为可恢复错误处理。
    pub fn free(&self, mut page: Page<'_>) {
        if !core::ptr::eq(page.kmem, self) || (page.frame as usize) >= self.npages {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        page.fill(FREE_JUNK);

        let _intr = IntrGuard::new();
        let id = cpu::cpu_id();
        self.shards[id].lock().frames.push(page.frame);
    }

    /// # 功能说明
    /// 分配一个物理页。优先从调用核心自己的分片取，
    /// 本分片为空时按固定顺序从兄弟分片借一页。
    ///
    /// # 流程解释
    /// 1. 关闭抢占（嵌套作用域，退出时恢复），取当前核心编号；
    /// 2. 锁住本核心分片并弹栈；
    /// 3. 若为空，按 `0..NCPU` 顺序逐个锁住其他分片查看，
    ///    任何时刻只持有一把分片锁，取到第一页即停止；
    /// 4. 全部为空则返回 `None`（可恢复的内存耗尽信号）；
    /// 5. 成功时覆写整页为 `ALLOC_JUNK` 后交给调用者。
    ///
    /// # 返回值
    /// - `Some(Page)`: 分配成功，页内容为哨兵字节；
    /// - `None`: 所有分片均为空，调用方决定重试、降级或上抛。
    pub fn alloc(&self) -> Option<Page<'_>> {
        let intr = IntrGuard::new();
        let id = cpu::cpu_id();
        let mut frame = self.shards[id].lock().frames.pop();

        if frame.is_none() {
            // 本核心分片已空，从其他核心的分片借用
            for j in 0..NCPU {
                if j == id {
                    continue;
                }
                let mut shard = self.shards[j].lock();
                if let Some(f) = shard.frames.pop() {
                    drop(shard);
                    log::debug!("kmem: hart {} steals frame {} from shard {}", id, f, j);
                    frame = Some(f);
                    break;
                }
            }
        }
        drop(intr);

        match frame {
            Some(f) => {
                let mut page = Page {
                    frame: f,
                    kmem: self,
                };
                page.fill(ALLOC_JUNK); // fill with junk
                Some(page)
            }
            None => {
                log::warn!("kmem: hart {} found no free page", id);
                None
            }
        }
    }

    /// 当前空闲页总数，逐个分片加锁统计，诊断用。
    pub fn free_pages(&self) -> usize {
        let mut sum = 0;
        for shard in self.shards.iter() {
            sum += shard.lock().frames.len();
        }
        sum
    }

    /// 页池总页数。
    pub fn total_pages(&self) -> usize {
        self.npages
    }

    /// 页帧对应的起始地址。
    fn frame_ptr(&self, frame: u32) -> *mut u8 {
        unsafe { self.base.as_ptr().add(frame as usize * PGSIZE) }
    }
}

impl Drop for Kmem {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.npages * PGSIZE, PGSIZE).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// 一个已分配物理页的所有权句柄。
///
/// 句柄在分配与归还之间唯一代表该页帧：它不可克隆，
/// 归还时被 [`Kmem::free`] 消耗，因此同一页不可能同时
/// 出现在两个分片中，也不可能被二次释放。
pub struct Page<'a> {
    frame: u32,
    kmem: &'a Kmem,
}

impl<'a> Page<'a> {
    /// 页帧编号。
    pub fn frame(&self) -> usize {
        self.frame as usize
    }

    /// 以字节切片访问页内容。
    pub fn as_slice(&self) -> &[u8] {
        // 安全性：句柄在分配与归还之间唯一拥有该页帧
        unsafe { slice::from_raw_parts(self.kmem.frame_ptr(self.frame), PGSIZE) }
    }

    /// 以可变字节切片访问页内容。
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.kmem.frame_ptr(self.frame), PGSIZE) }
    }

    fn fill(&mut self, junk: u8) {
        // 用裸指针整页覆写：页池刚建立时页内容尚未初始化，
        // 不能先对其构造引用
        unsafe { ptr::write_bytes(self.kmem.frame_ptr(self.frame), junk, PGSIZE) };
    }
}
