//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::cpu::{cpu_id, pop_off, push_off};

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的核心将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的核心编号，用于调试和重入检测。
///
/// 自旋锁只应保护短暂、有界的元数据操作，绝不能跨设备传输持有；
/// 需要跨慢速操作持有的资源应使用睡眠锁（见 `sleeplock`）。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `cpuid`: 当前持有锁的核心编号（-1 表示无核心持有）；
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了 `Deref` 和 `DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 流程解释
    /// 1. 调用 `push_off()` 关闭抢占（防止同核重入造成死锁）；
    /// 2. 检查当前核心是否已持有锁（重入即 panic）；
    /// 3. 通过原子比较交换忙等待直到获取锁；
    /// 4. 设置内存屏障确保临界区内的访问不被重排到获取之前；
    /// 5. 记录当前核心编号并返回守卫。
    ///
    /// # 返回值
    /// `SpinLockGuard<'_, T>` 守卫对象，提供对内部数据的访问。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// # 功能说明
    /// 尝试获取锁，不进行忙等待。
    /// 获取失败时立即返回 `None` 并恢复抢占状态。
    ///
    /// 缓冲区缓存的跨桶扫描在回绕方向上依赖本方法维持全局锁序，
    /// 详见 `fs/bio.rs`。
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self.holding() {
            panic!("spinlock {} try_lock", self.name);
        }
        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            pop_off();
            return None;
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
        Some(SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// 检查当前核心是否持有此锁。
    /// 只在抢占关闭期间有意义（核心编号稳定）。
    fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed) && self.cpuid.load(Ordering::Relaxed) == cpu_id() as isize
    }

    fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 守卫存在即表示锁被持有，离开作用域时自动释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }

    #[test]
    fn guard_gives_access() {
        let m = SpinLock::new(0usize, "count");
        *m.lock() = 42;
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn try_lock_contended() {
        crate::cpu::bind(0);
        let m = SpinLock::new((), "try");
        let g = m.lock();
        thread::scope(|s| {
            s.spawn(|| {
                crate::cpu::bind(1);
                assert!(m.try_lock().is_none());
            });
        });
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn parallel_counter() {
        let m = Arc::new(SpinLock::new(0usize, "counter"));
        let mut handles = Vec::new();
        for i in 0..4 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                crate::cpu::bind(i);
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }
}
