//! 睡眠锁模块
//! 提供基于挂起/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会被挂起（移出可运行集合），
//! 而不是忙等待；因此睡眠锁可以跨设备传输持有，自旋锁不可以。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use std::thread::{self, Thread, ThreadId};

use crate::spinlock::SpinLock;

/// 睡眠锁的内部状态，由内部自旋锁保护。
struct SleepState {
    /// 锁是否已被占用。
    locked: bool,
    /// 当前持有者的线程标识，用于释放时的持有者校验。
    owner: Option<ThreadId>,
    /// 等待该锁的线程句柄，释放时统一唤醒。
    waiters: Vec<Thread>,
}

/// 睡眠锁结构，提供阻塞式同步机制。
///
/// 与自旋锁不同，当锁被占用时，尝试获取的线程会挂起，
/// 直到锁被释放后被唤醒。这避免了忙等待，适用于可能长时间持有的锁，
/// 例如缓存槽的内容在一次设备传输期间始终由睡眠锁保护。
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护 `SleepState` 的原子访问；
/// - `name`: 锁的标识名称，用于调试；
/// - `data`: 被保护的数据，通过 `UnsafeCell` 实现内部可变性。
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<SleepState>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(
                SleepState {
                    locked: false,
                    owner: None,
                    waiters: Vec::new(),
                },
                "sleeplock",
            ),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// # 功能说明
    /// 获取睡眠锁，锁被占用时挂起当前线程直到被持有者唤醒。
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护状态检查；
    /// 2. 若已锁定：把自己登记到等待队列，释放内部锁后挂起；
    ///    被唤醒后重新上内部锁并复查（可能被其他等待者抢先）；
    /// 3. 设置 `locked` 与持有者标识，释放内部锁，返回守卫。
    ///
    /// # 返回值
    /// `SleepLockGuard<'_, T>` 守卫对象，提供对内部数据的独占访问。
    ///
    /// # 安全性
    /// 挂起前必须先释放内部自旋锁（恢复抢占计数），
    /// 否则持有自旋锁挂起会阻塞整个核心。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut state = self.lock.lock();
        while state.locked {
            state.waiters.push(thread::current());
            drop(state);
            // unpark 令牌保证登记与挂起之间的唤醒不会丢失
            thread::park();
            state = self.lock.lock();
        }
        state.locked = true;
        state.owner = Some(thread::current().id());
        drop(state);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁并唤醒所有等待者（内部方法，由守卫的 Drop 调用）。
    ///
    /// # 可能的错误
    /// 非持有者释放属于调用方契约违规，panic。
    fn unlock(&self) {
        let mut state = self.lock.lock();
        if !state.locked || state.owner != Some(thread::current().id()) {
            panic!("sleeplock {} release", self.name);
        }
        state.locked = false;
        state.owner = None;
        let waiters = core::mem::take(&mut state.waiters);
        drop(state);
        for w in waiters {
            w.unpark();
        }
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问。
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
