//! 处理器核心（hart）状态管理，用于绑定线程与核心并控制抢占开关
//!
//! 宿主环境下没有真实的中断使能位，这里用每线程的模拟标志与嵌套计数
//! 复刻内核中 `push_off` / `pop_off` 的语义：临界区内抢占被压制，
//! 核心编号保持稳定，最外层退出时精确恢复进入前的状态。

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::consts::NCPU;

/// 每个线程的 hart 状态：核心编号、抢占关闭嵌套层数与进入前的使能标志。
struct Hart {
    /// 该线程绑定的核心编号；`None` 表示尚未绑定，首次使用时自动分配。
    id: Cell<Option<usize>>,

    /// 关闭抢占的嵌套计数，表示当前抢占被禁止的层数。
    /// 每调用一次 `push_off` 计数加 1，每调用一次 `pop_off` 计数减 1。
    noff: Cell<u8>,

    /// 抢占使能标志，记录最外层 `push_off` 之前的使能状态，
    /// 用于在嵌套归零时恢复。
    intena: Cell<bool>,

    /// 模拟的"中断使能位"：`true` 表示该线程当前可被抢占。
    intr: Cell<bool>,
}

thread_local! {
    static HART: Hart = Hart {
        id: Cell::new(None),
        noff: Cell::new(0),
        intena: Cell::new(false),
        intr: Cell::new(true),
    };
}

/// 自动分配核心编号时使用的轮转计数器。
static NEXT_HART: AtomicUsize = AtomicUsize::new(0);

/// # 功能说明
/// 返回当前线程绑定的核心编号。
/// 若线程尚未绑定，则按轮转顺序自动分配一个 `0..NCPU` 的编号。
///
/// # 返回值
/// 当前线程的核心编号，取值范围 `0..NCPU`。
///
/// # 安全性
/// 编号在临界区内必须保持稳定；线程一经绑定不会被迁移，
/// 因此任何时刻读取都是一致的。并发测试应通过 [`bind`]
/// 显式为每个线程分配互不相同的编号。
pub fn cpu_id() -> usize {
    HART.with(|h| match h.id.get() {
        Some(id) => id,
        None => {
            let id = NEXT_HART.fetch_add(1, Ordering::Relaxed) % NCPU;
            h.id.set(Some(id));
            id
        }
    })
}

/// # 功能说明
/// 将当前线程显式绑定到编号为 `id` 的核心。
/// 测试中用于模拟"哪个核心在执行这段代码"。
///
/// # 参数
/// - `id`: 目标核心编号，必须小于 `NCPU`。
///
/// # 可能的错误
/// - `id >= NCPU` 时 panic；
/// - 在抢占关闭期间（临界区内）重新绑定会使核心编号失去稳定性，panic。
pub fn bind(id: usize) {
    if id >= NCPU {
        panic!("cpu bind: id {} out of range", id);
    }
    HART.with(|h| {
        if h.noff.get() != 0 {
            panic!("cpu bind: preemption off");
        }
        h.id.set(Some(id));
    });
}

/// 读取当前线程的模拟抢占使能标志。
pub fn intr_get() -> bool {
    HART.with(|h| h.intr.get())
}

fn intr_on() {
    HART.with(|h| h.intr.set(true));
}

fn intr_off() {
    HART.with(|h| h.intr.set(false));
}

/// # 功能说明
/// 关闭当前核心的抢占，并记录关闭的嵌套次数。
/// 多次调用 `push_off()` 需要相应次数的 `pop_off()` 才能恢复，
/// 如果抢占原本就处于关闭状态，调用后保持关闭。
///
/// # 流程解释
/// 1. 读取当前使能状态 `old`；
/// 2. 关闭抢占；
/// 3. 若嵌套计数 `noff` 为 0，将 `old` 保存到 `intena`，用于最外层恢复；
/// 4. 嵌套计数加 1。
pub fn push_off() {
    let old = intr_get();
    intr_off();
    HART.with(|h| {
        if h.noff.get() == 0 {
            h.intena.set(old);
        }
        h.noff.set(h.noff.get() + 1);
    });
}

/// # 功能说明
/// 解除一层由 `push_off()` 关闭的抢占，
/// 只有所有嵌套层都退出后才真正恢复进入前的使能状态。
///
/// # 可能的错误
/// - 在抢占已开启时调用，说明配对关系被破坏，panic；
/// - 嵌套计数已为 0 时调用，说明多余的 `pop_off()`，panic。
pub fn pop_off() {
    if intr_get() {
        panic!("pop_off(): interruptable");
    }
    HART.with(|h| {
        if h.noff.get() == 0 {
            panic!("pop_off(): count not match");
        }
        h.noff.set(h.noff.get() - 1);
        if h.noff.get() == 0 && h.intena.get() {
            intr_on();
        }
    });
}

/// 可嵌套的抢占关闭作用域。
///
/// 构造时关闭一层抢占，析构时恢复一层，
/// 整个生命周期内当前线程的核心编号保持稳定。
pub struct IntrGuard;

impl IntrGuard {
    pub fn new() -> Self {
        push_off();
        IntrGuard
    }
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_nesting() {
        assert!(intr_get());
        push_off();
        push_off();
        assert!(!intr_get());
        pop_off();
        assert!(!intr_get());
        pop_off();
        assert!(intr_get());
    }

    #[test]
    fn guard_restores_state() {
        {
            let _g = IntrGuard::new();
            assert!(!intr_get());
            {
                let _g2 = IntrGuard::new();
                assert!(!intr_get());
            }
            assert!(!intr_get());
        }
        assert!(intr_get());
    }

    #[test]
    #[should_panic(expected = "count not match")]
    fn unbalanced_pop() {
        push_off();
        pop_off();
        // 此时抢占已恢复，需再关一次才能触达计数检查
        intr_off();
        pop_off();
    }

    #[test]
    fn id_is_stable() {
        let id = cpu_id();
        assert_eq!(id, cpu_id());
        assert!(id < NCPU);
    }
}
