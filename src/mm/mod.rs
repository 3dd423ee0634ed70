//! 内存管理模块

use crate::consts::PGSIZE;

pub use kalloc::{Kmem, Page};

pub mod kalloc;

/// 向上取整到页边界。
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界。
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}
