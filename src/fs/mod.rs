//! 文件系统模块（块缓存层）
//!
//! 磁盘上的数据布局由更高层的文件系统协作者定义，
//! 这里只缓存定长的原始块。

pub use bio::{Bcache, Buf, BufData, BufPin};

mod bio;
