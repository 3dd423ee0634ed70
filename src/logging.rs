//! 定义内核核心的日志输出方式
//!
//! 通过 `log` 门面输出，由一个全局打印锁对多核（多线程）的
//! 输出行进行排序，避免交错。

use core::fmt::Write as _;
use std::io::Write as _;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::cpu;
use crate::spinlock::SpinLock;

/// 用于在多个核心之间对打印操作进行排序的全局锁。
static PRINT: SpinLock<()> = SpinLock::new((), "print");

struct KernLogger;

static LOGGER: KernLogger = KernLogger;

fn level_color(level: Level) -> u8 {
    match level {
        Level::Error => 31,
        Level::Warn => 93,
        Level::Info => 34,
        Level::Debug => 32,
        Level::Trace => 90,
    }
}

impl Log for KernLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        let _ = write!(
            line,
            "\u{1B}[{}m[{:>5}][hart {}] {}\u{1B}[0m",
            level_color(record.level()),
            record.level(),
            cpu::cpu_id(),
            record.args()
        );

        let guard = PRINT.lock();
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
        drop(guard);
    }

    fn flush(&self) {}
}

/// 安装日志输出端；重复调用是无害的。
///
/// 默认级别为 `Info`；开启 `verbose_init_info` 特性时放开到 `Trace`，
/// 以便观察跨分片借页与缓存槽迁移的细节。
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        #[cfg(feature = "verbose_init_info")]
        log::set_max_level(LevelFilter::Trace);
        #[cfg(not(feature = "verbose_init_info"))]
        log::set_max_level(LevelFilter::Info);
    }
}
