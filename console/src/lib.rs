//! 内核打印与分级日志。
//!
//! 内核把一个输出槽（[`Sink`]）装进来，之后所有 `kprint!` 和 `log` 宏
//! 都走这一条路。库内各 crate 只使用 `log` 门面，不直接打印。

#![no_std]
#![deny(warnings, missing_docs)]

use core::fmt::{self, Write};
use spin::Once;

/// 转发 `log`，方便使用者只依赖本 crate。
pub extern crate log;

/// 字节流的去处。实现者决定字符最终落在哪里。
pub trait Sink: Sync {
    /// 输出一段字符串。
    fn put_str(&self, s: &str);
}

static SINK: Once<&'static dyn Sink> = Once::new();

/// 装配输出槽并注册日志实现。重复调用只有第一次生效。
pub fn init(sink: &'static dyn Sink, level: log::LevelFilter) {
    let mut first = false;
    SINK.call_once(|| {
        first = true;
        sink
    });
    if first {
        let _ = log::set_logger(&Console);
        log::set_max_level(level);
    }
}

/// 打印的落点。给宏用的，不直接调用。
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = Console.write_fmt(args);
}

/// 格式化打印。
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::_print(core::format_args!($($arg)*))
    };
}

/// 格式化打印并换行。
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => {{
        $crate::_print(core::format_args!($($arg)*));
        $crate::kprint!("\n");
    }};
}

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = SINK.get() {
            sink.put_str(s);
        }
        Ok(())
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        SINK.get().is_some()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        use log::Level::*;
        let color: u8 = match record.level() {
            Error => 31,
            Warn => 93,
            Info => 34,
            Debug => 32,
            Trace => 90,
        };
        kprintln!(
            "\x1b[{color}m[{:>5}] {}\x1b[0m",
            record.level(),
            record.args(),
        );
    }

    fn flush(&self) {}
}
