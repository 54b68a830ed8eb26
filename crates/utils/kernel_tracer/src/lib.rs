#![cfg_attr(not(test), no_std)]

#[macro_use]
mod macros;
mod level;
mod record;

pub use level::{Level, LevelFilter, CLOG};
pub use record::Record;

use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset};
use spin::{mutex::SpinMutex, Once};

/// 日志的最终去向，比如 SBI 控制台或者测试时的标准输出
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

pub static KERNEL_TRACER: KernelTracer = KernelTracer {
    sink: Once::new(),
    output: SpinMutex::new(()),
};

pub struct KernelTracer {
    sink: Once<&'static dyn LogSink>,
    // 保证一条日志不会和其他核的日志交错
    output: SpinMutex<()>,
}

struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl KernelTracer {
    fn write_log(writer: &mut impl Write, record: &Record<'_>) -> fmt::Result {
        // 开头部分，即日志级别，如 `[ INFO]`
        let color = match record.level() {
            Level::Error => AnsiColor::Red,
            Level::Warn => AnsiColor::BrightYellow,
            Level::Info => AnsiColor::Blue,
            Level::Debug => AnsiColor::Green,
            Level::Trace => AnsiColor::BrightBlack,
        };
        write!(
            writer,
            "{}[{:>5}]{} ",
            color.render_fg(),
            record.level(),
            Reset.render()
        )?;

        writeln!(writer, "{}: {}", record.target(), record.args())
    }

    fn emit(&self, record: &Record<'_>) {
        let Some(sink) = self.sink.get() else {
            return;
        };
        let _guard = self.output.lock();
        // 输出端自身不会失败，忽略格式化错误即可
        let _ = Self::write_log(&mut SinkWriter(*sink), record);
    }
}

/// 设置日志输出端，只有第一次调用生效
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    KERNEL_TRACER.sink.call_once(|| {
        installed = true;
        sink
    });
    installed
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, target: &'static str, args: fmt::Arguments<'_>) {
    if CLOG.enabled(level) {
        KERNEL_TRACER.emit(&Record::new(level, target, args));
    }
}
