use core::fmt;

const LEVEL_NAMES: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

/// 日志等级，越往后越详细
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Level {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        LEVEL_NAMES[self as usize]
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// 允许输出的最详细等级。`Off` 表示什么都不输出
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    const ALL: [LevelFilter; 6] = [
        LevelFilter::Off,
        LevelFilter::Error,
        LevelFilter::Warn,
        LevelFilter::Info,
        LevelFilter::Debug,
        LevelFilter::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        LEVEL_NAMES[self as usize]
    }

    #[inline]
    pub fn enabled(self, level: Level) -> bool {
        level as u8 <= self as u8
    }

    /// 按名字（全大写）解析，无法识别时为 `Off`
    const fn from_name(name: &str) -> Self {
        let mut i = 1;
        while i < LEVEL_NAMES.len() {
            if const_str_eq(name, LEVEL_NAMES[i]) {
                return Self::ALL[i];
            }
            i += 1;
        }
        LevelFilter::Off
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

const fn const_str_eq(lhs: &str, rhs: &str) -> bool {
    let (lhs, rhs) = (lhs.as_bytes(), rhs.as_bytes());
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut i = 0;
    while i < lhs.len() {
        if lhs[i] != rhs[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// 控制台日志等级，编译期由环境变量 `KERNEL_CLOG` 决定，默认关闭
pub const CLOG: LevelFilter = match option_env!("KERNEL_CLOG") {
    Some(name) => LevelFilter::from_name(name),
    None => LevelFilter::Off,
};
