use core::fmt::Arguments;

use crate::Level;

/// 一条日志。`target` 是产生日志的模块路径，如 `memory::vmo`
#[derive(Clone, Debug)]
pub struct Record<'a> {
    level: Level,
    target: &'static str,
    args: Arguments<'a>,
}

impl<'a> Record<'a> {
    #[inline]
    pub fn new(level: Level, target: &'static str, args: Arguments<'a>) -> Self {
        Self {
            level,
            target,
            args,
        }
    }

    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub fn target(&self) -> &'static str {
        self.target
    }

    #[inline]
    pub fn args(&self) -> &Arguments<'a> {
        &self.args
    }
}
