/// 内存子系统会投递给用户线程的信号
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    SIGBUS = 7,
    SIGSEGV = 11,
}

impl Signal {
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }
}
