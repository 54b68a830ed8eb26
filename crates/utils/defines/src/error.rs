#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }

    /// 错误的描述信息，用于日志
    pub fn info(self) -> &'static str {
        errno::error_info(self.as_isize())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.info())
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", stringify!($desc)),)*
                    _ => "unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        UNSUPPORTED, -1024, "Do not support",

        EPERM,          -1,     "Operation not permitted.",
        ENOENT,         -2,     "No such file or directory.",
        ESRCH,          -3,     "No such process.",
        EINTR,          -4,     "Interrupted system call.",
        EIO,            -5,     "I/O error.",
        ENXIO,          -6,     "No such device or address.",
        ENOEXEC,        -8,     "Exec format error.",
        EBADF,          -9,     "Bad file number.",
        ECHILD,         -10,    "No child process",
        EAGAIN,         -11,    "Try again.",
        ENOMEM,         -12,    "Out of memory",
        EACCES,         -13,    "Permission denied.",
        EFAULT,         -14,    "Bad address.",
        EBUSY,          -16,    "Device or resource busy.",
        EEXIST,         -17,    "File exists.",
        ENODEV,         -19,    "No such device.",
        ENOTDIR,        -20,    "Not a directory.",
        EISDIR,         -21,    "Is a directory.",
        EINVAL,         -22,    "Invalid argument.",
        EMFILE,         -24,    "Too many open files.",
        ENOTTY,         -25,    "Not a tty.",
        ESPIPE,         -29,    "Illegal seek.",
        ERANGE,         -34,    "Exceed range.",
        ENOSYS,         -38,    "Function not implemented.",
        ENAMETOOLONG,   -78,    "Filename too long",
    );
}
