//! 放一些比较杂又非常简单的东西，以至于不值得分出单独的文件

use bitflags::bitflags;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub sec: usize,
    pub nsec: usize,
}

bitflags! {
    /// `mmap`、`mprotect` 的 `prot` 参数。`PROT_NONE` 即为空
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapProt: u32 {
        const PROT_READ = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC = 1 << 2;
    }
}

bitflags! {
    /// `mmap` 的 `flags` 参数
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// 对映射的修改对其他映射同一区域的进程可见，并写回文件
        const MAP_SHARED = 1 << 0;
        /// 写时复制的私有映射
        const MAP_PRIVATE = 1 << 1;
        /// 必须映射到给定地址，会替换掉原有的映射
        const MAP_FIXED = 1 << 4;
        /// 不与文件关联，内容初始化为 0
        const MAP_ANONYMOUS = 1 << 5;
        /// 映射时立即分配并建立所有页
        const MAP_POPULATE = 1 << 15;
    }
}
