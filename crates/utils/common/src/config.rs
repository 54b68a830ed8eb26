use crate::constant::GiB;

pub const PTR_SIZE: usize = core::mem::size_of::<usize>();

/// 物理内存的起始地址
pub const MEMORY_START: usize = 0x8000_0000;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 每个页中 PTE 的数量
pub const PTE_PER_PAGE: usize = PAGE_SIZE / PTR_SIZE;

/// 用户地址空间的起点。第 0 页永远不映射，用于捕获空指针
pub const USER_SPACE_START: usize = PAGE_SIZE;
/// 堆（brk）的起点，即低地址的 64GiB 处
pub const BRK_BASE: usize = 64 * GiB;
/// mmap 开始寻找可映射段的起点，即低地址的 128GiB 处
pub const MMAP_START: usize = 0x20_0000_0000;
/// 低地址的末端，即 256GiB 处
pub const LOW_ADDRESS_END: usize = 0x40_0000_0000;

/// 内核动态映射区（vmalloc）的起点，对应 Sv39 根页表的第 511 项
pub const KERNEL_VM_START: usize = 0xFFFF_FFFF_C000_0000;
/// 内核动态映射区的末端。最后一页不使用
pub const KERNEL_VM_END: usize = 0xFFFF_FFFF_FFFF_F000;
/// 所有地址空间共享的根页表项
pub const KERNEL_ROOT_LINES: &[usize] = &[511];

/// 页锁等待队列的数量，按页号哈希
pub const PAGE_WAIT_QUEUES: usize = 64;
/// inode 哈希表的桶数
pub const INODE_HASH_BUCKETS: usize = 64;
/// `strcpy_from_user` 的初始缓冲区大小
pub const STRCPY_INITIAL_CAPACITY: usize = 256;
