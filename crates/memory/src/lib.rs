//! 内核的虚拟内存和页缓存
//!
//! - [`page`]：物理页描述符、引用计数和页锁
//! - [`vmo`]：虚拟内存对象，按偏移保存页，负责按需提交和写时复制
//! - [`memory_space`]：地址空间，由不重叠的区域组成，每个区域映射一个 VMO
//! - [`page_cache`]：inode 的页缓存、写回
//! - [`fault`]、[`user_check`]：缺页处理和用户内存的读写
//! - [`syscall`]：`mmap` 等系统调用

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use]
extern crate kernel_tracer;

mod address;
mod frame_allocator;

pub mod context;
pub mod fault;
pub mod memory_space;
pub mod page;
pub mod page_cache;
pub mod syscall;
pub mod user_check;
pub mod vmo;

pub use self::address::{page_align_up, PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use self::context::{CpuContext, MmContext};
pub use self::fault::{FaultError, FaultInfo};
pub use self::frame_allocator::{BuddySystemFrameAllocator, FrameAllocator};
pub use self::memory_space::{
    AddressSpace, MapPermission, MapRequest, MappedFile, RegionKind, SpaceKind, SpaceState,
    VmRegion,
};
pub use self::page::{AllocFlags, MemStat, Page, PageFlags, PageRef, PageRegistry};
pub use self::page_cache::{CacheFlags, Inode, InodeBackend, InodeKey, WritebackList};
pub use self::vmo::{MappingType, Vmo, VmoGetFlags};
