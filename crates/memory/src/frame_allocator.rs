//! 物理页帧分配器。页描述符的记账在 [`crate::page`]，这里只负责页号的分配和回收

use core::ops::Range;

use crate::PhysPageNum;

/// 以 2 的幂为粒度分配物理页号
pub trait FrameAllocator: Send {
    /// 分配 `num` 个连续的物理页，返回第一个页号
    fn alloc(&mut self, num: usize) -> Option<PhysPageNum>;

    /// # Safety
    ///
    /// 需要保证 range 内的物理页之前都实际被分配，且是由同一次 `alloc` 得到的，或是其中的单个页
    unsafe fn dealloc(&mut self, range: Range<PhysPageNum>);
}

const BUDDY_ORDER: usize = 32;

pub struct BuddySystemFrameAllocator {
    allocator: buddy_system_allocator::FrameAllocator<BUDDY_ORDER>,
    base: PhysPageNum,
}

impl BuddySystemFrameAllocator {
    /// 管理 `frames` 范围内的所有物理页
    pub fn new(frames: Range<PhysPageNum>) -> Self {
        let mut allocator = buddy_system_allocator::FrameAllocator::new();
        allocator.add_frame(0, frames.end.0 - frames.start.0);
        Self {
            allocator,
            base: frames.start,
        }
    }
}

impl FrameAllocator for BuddySystemFrameAllocator {
    fn alloc(&mut self, num: usize) -> Option<PhysPageNum> {
        self.allocator
            .alloc(num)
            .map(|first| PhysPageNum(first + self.base.0))
    }

    unsafe fn dealloc(&mut self, range: Range<PhysPageNum>) {
        self.allocator
            .dealloc(range.start.0 - self.base.0, range.end.0 - range.start.0);
    }
}
