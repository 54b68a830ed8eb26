//! 物理页描述符、页注册表和页锁
//!
//! 每个物理页在注册表中有一个 [`Page`]，以物理页号为下标。[`PageRef`] 是对页的一个引用计数，
//! 克隆即 pin，析构即 unpin，计数归零时页回到分配器。

use alloc::{boxed::Box, sync::Arc, sync::Weak, vec::Vec};
use core::{
    alloc::Layout,
    fmt,
    ops::{Deref, Range},
    ptr::NonNull,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

use bitflags::bitflags;
use common::config::{MEMORY_START, PAGE_SIZE, PAGE_WAIT_QUEUES};
use event_listener::Event;
#[cfg(feature = "std")]
use event_listener::Listener;
use klocks::SpinMutex;

use crate::{
    frame_allocator::{BuddySystemFrameAllocator, FrameAllocator},
    page_cache::PageCacheEntry,
    PhysAddr, PhysPageNum,
};

bitflags! {
    /// 页的状态位，只通过原子操作修改
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: usize {
        /// 页锁，持有者可以对页做 I/O
        const LOCKED = 1 << 0;
        /// 内容比磁盘上新
        const DIRTY = 1 << 1;
        /// 不可被释放，比如正在作为页表使用
        const PINNED = 1 << 2;
        /// 空闲，属于分配器
        const BUDDY = 1 << 3;
        /// 正在写回
        const FLUSHING = 1 << 5;
        /// 留给文件系统自己使用
        const FILESYSTEM1 = 1 << 6;
        /// 有线程在等待页锁
        const WAITERS = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// 不清零，调用方马上会覆盖整个页
        const NO_ZERO = 1 << 0;
    }
}

/// 物理页描述符
pub struct Page {
    ref_count: AtomicUsize,
    flags: AtomicUsize,
    /// 在提交它的 VMO 中的偏移
    offset: AtomicUsize,
    /// 指回页缓存项，不持有所有权
    cache: SpinMutex<Option<Weak<PageCacheEntry>>>,
}

impl Page {
    fn new() -> Self {
        Self {
            ref_count: AtomicUsize::new(0),
            flags: AtomicUsize::new(PageFlags::BUDDY.bits()),
            offset: AtomicUsize::new(0),
            cache: SpinMutex::new(None),
        }
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// 置位并返回之前是否已经置位
    pub fn test_and_set_flags(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_retain(old).contains(flags)
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    pub(crate) fn set_offset(&self, offset: usize) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    /// 该页对应的页缓存项，如果有的话
    pub fn cache_entry(&self) -> Option<Arc<PageCacheEntry>> {
        self.cache.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_cache_entry(&self, entry: Option<Weak<PageCacheEntry>>) {
        *self.cache.lock() = entry;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemStat {
    pub total_pages: usize,
    pub free_pages: usize,
}

/// 物理页注册表，管理一段直接映射的物理内存
pub struct PageRegistry {
    base: PhysPageNum,
    pages: Box<[Page]>,
    direct_map: NonNull<u8>,
    /// 注册表自己申请的内存，析构时归还
    arena: Option<Layout>,
    allocator: SpinMutex<Box<dyn FrameAllocator>>,
    free_pages: AtomicUsize,
    wait_queues: Box<[Event]>,
}

// SAFETY: `direct_map` 指向的内存只通过页的引用计数和页锁来访问
unsafe impl Send for PageRegistry {}
unsafe impl Sync for PageRegistry {}

impl PageRegistry {
    /// 基于一段已经直接映射的物理内存构建注册表
    ///
    /// # Safety
    ///
    /// `direct_map` 必须是 `frames.start` 在内核中的虚拟地址，整个范围可读写，且之后只由注册表管理。
    /// `allocator` 必须只分配 `frames` 范围内的页号
    pub unsafe fn from_raw_parts(
        frames: Range<PhysPageNum>,
        direct_map: NonNull<u8>,
        allocator: Box<dyn FrameAllocator>,
    ) -> Arc<Self> {
        Self::build(frames, direct_map, None, allocator)
    }

    /// 从堆上申请 `nr_frames` 个页作为物理内存，页号从 `MEMORY_START` 开始编号
    pub fn with_capacity(nr_frames: usize) -> Arc<Self> {
        assert!(nr_frames > 0);
        let layout = Layout::from_size_align(nr_frames * PAGE_SIZE, PAGE_SIZE)
            .unwrap_or_else(|_| panic!("{nr_frames} frames do not fit in memory"));
        // SAFETY: layout 的大小非零
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(direct_map) = NonNull::new(ptr) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        let base = PhysAddr(MEMORY_START).floor();
        let frames = base..base + nr_frames;
        let allocator = Box::new(BuddySystemFrameAllocator::new(frames.clone()));
        Self::build(frames, direct_map, Some(layout), allocator)
    }

    fn build(
        frames: Range<PhysPageNum>,
        direct_map: NonNull<u8>,
        arena: Option<Layout>,
        allocator: Box<dyn FrameAllocator>,
    ) -> Arc<Self> {
        let nr_frames = frames.end.0 - frames.start.0;
        let pages = (0..nr_frames).map(|_| Page::new()).collect::<Vec<_>>();
        let wait_queues = (0..PAGE_WAIT_QUEUES)
            .map(|_| Event::new())
            .collect::<Vec<_>>();
        debug!("page registry manages {nr_frames} frames from {:?}", frames.start);
        Arc::new(Self {
            base: frames.start,
            pages: pages.into_boxed_slice(),
            direct_map,
            arena,
            allocator: SpinMutex::new(allocator),
            free_pages: AtomicUsize::new(nr_frames),
            wait_queues: wait_queues.into_boxed_slice(),
        })
    }

    pub fn contains(&self, ppn: PhysPageNum) -> bool {
        ppn >= self.base && ppn.0 - self.base.0 < self.pages.len()
    }

    fn page(&self, ppn: PhysPageNum) -> &Page {
        &self.pages[ppn.0 - self.base.0]
    }

    pub(crate) fn frame_ptr(&self, ppn: PhysPageNum) -> *mut u8 {
        debug_assert!(self.contains(ppn));
        // SAFETY: ppn 在注册表管理的范围内
        unsafe {
            self.direct_map
                .as_ptr()
                .add((ppn.0 - self.base.0) * PAGE_SIZE)
        }
    }

    fn wait_queue(&self, ppn: PhysPageNum) -> &Event {
        &self.wait_queues[ppn.0 % self.wait_queues.len()]
    }

    pub fn stat(&self) -> MemStat {
        MemStat {
            total_pages: self.pages.len(),
            free_pages: self.free_pages.load(Ordering::Relaxed),
        }
    }

    /// 分配 `1 << order` 个连续的物理页。分配不到时返回 `None`
    pub fn alloc_pages(self: &Arc<Self>, order: u32, flags: AllocFlags) -> Option<PageRun> {
        let count = 1usize << order;
        let start = self.allocator.lock().alloc(count)?;
        self.free_pages.fetch_sub(count, Ordering::Relaxed);
        for i in 0..count {
            let page = self.page(start + i);
            debug_assert!(page.flags().contains(PageFlags::BUDDY));
            debug_assert_eq!(page.ref_count(), 0);
            page.flags.store(0, Ordering::Relaxed);
            page.set_offset(0);
        }
        if !flags.contains(AllocFlags::NO_ZERO) {
            // SAFETY: 这些页刚分配出来，没有其他人访问
            unsafe { core::ptr::write_bytes(self.frame_ptr(start), 0, count * PAGE_SIZE) };
        }
        trace!("alloc {count} pages at {start:?}");
        Some(PageRun {
            registry: Some(Arc::clone(self)),
            start,
            order,
        })
    }

    pub fn alloc_page(self: &Arc<Self>, flags: AllocFlags) -> Option<PageRef> {
        self.alloc_pages(0, flags).and_then(|run| run.split().pop())
    }

    /// 计数归零后归还物理页
    fn free_page(&self, ppn: PhysPageNum) {
        let page = self.page(ppn);
        let flags = page.flags();
        assert!(
            !flags.intersects(PageFlags::LOCKED | PageFlags::PINNED),
            "freeing page {ppn:?} with flags {flags:?}"
        );
        page.set_cache_entry(None);
        page.flags.store(PageFlags::BUDDY.bits(), Ordering::Release);
        // SAFETY: 该页由 `alloc_pages` 分配，且已经没有引用了
        unsafe { self.allocator.lock().dealloc(ppn..ppn + 1) };
        self.free_pages.fetch_add(1, Ordering::Relaxed);
        trace!("free page {ppn:?}");
    }
}

impl Drop for PageRegistry {
    fn drop(&mut self) {
        if let Some(layout) = self.arena {
            // SAFETY: 由 `with_capacity` 以同样的 layout 申请
            unsafe { alloc::alloc::dealloc(self.direct_map.as_ptr(), layout) };
        }
    }
}

/// 一段连续的物理页，整体持有。可以拆成单独计数的页
pub struct PageRun {
    registry: Option<Arc<PageRegistry>>,
    start: PhysPageNum,
    order: u32,
}

impl PageRun {
    pub fn start(&self) -> PhysPageNum {
        self.start
    }

    pub fn len(&self) -> usize {
        1 << self.order
    }

    /// 拆分为单独计数的页，每个页之后各自释放
    pub fn split(mut self) -> Vec<PageRef> {
        let Some(registry) = self.registry.take() else {
            return Vec::new();
        };
        (0..self.len())
            .map(|i| {
                let ppn = self.start + i;
                registry.page(ppn).ref_count.store(1, Ordering::Release);
                PageRef {
                    registry: Arc::clone(&registry),
                    ppn,
                }
            })
            .collect()
    }
}

impl Drop for PageRun {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        let count = self.len();
        for i in 0..count {
            registry
                .page(self.start + i)
                .flags
                .store(PageFlags::BUDDY.bits(), Ordering::Release);
        }
        // SAFETY: 整段由同一次分配得到
        unsafe {
            registry
                .allocator
                .lock()
                .dealloc(self.start..self.start + count);
        }
        registry.free_pages.fetch_add(count, Ordering::Relaxed);
    }
}

/// 对物理页的一个计数引用
pub struct PageRef {
    registry: Arc<PageRegistry>,
    ppn: PhysPageNum,
}

impl PageRef {
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    pub fn registry(&self) -> &Arc<PageRegistry> {
        &self.registry
    }

    /// 是否是同一个物理页
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ppn == other.ppn && Arc::ptr_eq(&self.registry, &other.registry)
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        // SAFETY: 范围在页内
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.registry.frame_ptr(self.ppn).add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE);
        // SAFETY: 范围在页内
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.registry.frame_ptr(self.ppn).add(offset),
                data.len(),
            );
        }
    }

    pub fn zero_range(&self, range: Range<usize>) {
        assert!(range.start <= range.end && range.end <= PAGE_SIZE);
        // SAFETY: 范围在页内
        unsafe {
            core::ptr::write_bytes(
                self.registry.frame_ptr(self.ppn).add(range.start),
                0,
                range.end - range.start,
            );
        }
    }

    pub fn copy_from_page(&self, src: &PageRef) {
        if self.ptr_eq(src) {
            return;
        }
        // SAFETY: 两个不同的物理页，各自占满一页
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.registry.frame_ptr(src.ppn),
                self.registry.frame_ptr(self.ppn),
                PAGE_SIZE,
            );
        }
    }

    pub fn try_lock(&self) -> Option<PageLockGuard<'_>> {
        let old = self
            .flags
            .fetch_or(PageFlags::LOCKED.bits(), Ordering::Acquire);
        if PageFlags::from_bits_retain(old).contains(PageFlags::LOCKED) {
            None
        } else {
            Some(PageLockGuard { page: self })
        }
    }

    /// 获取页锁，可能睡眠。不能在持有自旋锁时调用
    pub fn lock(&self) -> PageLockGuard<'_> {
        match self.try_lock() {
            Some(guard) => guard,
            None => self.lock_slow(),
        }
    }

    #[cold]
    fn lock_slow(&self) -> PageLockGuard<'_> {
        let queue = self.registry.wait_queue(self.ppn);
        loop {
            // 先注册监听再设置 WAITERS，避免错过解锁时的唤醒
            let listener = queue.listen();
            self.set_flags(PageFlags::WAITERS);
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            #[cfg(feature = "std")]
            listener.wait();
            #[cfg(not(feature = "std"))]
            {
                drop(listener);
                while self.flags().contains(PageFlags::LOCKED) {
                    core::hint::spin_loop();
                }
            }
        }
    }

    fn unlock(&self) {
        let old = PageFlags::from_bits_retain(
            self.flags
                .fetch_and(!PageFlags::LOCKED.bits(), Ordering::Release),
        );
        debug_assert!(old.contains(PageFlags::LOCKED));
        if old.contains(PageFlags::WAITERS) {
            self.clear_flags(PageFlags::WAITERS);
            self.registry.wait_queue(self.ppn).notify(usize::MAX);
        }
    }
}

impl Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.registry.page(self.ppn)
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            registry: Arc::clone(&self.registry),
            ppn: self.ppn,
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        if self.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        self.registry.free_page(self.ppn);
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("ppn", &self.ppn)
            .field("ref_count", &self.ref_count())
            .field("flags", &self.flags())
            .finish()
    }
}

/// 页锁的守卫，析构时解锁
pub struct PageLockGuard<'a> {
    page: &'a PageRef,
}

impl Deref for PageLockGuard<'_> {
    type Target = PageRef;

    fn deref(&self) -> &PageRef {
        self.page
    }
}

impl Drop for PageLockGuard<'_> {
    fn drop(&mut self) {
        self.page.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;

    #[test]
    fn alloc_zeroed_and_free_on_last_unpin() {
        let registry = PageRegistry::with_capacity(8);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        let mut buf = [0xFFu8; 16];
        page.read_bytes(100, &mut buf);
        assert_eq!(buf, [0; 16]);
        assert_eq!(page.ref_count(), 1);
        assert_eq!(registry.stat().free_pages, 7);

        let pinned = page.clone();
        assert_eq!(page.ref_count(), 2);
        drop(page);
        assert_eq!(registry.stat().free_pages, 7);
        drop(pinned);
        assert_eq!(registry.stat().free_pages, 8);
    }

    #[test]
    fn exhaustion_returns_none() {
        let registry = PageRegistry::with_capacity(2);
        let a = registry.alloc_page(AllocFlags::empty()).unwrap();
        let b = registry.alloc_page(AllocFlags::empty()).unwrap();
        assert!(registry.alloc_page(AllocFlags::empty()).is_none());
        drop(a);
        assert!(registry.alloc_page(AllocFlags::empty()).is_some());
        drop(b);
    }

    #[test]
    fn run_splits_into_counted_pages() {
        let registry = PageRegistry::with_capacity(8);
        let run = registry.alloc_pages(2, AllocFlags::empty()).unwrap();
        assert_eq!(run.len(), 4);
        let start = run.start();
        let pages = run.split();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[3].ppn(), start + 3);
        assert_eq!(registry.stat().free_pages, 4);
        drop(pages);
        assert_eq!(registry.stat().free_pages, 8);

        let run = registry.alloc_pages(3, AllocFlags::NO_ZERO).unwrap();
        assert_eq!(registry.stat().free_pages, 0);
        drop(run);
        assert_eq!(registry.stat().free_pages, 8);
    }

    #[test]
    fn bytes_and_copy() {
        let registry = PageRegistry::with_capacity(4);
        let src = registry.alloc_page(AllocFlags::empty()).unwrap();
        let dst = registry.alloc_page(AllocFlags::NO_ZERO).unwrap();
        src.write_bytes(PAGE_SIZE - 3, b"abc");
        dst.copy_from_page(&src);
        let mut buf = [0u8; 3];
        dst.read_bytes(PAGE_SIZE - 3, &mut buf);
        assert_eq!(&buf, b"abc");
        dst.zero_range(PAGE_SIZE - 2..PAGE_SIZE);
        dst.read_bytes(PAGE_SIZE - 3, &mut buf);
        assert_eq!(&buf, b"a\0\0");
    }

    #[test]
    #[should_panic(expected = "freeing page")]
    fn freeing_pinned_page_is_fatal() {
        let registry = PageRegistry::with_capacity(1);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        page.set_flags(PageFlags::PINNED);
        drop(page);
    }

    #[test]
    fn try_lock_is_exclusive() {
        let registry = PageRegistry::with_capacity(1);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        let guard = page.try_lock().unwrap();
        assert!(page.try_lock().is_none());
        drop(guard);
        assert!(!page.flags().contains(PageFlags::LOCKED));
        assert!(page.try_lock().is_some());
    }

    #[test]
    fn contended_lock_wakes_waiter() {
        let registry = PageRegistry::with_capacity(1);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        let guard = page.lock();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let page = page.clone();
            thread::spawn(move || {
                let guard = page.lock();
                page.write_bytes(0, &[7]);
                drop(guard);
                tx.send(()).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        page.write_bytes(0, &[1]);
        drop(guard);

        rx.recv().unwrap();
        waiter.join().unwrap();
        let mut byte = [0u8];
        page.read_bytes(0, &mut byte);
        assert_eq!(byte, [7]);
        assert!(!page.flags().intersects(PageFlags::LOCKED | PageFlags::WAITERS));
    }
}
