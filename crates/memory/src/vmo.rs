//! 虚拟内存对象（VMO）。一个稀疏的“偏移 -> 物理页”映射，缺页时按提交策略填充
//!
//! 区域（[`crate::VmRegion`]）中的偏移都是相对于区域起点的，所以 VMO 的大小总是等于区域的大小。
//! inode 的页缓存也是一个 VMO，偏移即文件偏移。

use alloc::{
    collections::BTreeMap,
    sync::{self, Weak},
    vec::Vec,
};
use core::ops::Range;

use bitflags::bitflags;
use common::config::PAGE_OFFSET_MASK;
use defines::error::{errno, KResult};
use klocks::SpinMutex;
use smallvec::SmallVec;
use triomphe::Arc;

use crate::{
    memory_space::AddressSpace,
    page::{AllocFlags, PageRef, PageRegistry},
    page_cache::Inode,
    VirtAddr,
};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmoGetFlags: u32 {
        /// 页不存在时提交一个新页
        const MAY_POPULATE = 1 << 0;
        /// 调用方要写这个页，私有 VMO 中被共享的页会先复制一份
        const WRITE = 1 << 1;
    }
}

/// 映射的共享方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingType {
    /// 写时复制，修改对其他映射不可见
    Private,
    /// 修改对所有映射可见
    Shared,
}

/// 缺页时如何得到一个新页
#[derive(Clone)]
pub enum Commit {
    /// 全零页
    Anonymous,
    /// 从页缓存复制一份文件内容，超出文件末尾的部分填零
    FilePrivate {
        inode: sync::Arc<Inode>,
        file_offset: usize,
    },
    /// 直接引用页缓存中的页
    FileShared {
        inode: sync::Arc<Inode>,
        file_offset: usize,
    },
    /// inode 自己的页缓存，从磁盘读入
    PageCache(Weak<Inode>),
    /// fork 过的共享匿名映射，页取自父子共同引用的 VMO
    SharedAnonymous { store: Arc<Vmo>, offset: usize },
}

impl Commit {
    /// VMO 的开头被截掉 `amount` 字节后，文件偏移随之后移
    fn advance(&mut self, amount: usize) {
        match self {
            Commit::FilePrivate { file_offset, .. }
            | Commit::FileShared { file_offset, .. }
            | Commit::SharedAnonymous {
                offset: file_offset,
                ..
            } => {
                *file_offset += amount;
            }
            Commit::Anonymous | Commit::PageCache(_) => {}
        }
    }

    /// 共享文件映射中的页属于页缓存，其 `offset` 是文件偏移，不能改。共享匿名映射同理
    fn owns_pages(&self) -> bool {
        !matches!(
            self,
            Commit::FileShared { .. } | Commit::SharedAnonymous { .. }
        )
    }

    fn run(&self, registry: &sync::Arc<PageRegistry>, offset: usize) -> KResult<PageRef> {
        match self {
            Commit::Anonymous => registry
                .alloc_page(AllocFlags::empty())
                .ok_or(errno::ENOMEM),
            Commit::FilePrivate { inode, file_offset } => {
                inode.private_copy(registry, file_offset + offset)
            }
            Commit::FileShared { inode, file_offset } => inode.shared_page(file_offset + offset),
            Commit::PageCache(inode) => inode
                .upgrade()
                .ok_or(errno::EIO)?
                .read_from_backend(registry, offset),
            Commit::SharedAnonymous { store, offset: base } => {
                store.get(base + offset, VmoGetFlags::MAY_POPULATE)
            }
        }
    }
}

/// 映射了某个 VMO 的区域
#[derive(Clone, Debug)]
pub struct MappingLink {
    pub space: Weak<AddressSpace>,
    pub space_id: usize,
    pub base: VirtAddr,
}

impl PartialEq for MappingLink {
    fn eq(&self, other: &Self) -> bool {
        self.space_id == other.space_id && self.base == other.base
    }
}

pub struct Vmo {
    registry: sync::Arc<PageRegistry>,
    sharing: MappingType,
    inner: SpinMutex<VmoInner>,
    mappings: SpinMutex<SmallVec<[MappingLink; 1]>>,
}

struct VmoInner {
    size: usize,
    pages: BTreeMap<usize, Slot>,
    commit: Commit,
    /// 每次偏移的含义可能改变（截断、拆分、缩小）时加一
    generation: usize,
}

#[derive(Clone)]
struct Slot {
    page: PageRef,
    /// 页在 fork 时被其他 VMO 共享了，写之前要确认是否需要复制
    cow: bool,
}

impl Slot {
    fn new(page: PageRef) -> Self {
        Self { page, cow: false }
    }
}

impl VmoInner {
    fn new(size: usize, pages: BTreeMap<usize, Slot>, commit: Commit) -> Self {
        Self {
            size,
            pages,
            commit,
            generation: 0,
        }
    }

    fn extent(&self) -> usize {
        (self.size + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK
    }

    fn track(&self, offset: usize, page: &PageRef) {
        if self.commit.owns_pages() {
            page.set_offset(offset);
        }
    }
}

impl Vmo {
    pub fn new(
        registry: &sync::Arc<PageRegistry>,
        size: usize,
        commit: Commit,
        sharing: MappingType,
    ) -> Arc<Self> {
        Self::with_inner(registry, sharing, VmoInner::new(size, BTreeMap::new(), commit))
    }

    fn with_inner(
        registry: &sync::Arc<PageRegistry>,
        sharing: MappingType,
        inner: VmoInner,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: sync::Arc::clone(registry),
            sharing,
            inner: SpinMutex::new(inner),
            mappings: SpinMutex::new(SmallVec::new()),
        })
    }

    pub fn new_anonymous(
        registry: &sync::Arc<PageRegistry>,
        size: usize,
        sharing: MappingType,
    ) -> Arc<Self> {
        Self::new(registry, size, Commit::Anonymous, sharing)
    }

    pub fn registry(&self) -> &sync::Arc<PageRegistry> {
        &self.registry
    }

    pub fn sharing(&self) -> MappingType {
        self.sharing
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// 只查找，不提交
    pub fn lookup(&self, offset: usize) -> Option<PageRef> {
        self.inner
            .lock()
            .pages
            .get(&offset)
            .map(|slot| slot.page.clone())
    }

    pub fn get(&self, offset: usize, flags: VmoGetFlags) -> KResult<PageRef> {
        loop {
            if let Some((page, _)) = self.get_for_map(offset, flags)? {
                return Ok(page);
            }
        }
    }

    /// 同 [`Vmo::get`]，另外返回该页是否可以直接以可写方式映射。
    ///
    /// 提交期间 VMO 被截断、拆分或缩小时，`offset` 可能已经指向别的内容。
    /// 此时丢弃提交的页并返回 `None`，调用方需要重新确定偏移
    pub(crate) fn get_for_map(
        &self,
        offset: usize,
        flags: VmoGetFlags,
    ) -> KResult<Option<(PageRef, bool)>> {
        debug_assert_eq!(offset & PAGE_OFFSET_MASK, 0);
        let inner = self.inner.lock();
        if offset >= inner.extent() {
            return Err(errno::EFAULT);
        }
        if inner.pages.contains_key(&offset) {
            return self.resolve(inner, offset, flags).map(Some);
        }
        if !flags.contains(VmoGetFlags::MAY_POPULATE) {
            return Err(errno::ENOENT);
        }

        // 提交可能要做 I/O，不能持有锁
        let generation = inner.generation;
        let commit = inner.commit.clone();
        drop(inner);
        let committed = commit.run(&self.registry, offset);

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            drop(inner);
            trace!("vmo changed while committing offset {offset:#x}");
            drop(committed);
            return Ok(None);
        }
        let page = committed?;
        if inner.pages.contains_key(&offset) {
            // 别人先提交了，用它的，我们的页随 `page` 析构释放
            trace!("lost commit race at offset {offset:#x}");
        } else {
            inner.track(offset, &page);
            inner.pages.insert(offset, Slot::new(page.clone()));
            if let Commit::PageCache(inode) = &inner.commit {
                if let Some(inode) = inode.upgrade() {
                    inode.install_entry(offset, &page);
                }
            }
        }
        drop(page);
        self.resolve(inner, offset, flags).map(Some)
    }

    fn resolve(
        &self,
        mut inner: klocks::SpinMutexGuard<'_, VmoInner>,
        offset: usize,
        flags: VmoGetFlags,
    ) -> KResult<(PageRef, bool)> {
        let owns_pages = inner.commit.owns_pages();
        let Some(slot) = inner.pages.get_mut(&offset) else {
            return Err(errno::ENOENT);
        };
        if self.sharing == MappingType::Shared || !slot.cow {
            return Ok((slot.page.clone(), true));
        }
        if !flags.contains(VmoGetFlags::WRITE) {
            return Ok((slot.page.clone(), false));
        }
        // 其他共享者都已经复制走了
        if slot.page.ref_count() == 1 {
            slot.cow = false;
            return Ok((slot.page.clone(), true));
        }

        // 写时复制
        let copy = self
            .registry
            .alloc_page(AllocFlags::NO_ZERO)
            .ok_or(errno::ENOMEM)?;
        copy.copy_from_page(&slot.page);
        if owns_pages {
            copy.set_offset(offset);
        }
        trace!(
            "cow break at offset {offset:#x}: {:?} -> {:?}",
            slot.page.ppn(),
            copy.ppn()
        );
        *slot = Slot::new(copy.clone());
        Ok((copy, true))
    }

    /// 插入调用方准备好的页
    pub fn add_page(&self, offset: usize, page: PageRef) -> KResult<()> {
        debug_assert_eq!(offset & PAGE_OFFSET_MASK, 0);
        let mut inner = self.inner.lock();
        if offset >= inner.extent() {
            return Err(errno::EFAULT);
        }
        if inner.pages.contains_key(&offset) {
            warn!("page at offset {offset:#x} already exists");
            return Err(errno::EEXIST);
        }
        inner.track(offset, &page);
        if let Commit::PageCache(inode) = &inner.commit {
            if let Some(inode) = inode.upgrade() {
                inode.install_entry(offset, &page);
            }
        }
        inner.pages.insert(offset, Slot::new(page));
        Ok(())
    }

    /// 复制出一个新的 VMO，共享所有已存在的页。私有 VMO 的页因此变为写时复制。
    ///
    /// 共享匿名 VMO 第一次被 fork 时，已有的页移入一个父子共同引用的 VMO，
    /// 之后双方都从那里提交，后提交的页也是共享的
    pub fn fork(&self) -> Arc<Self> {
        let mut inner = self.inner.lock();
        match self.sharing {
            MappingType::Private => {
                for slot in inner.pages.values_mut() {
                    slot.cow = true;
                }
            }
            MappingType::Shared if matches!(inner.commit, Commit::Anonymous) => {
                let store = Self::with_inner(
                    &self.registry,
                    MappingType::Shared,
                    VmoInner::new(inner.extent(), inner.pages.clone(), Commit::Anonymous),
                );
                inner.commit = Commit::SharedAnonymous { store, offset: 0 };
                // 正在进行的匿名提交得到的页不在 store 中，必须重来
                inner.generation += 1;
            }
            MappingType::Shared => {}
        }
        Self::with_inner(
            &self.registry,
            self.sharing,
            VmoInner::new(inner.size, inner.pages.clone(), inner.commit.clone()),
        )
    }

    /// 挖掉 `[offset, offset + len)`，之后的页移到一个新 VMO 中（偏移从 0 开始），
    /// 中间的页被释放，自身缩小到 `offset`
    pub fn split(&self, offset: usize, len: usize) -> Arc<Self> {
        debug_assert_eq!(offset & PAGE_OFFSET_MASK, 0);
        debug_assert_eq!(len & PAGE_OFFSET_MASK, 0);
        let mut inner = self.inner.lock();
        let hole_end = offset + len;
        debug_assert!(hole_end <= inner.size);

        let tail = inner.pages.split_off(&hole_end);
        let hole = inner.pages.split_off(&offset);
        let mut commit = inner.commit.clone();
        commit.advance(hole_end);
        let owns_pages = commit.owns_pages();
        let pages = tail
            .into_iter()
            .map(|(off, slot)| {
                if owns_pages {
                    slot.page.set_offset(off - hole_end);
                }
                (off - hole_end, slot)
            })
            .collect();
        let new_size = inner.size - hole_end;
        inner.size = offset;
        inner.generation += 1;
        drop(inner);
        drop(hole);

        Self::with_inner(
            &self.registry,
            self.sharing,
            VmoInner::new(new_size, pages, commit),
        )
    }

    /// 截掉开头 `amount` 字节，其余的页前移
    pub fn truncate_beginning_and_resize(&self, amount: usize) {
        debug_assert_eq!(amount & PAGE_OFFSET_MASK, 0);
        let mut inner = self.inner.lock();
        debug_assert!(amount <= inner.size);
        let rest = inner.pages.split_off(&amount);
        let dropped = core::mem::replace(&mut inner.pages, BTreeMap::new());
        for (off, slot) in rest {
            inner.track(off - amount, &slot.page);
            inner.pages.insert(off - amount, slot);
        }
        inner.size -= amount;
        inner.commit.advance(amount);
        inner.generation += 1;
        drop(inner);
        drop(dropped);
    }

    /// 调整大小，新的末尾之后的页被释放
    pub fn resize(&self, new_size: usize) {
        let mut inner = self.inner.lock();
        inner.size = new_size;
        inner.generation += 1;
        let extent = inner.extent();
        let dropped = inner.pages.split_off(&extent);
        drop(inner);
        drop(dropped);
    }

    /// 只增大不缩小
    pub fn grow_to(&self, size: usize) {
        let mut inner = self.inner.lock();
        if size > inner.size {
            inner.size = size;
        }
    }

    /// 在锁内遍历 `range` 中已提交的页。第三个参数是该页是否可以直接以可写方式映射
    pub(crate) fn for_each_resident(
        &self,
        range: Range<usize>,
        mut f: impl FnMut(usize, &PageRef, bool) -> KResult<()>,
    ) -> KResult<()> {
        let inner = self.inner.lock();
        for (&offset, slot) in inner.pages.range(range) {
            let writable = self.sharing == MappingType::Shared || !slot.cow;
            f(offset, &slot.page, writable)?;
        }
        Ok(())
    }

    pub fn resident_offsets(&self) -> Vec<usize> {
        self.inner.lock().pages.keys().copied().collect()
    }

    pub fn append_mapping(&self, link: MappingLink) {
        self.mappings.lock().push(link);
    }

    pub fn remove_mapping(&self, link: &MappingLink) {
        let mut mappings = self.mappings.lock();
        if let Some(pos) = mappings.iter().position(|l| l == link) {
            mappings.swap_remove(pos);
        }
    }

    /// 区域的起点变化时更新
    pub fn rebase_mapping(&self, old: &MappingLink, new_base: VirtAddr) {
        if let Some(link) = self.mappings.lock().iter_mut().find(|l| *l == old) {
            link.base = new_base;
        }
    }

    pub fn mappings(&self) -> SmallVec<[MappingLink; 1]> {
        self.mappings.lock().clone()
    }

    /// 检查内部不变量，仅用于调试
    pub fn sanity_check(&self) {
        let inner = self.inner.lock();
        let extent = inner.extent();
        for (&offset, Slot { page, cow }) in &inner.pages {
            assert_eq!(offset & PAGE_OFFSET_MASK, 0, "unaligned offset {offset:#x}");
            assert!(!*cow || self.sharing == MappingType::Private);
            assert!(offset < extent, "page at {offset:#x} beyond size {:#x}", inner.size);
            assert!(page.ref_count() >= 1);
            if inner.commit.owns_pages() {
                assert_eq!(page.offset(), offset, "page {:?} has stale offset", page.ppn());
            }
        }
    }
}

impl Drop for Vmo {
    fn drop(&mut self) {
        trace!(
            "drop vmo with {} resident pages",
            self.inner.get_mut().pages.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use common::config::PAGE_SIZE;

    use super::*;

    fn registry(frames: usize) -> sync::Arc<PageRegistry> {
        PageRegistry::with_capacity(frames)
    }

    fn read_byte(page: &PageRef, offset: usize) -> u8 {
        let mut byte = [0u8];
        page.read_bytes(offset, &mut byte);
        byte[0]
    }

    #[test]
    fn get_without_populate_is_enoent() {
        let registry = registry(4);
        let vmo = Vmo::new_anonymous(&registry, 2 * PAGE_SIZE, MappingType::Private);
        assert_eq!(vmo.get(0, VmoGetFlags::empty()).unwrap_err(), errno::ENOENT);
        assert_eq!(
            vmo.get(2 * PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap_err(),
            errno::EFAULT
        );
        assert!(vmo.lookup(0).is_none());
    }

    #[test]
    fn populated_page_is_stable() {
        let registry = registry(4);
        let vmo = Vmo::new_anonymous(&registry, 3 * PAGE_SIZE, MappingType::Private);
        let page = vmo.get(PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
        assert_eq!(read_byte(&page, 10), 0);
        page.write_bytes(10, &[0x5A]);
        drop(page);

        let again = vmo.get(PAGE_SIZE, VmoGetFlags::empty()).unwrap();
        assert_eq!(read_byte(&again, 10), 0x5A);
        assert!(again.ptr_eq(&vmo.get(PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap()));
        assert_eq!(again.offset(), PAGE_SIZE);
        vmo.sanity_check();
    }

    #[test]
    fn concurrent_populate_commits_once() {
        let registry = registry(16);
        let vmo = Vmo::new_anonymous(&registry, PAGE_SIZE, MappingType::Private);
        let handles = (0..4)
            .map(|_| {
                let vmo = vmo.clone();
                thread::spawn(move || vmo.get(0, VmoGetFlags::MAY_POPULATE).unwrap().ppn())
            })
            .collect::<Vec<_>>();
        let ppns = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert!(ppns.iter().all(|&ppn| ppn == ppns[0]));
        assert_eq!(vmo.resident_count(), 1);
        assert_eq!(registry.stat().free_pages, 15);
    }

    #[test]
    fn add_page_rejects_duplicates() {
        let registry = registry(4);
        let vmo = Vmo::new_anonymous(&registry, PAGE_SIZE, MappingType::Shared);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        vmo.add_page(0, page.clone()).unwrap();
        assert_eq!(vmo.add_page(0, page).unwrap_err(), errno::EEXIST);
        let extra = registry.alloc_page(AllocFlags::empty()).unwrap();
        assert_eq!(vmo.add_page(PAGE_SIZE, extra).unwrap_err(), errno::EFAULT);
    }

    #[test]
    fn private_fork_copies_on_write() {
        let registry = registry(8);
        let parent = Vmo::new_anonymous(&registry, PAGE_SIZE, MappingType::Private);
        let original = parent.get(0, VmoGetFlags::MAY_POPULATE).unwrap();
        original.write_bytes(0, b"parent");
        drop(original);

        let child = parent.fork();
        let (shared, writable) = child.get_for_map(0, VmoGetFlags::empty()).unwrap().unwrap();
        assert!(!writable);
        drop(shared);

        let written = child
            .get(0, VmoGetFlags::MAY_POPULATE | VmoGetFlags::WRITE)
            .unwrap();
        written.write_bytes(0, b"child!");
        let untouched = parent.get(0, VmoGetFlags::empty()).unwrap();
        assert!(!untouched.ptr_eq(&written));
        let mut buf = [0u8; 6];
        untouched.read_bytes(0, &mut buf);
        assert_eq!(&buf, b"parent");
        drop(untouched);

        // 子 VMO 已经有了自己的页，父 VMO 的页又变为独占
        let (_, writable) = parent.get_for_map(0, VmoGetFlags::WRITE).unwrap().unwrap();
        assert!(writable);
    }

    #[test]
    fn shared_fork_writes_through() {
        let registry = registry(8);
        let parent = Vmo::new_anonymous(&registry, 2 * PAGE_SIZE, MappingType::Shared);
        let page = parent.get(0, VmoGetFlags::MAY_POPULATE).unwrap();
        let child = parent.fork();
        let child_page = child.get(0, VmoGetFlags::WRITE).unwrap();
        assert!(child_page.ptr_eq(&page));
        // fork 之后才提交的页也是共享的
        let a = child.get(PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
        let b = parent.get(PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
        assert!(a.ptr_eq(&b));
        parent.sanity_check();
        child.sanity_check();
    }

    #[test]
    fn sparse_shared_fork_commits_nothing() {
        let registry = registry(4);
        let pages = 1 << 16;
        let parent = Vmo::new_anonymous(&registry, pages * PAGE_SIZE, MappingType::Shared);
        parent.get(0, VmoGetFlags::MAY_POPULATE).unwrap();
        let free = registry.stat().free_pages;

        let child = parent.fork();
        let grandchild = child.fork();
        assert_eq!(registry.stat().free_pages, free);
        assert_eq!(child.resident_count(), 1);

        let far = (pages - 1) * PAGE_SIZE;
        let page = grandchild.get(far, VmoGetFlags::MAY_POPULATE).unwrap();
        page.write_bytes(0, b"far");
        let seen = parent.get(far, VmoGetFlags::MAY_POPULATE).unwrap();
        assert!(seen.ptr_eq(&page));
        assert_eq!(registry.stat().free_pages, free - 1);
    }

    #[test]
    fn shared_window_follows_truncation() {
        let registry = registry(8);
        let parent = Vmo::new_anonymous(&registry, 3 * PAGE_SIZE, MappingType::Shared);
        let child = parent.fork();
        // 父 VMO 被截掉开头一页后，偏移 0 对应共享内容中的第二页
        parent.truncate_beginning_and_resize(PAGE_SIZE);
        let a = parent.get(0, VmoGetFlags::MAY_POPULATE).unwrap();
        let b = child.get(PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(b.offset(), PAGE_SIZE);
        parent.sanity_check();
    }

    #[test]
    fn split_reparents_tail_and_frees_hole() {
        let registry = registry(8);
        let vmo = Vmo::new_anonymous(&registry, 5 * PAGE_SIZE, MappingType::Private);
        for i in 0..5 {
            let page = vmo.get(i * PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
            page.write_bytes(0, &[i as u8]);
        }
        assert_eq!(registry.stat().free_pages, 3);

        let tail = vmo.split(PAGE_SIZE, 2 * PAGE_SIZE);
        assert_eq!(vmo.size(), PAGE_SIZE);
        assert_eq!(vmo.resident_offsets(), [0]);
        assert_eq!(tail.size(), 2 * PAGE_SIZE);
        assert_eq!(tail.resident_offsets(), [0, PAGE_SIZE]);
        assert_eq!(read_byte(&tail.lookup(0).unwrap(), 0), 3);
        assert_eq!(read_byte(&tail.lookup(PAGE_SIZE).unwrap(), 0), 4);
        assert_eq!(registry.stat().free_pages, 5);
        vmo.sanity_check();
        tail.sanity_check();
    }

    #[test]
    fn truncate_beginning_shifts_pages() {
        let registry = registry(8);
        let vmo = Vmo::new_anonymous(&registry, 3 * PAGE_SIZE, MappingType::Private);
        for i in 0..3 {
            let page = vmo.get(i * PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
            page.write_bytes(0, &[i as u8 + 1]);
        }
        vmo.truncate_beginning_and_resize(2 * PAGE_SIZE);
        assert_eq!(vmo.size(), PAGE_SIZE);
        assert_eq!(vmo.resident_offsets(), [0]);
        assert_eq!(read_byte(&vmo.lookup(0).unwrap(), 0), 3);
        assert_eq!(registry.stat().free_pages, 7);
        vmo.sanity_check();
    }

    #[test]
    fn resize_drops_pages_past_end() {
        let registry = registry(8);
        let vmo = Vmo::new_anonymous(&registry, 4 * PAGE_SIZE, MappingType::Private);
        for i in 0..4 {
            vmo.get(i * PAGE_SIZE, VmoGetFlags::MAY_POPULATE).unwrap();
        }
        vmo.resize(PAGE_SIZE + 1);
        assert_eq!(vmo.resident_offsets(), [0, PAGE_SIZE]);
        vmo.grow_to(PAGE_SIZE);
        assert_eq!(vmo.size(), PAGE_SIZE + 1);
        vmo.grow_to(3 * PAGE_SIZE);
        assert_eq!(vmo.size(), 3 * PAGE_SIZE);
    }

    #[test]
    fn mapping_list_tracks_regions() {
        let registry = registry(1);
        let vmo = Vmo::new_anonymous(&registry, PAGE_SIZE, MappingType::Private);
        let link = |base| MappingLink {
            space: Weak::new(),
            space_id: 1,
            base: VirtAddr(base),
        };
        vmo.append_mapping(link(0x1000));
        vmo.rebase_mapping(&link(0x1000), VirtAddr(0x3000));
        assert_eq!(vmo.mappings()[0].base, VirtAddr(0x3000));
        vmo.remove_mapping(&link(0x3000));
        assert!(vmo.mappings().is_empty());
    }
}
