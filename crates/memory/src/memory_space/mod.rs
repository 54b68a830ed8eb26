use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{self, Arc, Weak},
    vec::Vec,
};
use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;
use common::config::{
    BRK_BASE, KERNEL_VM_END, KERNEL_VM_START, LOW_ADDRESS_END, PAGE_SIZE, PAGE_SIZE_BITS,
    USER_SPACE_START,
};
use defines::{
    error::{errno, KResult},
    misc::MmapProt,
};
use klocks::{SpinMutex, SpinMutexGuard};
use smallvec::SmallVec;

pub use self::{
    page_table::{PTEFlags, PageTable, PageTableEntry, Sv39PageTable},
    vm_area::{Backing, MapRequest, MappedFile, RegionFlags, RegionKind, VmRegion},
};
use crate::{
    address::page_align_up,
    fault::{FaultError, FaultInfo},
    page::{PageRef, PageRegistry},
    page_cache::Inode,
    vmo::{MappingLink, MappingType, VmoGetFlags},
    PhysAddr, VirtAddr, VirtPageNum,
};

mod page_table;
mod vm_area;

static SPACE_ID: AtomicUsize = AtomicUsize::new(0);

bitflags! {
    /// 对应于 PTE 中权限位的映射权限：`R W X U`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
    }
}

impl From<MmapProt> for MapPermission {
    fn from(mmap_prot: MmapProt) -> Self {
        Self::from_bits_truncate((mmap_prot.bits() << 1) as u8) | MapPermission::U
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

/// 地址空间的生命周期，只会向后推进
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceState {
    /// 正在构建（比如 fork 中），还不可见
    Uninitialized,
    Active,
    TearingDown,
    Freed,
}

/// 一个进程（或内核）的虚拟地址空间
pub struct AddressSpace {
    id: usize,
    kind: SpaceKind,
    range: Range<VirtAddr>,
    registry: sync::Arc<PageRegistry>,
    inner: SpinMutex<SpaceInner>,
}

struct SpaceInner {
    id: usize,
    /// 登记到 VMO 映射链表上，供写回时找到映射
    this: Weak<AddressSpace>,
    state: SpaceState,
    /// 区域起始地址 -> 区域
    regions: BTreeMap<VirtAddr, VmRegion>,
    page_table: Box<dyn PageTable>,
    brk: VirtAddr,
}

impl AddressSpace {
    fn with_table(
        kind: SpaceKind,
        range: Range<VirtAddr>,
        registry: &sync::Arc<PageRegistry>,
        page_table: Box<dyn PageTable>,
        state: SpaceState,
        brk: VirtAddr,
    ) -> Arc<Self> {
        let id = SPACE_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|this| Self {
            id,
            kind,
            range,
            registry: sync::Arc::clone(registry),
            inner: SpinMutex::new(SpaceInner {
                id,
                this: Weak::clone(this),
                state,
                regions: BTreeMap::new(),
                page_table,
                brk,
            }),
        })
    }

    pub fn new_kernel(registry: &sync::Arc<PageRegistry>) -> KResult<Arc<Self>> {
        let page_table = Box::new(Sv39PageTable::new_kernel(registry)?);
        let space = Self::with_table(
            SpaceKind::Kernel,
            VirtAddr(KERNEL_VM_START)..VirtAddr(KERNEL_VM_END),
            registry,
            page_table,
            SpaceState::Active,
            VirtAddr(0),
        );
        info!("kernel address space {} created", space.id);
        Ok(space)
    }

    /// 新的空用户地址空间，共享 `kernel` 的内核部分
    pub fn new_user(kernel: &AddressSpace) -> KResult<Arc<Self>> {
        let page_table = kernel.inner.lock().page_table.fork_table()?;
        let space = Self::with_table(
            SpaceKind::User,
            VirtAddr(USER_SPACE_START)..VirtAddr(LOW_ADDRESS_END),
            &kernel.registry,
            page_table,
            SpaceState::Active,
            VirtAddr(BRK_BASE),
        );
        debug!("user address space {} created", space.id);
        Ok(space)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn range(&self) -> Range<VirtAddr> {
        self.range.clone()
    }

    pub fn registry(&self) -> &sync::Arc<PageRegistry> {
        &self.registry
    }

    pub fn state(&self) -> SpaceState {
        self.inner.lock().state
    }

    /// 页表已经释放时为 `None`
    pub fn token(&self) -> Option<usize> {
        Some(self.lock_table()?.page_table.token())
    }

    /// 页表还在时加锁
    fn lock_table(&self) -> Option<SpinMutexGuard<'_, SpaceInner>> {
        let inner = self.inner.lock();
        (inner.state != SpaceState::Freed).then_some(inner)
    }

    fn lock_active(&self) -> KResult<SpinMutexGuard<'_, SpaceInner>> {
        let inner = self.inner.lock();
        if inner.state != SpaceState::Active {
            warn!("address space {} is {:?}", self.id, inner.state);
            return Err(errno::EFAULT);
        }
        Ok(inner)
    }

    fn check_bounds(&self, start: VirtAddr, size: usize) -> KResult<VirtAddr> {
        if size == 0 || !start.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(errno::EINVAL);
        }
        let end = start.checked_add(size).ok_or(errno::EINVAL)?;
        if start < self.range.start || end > self.range.end {
            return Err(errno::EINVAL);
        }
        Ok(end)
    }

    /// 在确定的位置 `[start, start + size)` 建立区域
    pub fn reserve_region(&self, start: VirtAddr, size: usize, req: MapRequest) -> KResult<VmRegion> {
        let end = self.check_bounds(start, size)?;
        let mut inner = self.lock_active()?;
        if !inner.is_free(start, end) {
            return Err(errno::EEXIST);
        }
        Ok(inner.insert_new(start, size, req, &self.registry))
    }

    /// 在不低于 `min` 的第一个足够大的空隙中建立区域
    pub fn allocate_region(&self, min: VirtAddr, size: usize, req: MapRequest) -> KResult<VmRegion> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(errno::EINVAL);
        }
        let mut inner = self.lock_active()?;
        let start = inner.find_gap(min, size, &self.range)?;
        Ok(inner.insert_new(start, size, req, &self.registry))
    }

    /// `MAP_FIXED`：先移除 `[start, start + size)` 中原有的映射，再建立区域
    pub fn map_fixed(&self, start: VirtAddr, size: usize, req: MapRequest) -> KResult<VmRegion> {
        let end = self.check_bounds(start, size)?;
        let mut inner = self.lock_active()?;
        inner.munmap(start, end);
        Ok(inner.insert_new(start, size, req, &self.registry))
    }

    /// 优先映射到 `hint`，被占用时从 `min` 开始寻找
    pub fn map_hint(
        &self,
        hint: Option<VirtAddr>,
        min: VirtAddr,
        size: usize,
        req: MapRequest,
    ) -> KResult<VmRegion> {
        if let Some(hint) = hint {
            if let Ok(end) = self.check_bounds(hint, size) {
                let mut inner = self.lock_active()?;
                if inner.is_free(hint, end) {
                    return Ok(inner.insert_new(hint, size, req, &self.registry));
                }
            }
        }
        self.allocate_region(min, size, req)
    }

    pub fn find_region(&self, va: VirtAddr) -> Option<VmRegion> {
        self.inner.lock().find(va).cloned()
    }

    /// 所有区域的快照，按地址排序
    pub fn regions(&self) -> Vec<VmRegion> {
        self.inner.lock().regions.values().cloned().collect()
    }

    /// 移除 `[start, start + size)` 中的所有映射，其中的空洞会被跳过
    pub fn munmap(&self, start: VirtAddr, size: usize) -> KResult<()> {
        let end = self.check_bounds(start, size)?;
        self.lock_active()?.munmap(start, end);
        Ok(())
    }

    /// 修改 `[start, start + size)` 的权限。该范围必须完全被区域覆盖
    pub fn mprotect(&self, start: VirtAddr, size: usize, perm: MapPermission) -> KResult<()> {
        if !start.is_page_aligned() {
            return Err(errno::EINVAL);
        }
        if size == 0 {
            return Ok(());
        }
        let end = page_align_up(size)
            .and_then(|size| start.checked_add(size))
            .ok_or(errno::ENOMEM)?;
        let mut inner = self.lock_active()?;

        // 先检查，保证失败时什么都没有改变
        let mut cursor = start;
        while cursor < end {
            let region = inner.find(cursor).ok_or(errno::ENOMEM)?;
            if perm.contains(MapPermission::W) && region.is_shared_file() {
                if let Some(file) = region.file() {
                    if !file.writable {
                        return Err(errno::EACCES);
                    }
                }
            }
            cursor = region.end();
        }

        inner.split_at(start);
        inner.split_at(end);
        let SpaceInner {
            regions,
            page_table,
            ..
        } = &mut *inner;
        for region in regions.range_mut(start..end).map(|(_, region)| region) {
            region.set_perm(perm);
            reprotect(page_table.as_mut(), region)?;
        }
        debug!(
            "space {}: mprotect {start:?}..{end:?} to {perm:?}",
            self.id
        );
        Ok(())
    }

    pub fn brk(&self) -> VirtAddr {
        self.inner.lock().brk
    }

    /// 调整堆的末尾，返回新的 brk。堆从 `BRK_BASE` 开始
    pub fn set_brk(&self, new_brk: VirtAddr) -> KResult<VirtAddr> {
        if self.kind != SpaceKind::User || new_brk < VirtAddr(BRK_BASE) {
            return Err(errno::ENOMEM);
        }
        let new_end = page_align_up(new_brk.0).ok_or(errno::ENOMEM)?;
        let new_end = VirtAddr(new_end);
        if new_end > self.range.end {
            return Err(errno::ENOMEM);
        }
        let mut inner = self.lock_active()?;
        let heap_base = VirtAddr(BRK_BASE);
        let old_end = match inner.heap() {
            Some(heap) => heap.end(),
            None => heap_base,
        };

        if new_end > old_end {
            if !inner.is_free(old_end, new_end) {
                return Err(errno::ENOMEM);
            }
            let pages = (new_end - heap_base) >> PAGE_SIZE_BITS;
            if let Some(heap) = inner
                .regions
                .get_mut(&heap_base)
                .filter(|heap| heap.kind() == RegionKind::Heap)
            {
                heap.grow(pages);
            } else {
                let perm = MapPermission::R | MapPermission::W | MapPermission::U;
                let req = MapRequest::anonymous(perm, MappingType::Private)
                    .with_kind(RegionKind::Heap);
                inner.insert_new(heap_base, new_end - heap_base, req, &self.registry);
            }
        } else if new_end < old_end {
            inner.munmap(new_end, old_end);
        }
        inner.brk = new_brk;
        trace!("space {}: brk set to {new_brk:?}", self.id);
        Ok(new_brk)
    }

    /// 立即提交并映射从 `start` 开始的 `pages` 个页。
    ///
    /// 可写的页按写访问提交，这样私有映射不必再经历一次写时复制。共享文件映射例外，否则所有页都会被标记为脏
    pub fn populate(&self, start: VirtAddr, pages: usize) -> KResult<()> {
        for i in 0..pages {
            let address = start + i * PAGE_SIZE;
            let region = self.find_region(address).ok_or(errno::EFAULT)?;
            let info = FaultInfo {
                address,
                write: region.perm().contains(MapPermission::W) && !region.is_shared_file(),
                exec: false,
                user: false,
            };
            self.fault_in(&info).map_err(FaultError::into_errno)?;
        }
        Ok(())
    }

    /// 查询虚拟地址当前映射到的物理地址
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let (ppn, _) = self.lock_table()?.page_table.translate(va.vpn_floor())?;
        Some(ppn.page_start() + va.page_offset())
    }

    /// 查询虚拟页当前的映射权限
    pub fn translate_perm(&self, va: VirtAddr) -> Option<MapPermission> {
        self.lock_table()?
            .page_table
            .translate(va.vpn_floor())
            .map(|(_, perm)| perm)
    }

    pub fn activate(&self) {
        match self.lock_table() {
            Some(inner) => inner.page_table.activate(),
            None => warn!("activating freed address space {}", self.id),
        }
    }

    /// 复制出一个子地址空间。所有区域的 VMO 都被 fork，已提交的页立即映射，
    /// 私有可写的页在父子双方都变为只读，直到写时复制
    pub fn fork(&self) -> KResult<Arc<Self>> {
        let mut inner = self.lock_active()?;
        let page_table = inner.page_table.fork_table()?;
        let child = Self::with_table(
            self.kind,
            self.range.clone(),
            &self.registry,
            page_table,
            SpaceState::Uninitialized,
            inner.brk,
        );
        // 中途失败时销毁已经建立的部分
        let child = scopeguard::guard(child, |child| {
            warn!("fork of space {} failed, tearing down the child", self.id);
            child.destroy();
        });

        let mut child_inner = child.inner.lock();
        let SpaceInner {
            regions,
            page_table,
            ..
        } = &mut *inner;
        for region in regions.values_mut() {
            region.mark_cow();
            let mut child_region = region.clone();
            child_region.fork_vmo();
            let child_table = child_inner.page_table.as_mut();
            child_region
                .vmo()
                .for_each_resident(0..child_region.size(), |offset, page, exclusive| {
                    let vpn = (child_region.base() + offset).vpn_floor();
                    child_table.map(vpn, page.ppn(), child_region.pte_perm(page, exclusive))?;
                    if page_table.change_protection(vpn, region.pte_perm(page, exclusive)) {
                        page_table.invalidate(vpn..vpn + 1);
                    }
                    Ok(())
                })?;
            child_inner.insert_region(child_region);
        }
        child_inner.state = SpaceState::Active;
        drop(child_inner);
        let child = scopeguard::ScopeGuard::into_inner(child);
        debug!("space {} forked into {}", self.id, child.id);
        Ok(child)
    }

    /// 释放所有区域和页表。之后地址空间不再可用
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SpaceState::TearingDown | SpaceState::Freed) {
            return;
        }
        inner.teardown();
        debug!("address space {} destroyed", self.id);
    }

    /// 解决一次缺页：提交页并建立映射，返回映射的页。
    ///
    /// 提交期间不持有地址空间的锁，之后重新确认区域没有变化，否则重试
    pub(crate) fn fault_in(&self, info: &FaultInfo) -> Result<PageRef, FaultError> {
        let vpn = info.address.vpn_floor();
        loop {
            let region = {
                let inner = self.inner.lock();
                if inner.state != SpaceState::Active {
                    return Err(FaultError::Inactive);
                }
                inner.find(info.address).ok_or(FaultError::Unmapped)?.clone()
            };
            if !region.allows(info.write, info.exec, info.user) {
                return Err(FaultError::AccessViolation);
            }

            let offset = region.vmo_offset(info.address);
            let mut flags = VmoGetFlags::MAY_POPULATE;
            if info.write {
                flags |= VmoGetFlags::WRITE;
            }
            let (page, exclusive) = match region.vmo().get_for_map(offset, flags) {
                Ok(Some(got)) => got,
                Ok(None) => {
                    trace!("vmo at {:?} changed during commit, retry", info.address);
                    continue;
                }
                // 区域被改动过的话，失败可能只是因为偏移已经过时
                Err(e) if self.inner.lock().still_maps(info.address, &region) => {
                    return Err(FaultError::Commit(e));
                }
                Err(_) => continue,
            };

            // 共享文件映射的写：标记为脏和建立可写映射必须在页锁内完成，与写回互斥
            let dirtying = info.write && region.is_shared_file();
            let page_lock = dirtying.then(|| page.lock());
            let mut perm = region.pte_perm(&page, exclusive);
            if dirtying {
                if let Some(file) = region.file() {
                    file.inode.mark_page_dirty(&page);
                }
                perm |= MapPermission::W;
            }

            let mut inner = self.inner.lock();
            if inner.state != SpaceState::Active {
                return Err(FaultError::Inactive);
            }
            if !inner.still_maps(info.address, &region)
                || !region.vmo().lookup(offset).is_some_and(|p| p.ptr_eq(&page))
            {
                trace!("region at {:?} changed during fault, retry", info.address);
                continue;
            }
            install(inner.page_table.as_mut(), vpn, &page, perm).map_err(FaultError::Commit)?;
            drop(inner);
            drop(page_lock);
            return Ok(page);
        }
    }

    /// 去掉 `base` 处共享文件映射中，文件偏移 `file_offset` 所在页的写权限。
    /// 调用方持有该页的页锁，之后的写入会重新缺页并标记为脏
    pub(crate) fn write_protect_file_page(
        &self,
        base: VirtAddr,
        inode: &Inode,
        file_offset: usize,
        page: &PageRef,
    ) {
        let mut inner = self.inner.lock();
        if inner.state != SpaceState::Active {
            return;
        }
        let SpaceInner {
            regions,
            page_table,
            ..
        } = &mut *inner;
        let Some(region) = regions.get(&base).filter(|region| {
            region.is_shared_file()
                && region
                    .file()
                    .is_some_and(|file| core::ptr::eq(sync::Arc::as_ptr(&file.inode), inode))
        }) else {
            return;
        };
        let Some(delta) = file_offset.checked_sub(region.offset()) else {
            return;
        };
        if delta >= region.size() {
            return;
        }
        let vpn = (base + delta).vpn_floor();
        match page_table.translate(vpn) {
            Some((ppn, perm)) if ppn == page.ppn() && perm.contains(MapPermission::W) => {
                page_table.change_protection(vpn, perm - MapPermission::W);
                page_table.invalidate(vpn..vpn + 1);
                trace!("space {}: write protect {vpn:?} for writeback", self.id);
            }
            _ => {}
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state != SpaceState::Freed {
            inner.teardown();
        }
    }
}

impl SpaceInner {
    fn find(&self, va: VirtAddr) -> Option<&VmRegion> {
        self.regions
            .range(..=va)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(va))
    }

    /// `va` 是否仍由与 `region` 相同的区域映射
    fn still_maps(&self, va: VirtAddr, region: &VmRegion) -> bool {
        self.find(va).is_some_and(|current| {
            triomphe::Arc::ptr_eq(current.vmo(), region.vmo())
                && current.base() == region.base()
                && current.perm() == region.perm()
        })
    }

    fn link(&self, base: VirtAddr) -> MappingLink {
        MappingLink {
            space: Weak::clone(&self.this),
            space_id: self.id,
            base,
        }
    }

    /// 登记到区域的 VMO 上。共享文件映射还要登记到页缓存上，写回时据此找到可写的映射
    fn link_region(&self, region: &VmRegion) {
        let link = self.link(region.base());
        if let Some(file) = region.file().filter(|_| region.is_shared_file()) {
            file.inode.pages().append_mapping(link.clone());
        }
        region.vmo().append_mapping(link);
    }

    fn unlink_region(&self, region: &VmRegion) {
        let link = self.link(region.base());
        if let Some(file) = region.file().filter(|_| region.is_shared_file()) {
            file.inode.pages().remove_mapping(&link);
        }
        region.vmo().remove_mapping(&link);
    }

    fn rebase_region(&self, region: &VmRegion, old_base: VirtAddr) {
        let old = self.link(old_base);
        if let Some(file) = region.file().filter(|_| region.is_shared_file()) {
            file.inode.pages().rebase_mapping(&old, region.base());
        }
        region.vmo().rebase_mapping(&old, region.base());
    }

    fn heap(&self) -> Option<&VmRegion> {
        self.regions
            .get(&VirtAddr(BRK_BASE))
            .filter(|heap| heap.kind() == RegionKind::Heap)
    }

    /// `[start, end)` 是否没有和任何区域重叠
    fn is_free(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.regions
            .range(..end)
            .next_back()
            .map_or(true, |(_, region)| region.end() <= start)
    }

    fn find_gap(&self, min: VirtAddr, size: usize, bound: &Range<VirtAddr>) -> KResult<VirtAddr> {
        let min = page_align_up(min.0).ok_or(errno::ENOMEM)?;
        let mut start = VirtAddr(min).max(bound.start);
        // `start` 左侧的一个区域有可能恰好包含了它
        if let Some(region) = self.find(start) {
            start = region.end();
        }
        for region in self.regions.range(start..).map(|(_, region)| region) {
            let end = start.checked_add(size).ok_or(errno::ENOMEM)?;
            if end <= region.base() {
                break;
            }
            start = region.end();
        }
        match start.checked_add(size) {
            Some(end) if end <= bound.end => Ok(start),
            _ => Err(errno::ENOMEM),
        }
    }

    fn insert_new(
        &mut self,
        start: VirtAddr,
        size: usize,
        req: MapRequest,
        registry: &sync::Arc<PageRegistry>,
    ) -> VmRegion {
        let region = VmRegion::new(start, size >> PAGE_SIZE_BITS, req, registry);
        trace!(
            "space {}: new {:?} region {start:?}..{:?}",
            self.id,
            region.kind(),
            region.end()
        );
        self.insert_region(region.clone());
        region
    }

    fn insert_region(&mut self, region: VmRegion) {
        assert!(
            self.is_free(region.base(), region.end()),
            "region {:?}..{:?} overlaps an existing one",
            region.base(),
            region.end()
        );
        self.link_region(&region);
        self.regions.insert(region.base(), region);
    }

    /// 从区域树中取出，但不解除映射链表上的登记
    fn take_region(&mut self, base: VirtAddr) -> VmRegion {
        let Some(region) = self.regions.remove(&base) else {
            panic!("no region at {base:?}");
        };
        region
    }

    /// 移除 `[start, end)` 中的映射，可能截断或者拆分区域
    fn munmap(&mut self, start: VirtAddr, end: VirtAddr) {
        let bases = self
            .regions
            .range(..end)
            .rev()
            .take_while(|(_, region)| region.end() > start)
            .map(|(&base, _)| base)
            .collect::<SmallVec<[VirtAddr; 4]>>();

        for base in bases {
            let mut region = self.take_region(base);
            let cut_start = start.max(region.base());
            let cut_end = end.min(region.end());
            unmap_pages(self.page_table.as_mut(), &region, cut_start..cut_end);

            let at_front = cut_start == region.base();
            let at_back = cut_end == region.end();
            match (at_front, at_back) {
                (true, true) => self.unlink_region(&region),
                (true, false) => {
                    region.shrink_front(cut_end - cut_start);
                    self.rebase_region(&region, base);
                    self.regions.insert(region.base(), region);
                }
                (false, true) => {
                    region.shrink_back(cut_start - region.base());
                    self.regions.insert(base, region);
                }
                (false, false) => {
                    let tail = region.split_off(cut_start, cut_end);
                    self.regions.insert(base, region);
                    self.insert_region(tail);
                }
            }
        }
        trace!("space {}: munmap {start:?}..{end:?}", self.id);
    }

    /// 如果有区域严格包含 `va`，在 `va` 处拆成两个
    fn split_at(&mut self, va: VirtAddr) {
        let Some(base) = self
            .find(va)
            .filter(|region| region.base() != va)
            .map(VmRegion::base)
        else {
            return;
        };
        let mut region = self.take_region(base);
        let tail = region.split_off(va, va);
        self.regions.insert(base, region);
        self.insert_region(tail);
    }

    fn teardown(&mut self) {
        self.state = SpaceState::TearingDown;
        let regions = core::mem::take(&mut self.regions);
        for region in regions.values() {
            unmap_pages(self.page_table.as_mut(), region, region.base()..region.end());
            self.unlink_region(region);
        }
        self.page_table.free();
        self.state = SpaceState::Freed;
        drop(regions);
    }
}

/// 移除 `range` 中已提交页的映射。共享文件映射中可写的页重新标记为脏
fn unmap_pages(page_table: &mut dyn PageTable, region: &VmRegion, range: Range<VirtAddr>) {
    let offsets = region.vmo_offset(range.start)..range.end - region.base();
    let file = region.file().filter(|_| region.is_shared_file());
    let ret = region.vmo().for_each_resident(offsets, |offset, page, _| {
        let vpn = (region.base() + offset).vpn_floor();
        if let Some((_, perm)) = page_table.unmap(vpn) {
            if perm.contains(MapPermission::W) {
                if let Some(file) = file {
                    file.inode.mark_page_dirty(page);
                }
            }
        }
        Ok(())
    });
    debug_assert!(ret.is_ok());
    page_table.invalidate(range.start.vpn_floor()..range.end.vpn_floor());
}

/// 按区域当前的权限重新设置已映射页的权限
fn reprotect(page_table: &mut dyn PageTable, region: &VmRegion) -> KResult<()> {
    region
        .vmo()
        .for_each_resident(0..region.size(), |offset, page, exclusive| {
            let vpn = (region.base() + offset).vpn_floor();
            if page_table.change_protection(vpn, region.pte_perm(page, exclusive)) {
                page_table.invalidate(vpn..vpn + 1);
            }
            Ok(())
        })
}

/// 建立或更新 `vpn` 到 `page` 的映射
fn install(
    page_table: &mut dyn PageTable,
    vpn: VirtPageNum,
    page: &PageRef,
    perm: MapPermission,
) -> KResult<()> {
    match page_table.translate(vpn) {
        Some((ppn, _)) if ppn == page.ppn() => {
            page_table.change_protection(vpn, perm);
        }
        Some(_) => {
            page_table.unmap(vpn);
            page_table.map(vpn, page.ppn(), perm)?;
        }
        None => page_table.map(vpn, page.ppn(), perm)?,
    }
    page_table.invalidate(vpn..vpn + 1);
    Ok(())
}
