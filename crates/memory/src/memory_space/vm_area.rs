use alloc::sync;
use core::ops::Range;

use bitflags::bitflags;
use common::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use triomphe::Arc;

use super::MapPermission;
use crate::{
    page::{PageRef, PageRegistry},
    page_cache::Inode,
    vmo::{Commit, MappingType, Vmo},
    VirtAddr, VirtPageNum,
};

/// 被映射的文件，及其打开方式
#[derive(Clone)]
pub struct MappedFile {
    pub inode: sync::Arc<Inode>,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Regular,
    Heap,
    FileBacked,
    Kernel,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// 私有可写区域被 fork 过，其中的页可能是写时复制的
        const COW = 1 << 0;
    }
}

#[derive(Clone)]
pub enum Backing {
    Anonymous,
    File { file: MappedFile, offset: usize },
}

/// 建立区域所需的参数
#[derive(Clone)]
pub struct MapRequest {
    pub perm: MapPermission,
    pub kind: RegionKind,
    pub mapping: MappingType,
    pub backing: Backing,
}

impl MapRequest {
    pub fn anonymous(perm: MapPermission, mapping: MappingType) -> Self {
        Self {
            perm,
            kind: RegionKind::Regular,
            mapping,
            backing: Backing::Anonymous,
        }
    }

    /// `offset` 是文件偏移，需页对齐
    pub fn file(perm: MapPermission, mapping: MappingType, file: MappedFile, offset: usize) -> Self {
        Self {
            perm,
            kind: RegionKind::FileBacked,
            mapping,
            backing: Backing::File { file, offset },
        }
    }

    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }
}

/// 地址空间中一段连续的虚拟地址，内容来自一个 VMO。VMO 中的偏移相对于区域的起点
#[derive(Clone)]
pub struct VmRegion {
    base: VirtAddr,
    pages: usize,
    perm: MapPermission,
    flags: RegionFlags,
    kind: RegionKind,
    mapping: MappingType,
    /// 区域起点对应的文件偏移
    offset: usize,
    file: Option<MappedFile>,
    vmo: Arc<Vmo>,
}

impl VmRegion {
    pub(super) fn new(
        base: VirtAddr,
        pages: usize,
        req: MapRequest,
        registry: &sync::Arc<PageRegistry>,
    ) -> Self {
        let size = pages << PAGE_SIZE_BITS;
        let (vmo, file, offset) = match req.backing {
            Backing::Anonymous => (Vmo::new_anonymous(registry, size, req.mapping), None, 0),
            Backing::File { file, offset } => {
                let inode = sync::Arc::clone(&file.inode);
                let commit = match req.mapping {
                    MappingType::Private => Commit::FilePrivate {
                        inode,
                        file_offset: offset,
                    },
                    MappingType::Shared => Commit::FileShared {
                        inode,
                        file_offset: offset,
                    },
                };
                (
                    Vmo::new(registry, size, commit, req.mapping),
                    Some(file),
                    offset,
                )
            }
        };
        Self {
            base,
            pages,
            perm: req.perm,
            flags: RegionFlags::empty(),
            kind: req.kind,
            mapping: req.mapping,
            offset,
            file,
            vmo,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn end(&self) -> VirtAddr {
        self.base + self.size()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn vpn_range(&self) -> Range<VirtPageNum> {
        self.base.vpn_floor()..self.end().vpn_floor()
    }

    pub fn perm(&self) -> MapPermission {
        self.perm
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn mapping(&self) -> MappingType {
        self.mapping
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    pub fn vmo(&self) -> &Arc<Vmo> {
        &self.vmo
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.base <= va && va < self.end()
    }

    /// `va` 所在页在 VMO 中的偏移
    pub(super) fn vmo_offset(&self, va: VirtAddr) -> usize {
        va.page_floor() - self.base
    }

    /// 共享的文件映射，写入需要反映到页缓存的脏标记上
    pub fn is_shared_file(&self) -> bool {
        self.mapping == MappingType::Shared && self.file.is_some()
    }

    /// 检查一次访问是否被区域的权限允许
    pub fn allows(&self, write: bool, exec: bool, user: bool) -> bool {
        if user && !self.perm.contains(MapPermission::U) {
            return false;
        }
        if write {
            return self.perm.contains(MapPermission::W);
        }
        if exec {
            return self.perm.contains(MapPermission::X);
        }
        self.perm.contains(MapPermission::R)
    }

    /// 映射 `page` 时页表项的权限。`exclusive` 表示 VMO 认为该页可以直接写
    pub(super) fn pte_perm(&self, page: &PageRef, exclusive: bool) -> MapPermission {
        let writable = match self.mapping {
            MappingType::Private => exclusive,
            // 缓存页总是先只读映射，写缺页时在页锁内标记为脏并加上写权限。已经被截断出页缓存的页不再跟踪
            MappingType::Shared if self.file.is_some() => page.cache_entry().is_none(),
            MappingType::Shared => true,
        };
        let mut perm = self.perm;
        if !writable {
            perm.remove(MapPermission::W);
        }
        perm
    }

    pub(super) fn set_perm(&mut self, perm: MapPermission) {
        let rwx = MapPermission::R | MapPermission::W | MapPermission::X;
        self.perm = (self.perm - rwx) | (perm & rwx);
    }

    pub(super) fn fork_vmo(&mut self) {
        self.vmo = self.vmo.fork();
    }

    pub(super) fn mark_cow(&mut self) {
        if self.mapping == MappingType::Private && self.perm.contains(MapPermission::W) {
            self.flags |= RegionFlags::COW;
        }
    }

    /// 截掉开头 `amount` 字节
    pub(super) fn shrink_front(&mut self, amount: usize) {
        self.vmo.truncate_beginning_and_resize(amount);
        self.base = self.base + amount;
        self.pages -= amount >> PAGE_SIZE_BITS;
        self.offset += amount;
    }

    /// 保留前 `size` 字节
    pub(super) fn shrink_back(&mut self, size: usize) {
        self.vmo.resize(size);
        self.pages = size >> PAGE_SIZE_BITS;
    }

    /// 扩展到 `pages` 页
    pub(super) fn grow(&mut self, pages: usize) {
        debug_assert!(pages >= self.pages);
        self.pages = pages;
        self.vmo.grow_to(self.size());
    }

    /// 挖掉 `[start, end)`，自身保留之前的部分，返回之后的部分
    pub(super) fn split_off(&mut self, start: VirtAddr, end: VirtAddr) -> VmRegion {
        debug_assert!(self.base <= start && start <= end && end < self.end());
        let head = start - self.base;
        let tail_vmo = self.vmo.split(head, end - start);
        let tail = VmRegion {
            base: end,
            pages: (self.end() - end) >> PAGE_SIZE_BITS,
            offset: self.offset + (end - self.base),
            vmo: tail_vmo,
            file: self.file.clone(),
            ..*self
        };
        self.pages = head >> PAGE_SIZE_BITS;
        tail
    }
}
