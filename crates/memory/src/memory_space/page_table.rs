//! Implementation of [`PageTableEntry`] and [`Sv39PageTable`].
//!
//! 地址空间只通过 [`PageTable`] 操作页表，这样换一种分页机制时只需要换掉实现

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{ops::Range, ptr::NonNull};

use bitflags::bitflags;
use common::config::{KERNEL_ROOT_LINES, PTE_PER_PAGE};
use defines::error::{errno, KResult};

use super::MapPermission;
use crate::{
    page::{AllocFlags, PageFlags, PageRef, PageRegistry},
    PhysPageNum, VirtPageNum,
};

/// 体系结构相关的页表操作
pub trait PageTable: Send {
    /// 建立映射，只会因为分配中间页表失败而返回 `ENOMEM`
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, perm: MapPermission) -> KResult<()>;

    /// 移除映射，返回原来映射到的物理页和权限
    fn unmap(&mut self, vpn: VirtPageNum) -> Option<(PhysPageNum, MapPermission)>;

    /// 修改已有映射的权限。`vpn` 未映射时返回 `false`
    fn change_protection(&mut self, vpn: VirtPageNum, perm: MapPermission) -> bool;

    fn translate(&self, vpn: VirtPageNum) -> Option<(PhysPageNum, MapPermission)>;

    /// 刷新 TLB 中 `range` 对应的项
    fn invalidate(&self, range: Range<VirtPageNum>);

    /// 创建一个新的页表，只共享内核部分
    fn fork_table(&self) -> KResult<Box<dyn PageTable>>;

    /// 释放页表占用的所有页。之后不能再使用该页表
    fn free(&mut self);

    fn token(&self) -> usize;

    /// 切换到该页表
    fn activate(&self);
}

bitflags! {
    /// page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u16 {
        const V =   1 << 0;
        const R =   1 << 1;
        const W =   1 << 2;
        const X =   1 << 3;
        const U =   1 << 4;
        const G =   1 << 5;
        const A =   1 << 6;
        const D =   1 << 7;
        const COW = 1 << 8;
    }
}

impl From<MapPermission> for PTEFlags {
    fn from(mp: MapPermission) -> Self {
        Self::from_bits_truncate(u16::from(mp.bits()))
    }
}

/// page table entry structure
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    pub fn ppn(&self) -> PhysPageNum {
        const LOW_44_MASK: usize = (1 << 44) - 1;
        PhysPageNum((self.bits >> 10) & LOW_44_MASK)
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u16)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    fn perm(&self) -> MapPermission {
        MapPermission::from_bits_truncate(self.flags().bits() as u8)
    }
}

const SATP_MODE_SV39: usize = 8;

/// Sv39 三级页表，其内跟踪了页表所占用的页，页表释放时，释放这些页
pub struct Sv39PageTable {
    registry: Arc<PageRegistry>,
    root: Option<PageRef>,
    frames: Vec<PageRef>,
}

impl Sv39PageTable {
    fn with_root(registry: &Arc<PageRegistry>) -> KResult<Self> {
        let root = Self::alloc_table_page(registry)?;
        Ok(Self {
            registry: Arc::clone(registry),
            root: Some(root),
            frames: Vec::new(),
        })
    }

    /// 内核页表。内核共享区域的二级页表会预先分配好，之后所有页表复制这些根页表项即可共享
    pub fn new_kernel(registry: &Arc<PageRegistry>) -> KResult<Self> {
        let mut table = Self::with_root(registry)?;
        for &line in KERNEL_ROOT_LINES {
            let frame = Self::alloc_table_page(registry)?;
            let pte = PageTableEntry::new(frame.ppn(), PTEFlags::V);
            table.frames.push(frame);
            // SAFETY: 根页表持有着，且通过 `&mut self` 访问
            unsafe { table.root_ptes().as_mut()[line] = pte };
        }
        Ok(table)
    }

    fn alloc_table_page(registry: &Arc<PageRegistry>) -> KResult<PageRef> {
        let page = registry
            .alloc_page(AllocFlags::empty())
            .ok_or(errno::ENOMEM)?;
        page.set_flags(PageFlags::PINNED);
        Ok(page)
    }

    fn root_ppn(&self) -> PhysPageNum {
        match &self.root {
            Some(root) => root.ppn(),
            None => panic!("use of a freed page table"),
        }
    }

    fn ptes(&self, ppn: PhysPageNum) -> NonNull<[PageTableEntry; PTE_PER_PAGE]> {
        assert!(self.registry.contains(ppn), "{ppn:?} is not a page table");
        // SAFETY: 页表页来自注册表，非空
        unsafe { NonNull::new_unchecked(self.registry.frame_ptr(ppn).cast()) }
    }

    fn root_ptes(&self) -> NonNull<[PageTableEntry; PTE_PER_PAGE]> {
        self.ptes(self.root_ppn())
    }

    /// 找到 `vpn` 对应的叶子页表项的位置。中间页表不存在时返回 `None`
    fn find_pte(&self, vpn: VirtPageNum) -> Option<NonNull<PageTableEntry>> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn();
        for (i, &idx) in idxs.iter().enumerate() {
            // SAFETY: 页表中指定的 ppn 必然已经分配
            let pte = unsafe { NonNull::from(&mut self.ptes(ppn).as_mut()[idx]) };
            if i == 2 {
                return Some(pte);
            }
            // SAFETY: 同上
            let entry = unsafe { *pte.as_ptr() };
            if !entry.is_valid() {
                return None;
            }
            ppn = entry.ppn();
        }
        None
    }

    /// 找到 `vpn` 对应的叶子页表项。注意不保证该页表项 valid，需调用方自己修改
    fn find_pte_create(&mut self, vpn: VirtPageNum) -> KResult<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn();
        for &idx in &idxs[..2] {
            // SAFETY: 页表中指定的 ppn 必然已经分配；且持有 `&mut self`，因此不会 alias
            let pte = unsafe { &mut self.ptes(ppn).as_mut()[idx] };
            if !pte.is_valid() {
                let frame = Self::alloc_table_page(&self.registry)?;
                *pte = PageTableEntry::new(frame.ppn(), PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        // SAFETY: 同上
        Ok(unsafe { &mut self.ptes(ppn).as_mut()[idxs[2]] })
    }

    fn valid_leaf_mut(&mut self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        // SAFETY: 持有 `&mut self`
        let pte = unsafe { self.find_pte(vpn)?.as_mut() };
        pte.is_valid().then_some(pte)
    }
}

impl PageTable for Sv39PageTable {
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, perm: MapPermission) -> KResult<()> {
        let pte = self.find_pte_create(vpn)?;
        debug_assert!(
            !pte.is_valid(),
            "vpn {:#x?} is mapped before mapping",
            vpn.0
        );
        *pte = PageTableEntry::new(ppn, PTEFlags::from(perm) | PTEFlags::V);
        Ok(())
    }

    fn unmap(&mut self, vpn: VirtPageNum) -> Option<(PhysPageNum, MapPermission)> {
        let pte = self.valid_leaf_mut(vpn)?;
        let old = *pte;
        *pte = PageTableEntry::empty();
        Some((old.ppn(), old.perm()))
    }

    fn change_protection(&mut self, vpn: VirtPageNum, perm: MapPermission) -> bool {
        let Some(pte) = self.valid_leaf_mut(vpn) else {
            return false;
        };
        *pte = PageTableEntry::new(pte.ppn(), PTEFlags::from(perm) | PTEFlags::V);
        true
    }

    fn translate(&self, vpn: VirtPageNum) -> Option<(PhysPageNum, MapPermission)> {
        // SAFETY: 只读
        let pte = unsafe { *self.find_pte(vpn)?.as_ptr() };
        pte.is_valid().then(|| (pte.ppn(), pte.perm()))
    }

    fn invalidate(&self, range: Range<VirtPageNum>) {
        for vpn in range.start.0..range.end.0 {
            flush_tlb(Some(VirtPageNum(vpn).page_start().0));
        }
    }

    fn fork_table(&self) -> KResult<Box<dyn PageTable>> {
        let table = Self::with_root(&self.registry)?;
        for &line in KERNEL_ROOT_LINES {
            // SAFETY: 两个根页表都持有着，且是不同的页
            unsafe {
                let pte = self.root_ptes().as_ref()[line];
                table.root_ptes().as_mut()[line] = pte;
            }
        }
        Ok(Box::new(table))
    }

    fn free(&mut self) {
        for frame in self.frames.drain(..).chain(self.root.take()) {
            frame.clear_flags(PageFlags::PINNED);
        }
    }

    fn token(&self) -> usize {
        SATP_MODE_SV39 << 60 | self.root_ppn().0
    }

    fn activate(&self) {
        write_satp(self.token());
        flush_tlb(None);
        trace!("activate page table {:#x}", self.token());
    }
}

#[cfg(target_arch = "riscv64")]
#[allow(unused_unsafe)]
fn write_satp(token: usize) {
    // SAFETY: 页表中包含内核共享的部分，切换后内核仍能正常运行
    unsafe { riscv::register::satp::write(token) };
}

#[cfg(not(target_arch = "riscv64"))]
fn write_satp(_token: usize) {}

/// 刷新 TLB，`None` 表示全部刷新
#[cfg(target_arch = "riscv64")]
#[allow(unused_unsafe)]
fn flush_tlb(addr: Option<usize>) {
    // SAFETY: 只是刷新 TLB
    unsafe {
        match addr {
            Some(addr) => riscv::asm::sfence_vma(0, addr),
            None => riscv::asm::sfence_vma_all(),
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn flush_tlb(_addr: Option<usize>) {}

impl Drop for Sv39PageTable {
    fn drop(&mut self) {
        self.free();
    }
}
