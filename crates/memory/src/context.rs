//! 内存子系统的全局状态。[`MmContext`] 在所有 CPU 之间共享，[`CpuContext`] 记录一个 CPU 当前的地址空间

use alloc::{boxed::Box, sync};

use common::config::{KERNEL_VM_START, PAGE_SIZE};
use defines::{
    error::{errno, KResult},
    misc::TimeSpec,
};
use klocks::SpinMutex;
use triomphe::Arc;

use crate::{
    memory_space::{AddressSpace, MapPermission, MapRequest, RegionKind},
    page::{MemStat, PageRegistry},
    page_cache::{Inode, InodeBackend, InodeKey, InodeLookup, InodeTable, WritebackList},
    vmo::MappingType,
    VirtAddr,
};

pub struct MmContext {
    registry: sync::Arc<PageRegistry>,
    kernel_space: sync::Arc<AddressSpace>,
    writeback: Arc<WritebackList>,
    inodes: InodeTable,
    /// 用于更新文件时间戳
    clock: fn() -> TimeSpec,
}

impl MmContext {
    pub fn new(registry: &sync::Arc<PageRegistry>, clock: fn() -> TimeSpec) -> KResult<Arc<Self>> {
        let kernel_space = AddressSpace::new_kernel(registry)?;
        let stat = registry.stat();
        info!(
            "memory context ready, {} of {} pages free",
            stat.free_pages, stat.total_pages
        );
        Ok(Arc::new(Self {
            registry: sync::Arc::clone(registry),
            kernel_space,
            writeback: WritebackList::new(),
            inodes: InodeTable::new(),
            clock,
        }))
    }

    pub fn registry(&self) -> &sync::Arc<PageRegistry> {
        &self.registry
    }

    pub fn kernel_space(&self) -> &sync::Arc<AddressSpace> {
        &self.kernel_space
    }

    pub fn writeback(&self) -> &Arc<WritebackList> {
        &self.writeback
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn memstat(&self) -> MemStat {
        self.registry.stat()
    }

    /// 新建一个空的用户地址空间
    pub fn create_address_space(&self) -> KResult<sync::Arc<AddressSpace>> {
        AddressSpace::new_user(&self.kernel_space)
    }

    /// 查找 inode，不存在时用 `make_backend` 创建。同一个 key 只会创建一次
    pub fn get_or_create_inode(
        &self,
        key: InodeKey,
        size: usize,
        make_backend: impl FnOnce() -> Box<dyn InodeBackend>,
    ) -> sync::Arc<Inode> {
        match self.inodes.find(key) {
            InodeLookup::Found(inode) => inode,
            InodeLookup::Vacant(vacant) => {
                trace!("create inode {key:?} of size {size}");
                let inode = Inode::new(
                    key,
                    size,
                    make_backend(),
                    &self.registry,
                    &self.writeback,
                    self.clock,
                );
                vacant.insert(inode)
            }
        }
    }

    /// 在内核动态映射区分配 `pages` 个立即映射好的页
    pub fn vmalloc(&self, pages: usize, perm: MapPermission) -> KResult<VirtAddr> {
        if pages == 0 {
            return Err(errno::EINVAL);
        }
        let size = pages.checked_mul(PAGE_SIZE).ok_or(errno::ENOMEM)?;
        let req = MapRequest::anonymous(perm - MapPermission::U, MappingType::Private)
            .with_kind(RegionKind::Kernel);
        let region = self
            .kernel_space
            .allocate_region(VirtAddr(KERNEL_VM_START), size, req)?;
        let base = region.base();
        if let Err(e) = self.kernel_space.populate(base, pages) {
            warn!("vmalloc of {pages} pages failed: {e}");
            self.kernel_space.munmap(base, size)?;
            return Err(e);
        }
        debug!("vmalloc {pages} pages at {base:?}");
        Ok(base)
    }

    pub fn vfree(&self, addr: VirtAddr, pages: usize) -> KResult<()> {
        if addr.0 < KERNEL_VM_START {
            return Err(errno::EINVAL);
        }
        self.kernel_space.munmap(addr, pages * PAGE_SIZE)
    }

    /// 写回所有脏 inode，返回写回的 inode 数
    pub fn sync_all(&self) -> KResult<usize> {
        self.writeback.flush_all()
    }
}

pub struct CpuContext {
    mm: Arc<MmContext>,
    current: SpinMutex<sync::Arc<AddressSpace>>,
}

impl CpuContext {
    /// 初始时运行在内核地址空间上
    pub fn new(mm: &Arc<MmContext>) -> Self {
        Self {
            mm: Arc::clone(mm),
            current: SpinMutex::new(sync::Arc::clone(mm.kernel_space())),
        }
    }

    pub fn mm(&self) -> &Arc<MmContext> {
        &self.mm
    }

    pub fn current(&self) -> sync::Arc<AddressSpace> {
        self.current.lock().clone()
    }

    pub fn switch_to(&self, space: &sync::Arc<AddressSpace>) {
        let mut current = self.current.lock();
        if sync::Arc::ptr_eq(&*current, space) {
            return;
        }
        space.activate();
        trace!("switch from space {} to {}", current.id(), space.id());
        *current = sync::Arc::clone(space);
    }

    /// 复制当前地址空间
    pub fn fork_address_space(&self) -> KResult<sync::Arc<AddressSpace>> {
        self.current().fork()
    }

    /// 销毁地址空间。若它是当前的，先切换回内核地址空间
    pub fn destroy_address_space(&self, space: &sync::Arc<AddressSpace>) {
        if sync::Arc::ptr_eq(&self.current(), space) {
            self.switch_to(self.mm.kernel_space());
        }
        space.destroy();
    }
}
