use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{self, Weak},
    vec,
    vec::Vec,
};
use core::{
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use bitflags::bitflags;
use common::config::{PAGE_OFFSET_MASK, PAGE_SIZE};
use defines::{
    error::{errno, KResult},
    misc::TimeSpec,
};
use klocks::{RwLock, SpinMutex};
use triomphe::Arc;

use super::{PageCacheEntry, WritebackList};
use crate::{
    address::page_align_up,
    memory_space::AddressSpace,
    page::{AllocFlags, PageFlags, PageRef, PageRegistry},
    user_check,
    vmo::{Commit, MappingType, Vmo, VmoGetFlags},
    VirtAddr,
};

/// 在整个系统中唯一标识一个 inode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: usize,
    pub ino: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct InodeMeta {
    /// 文件的逻辑大小
    pub size: usize,
    /// 上一次访问时间
    pub atime: TimeSpec,
    /// 上一次修改时间
    pub mtime: TimeSpec,
    /// 上一次元数据变化时间
    pub ctime: TimeSpec,
}

/// 文件系统提供的按页读写能力
pub trait InodeBackend: Send + Sync {
    /// 把 `offset` 开始的一页读入 `page`，返回读到的字节数。超出文件末尾的部分可以不读
    fn read_page(&self, page: &PageRef, offset: usize) -> KResult<usize>;
    /// 把 `page` 的前 `len` 字节写到 `offset` 处
    fn write_page(&self, page: &PageRef, offset: usize, len: usize) -> KResult<usize>;
    fn truncate(&self, _size: usize) -> KResult<()> {
        Ok(())
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// 调用方要写这一页，超出文件范围时会扩展
        const WRITE = 1 << 0;
    }
}

pub struct Inode {
    key: InodeKey,
    meta: SpinMutex<InodeMeta>,
    /// 写者之间互斥，且与读者互斥
    rwlock: RwLock<()>,
    pages: Arc<Vmo>,
    entries: SpinMutex<BTreeMap<usize, sync::Arc<PageCacheEntry>>>,
    /// 是否已经登记在写回链表上
    dirty: AtomicBool,
    this: Weak<Inode>,
    backend: Box<dyn InodeBackend>,
    writeback: Arc<WritebackList>,
    clock: fn() -> TimeSpec,
}

impl Inode {
    pub fn new(
        key: InodeKey,
        size: usize,
        backend: Box<dyn InodeBackend>,
        registry: &sync::Arc<PageRegistry>,
        writeback: &Arc<WritebackList>,
        clock: fn() -> TimeSpec,
    ) -> sync::Arc<Self> {
        let now = clock();
        sync::Arc::new_cyclic(|this| Self {
            key,
            meta: SpinMutex::new(InodeMeta {
                size,
                atime: now,
                mtime: now,
                ctime: now,
            }),
            rwlock: RwLock::new(()),
            pages: Vmo::new(
                registry,
                size,
                Commit::PageCache(Weak::clone(this)),
                MappingType::Shared,
            ),
            entries: SpinMutex::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
            this: Weak::clone(this),
            backend,
            writeback: Arc::clone(writeback),
            clock,
        })
    }

    pub fn key(&self) -> InodeKey {
        self.key
    }

    pub fn meta(&self) -> InodeMeta {
        *self.meta.lock()
    }

    pub fn size(&self) -> usize {
        self.meta.lock().size
    }

    /// 缓存文件内容的 VMO
    pub fn pages(&self) -> &Arc<Vmo> {
        &self.pages
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn cached_entry(&self, offset: usize) -> Option<sync::Arc<PageCacheEntry>> {
        self.entries.lock().get(&(offset & !PAGE_OFFSET_MASK)).cloned()
    }

    pub fn dirty_entries(&self) -> Vec<sync::Arc<PageCacheEntry>> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_dirty())
            .cloned()
            .collect()
    }

    fn registry(&self) -> &sync::Arc<PageRegistry> {
        self.pages.registry()
    }

    /// 获取 `offset` 所在页的缓存项
    pub fn get_page(&self, offset: usize, flags: CacheFlags) -> KResult<sync::Arc<PageCacheEntry>> {
        let offset = offset & !PAGE_OFFSET_MASK;
        let extent = page_align_up(self.pages.size()).ok_or(errno::EINVAL)?;
        if flags.contains(CacheFlags::WRITE) && offset >= extent {
            self.pages.grow_to(offset + PAGE_SIZE);
            let page = self
                .registry()
                .alloc_page(AllocFlags::empty())
                .ok_or(errno::ENOMEM)?;
            match self.pages.add_page(offset, page) {
                // 并发的写者先加上了
                Ok(()) | Err(errno::EEXIST) => {}
                Err(e) => return Err(e),
            }
        }
        self.pages.get(offset, VmoGetFlags::MAY_POPULATE)?;
        // 缓存项在页加入 VMO 时就已经建立，这里找不到说明被并发截断了
        self.cached_entry(offset).ok_or(errno::EIO)
    }

    /// 建立页缓存项。调用时持有 VMO 的锁
    pub(crate) fn install_entry(&self, offset: usize, page: &PageRef) {
        let entry = sync::Arc::new(PageCacheEntry::new(offset, page.clone()));
        page.set_cache_entry(Some(sync::Arc::downgrade(&entry)));
        let old = self.entries.lock().insert(offset, entry);
        debug_assert!(old.map_or(true, |old| !old.page().ptr_eq(page)));
    }

    /// 页缓存 VMO 的提交：从磁盘读入一页
    pub(crate) fn read_from_backend(
        &self,
        registry: &sync::Arc<PageRegistry>,
        offset: usize,
    ) -> KResult<PageRef> {
        let page = registry
            .alloc_page(AllocFlags::empty())
            .ok_or(errno::ENOMEM)?;
        let nread = self.backend.read_page(&page, offset).map_err(|e| {
            warn!("inode {:?}: read page at {offset:#x} failed: {e}", self.key);
            e
        })?;
        if nread < PAGE_SIZE {
            page.zero_range(nread..PAGE_SIZE);
        }
        trace!("inode {:?}: read {nread} bytes at {offset:#x}", self.key);
        Ok(page)
    }

    /// 私有文件映射的提交：复制一份缓存页，文件末尾之后填零
    pub(crate) fn private_copy(
        &self,
        registry: &sync::Arc<PageRegistry>,
        file_offset: usize,
    ) -> KResult<PageRef> {
        let size = self.size();
        if file_offset >= size {
            return Err(errno::EFAULT);
        }
        let entry = self.get_page(file_offset, CacheFlags::empty())?;
        let page = registry
            .alloc_page(AllocFlags::NO_ZERO)
            .ok_or(errno::ENOMEM)?;
        page.copy_from_page(entry.page());
        let valid = size - file_offset;
        if valid < PAGE_SIZE {
            page.zero_range(valid..PAGE_SIZE);
        }
        Ok(page)
    }

    /// 共享文件映射的提交：直接引用缓存页
    pub(crate) fn shared_page(&self, file_offset: usize) -> KResult<PageRef> {
        if file_offset >= self.size() {
            return Err(errno::EFAULT);
        }
        Ok(self.get_page(file_offset, CacheFlags::empty())?.page().clone())
    }

    /// 如果 `page` 是本 inode 的缓存页，将其标记为脏
    pub(crate) fn mark_page_dirty(&self, page: &PageRef) {
        if let Some(entry) = page.cache_entry() {
            self.mark_entry_dirty(&entry);
        }
    }

    fn mark_entry_dirty(&self, entry: &PageCacheEntry) {
        entry.set_dirty();
        if !self.dirty.swap(true, Ordering::AcqRel) {
            if let Some(this) = self.this.upgrade() {
                self.writeback.register(this);
            }
        }
    }

    /// 从 `offset` 开始读至多 `len` 字节，每一段交给 `sink` 从页中取走。
    ///
    /// 读到一部分后出错时返回已读的字节数
    pub fn file_read_cache(
        &self,
        offset: usize,
        len: usize,
        mut sink: impl FnMut(&PageRef, Range<usize>) -> KResult<()>,
    ) -> KResult<usize> {
        let _guard = self.rwlock.read();
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let end = usize::min(offset.saturating_add(len), size);

        let mut pos = offset;
        while pos < end {
            let page_offset = pos & PAGE_OFFSET_MASK;
            let chunk = usize::min(end - pos, PAGE_SIZE - page_offset);
            let ret = self
                .get_page(pos, CacheFlags::empty())
                .and_then(|entry| sink(entry.page(), page_offset..page_offset + chunk));
            if let Err(e) = ret {
                if pos == offset {
                    return Err(e);
                }
                break;
            }
            pos += chunk;
        }
        self.meta.lock().atime = (self.clock)();
        Ok(pos - offset)
    }

    /// 从 `offset` 开始写 `len` 字节，每一段由 `source` 填入页中。写超过文件末尾时扩展文件。
    ///
    /// 写了一部分后出错时返回已写的字节数
    pub fn file_write_cache(
        &self,
        offset: usize,
        len: usize,
        mut source: impl FnMut(&PageRef, Range<usize>) -> KResult<()>,
    ) -> KResult<usize> {
        let _guard = self.rwlock.write();
        let end = offset.checked_add(len).ok_or(errno::EINVAL)?;

        let mut pos = offset;
        let mut error = None;
        while pos < end {
            let page_offset = pos & PAGE_OFFSET_MASK;
            let chunk = usize::min(end - pos, PAGE_SIZE - page_offset);
            let entry = match self.get_page(pos, CacheFlags::WRITE) {
                Ok(entry) => entry,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            let page = entry.page();
            let lock = page.lock();
            if let Err(e) = source(page, page_offset..page_offset + chunk) {
                error = Some(e);
                break;
            }
            self.mark_entry_dirty(&entry);
            drop(lock);
            pos += chunk;
        }

        let written = pos - offset;
        if written > 0 {
            let now = (self.clock)();
            let mut meta = self.meta.lock();
            if pos > meta.size {
                meta.size = pos;
            }
            meta.mtime = now;
            meta.ctime = now;
        }
        match error {
            Some(e) if written == 0 => Err(e),
            _ => Ok(written),
        }
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> KResult<usize> {
        let mut copied = 0;
        self.file_read_cache(offset, buf.len(), |page, range| {
            let len = range.len();
            page.read_bytes(range.start, &mut buf[copied..copied + len]);
            copied += len;
            Ok(())
        })
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> KResult<usize> {
        let mut copied = 0;
        self.file_write_cache(offset, buf.len(), |page, range| {
            let len = range.len();
            page.write_bytes(range.start, &buf[copied..copied + len]);
            copied += len;
            Ok(())
        })
    }

    /// 读到 `space` 中的用户内存 `[dst, dst + len)`
    pub fn read_to_user(
        &self,
        space: &AddressSpace,
        offset: usize,
        dst: VirtAddr,
        len: usize,
    ) -> KResult<usize> {
        let mut bounce = vec![0; PAGE_SIZE];
        let mut copied = 0;
        self.file_read_cache(offset, len, |page, range| {
            let len = range.len();
            page.read_bytes(range.start, &mut bounce[..len]);
            user_check::copy_to_user(space, dst + copied, &bounce[..len])?;
            copied += len;
            Ok(())
        })
    }

    /// 从 `space` 中的用户内存 `[src, src + len)` 写入
    pub fn write_from_user(
        &self,
        space: &AddressSpace,
        offset: usize,
        src: VirtAddr,
        len: usize,
    ) -> KResult<usize> {
        let mut bounce = vec![0; PAGE_SIZE];
        let mut copied = 0;
        self.file_write_cache(offset, len, |page, range| {
            let len = range.len();
            user_check::copy_from_user(space, &mut bounce[..len], src + copied)?;
            page.write_bytes(range.start, &bounce[..len]);
            copied += len;
            Ok(())
        })
    }

    /// 把所有脏页写回磁盘。
    ///
    /// 写回的页在所有共享映射中变为只读，之后的写入会重新缺页，从而再次标记为脏
    pub fn sync(&self) -> KResult<()> {
        let _guard = self.rwlock.read();
        // 先清掉登记标记，写回期间新变脏的页会让 inode 重新登记
        self.dirty.store(false, Ordering::Release);
        let size = self.size();
        let mut result = Ok(());
        for entry in self.dirty_entries() {
            let page = entry.page();
            let _lock = page.lock();
            // 持有页锁之后新建的映射只能通过写缺页得到写权限
            for link in self.pages.mappings() {
                if let Some(space) = link.space.upgrade() {
                    space.write_protect_file_page(link.base, self, entry.offset(), page);
                }
            }
            if !entry.clear_dirty() || entry.offset() >= size {
                continue;
            }
            let len = usize::min(PAGE_SIZE, size - entry.offset());
            page.set_flags(PageFlags::FLUSHING);
            let ret = self.backend.write_page(page, entry.offset(), len);
            page.clear_flags(PageFlags::FLUSHING);
            if let Err(e) = ret {
                warn!(
                    "inode {:?}: write back page at {:#x} failed: {e}",
                    self.key,
                    entry.offset()
                );
                self.mark_entry_dirty(&entry);
                result = Err(e);
            }
        }
        debug!("inode {:?} synced", self.key);
        result
    }

    /// 修改文件大小。缩小时丢弃之后的缓存页，且最后一页中超出的部分清零
    pub fn truncate(&self, new_size: usize) -> KResult<()> {
        let _guard = self.rwlock.write();
        self.backend.truncate(new_size)?;
        let now = (self.clock)();
        let old_size = {
            let mut meta = self.meta.lock();
            let old_size = meta.size;
            meta.size = new_size;
            meta.mtime = now;
            meta.ctime = now;
            old_size
        };
        if new_size >= old_size {
            self.pages.grow_to(new_size);
            return Ok(());
        }

        let extent = page_align_up(new_size).ok_or(errno::EINVAL)?;
        self.pages.resize(new_size);
        let removed = self.entries.lock().split_off(&extent);
        for entry in removed.values() {
            entry.clear_dirty();
        }
        drop(removed);
        let tail = new_size & PAGE_OFFSET_MASK;
        if tail != 0 {
            if let Some(page) = self.pages.lookup(new_size & !PAGE_OFFSET_MASK) {
                let _lock = page.lock();
                page.zero_range(tail..PAGE_SIZE);
            }
        }
        debug!("inode {:?} truncated from {old_size:#x} to {new_size:#x}", self.key);
        Ok(())
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let dirty = self.entries.get_mut().values().filter(|e| e.is_dirty()).count();
        if dirty > 0 {
            warn!("inode {:?} dropped with {dirty} dirty pages", self.key);
        }
    }
}
