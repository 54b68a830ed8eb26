use atomic::{Atomic, Ordering};

use crate::page::{PageFlags, PageRef};

#[derive(bytemuck::NoUninit, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// 与磁盘一致
    Clean,
    /// 比磁盘上的新，需要写回
    Dirty,
}

/// 页缓存中的一页。由 inode 持有，页通过 [`Page::cache_entry`](crate::Page::cache_entry) 弱引用回来
pub struct PageCacheEntry {
    /// 文件偏移，页对齐
    offset: usize,
    state: Atomic<EntryState>,
    page: PageRef,
}

impl PageCacheEntry {
    pub(crate) fn new(offset: usize, page: PageRef) -> Self {
        Self {
            offset,
            state: Atomic::new(EntryState::Clean),
            page,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn state(&self) -> EntryState {
        self.state.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == EntryState::Dirty
    }

    /// 标记为脏，返回之前是否已经是脏的
    pub(crate) fn set_dirty(&self) -> bool {
        self.page.set_flags(PageFlags::DIRTY);
        self.state.swap(EntryState::Dirty, Ordering::AcqRel) == EntryState::Dirty
    }

    /// 清除脏标记，返回之前是否是脏的
    pub(crate) fn clear_dirty(&self) -> bool {
        let was_dirty = self.state.swap(EntryState::Clean, Ordering::AcqRel) == EntryState::Dirty;
        self.page.clear_flags(PageFlags::DIRTY);
        was_dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{AllocFlags, PageRegistry};

    #[test]
    fn dirty_state_mirrors_page_flag() {
        let registry = PageRegistry::with_capacity(1);
        let page = registry.alloc_page(AllocFlags::empty()).unwrap();
        let entry = PageCacheEntry::new(0, page);
        assert_eq!(entry.state(), EntryState::Clean);
        assert!(!entry.set_dirty());
        assert!(entry.set_dirty());
        assert!(entry.page().flags().contains(PageFlags::DIRTY));
        assert!(entry.clear_dirty());
        assert!(!entry.clear_dirty());
        assert!(!entry.page().flags().contains(PageFlags::DIRTY));
    }
}
