use alloc::{sync, vec::Vec};

use defines::error::KResult;
use klocks::SpinMutex;
use triomphe::Arc;

use super::Inode;

/// 有脏页的 inode，等待统一写回
#[derive(Default)]
pub struct WritebackList {
    inodes: SpinMutex<Vec<sync::Arc<Inode>>>,
}

impl WritebackList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 调用方保证同一个 inode 在被写回之前只登记一次
    pub(crate) fn register(&self, inode: sync::Arc<Inode>) {
        trace!("inode {:?} registered for writeback", inode.key());
        self.inodes.lock().push(inode);
    }

    pub fn len(&self) -> usize {
        self.inodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }

    /// 写回所有登记的 inode，返回写回的 inode 数。
    ///
    /// 出错的 inode 会保持脏的状态并重新登记，所有 inode 都处理完后返回第一个错误
    pub fn flush_all(&self) -> KResult<usize> {
        let inodes = core::mem::take(&mut *self.inodes.lock());
        let mut first_error = None;
        for inode in &inodes {
            if let Err(e) = inode.sync() {
                first_error.get_or_insert(e);
            }
        }
        debug!("flushed {} inodes", inodes.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(inodes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use common::config::PAGE_SIZE;
    use defines::error::errno;

    use crate::{page::PageRegistry, page_cache::inode::tests::mem_inode};

    #[test]
    fn flush_all_drains_and_reregisters_failures() {
        let registry = PageRegistry::with_capacity(8);
        let (inode, backend, writeback) = mem_inode(&registry, b"");
        assert!(writeback.is_empty());
        inode.write_at(PAGE_SIZE, b"late").unwrap();
        assert_eq!(writeback.len(), 1);

        backend.fail_writes.store(true, Ordering::Relaxed);
        assert_eq!(writeback.flush_all().unwrap_err(), errno::EIO);
        assert_eq!(writeback.len(), 1);

        backend.fail_writes.store(false, Ordering::Relaxed);
        assert_eq!(writeback.flush_all().unwrap(), 1);
        assert!(writeback.is_empty());
        let data = backend.data.lock();
        assert_eq!(data.len(), PAGE_SIZE + 4);
        assert_eq!(&data[PAGE_SIZE..], b"late");
    }
}
