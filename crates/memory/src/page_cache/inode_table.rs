use alloc::{boxed::Box, sync::Arc, vec::Vec};

use common::config::INODE_HASH_BUCKETS;
use hashbrown::HashMap;
use klocks::{SpinMutex, SpinMutexGuard};

use super::{Inode, InodeKey};

type Bucket = HashMap<InodeKey, Arc<Inode>>;

/// 已经打开的 inode，按 (dev, ino) 查找
pub struct InodeTable {
    buckets: Box<[SpinMutex<Bucket>]>,
}

pub enum InodeLookup<'a> {
    Found(Arc<Inode>),
    /// 没找到。持有桶的锁，调用方创建好 inode 后通过 [`VacantInode::insert`] 放入，
    /// 其间不会有其他人为同一个 key 创建 inode
    Vacant(VacantInode<'a>),
}

pub struct VacantInode<'a> {
    key: InodeKey,
    bucket: SpinMutexGuard<'a, Bucket>,
}

impl VacantInode<'_> {
    pub fn key(&self) -> InodeKey {
        self.key
    }

    pub fn insert(mut self, inode: Arc<Inode>) -> Arc<Inode> {
        assert_eq!(inode.key(), self.key, "inserting inode under a wrong key");
        self.bucket.insert(self.key, Arc::clone(&inode));
        inode
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let buckets = (0..INODE_HASH_BUCKETS)
            .map(|_| SpinMutex::new(HashMap::new()))
            .collect::<Vec<_>>();
        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    fn bucket(&self, key: InodeKey) -> &SpinMutex<Bucket> {
        let hash = key.dev.wrapping_mul(31).wrapping_add(key.ino);
        &self.buckets[hash % self.buckets.len()]
    }

    pub fn find(&self, key: InodeKey) -> InodeLookup<'_> {
        let bucket = self.bucket(key).lock();
        match bucket.get(&key) {
            Some(inode) => InodeLookup::Found(Arc::clone(inode)),
            None => InodeLookup::Vacant(VacantInode { key, bucket }),
        }
    }

    pub fn remove(&self, key: InodeKey) -> Option<Arc<Inode>> {
        self.bucket(key).lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
