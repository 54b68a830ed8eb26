//! 页缓存
//!
//! inode 的内容缓存在它自己的 [`Vmo`](crate::Vmo) 中，文件偏移即 VMO 偏移。
//! 共享文件映射直接引用这些页，因此 `read`/`write` 与 `mmap` 看到的是同一份内容。

mod entry;
pub(crate) mod inode;
mod inode_table;
mod writeback;

pub use self::entry::{EntryState, PageCacheEntry};
pub use self::inode::{CacheFlags, Inode, InodeBackend, InodeKey, InodeMeta};
pub use self::inode_table::{InodeLookup, InodeTable, VacantInode};
pub use self::writeback::WritebackList;
