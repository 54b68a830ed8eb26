#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Barrier,
};

use common::config::PAGE_SIZE;
use defines::{
    error::{errno, KResult},
    misc::TimeSpec,
};
use klocks::SpinMutex;
use memory::{CpuContext, InodeBackend, InodeKey, MmContext, PageRef, PageRegistry};

/// 保存在内存中的文件内容
#[derive(Default)]
pub struct RamFile {
    pub data: SpinMutex<Vec<u8>>,
    pub fail_reads: AtomicBool,
    pub page_writes: AtomicUsize,
}

impl RamFile {
    pub fn new(data: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: SpinMutex::new(data.to_vec()),
            ..Self::default()
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

pub struct RamBackend(pub Arc<RamFile>);

impl InodeBackend for RamBackend {
    fn read_page(&self, page: &PageRef, offset: usize) -> KResult<usize> {
        if self.0.fail_reads.load(Ordering::Relaxed) {
            return Err(errno::EIO);
        }
        let data = self.0.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = PAGE_SIZE.min(data.len() - offset);
        page.write_bytes(0, &data[offset..offset + len]);
        Ok(len)
    }

    fn write_page(&self, page: &PageRef, offset: usize, len: usize) -> KResult<usize> {
        let mut data = self.0.data.lock();
        if data.len() < offset + len {
            data.resize(offset + len, 0);
        }
        page.read_bytes(0, &mut data[offset..offset + len]);
        self.0.page_writes.fetch_add(1, Ordering::Relaxed);
        Ok(len)
    }

    fn truncate(&self, size: usize) -> KResult<()> {
        self.0.data.lock().resize(size, 0);
        Ok(())
    }
}

/// 让第一次读盘停在中途，直到测试放行
pub struct Gate {
    armed: AtomicBool,
    entered: Barrier,
    released: Barrier,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            released: Barrier::new(2),
        })
    }

    /// 等到读盘的线程停下
    pub fn wait_entered(&self) {
        self.entered.wait();
    }

    pub fn release(&self) {
        self.released.wait();
    }

    fn pass(&self) {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.entered.wait();
            self.released.wait();
        }
    }
}

pub struct GatedBackend(pub RamBackend, pub Arc<Gate>);

impl InodeBackend for GatedBackend {
    fn read_page(&self, page: &PageRef, offset: usize) -> KResult<usize> {
        self.1.pass();
        self.0.read_page(page, offset)
    }

    fn write_page(&self, page: &PageRef, offset: usize, len: usize) -> KResult<usize> {
        self.0.write_page(page, offset, len)
    }

    fn truncate(&self, size: usize) -> KResult<()> {
        self.0.truncate(size)
    }
}

pub fn clock() -> TimeSpec {
    static TICKS: AtomicUsize = AtomicUsize::new(1);
    TimeSpec {
        sec: TICKS.fetch_add(1, Ordering::Relaxed),
        nsec: 0,
    }
}

/// 一个已经切换到新用户地址空间的 CPU
pub fn user_cpu(pages: usize) -> CpuContext {
    let registry = PageRegistry::with_capacity(pages);
    let mm = MmContext::new(&registry, clock).unwrap();
    let cpu = CpuContext::new(&mm);
    let space = mm.create_address_space().unwrap();
    cpu.switch_to(&space);
    cpu
}

pub fn open_file(cpu: &CpuContext, ino: usize, data: &[u8]) -> (Arc<memory::Inode>, Arc<RamFile>) {
    let file = RamFile::new(data);
    let backend = RamBackend(Arc::clone(&file));
    let inode = cpu
        .mm()
        .get_or_create_inode(InodeKey { dev: 0, ino }, data.len(), || Box::new(backend));
    (inode, file)
}
