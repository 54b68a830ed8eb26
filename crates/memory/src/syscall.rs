//! 内存相关的系统调用

use common::config::{LOW_ADDRESS_END, MMAP_START, PAGE_OFFSET_MASK, PAGE_SIZE_BITS};
use defines::{
    error::{errno, KResult},
    misc::{MmapFlags, MmapProt},
};

use crate::{
    address::page_align_up,
    context::CpuContext,
    memory_space::{MapPermission, MapRequest, MappedFile},
    vmo::MappingType,
    VirtAddr,
};

/// 映射虚拟内存。返回实际映射的地址。
///
/// `addr` 若是 NULL，那么内核会自动选择一个按页对齐的地址进行映射。
///
/// `addr` 若有指定地址，那么内核会尝试在最近的页边界上映射，但如果已经被映射过了，
/// 就从 `MMAP_START` 开始挑选一个新的地址。指定 `MAP_FIXED` 时则一定映射到 `addr`，原有的映射被替换。
///
/// 如果映射文件，那么会以该文件 `offset` 开始处的 `len` 个字节初始化映射内容。
/// `MAP_SHARED` 的文件映射与页缓存共享页，写入会在写回时同步到文件上。
///
/// 参数：
/// - `addr` 映射的目标地址
/// - `len` 映射的目标长度，会向上对齐到页
/// - `prot` 描述该映射的内存保护方式，不能与文件打开模式冲突
/// - `flags` 描述映射的特征，详细参考 [`MmapFlags`]
/// - `file` 被映射的文件，匿名映射时忽略
/// - `offset` 映射的起始偏移，必须是 `PAGE_SIZE` 的整数倍
pub fn sys_mmap(
    cpu: &CpuContext,
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    file: Option<MappedFile>,
    offset: usize,
) -> KResult {
    let prot = MmapProt::from_bits(prot).ok_or(errno::EINVAL)?;
    let Some(flags) = MmapFlags::from_bits(flags) else {
        // flags 出现了意料之外的标志位
        error!("unsupported flags: {flags:#b}");
        return Err(errno::UNSUPPORTED);
    };
    debug!("mmap addr: {addr:#x}, len: {len}, prot: {prot:?}, flags: {flags:?}, offset: {offset:#x}");
    if len == 0 {
        return Err(errno::EINVAL);
    }
    // `MAP_SHARED`、`MAP_PRIVATE` 有且只有其一
    let mapping = match (
        flags.contains(MmapFlags::MAP_SHARED),
        flags.contains(MmapFlags::MAP_PRIVATE),
    ) {
        (true, false) => MappingType::Shared,
        (false, true) => MappingType::Private,
        _ => return Err(errno::EINVAL),
    };
    if offset & PAGE_OFFSET_MASK != 0 {
        return Err(errno::EINVAL);
    }
    let size = page_align_up(len).ok_or(errno::ENOMEM)?;

    let perm = MapPermission::from(prot);
    let req = if flags.contains(MmapFlags::MAP_ANONYMOUS) {
        MapRequest::anonymous(perm, mapping)
    } else {
        let file = file.ok_or(errno::EBADF)?;
        if !file.readable {
            return Err(errno::EACCES);
        }
        if mapping == MappingType::Shared && prot.contains(MmapProt::PROT_WRITE) && !file.writable
        {
            return Err(errno::EACCES);
        }
        MapRequest::file(perm, mapping, file, offset)
    };

    let space = cpu.current();
    let region = if flags.contains(MmapFlags::MAP_FIXED) {
        let end = addr.checked_add(size).ok_or(errno::ENOMEM)?;
        // 不能固定映射到 NULL 或者内核地址
        if addr == 0 || addr >= LOW_ADDRESS_END || end > LOW_ADDRESS_END {
            return Err(errno::ENOMEM);
        }
        if addr & PAGE_OFFSET_MASK != 0 {
            return Err(errno::EINVAL);
        }
        space.map_fixed(VirtAddr(addr), size, req)?
    } else {
        // 内核地址的提示直接忽略
        let hint = (addr != 0 && addr < LOW_ADDRESS_END).then(|| VirtAddr(addr).page_floor());
        space.map_hint(hint, VirtAddr(MMAP_START), size, req)?
    };

    let base = region.base();
    if flags.contains(MmapFlags::MAP_POPULATE)
        && prot.intersects(MmapProt::PROT_READ | MmapProt::PROT_WRITE)
    {
        if let Err(e) = space.populate(base, size >> PAGE_SIZE_BITS) {
            warn!("populating {base:?} failed: {e}");
            space.munmap(base, size)?;
            return Err(e);
        }
    }
    Ok(base.0 as isize)
}

/// 解除 `[addr, addr + len)` 中的映射。其中没有映射的部分被忽略
pub fn sys_munmap(cpu: &CpuContext, addr: usize, len: usize) -> KResult {
    debug!("munmap addr: {addr:#x}, len: {len}");
    if addr & PAGE_OFFSET_MASK != 0 || len == 0 || addr >= LOW_ADDRESS_END {
        return Err(errno::EINVAL);
    }
    let size = page_align_up(len).ok_or(errno::EINVAL)?;
    let end = addr.checked_add(size).ok_or(errno::EINVAL)?;
    if end > LOW_ADDRESS_END {
        return Err(errno::EINVAL);
    }
    cpu.current().munmap(VirtAddr(addr), size)?;
    Ok(0)
}

/// 修改 `[addr, addr + len)` 的保护方式。
///
/// 范围内存在没有映射的地址时返回 `ENOMEM`，此时不会做任何修改
pub fn sys_mprotect(cpu: &CpuContext, addr: usize, len: usize, prot: u32) -> KResult {
    let prot = MmapProt::from_bits(prot).ok_or(errno::EINVAL)?;
    debug!("mprotect addr: {addr:#x}, len: {len}, prot: {prot:?}");
    if addr & PAGE_OFFSET_MASK != 0 {
        return Err(errno::EINVAL);
    }
    let end = page_align_up(len)
        .and_then(|size| addr.checked_add(size))
        .ok_or(errno::ENOMEM)?;
    if end > LOW_ADDRESS_END {
        return Err(errno::ENOMEM);
    }
    cpu.current()
        .mprotect(VirtAddr(addr), len, MapPermission::from(prot))?;
    Ok(0)
}

/// 调整堆顶。`brk` 为 0 时返回当前的堆顶，失败时也返回当前的堆顶
pub fn sys_brk(cpu: &CpuContext, brk: usize) -> KResult {
    let space = cpu.current();
    let old = space.brk();
    if brk == 0 {
        return Ok(old.0 as isize);
    }
    match space.set_brk(VirtAddr(brk)) {
        Ok(new) => Ok(new.0 as isize),
        Err(e) => {
            debug!("brk to {brk:#x} failed: {e}");
            Ok(old.0 as isize)
        }
    }
}

#[cfg(test)]
mod tests {
    use common::config::{BRK_BASE, PAGE_SIZE};

    use super::*;
    use crate::{context::MmContext, page::PageRegistry, page_cache::inode::tests::clock};

    const RW: u32 = MmapProt::PROT_READ.bits() | MmapProt::PROT_WRITE.bits();
    const PRIVATE_ANON: u32 = MmapFlags::MAP_PRIVATE.bits() | MmapFlags::MAP_ANONYMOUS.bits();

    fn user_cpu() -> CpuContext {
        let registry = PageRegistry::with_capacity(64);
        let mm = MmContext::new(&registry, clock).unwrap();
        let cpu = CpuContext::new(&mm);
        let space = mm.create_address_space().unwrap();
        cpu.switch_to(&space);
        cpu
    }

    fn mmap(cpu: &CpuContext, addr: usize, len: usize, flags: u32) -> KResult {
        sys_mmap(cpu, addr, len, RW, flags, None, 0)
    }

    #[test]
    fn argument_checks() {
        let cpu = user_cpu();
        assert_eq!(mmap(&cpu, 0, 0, PRIVATE_ANON), Err(errno::EINVAL));
        let both = PRIVATE_ANON | MmapFlags::MAP_SHARED.bits();
        assert_eq!(mmap(&cpu, 0, PAGE_SIZE, both), Err(errno::EINVAL));
        let neither = MmapFlags::MAP_ANONYMOUS.bits();
        assert_eq!(mmap(&cpu, 0, PAGE_SIZE, neither), Err(errno::EINVAL));
        assert_eq!(
            sys_mmap(&cpu, 0, PAGE_SIZE, RW, PRIVATE_ANON, None, 10),
            Err(errno::EINVAL)
        );
        let private_file = MmapFlags::MAP_PRIVATE.bits();
        assert_eq!(mmap(&cpu, 0, PAGE_SIZE, private_file), Err(errno::EBADF));
    }

    #[test]
    fn hint_and_fixed_placement() {
        let cpu = user_cpu();
        let first = mmap(&cpu, 0, 100, PRIVATE_ANON).unwrap() as usize;
        assert_eq!(first, MMAP_START);

        let hinted = mmap(&cpu, 0x1234_5123, PAGE_SIZE, PRIVATE_ANON).unwrap() as usize;
        assert_eq!(hinted, 0x1234_5000);
        // 提示的地址被占用，从 MMAP_START 开始找
        let taken = mmap(&cpu, 0x1234_5000, PAGE_SIZE, PRIVATE_ANON).unwrap() as usize;
        assert_eq!(taken, MMAP_START + PAGE_SIZE);

        let fixed = PRIVATE_ANON | MmapFlags::MAP_FIXED.bits();
        assert_eq!(mmap(&cpu, LOW_ADDRESS_END, PAGE_SIZE, fixed), Err(errno::ENOMEM));
        assert_eq!(mmap(&cpu, 0, PAGE_SIZE, fixed), Err(errno::ENOMEM));
        assert_eq!(mmap(&cpu, 0x1234_5010, PAGE_SIZE, fixed), Err(errno::EINVAL));
        // 替换掉原有的映射
        assert_eq!(mmap(&cpu, 0x1234_5000, PAGE_SIZE, fixed), Ok(0x1234_5000));
        assert_eq!(cpu.current().regions().len(), 3);
    }

    #[test]
    fn kernel_hint_is_dropped() {
        let cpu = user_cpu();
        let addr = mmap(&cpu, usize::MAX - PAGE_SIZE, PAGE_SIZE, PRIVATE_ANON).unwrap();
        assert_eq!(addr as usize, MMAP_START);
    }

    #[test]
    fn munmap_checks() {
        let cpu = user_cpu();
        assert_eq!(sys_munmap(&cpu, 0x1001, PAGE_SIZE), Err(errno::EINVAL));
        assert_eq!(sys_munmap(&cpu, 0x1000, 0), Err(errno::EINVAL));
        assert_eq!(sys_munmap(&cpu, LOW_ADDRESS_END, PAGE_SIZE), Err(errno::EINVAL));
        // 没有映射的范围
        assert_eq!(sys_munmap(&cpu, 0x1000, PAGE_SIZE), Ok(0));
    }

    #[test]
    fn mprotect_on_hole_changes_nothing() {
        let cpu = user_cpu();
        let addr = mmap(&cpu, 0, 2 * PAGE_SIZE, PRIVATE_ANON).unwrap() as usize;
        sys_munmap(&cpu, addr + PAGE_SIZE, PAGE_SIZE).unwrap();
        let read = MmapProt::PROT_READ.bits();
        assert_eq!(
            sys_mprotect(&cpu, addr, 2 * PAGE_SIZE, read),
            Err(errno::ENOMEM)
        );
        let region = cpu.current().find_region(VirtAddr(addr)).unwrap();
        assert!(region.perm().contains(MapPermission::W));
        assert_eq!(sys_mprotect(&cpu, addr, PAGE_SIZE, read), Ok(0));
        let region = cpu.current().find_region(VirtAddr(addr)).unwrap();
        assert!(!region.perm().contains(MapPermission::W));
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let cpu = user_cpu();
        assert_eq!(sys_brk(&cpu, 0), Ok(BRK_BASE as isize));
        let top = BRK_BASE + 3 * PAGE_SIZE + 8;
        assert_eq!(sys_brk(&cpu, top), Ok(top as isize));
        let heap = cpu.current().find_region(VirtAddr(BRK_BASE)).unwrap();
        assert_eq!(heap.pages(), 4);

        assert_eq!(sys_brk(&cpu, BRK_BASE + PAGE_SIZE), Ok((BRK_BASE + PAGE_SIZE) as isize));
        assert_eq!(cpu.current().find_region(VirtAddr(BRK_BASE)).unwrap().pages(), 1);
        // 低于堆的起点，失败时返回原来的堆顶
        assert_eq!(sys_brk(&cpu, PAGE_SIZE), Ok((BRK_BASE + PAGE_SIZE) as isize));
    }

    #[test]
    fn populate_commits_every_page() {
        let cpu = user_cpu();
        let flags = PRIVATE_ANON | MmapFlags::MAP_POPULATE.bits();
        let addr = mmap(&cpu, 0, 3 * PAGE_SIZE, flags).unwrap() as usize;
        let space = cpu.current();
        for i in 0..3 {
            let perm = space.translate_perm(VirtAddr(addr + i * PAGE_SIZE)).unwrap();
            assert!(perm.contains(MapPermission::W));
        }
    }
}
