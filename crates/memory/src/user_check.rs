//! 用户内存的读写。所有访问都经过缺页路径解析，因此写入会像写缺页一样打破写时复制

use alloc::vec::Vec;
use core::ops::Range;

use common::config::{PAGE_SIZE, STRCPY_INITIAL_CAPACITY};
use defines::error::{errno, KResult};

use crate::{fault::FaultInfo, memory_space::AddressSpace, page::PageRef, VirtAddr};

/// 每次从用户空间读取字符串的字节数
const STRCPY_CHUNK: usize = 64;

/// 把 `[start, start + len)` 按页切开，对每一块调用 `f(page, 页内范围, 块在整个范围中的偏移)`
fn for_each_user_page(
    space: &AddressSpace,
    start: VirtAddr,
    len: usize,
    write: bool,
    mut f: impl FnMut(&PageRef, Range<usize>, usize),
) -> KResult<()> {
    let end = start.checked_add(len).ok_or(errno::EFAULT)?;
    let mut va = start;
    while va < end {
        let page_offset = va.page_offset();
        let chunk = (PAGE_SIZE - page_offset).min(end - va);
        let info = FaultInfo {
            address: va,
            write,
            exec: false,
            user: true,
        };
        let page = space.fault_in(&info).map_err(|e| {
            debug!("user access at {va:?} failed: {e:?}");
            errno::EFAULT
        })?;
        f(&page, page_offset..page_offset + chunk, va - start);
        va = va + chunk;
    }
    Ok(())
}

/// 把 `src` 写入用户地址 `dst`。目标范围必须完全落在用户可写的区域中
pub fn copy_to_user(space: &AddressSpace, dst: VirtAddr, src: &[u8]) -> KResult<()> {
    for_each_user_page(space, dst, src.len(), true, |page, range, done| {
        page.write_bytes(range.start, &src[done..done + range.len()]);
    })
}

/// 从用户地址 `src` 读出 `dst.len()` 个字节
pub fn copy_from_user(space: &AddressSpace, dst: &mut [u8], src: VirtAddr) -> KResult<()> {
    let len = dst.len();
    for_each_user_page(space, src, len, false, |page, range, done| {
        page.read_bytes(range.start, &mut dst[done..done + range.len()]);
    })
}

/// 读取以 `\0` 结尾的用户字符串，结果不包含 `\0`
pub fn strcpy_from_user(space: &AddressSpace, src: VirtAddr) -> KResult<Vec<u8>> {
    let mut ret = Vec::new();
    ret.try_reserve_exact(STRCPY_INITIAL_CAPACITY)
        .map_err(|_| errno::ENOMEM)?;
    let mut va = src;
    let mut chunk = [0u8; STRCPY_CHUNK];
    loop {
        // 不跨页读取，避免因为字符串之后的页没有映射而失败
        let len = STRCPY_CHUNK.min(PAGE_SIZE - va.page_offset());
        let buf = &mut chunk[..len];
        copy_from_user(space, buf, va)?;
        let (data, found) = match buf.iter().position(|&b| b == 0) {
            Some(nul) => (&buf[..nul], true),
            None => (&buf[..], false),
        };
        if ret.capacity() - ret.len() < data.len() {
            // 容量翻倍
            ret.try_reserve_exact(ret.capacity().max(data.len()))
                .map_err(|_| errno::ENOMEM)?;
        }
        ret.extend_from_slice(data);
        if found {
            return Ok(ret);
        }
        va = va.checked_add(len).ok_or(errno::EFAULT)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory_space::{MapPermission, MapRequest},
        page::PageRegistry,
        vmo::MappingType,
    };

    fn user_space() -> alloc::sync::Arc<AddressSpace> {
        let registry = PageRegistry::with_capacity(64);
        let kernel = AddressSpace::new_kernel(&registry).unwrap();
        AddressSpace::new_user(&kernel).unwrap()
    }

    fn map(space: &AddressSpace, start: usize, pages: usize, perm: MapPermission) {
        let req = MapRequest::anonymous(perm | MapPermission::U, MappingType::Private);
        space
            .reserve_region(VirtAddr(start), pages * PAGE_SIZE, req)
            .unwrap();
    }

    #[test]
    fn copy_across_page_boundary() {
        let space = user_space();
        map(&space, 0x1000, 2, MapPermission::R | MapPermission::W);
        let data = (0..100u8).collect::<Vec<_>>();
        copy_to_user(&space, VirtAddr(0x1fd0), &data).unwrap();
        let mut back = [0u8; 100];
        copy_from_user(&space, &mut back, VirtAddr(0x1fd0)).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn read_only_region_rejects_writes() {
        let space = user_space();
        map(&space, 0x1000, 1, MapPermission::R);
        assert_eq!(
            copy_to_user(&space, VirtAddr(0x1000), b"x"),
            Err(errno::EFAULT)
        );
        let mut buf = [1u8; 4];
        copy_from_user(&space, &mut buf, VirtAddr(0x1000)).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn unmapped_tail_fails_the_whole_copy() {
        let space = user_space();
        map(&space, 0x1000, 1, MapPermission::R | MapPermission::W);
        let mut buf = [0u8; 16];
        assert_eq!(
            copy_from_user(&space, &mut buf, VirtAddr(0x1ff8)),
            Err(errno::EFAULT)
        );
    }

    #[test]
    fn strcpy_stops_at_nul() {
        let space = user_space();
        map(&space, 0x1000, 2, MapPermission::R | MapPermission::W);
        copy_to_user(&space, VirtAddr(0x1ffe), b"hello\0world").unwrap();
        let s = strcpy_from_user(&space, VirtAddr(0x1ffe)).unwrap();
        assert_eq!(s, b"hello");
    }

    #[test]
    fn strcpy_grows_for_long_strings() {
        let space = user_space();
        map(&space, 0x1000, 2, MapPermission::R | MapPermission::W);
        let long = [b'a'; 1000];
        copy_to_user(&space, VirtAddr(0x1000), &long).unwrap();
        let s = strcpy_from_user(&space, VirtAddr(0x1000)).unwrap();
        assert_eq!(s.len(), 1000);
        assert!(s.iter().all(|&b| b == b'a'));
    }

    #[test]
    fn strcpy_without_nul_faults() {
        let space = user_space();
        map(&space, 0x1000, 1, MapPermission::R | MapPermission::W);
        copy_to_user(&space, VirtAddr(0x1000), &[b'a'; PAGE_SIZE]).unwrap();
        assert_eq!(
            strcpy_from_user(&space, VirtAddr(0x1000)),
            Err(errno::EFAULT)
        );
    }
}
