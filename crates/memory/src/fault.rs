//! 缺页处理

use alloc::sync::Arc;

use common::config::KERNEL_VM_START;
use defines::{
    error::{errno, Error},
    signal::Signal,
};

use crate::{context::CpuContext, VirtAddr};

/// 一次缺页的描述，由陷入处理程序根据 `scause`/`stval` 构造
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub address: VirtAddr,
    pub write: bool,
    pub exec: bool,
    /// 是否发生在用户态
    pub user: bool,
}

impl FaultInfo {
    pub fn user_read(address: VirtAddr) -> Self {
        Self {
            address,
            write: false,
            exec: false,
            user: true,
        }
    }

    pub fn user_write(address: VirtAddr) -> Self {
        Self {
            write: true,
            ..Self::user_read(address)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// 地址不在任何区域内
    Unmapped,
    /// 区域的权限不允许这次访问
    AccessViolation,
    /// VMO 提交页失败
    Commit(Error),
    /// 地址空间正在销毁或者已经销毁
    Inactive,
}

impl FaultError {
    pub fn into_errno(self) -> Error {
        match self {
            FaultError::Commit(e) => e,
            FaultError::Unmapped | FaultError::AccessViolation | FaultError::Inactive => {
                errno::EFAULT
            }
        }
    }

    /// 用户态缺页失败时投递的信号。提交失败（比如读文件出错）也按段错误处理
    pub fn signal(self) -> Signal {
        Signal::SIGSEGV
    }
}

impl CpuContext {
    /// 处理缺页。用户态的失败返回应投递给进程的信号，内核态的失败是致命的
    pub fn handle_page_fault(&self, info: FaultInfo) -> Result<(), Signal> {
        let space = if info.address.0 >= KERNEL_VM_START {
            Arc::clone(self.mm().kernel_space())
        } else {
            self.current()
        };
        trace!(
            "page fault at {:?} in space {}, write: {}, exec: {}, user: {}",
            info.address,
            space.id(),
            info.write,
            info.exec,
            info.user
        );
        match space.fault_in(&info) {
            Ok(_) => Ok(()),
            Err(e) if info.user => {
                let signal = e.signal();
                info!("user page fault at {:?} failed: {e:?}, send {signal:?}", info.address);
                Err(signal)
            }
            Err(e) => panic!("kernel page fault at {:?} failed: {e:?}", info.address),
        }
    }
}
