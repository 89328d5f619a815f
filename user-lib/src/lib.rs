//! 用户态运行时：fork/wait、文件层和 exec，全部只靠 [`SysApi`] 说话。
//!
//! 这层没有任何内核内幕。文件状态块整页搬进搬出，数据页靠 PUT/GET 的
//! 写时复制搬运，会合点上的调和把两边的文件系统捏回一致。

#![no_std]
#![deny(warnings)]

extern crate alloc;

pub mod exec;
pub mod file;
pub mod fork;

use alloc::boxed::Box;
use core::fmt;
use merge_fs::{FileState, FILESVA};
use page_map::{USERHI, USERLO};
use rendezvous::{child_word, Cmd, Sys, SysApi, SysError};

/// 整个用户窗口的起点。
pub const ALLVA: u32 = USERLO;
/// 整个用户窗口的长度。
pub const ALLSIZE: u32 = USERHI - USERLO;

/// 子进程正常退出。
pub const WEXITED: i32 = 0x100;
/// 子进程死于陷阱，低位是陷阱号。
pub const WSIGNALED: i32 = 0x200;

/// 取出退出码。
pub fn wexitstatus(status: i32) -> i32 {
    status & 0xFF
}

/// 用户层错误。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UserError {
    /// 系统调用层出错。
    Sys(SysError),
    /// 路径不存在。
    NotFound,
    /// 已经存在。
    Exists,
    /// inode 表满了。
    NoSpace,
    /// 描述符无效。
    BadFd,
    /// 超出单文件上限。
    TooBig,
    /// 没有可等的子进程。
    NoChild,
    /// 没有空槽。
    Again,
    /// 镜像不像个可执行文件。
    BadImage,
}

impl From<SysError> for UserError {
    fn from(e: SysError) -> Self {
        UserError::Sys(e)
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserError::Sys(e) => write!(f, "{e}"),
            UserError::NotFound => write!(f, "no such file"),
            UserError::Exists => write!(f, "already exists"),
            UserError::NoSpace => write!(f, "inode table full"),
            UserError::BadFd => write!(f, "bad descriptor"),
            UserError::TooBig => write!(f, "file too large"),
            UserError::NoChild => write!(f, "no child to wait for"),
            UserError::Again => write!(f, "no free slot"),
            UserError::BadImage => write!(f, "bad executable image"),
        }
    }
}

/// 用户层结果。
pub type UResult<T> = Result<T, UserError>;

/// 把自己的文件状态块读进来。
pub fn load_state(env: &mut dyn SysApi) -> Sys<Box<FileState>> {
    let mut st = FileState::new_boxed();
    env.mem_read(FILESVA, st.as_bytes_mut())?;
    Ok(st)
}

/// 把文件状态块写回去。
pub fn store_state(env: &mut dyn SysApi, st: &FileState) -> Sys<()> {
    env.mem_write(FILESVA, st.as_bytes())
}

/// 给自己的一段地址弄到读写权限。借 0 号孩子的 GET PERM 实现，
/// 0 号孩子不存在就先用一次空 PUT 把它带出来。
pub fn grant_rw(env: &mut dyn SysApi, va: u32, size: u32) -> Sys<()> {
    env.put(Cmd::PUT, child_word(0, 0), None, None, 0, 0, 0)?;
    env.get(
        Cmd::GET | Cmd::PERM | Cmd::READ | Cmd::WRITE,
        child_word(0, 0),
        None,
        0,
        va,
        size,
    )
}
