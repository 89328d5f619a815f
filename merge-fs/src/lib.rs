//! 父子进程在每个会合点上交换的文件状态区。
//!
//! 每个进程把整个文件系统装在一块定址的状态区里：inode 表、打开的
//! 描述符表、孩子记账槽和退出标志。第 `i` 个 inode 的数据固定住在
//! `file_data(i)` 那扇窗里，所以整个文件在地址空间之间就是一段普通的
//! 页面搬运，不需要任何间接。区里的字段全是小整数，分叉时按页复制
//! 出来的那份可以直接按原样解释。

#![no_std]
#![deny(warnings)]

extern crate alloc;

use alloc::boxed::Box;
use bitflags::bitflags;
use page_map::PT_SIZE;

/// inode 总数，含保留的 0 号。
pub const FILE_INODES: usize = 64;
/// 名字的字节预算，结尾符在内。
pub const NAME_MAX: usize = 56;
/// 描述符表的大小。
pub const FD_COUNT: usize = 16;
/// 孩子记账槽数。0 号槽留给 exec 当草稿。
pub const CHILD_SLOTS: usize = 32;

/// 控制台输入。
pub const INO_CONSIN: u32 = 1;
/// 控制台输出。
pub const INO_CONSOUT: u32 = 2;
/// 根目录。
pub const INO_ROOTDIR: u32 = 3;
/// 第一个通用 inode。
pub const INO_GENERAL: u32 = 4;

/// 状态区在每个地址空间里的固定位置。
pub const FILESVA: u32 = 0x8000_0000;
/// 单个文件不许超出自己那扇数据窗。
pub const FILE_MAXSIZE: u32 = PT_SIZE as u32;

/// 第 `ino` 个 inode 的数据窗。
pub const fn file_data(ino: u32) -> u32 {
    FILESVA + ino * PT_SIZE as u32
}

bitflags! {
    /// inode 模式位。模式为零表示空闲或已删除。
    pub struct FileMode: u32 {
        /// 常规文件。
        const REG = 1 << 8;
        /// 目录。
        const DIR = 1 << 9;
        /// 符号链接。
        const LNK = 1 << 10;
        /// 调和不了的分歧，已经打上冲突标记。
        const CONF = 1 << 11;
        /// 部分文件：外界会往里追加（控制台输入）。
        const PART = 1 << 12;
    }
}

bitflags! {
    /// 打开标志。
    pub struct OpenFlags: u32 {
        /// 读。
        const RDONLY = 1 << 0;
        /// 写。
        const WRONLY = 1 << 1;
        /// 写都落在末尾。
        const APPEND = 1 << 4;
        /// 没有就建。
        const CREAT = 1 << 8;
        /// 打开即清空。
        const TRUNC = 1 << 9;
        /// 已经存在就报错。
        const EXCL = 1 << 10;

        /// 可读可写。
        const RDWR = Self::RDONLY.bits | Self::WRONLY.bits;
    }
}

/// 一个打开的描述符。
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct FdEntry {
    /// 对应的 inode，0 表示描述符空着。
    pub ino: u32,
    /// [`OpenFlags`] 位。
    pub flags: u32,
    /// 当前读写位置。
    pub ofs: u32,
}

/// 一个 inode。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct FileInode {
    /// 目录项名字，以 NUL 结尾。空名表示从未用过。
    pub name: [u8; NAME_MAX],
    /// 所在目录的 inode。
    pub dino: u32,
    /// [`FileMode`] 位，0 表示已删除。
    pub mode: u32,
    /// 版本号，任何非追加修改都把它加一。
    pub ver: u32,
    /// 当前长度，按字节。
    pub size: u32,
    /// 子进程里：家长那边对应的 inode 下标，0 表示还不知道。
    pub rino: u32,
    /// 子进程里：上次同步时看到的版本。
    pub rver: u32,
    /// 子进程里：上次同步时看到的长度。
    pub rlen: u32,
}

impl FileInode {
    /// 从未用过的 inode。
    pub const EMPTY: Self = Self {
        name: [0; NAME_MAX],
        dino: 0,
        mode: 0,
        ver: 0,
        size: 0,
        rino: 0,
        rver: 0,
        rlen: 0,
    };

    /// 名字的字符串视图，到结尾符为止。
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// 存个名字，装不下就截断。
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_MAX];
        let n = name.len().min(NAME_MAX - 1);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// 模式位的类型化视图。
    pub fn mode(&self) -> FileMode {
        FileMode::from_bits_truncate(self.mode)
    }

    /// 有名字而且还活着。
    pub fn is_alloced(&self) -> bool {
        self.name[0] != 0 && self.mode != 0
    }
}

/// 孩子槽的状态，由用户态的 fork 运行时记在状态区里。
pub const CHILD_FREE: u32 = 0;
/// 保留着，永远不分叉进去（0 号槽）。
pub const CHILD_RESERVED: u32 = 1;
/// 分叉出去的孩子，可以等它。
pub const CHILD_FORKED: u32 = 2;

/// 每个孩子一格的记账。
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct ChildSlot {
    /// `CHILD_*` 状态之一。
    pub state: u32,
}

/// 整个状态区。住在 [`FILESVA`]。
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FileState {
    /// 打开的描述符。0 是控制台输入，1 和 2 是控制台输出。
    pub fd: [FdEntry; FD_COUNT],
    /// inode 表。0 号保留。
    pub fi: [FileInode; FILE_INODES],
    /// 孩子记账。
    pub child: [ChildSlot; CHILD_SLOTS],
    /// 当前工作目录的 inode。
    pub cwd: u32,
    /// 进程调过 exit 之后非零。
    pub exited: u32,
    /// 退出状态。
    pub status: u32,
}

/// 状态区的字节数。
pub const STATE_SIZE: usize = core::mem::size_of::<FileState>();
/// 凑整到整页；授权和复制都按这个量。
pub const STATE_PAGES: u32 = ((STATE_SIZE + page_map::PAGE_SIZE - 1)
    & !(page_map::PAGE_SIZE - 1)) as u32;

const _: () = assert!(STATE_SIZE <= PT_SIZE);
const _: () = assert!(core::mem::align_of::<FileState>() == 4);

impl FileState {
    /// 堆上一块清零的状态区。
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self {
            fd: [FdEntry::default(); FD_COUNT],
            fi: [FileInode::EMPTY; FILE_INODES],
            child: [ChildSlot::default(); CHILD_SLOTS],
            cwd: 0,
            exited: 0,
            status: 0,
        })
    }

    /// 整块搬运用的原始视图。字段全是小整数，
    /// 读回来的任何字节样式都是一块合法的状态区。
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, STATE_SIZE) }
    }

    /// 可写的原始视图。
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self as *mut Self as *mut u8, STATE_SIZE) }
    }

    /// 按根进程的开局摆好：控制台 inode、标准描述符、
    /// 根目录和保留的 0 号孩子。
    pub fn init_root(&mut self) {
        self.fd[0] = FdEntry {
            ino: INO_CONSIN,
            flags: OpenFlags::RDONLY.bits(),
            ofs: 0,
        };
        for fd in [1, 2] {
            self.fd[fd] = FdEntry {
                ino: INO_CONSOUT,
                flags: (OpenFlags::WRONLY | OpenFlags::APPEND).bits(),
                ofs: 0,
            };
        }
        let consin = &mut self.fi[INO_CONSIN as usize];
        consin.set_name("consin");
        consin.dino = INO_ROOTDIR;
        consin.mode = (FileMode::REG | FileMode::PART).bits();
        let consout = &mut self.fi[INO_CONSOUT as usize];
        consout.set_name("consout");
        consout.dino = INO_ROOTDIR;
        consout.mode = FileMode::REG.bits();
        let root = &mut self.fi[INO_ROOTDIR as usize];
        root.set_name("/");
        root.dino = INO_ROOTDIR;
        root.mode = FileMode::DIR.bits();
        self.cwd = INO_ROOTDIR;
        self.child[0].state = CHILD_RESERVED;
    }

    /// 在目录 `dino` 下找一个还活着、名叫 `name` 的条目。
    pub fn lookup(&self, dino: u32, name: &str) -> Option<u32> {
        (1..FILE_INODES as u32)
            .find(|&i| {
                let fi = &self.fi[i as usize];
                fi.name[0] != 0 && fi.dino == dino && fi.mode != 0 && fi.name_str() == name
            })
    }

    /// 在 `dino` 下找到或建出一个叫 `name` 的 inode。新生的 inode 模式
    /// 和版本都是零，成什么样由创建者决定。表满了给 `None`。
    pub fn create(&mut self, dino: u32, name: &str) -> Option<u32> {
        if name.is_empty() {
            return None;
        }
        if let Some(ino) = self.lookup(dino, name) {
            return Some(ino);
        }
        let ino = (INO_GENERAL..FILE_INODES as u32)
            .find(|&i| self.fi[i as usize].name[0] == 0)?;
        let fi = &mut self.fi[ino as usize];
        *fi = FileInode::EMPTY;
        fi.set_name(name);
        fi.dino = dino;
        Some(ino)
    }

    /// 目录 `dino` 下还活着的条目。
    pub fn dir_entries(&self, dino: u32) -> impl Iterator<Item = u32> + '_ {
        (1..FILE_INODES as u32).filter(move |&i| {
            let fi = &self.fi[i as usize];
            fi.is_alloced() && fi.dino == dino && i != dino
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_block_shape() {
        let mut st = FileState::new_boxed();
        st.init_root();
        assert_eq!(st.fi[INO_CONSIN as usize].name_str(), "consin");
        assert!(st.fi[INO_CONSIN as usize].mode().contains(FileMode::PART));
        assert_eq!(st.fi[INO_ROOTDIR as usize].dino, INO_ROOTDIR);
        assert_eq!(st.cwd, INO_ROOTDIR);
        assert_eq!(st.child[0].state, CHILD_RESERVED);
        assert_eq!(st.fd[1].ino, INO_CONSOUT);
    }

    #[test]
    fn create_is_idempotent_by_name() {
        let mut st = FileState::new_boxed();
        st.init_root();
        let a = st.create(INO_ROOTDIR, "log").unwrap();
        st.fi[a as usize].mode = FileMode::REG.bits();
        let b = st.create(INO_ROOTDIR, "log").unwrap();
        assert_eq!(a, b);
        assert!(a >= INO_GENERAL);
        assert_eq!(st.lookup(INO_ROOTDIR, "log"), Some(a));
        assert_eq!(st.lookup(INO_ROOTDIR, "nope"), None);
    }

    #[test]
    fn table_fills_up() {
        let mut st = FileState::new_boxed();
        st.init_root();
        let mut made = 0;
        let mut name = alloc::string::String::new();
        for i in 0..FILE_INODES {
            use core::fmt::Write;
            name.clear();
            write!(name, "f{i}").unwrap();
            if let Some(ino) = st.create(INO_ROOTDIR, &name) {
                st.fi[ino as usize].mode = FileMode::REG.bits();
                made += 1;
            }
        }
        assert_eq!(made, FILE_INODES - INO_GENERAL as usize);
        assert!(st.create(INO_ROOTDIR, "overflow").is_none());
    }

    #[test]
    fn byte_view_roundtrips() {
        let mut st = FileState::new_boxed();
        st.init_root();
        st.fi[5].set_name("x");
        st.fi[5].mode = FileMode::REG.bits();
        st.fi[5].ver = 7;
        let bytes: alloc::vec::Vec<u8> = st.as_bytes().to_vec();
        let mut st2 = FileState::new_boxed();
        st2.as_bytes_mut().copy_from_slice(&bytes);
        assert_eq!(st2.fi[5].ver, 7);
        assert_eq!(st2.fi[5].name_str(), "x");
        assert_eq!(st2.cwd, INO_ROOTDIR);
    }

    #[test]
    fn data_windows_do_not_overlap_state() {
        assert!(STATE_SIZE as u32 <= file_data(1) - FILESVA);
        assert_eq!(file_data(2) - file_data(1), PT_SIZE as u32);
    }
}
