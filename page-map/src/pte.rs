//! 页表项：一个 32 位格子。
//!
//! 高 20 位是载荷，低 12 位是标志。本地映射的载荷就是帧号；
//! `REMOTE` 置位时载荷是 `(节点 << 16) | 对方帧号`，此时硬件存在位必须清零。

use bitflags::bitflags;
use frame_alloc::Pfn;

bitflags! {
    /// 页表项标志位。
    pub struct PteFlags: u32 {
        /// 硬件存在位。
        const P = 1 << 0;
        /// 硬件可写位。写时复制会把它清掉。
        const W = 1 << 1;
        /// 用户可见。
        const U = 1 << 2;
        /// 访问过。
        const A = 1 << 5;
        /// 写过。
        const D = 1 << 6;
        /// 4 MiB 大页（只出现在内核窗口的目录项里）。
        const PS = 1 << 7;
        /// 全局映射，切换根时不失效。不得泄漏到线上。
        const G = 1 << 8;
        /// 名义读权限，软件语义。
        const SYS_READ = 1 << 9;
        /// 名义写权限。硬件 `W` 清零时它可以仍然置位，由缺页处理调和。
        const SYS_WRITE = 1 << 10;
        /// 远程引用标记。
        const REMOTE = 1 << 11;

        /// 两个名义权限位合在一起，可以直接从系统调用命令字里掩出来。
        const SYS_RW = Self::SYS_READ.bits | Self::SYS_WRITE.bits;
        /// 随远程引用一起传走的权限位。
        const RR_RW = Self::SYS_RW.bits | Self::W.bits;
    }
}

/// 页表项（页目录项同构）。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pte(pub u32);

/// 对格子的分类视图，代替到处散落的位测试。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PteKind {
    /// 载荷指向零页。标志里有没有 `P` 决定它是「缺页」还是「只读零页」。
    Zero,
    /// 本地帧。
    Local(Pfn),
    /// 远程引用。
    Remote(Rr),
}

impl Pte {
    /// 空项。全零，指向零页且不存在。
    pub const ZERO: Self = Self(0);

    /// 由帧号和标志组装。
    #[inline]
    pub fn new(pfn: Pfn, flags: PteFlags) -> Self {
        Self((pfn.0 << 12) | flags.bits())
    }

    /// 载荷解释为本地帧号。
    #[inline]
    pub fn pfn(self) -> Pfn {
        Pfn(self.0 >> 12)
    }

    /// 标志位。
    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// 是否带有全部给定标志。
    #[inline]
    pub fn has(self, f: PteFlags) -> bool {
        self.flags().contains(f)
    }

    /// 置位。
    #[inline]
    pub fn set(self, f: PteFlags) -> Self {
        Self(self.0 | f.bits())
    }

    /// 清位。
    #[inline]
    pub fn clear(self, f: PteFlags) -> Self {
        Self(self.0 & !f.bits())
    }

    /// 分类。
    pub fn kind(self) -> PteKind {
        if self.has(PteFlags::REMOTE) {
            PteKind::Remote(Rr(self.0))
        } else if self.pfn().is_zero() {
            PteKind::Zero
        } else {
            PteKind::Local(self.pfn())
        }
    }
}

impl From<Rr> for Pte {
    fn from(rr: Rr) -> Self {
        Self(rr.0)
    }
}

/// 远程引用：`(节点, 对方帧号, 权限)` 打包成一个字，是能力而不是指针。
///
/// 位布局与页表项一致，因此可以原样存进迁移进程的页表格子里。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Rr(pub u32);

impl Rr {
    /// 打包。节点 1..=8，帧号 16 位。
    pub fn cons(node: u8, pfn: u32, rw: PteFlags) -> Self {
        debug_assert!(node >= 1 && node <= 8);
        debug_assert!(pfn < 1 << 16);
        Self(
            ((node as u32) << 28)
                | (pfn << 12)
                | (rw & PteFlags::RR_RW).bits()
                | PteFlags::REMOTE.bits(),
        )
    }

    /// 零地址引用：对方那边是零映射，只携带权限。
    pub fn zero(rw: PteFlags) -> Self {
        Self((rw & PteFlags::RR_RW).bits() | PteFlags::REMOTE.bits())
    }

    /// 始发节点。
    #[inline]
    pub fn node(self) -> u8 {
        (self.0 >> 28) as u8
    }

    /// 对方节点上的帧号。
    #[inline]
    pub fn pfn(self) -> u32 {
        (self.0 >> 12) & 0xFFFF
    }

    /// 地址部分是否为零。
    #[inline]
    pub fn is_zero_addr(self) -> bool {
        self.node() == 0 && self.pfn() == 0
    }

    /// 携带的权限位。
    #[inline]
    pub fn rw(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0) & PteFlags::RR_RW
    }
}
