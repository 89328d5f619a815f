//! 物理页帧仓库。
//!
//! 页帧按 20 位帧号（[`Pfn`]）寻址。每帧带原子引用计数、`home` 远程引用标记
//! 和只增不减的共享掩码。0 号帧是常驻的共享零页，不参与引用计数。

#![no_std]
#![deny(warnings)]

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// 页帧字节数。
pub const PAGE_SIZE: usize = 4096;

/// 物理页帧号。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Pfn(pub u32);

impl Pfn {
    /// 共享零页。
    pub const ZERO: Self = Self(0);

    /// 作下标用。
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// 是否是零页。
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

struct Frame {
    refs: AtomicU32,
    /// 帧的来历：0 表示本节点所有，否则是始发节点上的远程引用字。
    home: AtomicU32,
    /// 哪些节点可能持有副本。按位或累积，从不清除。
    shared: AtomicU8,
    data: Option<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    fn new(data: Option<Box<[u8; PAGE_SIZE]>>) -> Self {
        Self {
            refs: AtomicU32::new(0),
            home: AtomicU32::new(0),
            shared: AtomicU8::new(0),
            data,
        }
    }
}

/// 页帧仓库。回收栈优先，然后顺序取新帧。
pub struct Arena {
    frames: Vec<Frame>,
    recycled: Vec<u32>,
    limit: u32,
    /// 远程引用字到本地帧的对照表，供迁移拉取复用已有副本。
    rr_map: BTreeMap<u32, Pfn>,
}

impl Arena {
    /// 建一个最多 `limit` 帧的仓库，零页就位。
    pub fn new(limit: usize) -> Self {
        let mut zero = Frame::new(Some(Box::new([0; PAGE_SIZE])));
        *zero.refs.get_mut() = 1;
        let mut frames = Vec::new();
        frames.push(zero);
        Self {
            frames,
            recycled: Vec::new(),
            limit: limit as u32,
            rr_map: BTreeMap::new(),
        }
    }

    /// 取一个清零的新帧，引用计数为 0，由调用者负责 `incref`。
    /// 仓库耗尽时返回 `None`。
    pub fn alloc(&mut self) -> Option<Pfn> {
        let pfn = if let Some(n) = self.recycled.pop() {
            let f = &mut self.frames[n as usize];
            debug_assert!(f.data.is_none());
            f.data = Some(Box::new([0; PAGE_SIZE]));
            *f.refs.get_mut() = 0;
            *f.home.get_mut() = 0;
            *f.shared.get_mut() = 0;
            n
        } else {
            let n = self.frames.len() as u32;
            if n >= self.limit {
                return None;
            }
            self.frames.push(Frame::new(Some(Box::new([0; PAGE_SIZE]))));
            n
        };
        Some(Pfn(pfn))
    }

    /// 引用 +1。零页不计数。
    pub fn incref(&self, pfn: Pfn) {
        if pfn.is_zero() {
            return;
        }
        self.frames[pfn.index()].refs.fetch_add(1, Ordering::AcqRel);
    }

    /// 引用 -1，减到 0 时返回 `true`，此时调用者应当释放该帧
    /// （普通页直接 [`Arena::release`]，页表先递归放掉下级引用）。
    pub fn decref(&self, pfn: Pfn) -> bool {
        if pfn.is_zero() {
            return false;
        }
        let prev = self.frames[pfn.index()].refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "decref of free frame {pfn:?}");
        prev == 1
    }

    /// 当前引用计数。
    pub fn refs(&self, pfn: Pfn) -> u32 {
        self.frames[pfn.index()].refs.load(Ordering::Acquire)
    }

    /// 把计数归零的帧放回回收栈。
    /// 已经跨节点共享过的帧不回收：别的节点手里还有指向它的引用。
    pub fn release(&mut self, pfn: Pfn) {
        assert!(!pfn.is_zero());
        let f = &mut self.frames[pfn.index()];
        assert_eq!(*f.refs.get_mut(), 0, "release of live frame {pfn:?}");
        if *f.shared.get_mut() != 0 {
            return;
        }
        f.data = None;
        self.rr_map.retain(|_, v| *v != pfn);
        self.recycled.push(pfn.0);
    }

    /// 帧在不在（已分配且没被回收）。
    pub fn is_live(&self, pfn: Pfn) -> bool {
        self.frames
            .get(pfn.index())
            .map_or(false, |f| f.data.is_some())
    }

    /// 这个帧从此归本地所有：抹掉来历，从对照表里除名。
    /// 写它之前必须这么做，不然回迁时会被出生地的旧副本盖掉。
    pub fn privatize(&mut self, pfn: Pfn) {
        let h = self.frames[pfn.index()].home.swap(0, Ordering::AcqRel);
        if h != 0 {
            self.rr_map.remove(&h);
        }
    }

    /// 读帧内容。
    pub fn data(&self, pfn: Pfn) -> &[u8; PAGE_SIZE] {
        self.frames[pfn.index()]
            .data
            .as_ref()
            .expect("read of free frame")
    }

    /// 写帧内容。零页只读。
    pub fn data_mut(&mut self, pfn: Pfn) -> &mut [u8; PAGE_SIZE] {
        assert!(!pfn.is_zero(), "write to the zero frame");
        self.frames[pfn.index()]
            .data
            .as_mut()
            .expect("write to free frame")
    }

    /// 复制一份帧内容。绕开同仓库多帧借用的限制。
    pub fn copy_of(&self, pfn: Pfn) -> Box<[u8; PAGE_SIZE]> {
        Box::new(*self.data(pfn))
    }

    /// 帧的来历标记。
    pub fn home(&self, pfn: Pfn) -> u32 {
        self.frames[pfn.index()].home.load(Ordering::Acquire)
    }

    /// 记录帧来自远方。
    pub fn set_home(&self, pfn: Pfn, rr: u32) {
        self.frames[pfn.index()].home.store(rr, Ordering::Release);
    }

    /// 把 `node` 记进共享掩码。节点号 1 起。
    pub fn share_with(&self, pfn: Pfn, node: u8) {
        debug_assert!((1..=8).contains(&node));
        self.frames[pfn.index()]
            .shared
            .fetch_or(1 << (node - 1), Ordering::AcqRel);
    }

    /// 共享掩码。
    pub fn shared_mask(&self, pfn: Pfn) -> u8 {
        self.frames[pfn.index()].shared.load(Ordering::Acquire)
    }

    /// 记录远程引用对应的本地帧。
    pub fn rr_track(&mut self, rr: u32, pfn: Pfn) {
        self.rr_map.insert(rr, pfn);
    }

    /// 查远程引用是否已有本地副本。
    pub fn rr_lookup(&self, rr: u32) -> Option<Pfn> {
        self.rr_map.get(&rr).copied()
    }

    /// 还能分配多少帧。测试用。
    pub fn spare(&self) -> usize {
        (self.limit as usize - self.frames.len()) + self.recycled.len()
    }
}
