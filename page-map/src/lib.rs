//! 页表管理：写时复制、名义权限叠加和字节级三路归并。
//!
//! 32 位虚地址空间，4 KiB 页，4 MiB 一张页表。页目录和页表本身也是
//! [`frame_alloc`] 里的帧，因此可以被引用计数、共享和随迁移搬运。

#![no_std]
#![deny(warnings)]

extern crate alloc;

mod dir;
mod pte;

pub use dir::{
    boot_pde, copy, free_dir, insert, merge, new_dir, page_fault, rd, remove, setperm,
    translate, walk, wr, FaultFix, PageDir,
};
pub use pte::{Pte, PteFlags, PteKind, Rr};

/// 页大小。
pub const PAGE_SIZE: usize = 4096;
/// 一张页表覆盖的范围，4 MiB。
pub const PT_SIZE: usize = 4 << 20;
/// 每张表（和目录）的格子数。
pub const ENTRIES: usize = 1024;

/// 用户窗口下界。
pub const USERLO: u32 = 0x4000_0000;
/// 用户窗口上界，同时是栈顶。
pub const USERHI: u32 = 0xF000_0000;
/// 暂存区下界，等待和装载都用它。
pub const SCRATCHLO: u32 = 0x7000_0000;
/// 暂存区上界。
pub const SCRATCHHI: u32 = 0x8000_0000;
/// 栈顶。
pub const STACKHI: u32 = USERHI;

/// 目录下标。
#[inline]
pub const fn pdx(va: u32) -> usize {
    (va >> 22) as usize
}

/// 表内下标。
#[inline]
pub const fn ptx(va: u32) -> usize {
    ((va >> 12) & 0x3FF) as usize
}

/// 向下对齐到 4 MiB。
#[inline]
pub const fn ptaddr(va: u32) -> u32 {
    va & !(PT_SIZE as u32 - 1)
}

/// 地址段是否完全落在用户窗口里。
pub fn user_range_ok(va: u32, size: u32) -> bool {
    va >= USERLO && va < USERHI && (va as u64 + size as u64) <= USERHI as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_alloc::{Arena, Pfn};

    const LO: u32 = USERLO;

    fn read_byte(arena: &mut Arena, pd: PageDir, va: u32) -> u8 {
        let pfn = translate(arena, pd, va, PteFlags::empty()).expect("unmapped");
        arena.data(pfn)[(va as usize) % PAGE_SIZE]
    }

    /// 写一个字节，像硬件那样先试、缺页就走内核修复再试。
    fn write_byte(arena: &mut Arena, pd: PageDir, va: u32, val: u8) {
        for _ in 0..2 {
            if let Some(pfn) = translate(arena, pd, va, PteFlags::W) {
                arena.data_mut(pfn)[(va as usize) % PAGE_SIZE] = val;
                return;
            }
            assert_eq!(page_fault(arena, pd, va), FaultFix::Fixed);
        }
        panic!("write_byte did not settle at {va:#x}");
    }

    #[test]
    fn insert_remove_refcounts() {
        let mut arena = Arena::new(16);
        let pd = new_dir(&mut arena).unwrap();
        let p1 = arena.alloc().unwrap();
        let p2 = arena.alloc().unwrap();

        assert!(insert(&mut arena, pd, p1, LO, PteFlags::U).is_some());
        assert_eq!(arena.refs(p1), 1);
        // 同帧重插不丢帧
        assert!(insert(&mut arena, pd, p1, LO, PteFlags::U).is_some());
        assert_eq!(arena.refs(p1), 1);
        // 顶掉旧映射
        assert!(insert(&mut arena, pd, p2, LO, PteFlags::U).is_some());
        assert_eq!(arena.refs(p1), 0);
        assert_eq!(arena.refs(p2), 1);

        remove(&mut arena, pd, LO, PAGE_SIZE as u32);
        assert_eq!(arena.refs(p2), 0);
        assert!(translate(&mut arena, pd, LO, PteFlags::empty()).is_none());
    }

    #[test]
    fn remove_covering_whole_table_drops_it() {
        let mut arena = Arena::new(16);
        let pd = new_dir(&mut arena).unwrap();
        let p = arena.alloc().unwrap();
        insert(&mut arena, pd, p, LO, PteFlags::U).unwrap();
        insert(&mut arena, pd, p, LO + PT_SIZE as u32 - PAGE_SIZE as u32, PteFlags::U).unwrap();
        assert_eq!(arena.refs(p), 2);
        let spare = arena.spare();
        remove(&mut arena, pd, LO, PT_SIZE as u32);
        assert_eq!(arena.refs(p), 0);
        // 数据页和整张页表都回收了
        assert_eq!(arena.spare(), spare + 2);
    }

    #[test]
    fn walk_adjacent_pages_share_table() {
        let mut arena = Arena::new(16);
        let pd = new_dir(&mut arena).unwrap();
        let (t1, i1) = walk(&mut arena, pd, LO, true).unwrap();
        let (t2, i2) = walk(&mut arena, pd, LO + PAGE_SIZE as u32, true).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(i2, i1 + 1);
    }

    #[test]
    fn setperm_maps_zero_and_defers_write() {
        let mut arena = Arena::new(16);
        let pd = new_dir(&mut arena).unwrap();
        setperm(&mut arena, pd, LO, PAGE_SIZE as u32, PteFlags::SYS_READ).unwrap();
        assert_eq!(read_byte(&mut arena, pd, LO), 0);
        // 只读零页上的写必须反射
        assert_eq!(page_fault(&mut arena, pd, LO), FaultFix::Reflect);

        setperm(&mut arena, pd, LO, PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        let (tab, idx) = walk(&mut arena, pd, LO, false).unwrap();
        // 硬件可写位推迟到缺页时才给
        assert!(!rd(&arena, tab, idx).has(PteFlags::W));
        write_byte(&mut arena, pd, LO, 7);
        assert_eq!(read_byte(&mut arena, pd, LO), 7);
        // 零页本身未被污染
        assert_eq!(arena.data(Pfn::ZERO)[0], 0);
    }

    #[test]
    fn cow_copy_isolates_both_sides() {
        let mut arena = Arena::new(32);
        let a = new_dir(&mut arena).unwrap();
        let b = new_dir(&mut arena).unwrap();
        setperm(&mut arena, a, LO, PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        write_byte(&mut arena, a, LO, 0x11);

        copy(&mut arena, a, LO, b, LO, PT_SIZE as u32);
        // 两边读到同一个字节
        assert_eq!(read_byte(&mut arena, a, LO), 0x11);
        assert_eq!(read_byte(&mut arena, b, LO), 0x11);

        // 写 a，b 不受影响
        write_byte(&mut arena, a, LO, 0x22);
        assert_eq!(read_byte(&mut arena, a, LO), 0x22);
        assert_eq!(read_byte(&mut arena, b, LO), 0x11);

        // 写 b，a 不受影响
        write_byte(&mut arena, b, LO, 0x33);
        assert_eq!(read_byte(&mut arena, b, LO), 0x33);
        assert_eq!(read_byte(&mut arena, a, LO), 0x22);
    }

    fn snap_of(arena: &mut Arena, src: PageDir) -> PageDir {
        let r = new_dir(arena).unwrap();
        copy(arena, src, LO, r, LO, PT_SIZE as u32);
        r
    }

    #[test]
    fn merge_takes_disjoint_changes() {
        let mut arena = Arena::new(64);
        let base = new_dir(&mut arena).unwrap();
        setperm(&mut arena, base, LO, 2 * PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        write_byte(&mut arena, base, LO, 1);
        write_byte(&mut arena, base, LO + PAGE_SIZE as u32, 2);

        // 快照，然后派生出两个都继承快照的空间
        let snap = snap_of(&mut arena, base);
        let child = new_dir(&mut arena).unwrap();
        copy(&mut arena, base, LO, child, LO, PT_SIZE as u32);

        // 两边改不同字节
        write_byte(&mut arena, child, LO, 0xC1);
        write_byte(&mut arena, base, LO + PAGE_SIZE as u32, 0xB2);

        assert!(!merge(&mut arena, snap, child, LO, base, LO, PT_SIZE as u32));
        assert_eq!(read_byte(&mut arena, base, LO), 0xC1);
        assert_eq!(read_byte(&mut arena, base, LO + PAGE_SIZE as u32), 0xB2);
    }

    #[test]
    fn merge_same_byte_same_value_is_quiet() {
        let mut arena = Arena::new(64);
        let base = new_dir(&mut arena).unwrap();
        setperm(&mut arena, base, LO, PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        write_byte(&mut arena, base, LO, 1);
        let snap = snap_of(&mut arena, base);
        let child = new_dir(&mut arena).unwrap();
        copy(&mut arena, base, LO, child, LO, PT_SIZE as u32);

        write_byte(&mut arena, child, LO, 9);
        write_byte(&mut arena, base, LO, 9);
        assert!(!merge(&mut arena, snap, child, LO, base, LO, PT_SIZE as u32));
        assert_eq!(read_byte(&mut arena, base, LO), 9);
    }

    #[test]
    fn merge_conflict_clears_destination_page() {
        let mut arena = Arena::new(64);
        let base = new_dir(&mut arena).unwrap();
        setperm(&mut arena, base, LO, PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        write_byte(&mut arena, base, LO, 1);
        let snap = snap_of(&mut arena, base);
        let child = new_dir(&mut arena).unwrap();
        copy(&mut arena, base, LO, child, LO, PT_SIZE as u32);

        write_byte(&mut arena, child, LO, 0xAA);
        write_byte(&mut arena, base, LO, 0xBB);
        assert!(merge(&mut arena, snap, child, LO, base, LO, PT_SIZE as u32));
        // 目的页整页清空
        let (tab, idx) = walk(&mut arena, base, LO, false).unwrap();
        assert_eq!(rd(&arena, tab, idx), Pte::ZERO);
    }

    #[test]
    fn merge_commutes_on_disjoint_appends() {
        // 两个方向各归并一次，最终两边字节一致
        let mut arena = Arena::new(96);
        let base = new_dir(&mut arena).unwrap();
        setperm(&mut arena, base, LO, 4 * PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        write_byte(&mut arena, base, LO, 0x10);
        let snap = snap_of(&mut arena, base);
        let child = new_dir(&mut arena).unwrap();
        copy(&mut arena, base, LO, child, LO, PT_SIZE as u32);

        write_byte(&mut arena, child, LO + PAGE_SIZE as u32, 0xC0);
        write_byte(&mut arena, base, LO + 2 * PAGE_SIZE as u32, 0xB0);

        assert!(!merge(&mut arena, snap, child, LO, base, LO, PT_SIZE as u32));
        assert!(!merge(&mut arena, snap, base, LO, child, LO, PT_SIZE as u32));
        for off in [0, PAGE_SIZE as u32, 2 * PAGE_SIZE as u32] {
            assert_eq!(
                read_byte(&mut arena, base, LO + off),
                read_byte(&mut arena, child, LO + off),
            );
        }
    }

    #[test]
    fn fault_preserves_nominal_bits() {
        let mut arena = Arena::new(16);
        let pd = new_dir(&mut arena).unwrap();
        setperm(&mut arena, pd, LO, PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        assert_eq!(page_fault(&mut arena, pd, LO), FaultFix::Fixed);
        let (tab, idx) = walk(&mut arena, pd, LO, false).unwrap();
        let e = rd(&arena, tab, idx);
        assert!(e.has(PteFlags::SYS_READ | PteFlags::SYS_WRITE | PteFlags::W | PteFlags::P));
    }

    #[test]
    fn free_dir_reclaims_everything() {
        let mut arena = Arena::new(32);
        let spare0 = arena.spare();
        let pd = new_dir(&mut arena).unwrap();
        setperm(&mut arena, pd, LO, 4 * PAGE_SIZE as u32, PteFlags::SYS_RW).unwrap();
        for i in 0..4u32 {
            write_byte(&mut arena, pd, LO + i * PAGE_SIZE as u32, i as u8 + 1);
        }
        free_dir(&mut arena, pd);
        assert_eq!(arena.spare(), spare0);
    }
}
