//! 两级页表上的操作：查、插、删、写时复制、名义权限和三路归并。

use crate::{pdx, ptaddr, ptx, ENTRIES, PAGE_SIZE, PT_SIZE, USERHI, USERLO};
use crate::{Pte, PteFlags, PteKind};
use frame_alloc::{Arena, Pfn};

/// 页目录句柄，就是根帧号。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageDir(pub Pfn);

/// 缺页处理的结论。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultFix {
    /// 内核悄悄修好了，重试即可。
    Fixed,
    /// 不是写时复制，该怪用户。
    Reflect,
}

/// 读一个格子。
pub fn rd(arena: &Arena, table: Pfn, idx: usize) -> Pte {
    let d = arena.data(table);
    let o = idx * 4;
    Pte(u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]))
}

/// 写一个格子。
pub fn wr(arena: &mut Arena, table: Pfn, idx: usize, pte: Pte) {
    let d = arena.data_mut(table);
    d[idx * 4..idx * 4 + 4].copy_from_slice(&pte.0.to_le_bytes());
}

/// 启动模板里第 `slot` 个目录项。用户窗口全空，其余是全局大页恒等映射。
pub fn boot_pde(slot: usize) -> Pte {
    if (pdx(USERLO)..pdx(USERHI)).contains(&slot) {
        Pte::ZERO
    } else {
        Pte((slot as u32) << 22)
            .set(PteFlags::P | PteFlags::W | PteFlags::PS | PteFlags::G)
    }
}

/// 新建页目录，按启动模板初始化，引用计数 1。
pub fn new_dir(arena: &mut Arena) -> Option<PageDir> {
    let root = arena.alloc()?;
    arena.incref(root);
    for slot in 0..ENTRIES {
        wr(arena, root, slot, boot_pde(slot));
    }
    Some(PageDir(root))
}

/// 释放页目录连同其中全部页表和映射。
pub fn free_dir(arena: &mut Arena, pd: PageDir) {
    remove(arena, pd, USERLO, USERHI - USERLO);
    if arena.decref(pd.0) {
        arena.release(pd.0);
    }
}

/// 释放一张引用已归零的页表：放掉每个本地映射，然后归还表帧。
fn drop_table(arena: &mut Arena, ptab: Pfn) {
    for i in 0..ENTRIES {
        if let PteKind::Local(pfn) = rd(arena, ptab, i).kind() {
            if arena.decref(pfn) {
                arena.release(pfn);
            }
        }
    }
    arena.release(ptab);
}

/// 找到 `va` 对应的叶子格，返回（表帧，表内下标）。
///
/// 缺表时：不写返回 `None`；要写就分配一张新表。表读共享而又要写时，
/// 独占的表把每一项就地降为只读，共享的表拷一份私有副本。
pub fn walk(arena: &mut Arena, pd: PageDir, va: u32, writing: bool) -> Option<(Pfn, usize)> {
    assert!((USERLO..USERHI).contains(&va));
    let slot = pdx(va);
    let pde = rd(arena, pd.0, slot);
    match pde.kind() {
        PteKind::Local(tab) if pde.has(PteFlags::P) => {
            let mut tab = tab;
            if writing {
                if !pde.has(PteFlags::W) {
                    if arena.refs(tab) == 1 {
                        // 写保护下推到叶子
                        for i in 0..ENTRIES {
                            let e = rd(arena, tab, i);
                            wr(arena, tab, i, e.clear(PteFlags::W));
                        }
                    } else {
                        let new = arena.alloc()?;
                        arena.incref(new);
                        for i in 0..ENTRIES {
                            let e = rd(arena, tab, i);
                            if let PteKind::Local(pfn) = e.kind() {
                                arena.incref(pfn);
                            }
                            wr(arena, new, i, e.clear(PteFlags::W));
                        }
                        if arena.decref(tab) {
                            drop_table(arena, tab);
                        }
                        tab = new;
                    }
                }
                wr(
                    arena,
                    pd.0,
                    slot,
                    Pte::new(tab, PteFlags::P | PteFlags::U | PteFlags::A | PteFlags::W),
                );
            }
            Some((tab, ptx(va)))
        }
        PteKind::Remote(_) => None,
        _ => {
            if !writing {
                return None;
            }
            let tab = arena.alloc()?;
            arena.incref(tab);
            wr(
                arena,
                pd.0,
                slot,
                Pte::new(tab, PteFlags::P | PteFlags::U | PteFlags::A | PteFlags::W),
            );
            Some((tab, ptx(va)))
        }
    }
}

/// 把帧 `pfn` 以 `perm | P` 映射到 `va`，顶掉旧映射。`None` 表示没帧可用。
pub fn insert(arena: &mut Arena, pd: PageDir, pfn: Pfn, va: u32, perm: PteFlags) -> Option<()> {
    let (tab, idx) = walk(arena, pd, va, true)?;
    // 同帧重插时先加后减，计数不会中途归零
    arena.incref(pfn);
    if let PteKind::Local(old) = rd(arena, tab, idx).kind() {
        if arena.decref(old) {
            arena.release(old);
        }
    }
    wr(arena, tab, idx, Pte::new(pfn, perm | PteFlags::P));
    Some(())
}

/// 解除 `[va, va+size)` 的映射。页对齐。正好盖满整张表时直接摘表。
pub fn remove(arena: &mut Arena, pd: PageDir, va: u32, size: u32) {
    assert_eq!(va % PAGE_SIZE as u32, 0);
    assert_eq!(size % PAGE_SIZE as u32, 0);
    assert!((USERLO..USERHI).contains(&va));
    assert!(size <= USERHI - va);

    let mut start = va;
    let end = va + size;
    while start < end {
        let slot = pdx(start);
        let pde = rd(arena, pd.0, slot);
        match pde.kind() {
            PteKind::Zero => {
                start = ptaddr(start) + PT_SIZE as u32;
                continue;
            }
            PteKind::Remote(_) => {
                // 远程引用不占本地帧，清掉即可
                wr(arena, pd.0, slot, Pte::ZERO);
                start = ptaddr(start) + PT_SIZE as u32;
                continue;
            }
            PteKind::Local(tab) => {
                if ptx(start) != 0 || start + PT_SIZE as u32 > end {
                    // 只盖住表的一部分，逐项删
                    let (tab, mut idx) = walk(arena, pd, start, true).expect("out of frames");
                    while start < end {
                        if let PteKind::Local(pfn) = rd(arena, tab, idx).kind() {
                            if arena.decref(pfn) {
                                arena.release(pfn);
                            }
                        }
                        wr(arena, tab, idx, Pte::ZERO);
                        start += PAGE_SIZE as u32;
                        idx += 1;
                        if idx == ENTRIES {
                            break;
                        }
                    }
                    continue;
                }
                // 整表摘除
                if arena.decref(tab) {
                    drop_table(arena, tab);
                }
                wr(arena, pd.0, slot, Pte::ZERO);
                start += PT_SIZE as u32;
            }
        }
    }
}

/// 按写时复制从 `spd` 向 `dpd` 复制一段映射。三个参数都要 4 MiB 对齐。
/// 只搬目录项并给页表加引用，两边的目录项同时清掉硬件可写位。
pub fn copy(arena: &mut Arena, spd: PageDir, sva: u32, dpd: PageDir, dva: u32, size: u32) {
    assert_eq!(sva % PT_SIZE as u32, 0);
    assert_eq!(dva % PT_SIZE as u32, 0);
    assert_eq!(size % PT_SIZE as u32, 0);
    assert!((USERLO..USERHI).contains(&sva) && size <= USERHI - sva);
    assert!((USERLO..USERHI).contains(&dva) && size <= USERHI - dva);

    let slots = size as usize / PT_SIZE;
    for i in 0..slots {
        let sslot = pdx(sva) + i;
        let dslot = pdx(dva) + i;
        let spde = rd(arena, spd.0, sslot);
        if let PteKind::Local(tab) = spde.kind() {
            arena.incref(tab);
        }
        let dpde = rd(arena, dpd.0, dslot);
        if dpde.has(PteFlags::P) {
            remove(arena, dpd, dva + (i * PT_SIZE) as u32, PT_SIZE as u32);
        }
        let shared = spde.clear(PteFlags::W);
        wr(arena, spd.0, sslot, shared);
        wr(arena, dpd.0, dslot, shared);
    }
}

/// 设置 `[va, va+size)` 每页的名义权限。
///
/// 给缺页加 `SYS_READ` 会把零页只读映射进来；加 `SYS_WRITE` 不立即给页，
/// 零页的复制推迟到真正写它的那次缺页。
pub fn setperm(arena: &mut Arena, pd: PageDir, va: u32, size: u32, perm: PteFlags) -> Option<()> {
    assert_eq!(va % PAGE_SIZE as u32, 0);
    assert_eq!(size % PAGE_SIZE as u32, 0);
    assert!((USERLO..USERHI).contains(&va));
    assert!(size <= USERHI - va);
    assert!(PteFlags::SYS_RW.contains(perm));

    let mut start = va;
    let end = va + size;
    while start < end {
        let pde = rd(arena, pd.0, pdx(start));
        if pde == Pte::ZERO && !perm.contains(PteFlags::SYS_READ) {
            // 本来就没有的东西不用再收权限
            start = ptaddr(start) + PT_SIZE as u32;
            continue;
        }
        let (tab, mut idx) = walk(arena, pd, start, true)?;
        while start < end {
            let e = rd(arena, tab, idx);
            let new = if perm.contains(PteFlags::SYS_RW) {
                e.set(
                    PteFlags::SYS_RW
                        | PteFlags::U
                        | PteFlags::P
                        | PteFlags::A
                        | PteFlags::D,
                )
            } else if perm.contains(PteFlags::SYS_READ) {
                e.clear(PteFlags::SYS_WRITE | PteFlags::W)
                    .set(PteFlags::SYS_READ | PteFlags::U | PteFlags::P)
            } else {
                e.clear(PteFlags::SYS_RW | PteFlags::P | PteFlags::W)
            };
            wr(arena, tab, idx, new);
            start += PAGE_SIZE as u32;
            idx += 1;
            if idx == ENTRIES {
                break;
            }
        }
    }
    Some(())
}

/// 对不可写页的写触发的缺页。名义可写而帧被共享（或还是零页）时现场复制，
/// 两个名义位都保留；其余情况把错误反射给用户。
pub fn page_fault(arena: &mut Arena, pd: PageDir, fva: u32) -> FaultFix {
    if !(USERLO..USERHI).contains(&fva) {
        return FaultFix::Reflect;
    }
    let Some((tab, idx)) = walk(arena, pd, fva, true) else {
        log::warn!("page_fault: no frame for page table at {fva:#x}");
        return FaultFix::Reflect;
    };
    let e = rd(arena, tab, idx);
    if !e.has(PteFlags::SYS_WRITE) || e.has(PteFlags::REMOTE) {
        return FaultFix::Reflect;
    }
    let mut pfn = e.pfn();
    if arena.refs(pfn) > 1 || pfn.is_zero() {
        let Some(new) = arena.alloc() else {
            log::warn!("page_fault: out of frames at {fva:#x}");
            return FaultFix::Reflect;
        };
        let bytes = arena.copy_of(pfn);
        arena.incref(new);
        *arena.data_mut(new) = *bytes;
        if arena.decref(pfn) {
            arena.release(pfn);
        }
        pfn = new;
    } else {
        // 独占的帧就地放开写。从外面拉来的帧从此算本地的
        arena.privatize(pfn);
    }
    wr(
        arena,
        tab,
        idx,
        Pte::new(
            pfn,
            (e.flags() & PteFlags::SYS_RW)
                | PteFlags::P
                | PteFlags::U
                | PteFlags::W
                | PteFlags::A
                | PteFlags::D,
        ),
    );
    FaultFix::Fixed
}

/// 以 `rpd` 为基准快照，把 `spd` 的修改归并进 `dpd`。4 MiB 粒度。
/// 返回是否出现过字节级冲突。
pub fn merge(
    arena: &mut Arena,
    rpd: PageDir,
    spd: PageDir,
    sva: u32,
    dpd: PageDir,
    dva: u32,
    size: u32,
) -> bool {
    assert_eq!(sva % PT_SIZE as u32, 0);
    assert_eq!(dva % PT_SIZE as u32, 0);
    assert_eq!(size % PT_SIZE as u32, 0);
    assert!((USERLO..USERHI).contains(&sva) && size <= USERHI - sva);
    assert!((USERLO..USERHI).contains(&dva) && size <= USERHI - dva);

    let mut conflicted = false;
    let slots = size as usize / PT_SIZE;
    for i in 0..slots {
        let s_at = sva + (i * PT_SIZE) as u32;
        let d_at = dva + (i * PT_SIZE) as u32;
        let spde = rd(arena, spd.0, pdx(s_at));
        let rpde = rd(arena, rpd.0, pdx(s_at));
        let dpde = rd(arena, dpd.0, pdx(d_at));
        if spde == rpde {
            // 源没动
            continue;
        }
        if dpde == rpde {
            // 目的没动，整段按写时复制搬过去
            copy(arena, spd, s_at, dpd, d_at, PT_SIZE as u32);
            continue;
        }
        // 两边都动过，下到叶子逐项比对
        let (stab, _) = walk(arena, spd, s_at, true).expect("out of frames");
        let (dtab, _) = walk(arena, dpd, d_at, true).expect("out of frames");
        let (rtab, _) = walk(arena, rpd, s_at, true).expect("out of frames");
        for j in 0..ENTRIES {
            let se = rd(arena, stab, j);
            let re = rd(arena, rtab, j);
            let de = rd(arena, dtab, j);
            if se == re {
                continue;
            }
            if de == re {
                // 叶子级写时复制
                if let PteKind::Local(old) = de.kind() {
                    if arena.decref(old) {
                        arena.release(old);
                    }
                }
                if let PteKind::Local(pfn) = se.kind() {
                    arena.incref(pfn);
                }
                let shared = se.clear(PteFlags::W);
                wr(arena, stab, j, shared);
                wr(arena, dtab, j, shared);
                continue;
            }
            conflicted |= merge_page(arena, rtab, stab, dtab, j);
        }
    }
    conflicted
}

/// 逐字节三路归并一页。目的页读共享或是零页时先克隆。
/// 两边改了同一个字节且值不同即为冲突：警告、把目的映射清回零页、放弃本页。
fn merge_page(arena: &mut Arena, rtab: Pfn, stab: Pfn, dtab: Pfn, j: usize) -> bool {
    let se = rd(arena, stab, j);
    let re = rd(arena, rtab, j);
    let de = rd(arena, dtab, j);
    if se.has(PteFlags::REMOTE) || re.has(PteFlags::REMOTE) || de.has(PteFlags::REMOTE) {
        log::warn!("merge_page: remote entry, skipping");
        return false;
    }
    let mut dpfn = de.pfn();
    if arena.refs(dpfn) > 1 || dpfn.is_zero() {
        let Some(new) = arena.alloc() else {
            log::warn!("merge_page: out of frames");
            wr(arena, dtab, j, Pte::ZERO);
            return true;
        };
        let bytes = arena.copy_of(dpfn);
        arena.incref(new);
        *arena.data_mut(new) = *bytes;
        if arena.decref(dpfn) {
            arena.release(dpfn);
        }
        dpfn = new;
        wr(
            arena,
            dtab,
            j,
            Pte::new(
                dpfn,
                PteFlags::SYS_RW | PteFlags::P | PteFlags::U | PteFlags::W,
            ),
        );
    }
    let sbuf = arena.copy_of(se.pfn());
    let rbuf = arena.copy_of(re.pfn());
    let mut conflict = false;
    {
        let d = arena.data_mut(dpfn);
        for b in 0..PAGE_SIZE {
            if sbuf[b] == rbuf[b] {
                continue; // 源这边没改这个字节
            }
            if d[b] == rbuf[b] {
                d[b] = sbuf[b];
            } else if d[b] != sbuf[b] {
                conflict = true;
                break;
            }
        }
    }
    if conflict {
        log::warn!("merge conflict, dropping destination page");
        wr(arena, dtab, j, Pte::ZERO);
        if arena.decref(dpfn) {
            arena.release(dpfn);
        }
    }
    conflict
}

/// 地址翻译，按硬件规则两级都查：两级都得存在，要写时两级都得可写。
/// 成功给出叶子帧号，不改任何状态。
pub fn translate(arena: &Arena, pd: PageDir, va: u32, need: PteFlags) -> Option<Pfn> {
    if !(USERLO..USERHI).contains(&va) {
        return None;
    }
    let pde = rd(arena, pd.0, pdx(va));
    if !pde.has(PteFlags::P) || pde.has(PteFlags::REMOTE) {
        return None;
    }
    if need.contains(PteFlags::W) && !pde.has(PteFlags::W) {
        return None;
    }
    let e = rd(arena, pde.pfn(), ptx(va));
    if e.has(PteFlags::REMOTE) || !e.has(need | PteFlags::P) {
        return None;
    }
    Some(e.pfn())
}
