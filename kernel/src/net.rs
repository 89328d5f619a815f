//! 跨节点迁移和按需拉页。
//!
//! 没有序号：MIGRQ 和 PULLRQ 按时钟重发，收端对重复消息的回应是幂等的。
//! 线上只走寄存器和页；执行体的线程与待重试的调用走行李房（见 node.rs）。

use crate::node::{Baggage, Flow, Node};
use crate::proc::{PullJob, RunState};
use crate::task::Request;
use frame_alloc::Pfn;
use net_proto::{
    decode, encode, part_off, Migrp, Migrq, Packet, PageLevel, Pullrp, Pullrq, PART_LEN,
};
use page_map::{
    boot_pde, free_dir, new_dir, pdx, ptaddr, ptx, rd, wr, Pte, PteFlags, PteKind, Rr, ENTRIES,
    PAGE_SIZE, PT_SIZE, USERHI, USERLO,
};
use proc_manage::ProcId;
use rendezvous::{SysError, T_GPFLT, T_SYSCALL};

impl Node {
    /// 当前进程要去 `dst` 节点。调用本身存进行李，落地后重做。
    pub(crate) fn migrate_out(&mut self, pid: ProcId, dst: u8, pending: Request) -> Flow {
        if dst == 0 || dst > net_proto::MAX_NODES || dst == self.id {
            return Flow::Continue(Err(SysError::Fault(T_GPFLT)));
        }
        {
            let p = self.procs.get_mut(pid).unwrap();
            p.sv.tf.trapno = T_SYSCALL;
            p.state = RunState::Migr;
            p.migrdest = dst;
            let chan = p.chan.take();
            let home = p.home;
            self.baggage.borrow_mut().insert(
                home.0,
                Baggage {
                    chan,
                    pending: Some(pending),
                },
            );
        }
        self.migrlist.push(pid);
        self.tx_migrq(pid);
        Flow::Blocked
    }

    pub(crate) fn tx_migrq(&mut self, pid: ProcId) {
        let p = self.procs.get(pid).unwrap();
        let pkt = Packet::Migrq(Migrq {
            home: p.home,
            pdir: Rr::cons(self.id, p.pdir.0 .0, PteFlags::empty()),
            save: p.sv,
        });
        let frame = encode(self.id, p.migrdest, &pkt);
        self.outbox.push(frame);
    }

    fn tx_migrp(&mut self, dst: u8, home: Rr) {
        let frame = encode(self.id, dst, &Packet::Migrp(Migrp { home }));
        self.outbox.push(frame);
    }

    /// 收一帧。解不开或不是给我们的就悄悄丢掉。
    pub fn rx_frame(&mut self, frame: &[u8]) {
        match decode(self.id, frame) {
            Ok((src, Packet::Migrq(m))) => self.rx_migrq(src, m),
            Ok((_, Packet::Migrp(m))) => self.rx_migrp(m),
            Ok((src, Packet::Pullrq(q))) => self.rx_pullrq(src, q),
            Ok((_, Packet::Pullrp(r))) => self.rx_pullrp(r),
            Err(e) => log::debug!("net: dropping frame ({e})"),
        }
    }

    fn rx_migrq(&mut self, src: u8, m: Migrq) {
        // 按出生地认进程：自家的直接按槽号找，外来的查登记簿
        let pid = if m.home.node() == self.id {
            let pid = ProcId(m.home.pfn() as u16);
            if self.procs.get(pid).is_none() {
                log::warn!("migrq for unknown local proc {pid:?}");
                return;
            }
            pid
        } else if let Some(&pid) = self.guests.get(&m.home.0) {
            pid
        } else {
            let Some(pid) = self.proc_alloc(None, 0) else {
                return; // 没帧了，等对面重传
            };
            let p = self.procs.get_mut(pid).unwrap();
            p.state = RunState::Away;
            p.home = m.home;
            self.guests.insert(m.home.0, pid);
            pid
        };

        if self.procs.get(pid).unwrap().state != RunState::Away {
            // 多半是重传，进程已经在这儿了；再应一声就好
            log::warn!("migrq: proc {pid:?} is already local");
            self.tx_migrp(src, m.home);
            return;
        }

        self.procs.get_mut(pid).unwrap().sv = m.save;
        self.tx_migrp(src, m.home);

        // 旧地址空间丢掉，换一张白纸，页目录从对面拉
        let old = self.procs.get(pid).unwrap().pdir;
        free_dir(&mut self.arena, old);
        let fresh = new_dir(&mut self.arena).expect("out of frames");
        {
            let p = self.procs.get_mut(pid).unwrap();
            p.pdir = fresh;
            p.pullva = USERLO;
        }
        self.start_pull(pid, m.pdir, fresh.0, PageLevel::Dir);
    }

    fn rx_migrp(&mut self, m: Migrp) {
        let pos = self.migrlist.iter().position(|&pid| {
            self.procs
                .get(pid)
                .map_or(false, |p| p.home == m.home)
        });
        let Some(pos) = pos else {
            log::debug!("migrp nobody is waiting for");
            return;
        };
        let pid = self.migrlist.remove(pos);
        let p = self.procs.get_mut(pid).unwrap();
        p.state = RunState::Away;
        p.migrdest = 0;
    }

    pub(crate) fn start_pull(&mut self, pid: ProcId, rr: Rr, into: Pfn, level: PageLevel) {
        {
            let p = self.procs.get_mut(pid).unwrap();
            p.state = RunState::Pull;
            p.pull = Some(PullJob {
                rr,
                level,
                into,
                arrived: 0,
            });
        }
        self.pulllist.push(pid);
        self.tx_pullrq(pid);
    }

    pub(crate) fn tx_pullrq(&mut self, pid: ProcId) {
        let p = self.procs.get(pid).unwrap();
        let Some(job) = &p.pull else { return };
        let pkt = Packet::Pullrq(Pullrq {
            rr: job.rr,
            level: job.level,
            need: !job.arrived & 7,
        });
        let frame = encode(self.id, job.rr.node(), &pkt);
        self.outbox.push(frame);
    }

    fn rx_pullrq(&mut self, src: u8, q: Pullrq) {
        if q.rr.node() != self.id {
            log::warn!("pullrq came to the wrong node");
            return;
        }
        let pfn = Pfn(q.rr.pfn());
        if !self.arena.is_live(pfn) || self.arena.refs(pfn) == 0 {
            log::warn!("pullrq for dead frame {pfn:?}");
            return;
        }
        if self.arena.home(pfn) != 0 {
            log::warn!("pullrq for a frame we do not own");
            return;
        }
        // 对面马上就有副本了，先记上
        self.arena.share_with(pfn, src);
        for part in 0..3u8 {
            if q.need & (1 << part) != 0 {
                self.tx_pullrp(src, q.rr, q.level, part);
            }
        }
    }

    /// 发一份页的一角。页表和页目录的格子先翻译成远程引用：
    /// 全局项抹掉，远程项原样过，零映射带着权限走零地址引用，
    /// 本地页给出自家引用或它原本的出生地。
    fn tx_pullrp(&mut self, dst: u8, rr: Rr, level: PageLevel, part: u8) {
        let pfn = Pfn(rr.pfn());
        let off = part_off(part as usize);
        let len = PART_LEN[part as usize];
        let data: Vec<u8> = if level == PageLevel::Page {
            self.arena.data(pfn)[off..off + len].to_vec()
        } else {
            let src_page = self.arena.data(pfn);
            let mut out = Vec::with_capacity(len);
            for at in (off..off + len).step_by(4) {
                let e = Pte(u32::from_le_bytes([
                    src_page[at],
                    src_page[at + 1],
                    src_page[at + 2],
                    src_page[at + 3],
                ]));
                let word = if e.has(PteFlags::G) {
                    0 // 内核映射不许上线
                } else if e.has(PteFlags::REMOTE) {
                    e.0
                } else if e.pfn().is_zero() {
                    Rr::zero(e.flags() & PteFlags::RR_RW).0
                } else {
                    let h = self.arena.home(e.pfn());
                    if h != 0 {
                        h // 客籍页指回它的出生地
                    } else {
                        Rr::cons(self.id, e.pfn().0, e.flags() & PteFlags::RR_RW).0
                    }
                };
                out.extend_from_slice(&word.to_le_bytes());
            }
            out
        };
        let frame = encode(
            self.id,
            dst,
            &Packet::Pullrp(Pullrp { rr, part, data }),
        );
        self.outbox.push(frame);
    }

    fn rx_pullrp(&mut self, r: Pullrp) {
        let pos = self.pulllist.iter().position(|&pid| {
            self.procs
                .get(pid)
                .and_then(|p| p.pull.as_ref())
                .map_or(false, |j| j.rr == r.rr)
        });
        let Some(pos) = pos else {
            log::debug!("pullrp nobody is waiting for");
            return;
        };
        let pid = self.pulllist[pos];
        let (into, level, arrived) = {
            let p = self.procs.get_mut(pid).unwrap();
            let job = p.pull.as_mut().unwrap();
            let bit = 1 << r.part;
            if job.arrived & bit != 0 {
                log::debug!("pullrp part {} came twice", r.part);
                return;
            }
            job.arrived |= bit;
            (job.into, job.level, job.arrived)
        };
        let off = part_off(r.part as usize);
        self.arena.data_mut(into)[off..off + r.data.len()].copy_from_slice(&r.data);
        if arrived != 7 {
            return;
        }

        // 三份都齐了
        self.pulllist.remove(pos);
        self.procs.get_mut(pid).unwrap().pull = None;
        if level == PageLevel::Dir {
            // 页目录的内核槽换成自己的启动模板
            for slot in 0..ENTRIES {
                if (pdx(USERLO)..pdx(USERHI)).contains(&slot) {
                    continue;
                }
                wr(&mut self.arena, into, slot, boot_pde(slot));
            }
        }
        self.pull_walk(pid);
    }

    /// 从上次停下的地方继续向前走，把用户窗口里的远程引用逐个落地。
    /// 全都本地（或者干脆是零）之后进程就绪。
    fn pull_walk(&mut self, pid: ProcId) {
        loop {
            let (pva, root) = {
                let p = self.procs.get(pid).unwrap();
                (p.pullva, p.pdir)
            };
            if pva >= USERHI {
                break;
            }
            let slot = pdx(pva);
            let pde = rd(&self.arena, root.0, slot);
            match pde.kind() {
                PteKind::Remote(rr) => {
                    if !self.pull_pte(pid, root.0, slot, rr, PageLevel::Table) {
                        return; // 等这张表到货
                    }
                }
                PteKind::Zero => {
                    self.procs.get_mut(pid).unwrap().pullva =
                        ptaddr(pva) + PT_SIZE as u32;
                }
                PteKind::Local(tab) => {
                    let pte = rd(&self.arena, tab, ptx(pva));
                    match pte.kind() {
                        PteKind::Remote(rr) => {
                            if !self.pull_pte(pid, tab, ptx(pva), rr, PageLevel::Page) {
                                return; // 等这一页到货
                            }
                        }
                        _ => {
                            self.procs.get_mut(pid).unwrap().pullva =
                                pva + PAGE_SIZE as u32;
                        }
                    }
                }
            }
        }
        // 整个窗口都在本地了，可以跑了
        let p = self.procs.get_mut(pid).unwrap();
        p.state = RunState::Ready;
        self.enqueue(pid, false);
    }

    /// 解掉一个远程格子。能当场解决就返回 true；
    /// 要去线上拉的话挂起拉取并返回 false。
    fn pull_pte(
        &mut self,
        pid: ProcId,
        table: Pfn,
        idx: usize,
        rr: Rr,
        level: PageLevel,
    ) -> bool {
        if rr.is_zero_addr() {
            // 对面也只是零映射，把名义权限留下来
            let cell = match level {
                PageLevel::Table => Pte::ZERO,
                _ => {
                    let rw = rr.rw() & PteFlags::SYS_RW;
                    let mut flags = rw;
                    if rw.contains(PteFlags::SYS_READ) {
                        flags |= PteFlags::P | PteFlags::U;
                    }
                    Pte::new(Pfn::ZERO, flags)
                }
            };
            wr(&mut self.arena, table, idx, cell);
            return true;
        }
        if rr.node() == self.id {
            // 绕了一圈回到自家的帧
            let pfn = Pfn(rr.pfn());
            if !self.arena.is_live(pfn) {
                log::warn!("remote ref to a frame we no longer have");
                wr(&mut self.arena, table, idx, Pte::ZERO);
                return true;
            }
            self.arena.incref(pfn);
            let cell = make_cell(pfn, rr, level);
            wr(&mut self.arena, table, idx, cell);
            return true;
        }
        if let Some(pfn) = self.arena.rr_lookup(rr.0) {
            // 以前拉过，直接复用副本
            self.arena.incref(pfn);
            let cell = make_cell(pfn, rr, level);
            wr(&mut self.arena, table, idx, cell);
            return true;
        }
        let pfn = self.arena.alloc().expect("out of frames");
        self.arena.incref(pfn);
        self.arena.set_home(pfn, rr.0);
        self.arena.rr_track(rr.0, pfn);
        let cell = make_cell(pfn, rr, level);
        wr(&mut self.arena, table, idx, cell);
        self.start_pull(pid, rr, pfn, level);
        false
    }

    /// 时钟滴答。每 64 拍把还在途的请求重发一轮。
    pub fn tick(&mut self) {
        self.ticks_bump();
    }

    /// 待发的帧。集群负责递送。
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }
}

fn make_cell(pfn: Pfn, rr: Rr, level: PageLevel) -> Pte {
    match level {
        PageLevel::Table | PageLevel::Dir => Pte::new(
            pfn,
            PteFlags::P | PteFlags::U | PteFlags::W | PteFlags::A,
        ),
        // 硬件可写位不给：第一次写走缺页，顺便把帧私有化，
        // 否则改动会被它出生地的旧副本盖掉
        PageLevel::Page => Pte::new(
            pfn,
            (rr.rw() & PteFlags::SYS_RW) | PteFlags::P | PteFlags::U,
        ),
    }
}
