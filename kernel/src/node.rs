//! 节点：进程表、调度循环、会合系统调用和根进程的控制台。

use crate::proc::{Proc, RunState};
use crate::task::{launch_entry, Msg, ProcChan, Reply, Request, Resp, Retarget};
use console::kprint;
use frame_alloc::Arena;
use merge_fs::{
    file_data, FileMode, FileState, CHILD_SLOTS, FILESVA, INO_CONSIN, INO_CONSOUT, INO_ROOTDIR,
    STATE_PAGES,
};
use page_map::{
    copy, free_dir, new_dir, page_fault, rd, remove, setperm, translate, FaultFix, PageDir,
    PteFlags, PteKind, Rr, ENTRIES, PAGE_SIZE, PT_SIZE, STACKHI, USERHI, USERLO,
};
use proc_manage::{Fifo, ProcId, Schedule, Slots};
use rendezvous::{
    CallType, Cmd, Entry, MemOp, ProcState, ProgMain, SysError, FL_IF, FL_USER, T_GPFLT, T_PGFLT,
    T_SYSCALL, UCODE_SEL, UDATA_SEL,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// 一个时间片里最多处理多少次陷入。用完了就排回队尾，相当于时钟中断。
const QUANTUM: u32 = 64;

/// 注册给节点的一个程序：文件名、镜像内容和宿主侧正文。
pub struct Program {
    /// 在根目录下的文件名，也是程序表的键。
    pub name: String,
    /// 放进文件系统的镜像字节。
    pub image: Vec<u8>,
    /// 正文。
    pub main: ProgMain,
}

/// 节点配置。
pub struct NodeConfig {
    /// 节点号，1..=8。
    pub id: u8,
    /// 页帧总数。
    pub frames: usize,
    /// 预装的程序。
    pub programs: Vec<Program>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            frames: 8192,
            programs: Vec::new(),
        }
    }
}

/// 一轮调度的结果。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
    /// 干了点事。
    Progress,
    /// 没事可干。
    Idle,
    /// 根进程退出了。
    Exited(i32),
}

/// [`Node::run`] 的结局。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunOutcome {
    /// 根进程带着状态退出。
    Exited(i32),
    /// 所有人都在等外界，比如控制台输入或网络。
    Idle,
}

/// 迁移进程的线下行李：宿主线程的联络方式和待重试的调用。
/// 寄存器和内存走线上协议，这两样走不了线。
pub(crate) struct Baggage {
    pub chan: Option<ProcChan>,
    pub pending: Option<Request>,
}

/// 集群各节点共用的行李房，按出生地引用索引。
pub(crate) type BaggageStore = Rc<RefCell<BTreeMap<u32, Baggage>>>;

pub(crate) enum Flow {
    Continue(Result<Resp, SysError>),
    Blocked,
    Stopped,
    RootExit(i32),
}

/// 一个节点。
pub struct Node {
    pub(crate) id: u8,
    pub(crate) arena: Arena,
    pub(crate) procs: Slots<Proc>,
    ready: spin::Mutex<Fifo<ProcId>>,
    current: Option<ProcId>,
    tx: Sender<Msg>,
    rx: Receiver<Msg>,
    gen: u32,
    root: Option<ProcId>,
    root_sleeping: bool,
    cons_pending: VecDeque<u8>,
    cons_written: u32,
    cons_log: Vec<u8>,
    programs: BTreeMap<String, ProgMain>,
    staged_images: Vec<(String, Vec<u8>)>,
    pub(crate) outbox: Vec<Vec<u8>>,
    pub(crate) migrlist: Vec<ProcId>,
    pub(crate) pulllist: Vec<ProcId>,
    pub(crate) guests: BTreeMap<u32, ProcId>,
    pub(crate) baggage: BaggageStore,
    ticks: u64,
    exit: Option<i32>,
}

impl Node {
    /// 独立节点。
    pub fn new(cfg: NodeConfig) -> Self {
        Self::new_shared(cfg, Rc::new(RefCell::new(BTreeMap::new())))
    }

    pub(crate) fn new_shared(cfg: NodeConfig, baggage: BaggageStore) -> Self {
        assert!((1..=net_proto::MAX_NODES).contains(&cfg.id));
        let (tx, rx) = channel();
        let mut programs = BTreeMap::new();
        let mut staged_images = Vec::new();
        for p in cfg.programs {
            programs.insert(p.name.clone(), p.main);
            staged_images.push((p.name, p.image));
        }
        Self {
            id: cfg.id,
            arena: Arena::new(cfg.frames),
            procs: Slots::new(),
            ready: spin::Mutex::new(Fifo::new()),
            current: None,
            tx,
            rx,
            gen: 0,
            root: None,
            root_sleeping: false,
            cons_pending: VecDeque::new(),
            cons_written: 0,
            cons_log: Vec::new(),
            programs,
            staged_images,
            outbox: Vec::new(),
            migrlist: Vec::new(),
            pulllist: Vec::new(),
            guests: BTreeMap::new(),
            baggage,
            ticks: 0,
            exit: None,
        }
    }

    /// 节点号。
    pub fn node_id(&self) -> u8 {
        self.id
    }

    /// 根进程退出状态。
    pub fn exit_status(&self) -> Option<i32> {
        self.exit
    }

    /// 到目前为止控制台收到的所有字节。
    pub fn console_output(&self) -> &[u8] {
        &self.cons_log
    }

    /// 给控制台喂输入。根进程睡着的话叫醒它。
    pub fn feed_input(&mut self, bytes: &[u8]) {
        self.cons_pending.extend(bytes.iter().copied());
        if self.root_sleeping {
            self.root_sleeping = false;
            if let Some(r) = self.root {
                if let Some(p) = self.procs.get_mut(r) {
                    p.state = RunState::Ready;
                }
                self.ready.lock().add_back(r);
                self.reply(r, Ok(Resp::Unit));
            }
        }
    }

    pub(crate) fn fresh_gen(&mut self) -> u32 {
        self.gen += 1;
        self.gen
    }

    pub(crate) fn enqueue(&self, pid: ProcId, front: bool) {
        let mut q = self.ready.lock();
        if front {
            q.add_front(pid);
        } else {
            q.add_back(pid);
        }
    }

    /// 创建根进程并发车。
    pub fn launch(&mut self, root: Entry) {
        assert!(self.root.is_none());
        let pid = self.proc_alloc(None, 0).expect("out of frames at boot");
        self.root = Some(pid);
        self.file_initroot(pid);
        {
            let p = self.procs.get_mut(pid).unwrap();
            p.sv.tf.esp = STACKHI;
            p.sv.tf.eflags = FL_IF;
            p.staged = Some(root);
        }
        self.start_child(pid);
    }

    /// 一直调度，直到根进程退出或没人能动。
    pub fn run(&mut self) -> RunOutcome {
        loop {
            match self.step() {
                Step::Progress => {}
                Step::Idle => return RunOutcome::Idle,
                Step::Exited(code) => return RunOutcome::Exited(code),
            }
        }
    }

    /// 调度一个时间片。
    pub fn step(&mut self) -> Step {
        if let Some(code) = self.exit {
            return Step::Exited(code);
        }
        self.drain_msgs();
        let next = self.ready.lock().fetch();
        match next {
            Some(pid) => self.run_quantum(pid),
            None => Step::Idle,
        }
    }

    fn drain_msgs(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.stash(msg);
        }
    }

    fn stash(&mut self, msg: Msg) {
        let Some(p) = self.procs.get_mut(msg.pid) else {
            return; // 槽已经回收，遗言作废
        };
        if p.gen != msg.gen {
            return;
        }
        if p.pending.is_some() {
            log::warn!("proc {:?} already has a pending trap", msg.pid);
            return;
        }
        p.pending = Some(msg.req);
    }

    fn run_quantum(&mut self, pid: ProcId) -> Step {
        if let Some(p) = self.procs.get_mut(pid) {
            p.state = RunState::Run;
        } else {
            return Step::Progress;
        }
        self.current = Some(pid);
        self.adopt_baggage(pid);
        let mut budget = QUANTUM;
        let out = loop {
            let Some(req) = self.next_req(pid) else {
                // 执行体死了，按保护违例反射给家长
                self.trap_stop(pid, T_GPFLT);
                break Step::Progress;
            };
            match self.handle(pid, req) {
                Flow::Continue(result) => {
                    self.reply(pid, result);
                    budget -= 1;
                    if budget == 0 {
                        // 时间片用完，排到队尾
                        if let Some(p) = self.procs.get_mut(pid) {
                            p.state = RunState::Ready;
                        }
                        self.enqueue(pid, false);
                        break Step::Progress;
                    }
                }
                Flow::Blocked | Flow::Stopped => break Step::Progress,
                Flow::RootExit(code) => {
                    self.exit = Some(code);
                    break Step::Exited(code);
                }
            }
        };
        self.current = None;
        out
    }

    /// 迁来的进程第一次被调度时，把行李领回来。
    fn adopt_baggage(&mut self, pid: ProcId) {
        let home = match self.procs.get(pid) {
            Some(p) if p.chan.is_none() => p.home,
            _ => return,
        };
        let Some(bag) = self.baggage.borrow_mut().remove(&home.0) else {
            return;
        };
        let gen = self.fresh_gen();
        let p = self.procs.get_mut(pid).unwrap();
        p.chan = bag.chan;
        if p.pending.is_none() {
            p.pending = bag.pending;
        }
        p.gen = gen;
        p.retarget = true;
    }

    fn next_req(&mut self, pid: ProcId) -> Option<Request> {
        loop {
            {
                let p = self.procs.get_mut(pid)?;
                if let Some(r) = p.pending.take() {
                    return Some(r);
                }
                match &p.chan {
                    Some(ch) if ch.alive() => {}
                    _ => return None,
                }
            }
            match self.rx.recv_timeout(Duration::from_millis(1)) {
                Ok(msg) if msg.pid == pid => {
                    let gen_ok = self.procs.get(pid).map_or(false, |p| p.gen == msg.gen);
                    if gen_ok {
                        return Some(msg.req);
                    }
                }
                Ok(msg) => self.stash(msg),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub(crate) fn reply(&mut self, pid: ProcId, result: Result<Resp, SysError>) {
        let Some(p) = self.procs.get_mut(pid) else {
            return;
        };
        let retarget = if p.retarget {
            p.retarget = false;
            Some(Retarget {
                tx: self.tx.clone(),
                pid,
                gen: p.gen,
            })
        } else {
            None
        };
        if let Some(ch) = &p.chan {
            let _ = ch.reply.send(Reply { result, retarget });
        }
    }

    fn handle(&mut self, pid: ProcId, req: Request) -> Flow {
        match req {
            Request::Sys {
                cmd,
                child,
                regs,
                entry,
                sva,
                dva,
                size,
            } => match cmd.ty() {
                CallType::Put => self.do_put(pid, cmd, child, regs, entry, sva, dva, size),
                CallType::Get => self.do_get(pid, cmd, child, sva, dva, size),
                CallType::Ret => self.do_ret(pid),
                CallType::Cputs => Flow::Continue(Err(SysError::Fault(T_GPFLT))),
            },
            Request::MemRead { va, len } => Flow::Continue(self.user_read(pid, va, len)),
            Request::MemWrite { va, bytes } => Flow::Continue(self.user_write(pid, va, &bytes)),
            Request::Cputs(s) => {
                kprint!("{s}");
                self.cons_log.extend(s.as_bytes());
                Flow::Continue(Ok(Resp::Unit))
            }
            Request::Program(name) => Flow::Continue(
                self.programs
                    .get(&name)
                    .copied()
                    .map(Resp::Prog)
                    .ok_or(SysError::Fault(T_GPFLT)),
            ),
            Request::Trapped(t) => {
                self.reply(pid, Err(SysError::Terminated));
                self.trap_stop(pid, t);
                Flow::Stopped
            }
        }
    }

    /// 校验必须全部过关才能动手，失败的调用不留任何痕迹。
    fn validate(
        &self,
        cmd: Cmd,
        sva: u32,
        dva: u32,
        size: u32,
        is_put: bool,
    ) -> Result<(), SysError> {
        let pt_ok = |va: u32| va % PT_SIZE as u32 == 0;
        let pg_ok = |va: u32| va % PAGE_SIZE as u32 == 0;
        match cmd.memop() {
            MemOp::Copy | MemOp::Merge => {
                if cmd.memop() == MemOp::Merge && is_put {
                    return Err(SysError::Fault(T_GPFLT));
                }
                if !pt_ok(sva) || !pt_ok(dva) || !pt_ok(size) {
                    return Err(SysError::Fault(T_PGFLT));
                }
                if !page_map::user_range_ok(sva, size) || !page_map::user_range_ok(dva, size) {
                    return Err(SysError::Fault(T_PGFLT));
                }
            }
            MemOp::Zero => {
                if !pg_ok(dva) || !pg_ok(size) || !page_map::user_range_ok(dva, size) {
                    return Err(SysError::Fault(T_PGFLT));
                }
            }
            MemOp::None => {}
        }
        if cmd.has(Cmd::PERM)
            && (!pg_ok(dva) || !pg_ok(size) || !page_map::user_range_ok(dva, size))
        {
            return Err(SysError::Fault(T_PGFLT));
        }
        if cmd.has(Cmd::SNAP) && !is_put {
            return Err(SysError::Fault(T_GPFLT));
        }
        Ok(())
    }

    /// 找到（或建出）第 `cn` 个孩子。
    fn child_of(&mut self, pid: ProcId, cn: usize) -> Result<ProcId, Flow> {
        if cn >= CHILD_SLOTS {
            return Err(Flow::Continue(Err(SysError::Fault(T_GPFLT))));
        }
        match self.procs.get(pid).unwrap().children[cn] {
            Some(c) => Ok(c),
            None => match self.proc_alloc(Some(pid), cn as u8) {
                Some(c) => Ok(c),
                None => Err(Flow::Continue(Err(SysError::NoMem))),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn do_put(
        &mut self,
        pid: ProcId,
        cmd: Cmd,
        child: u16,
        regs: Option<ProcState>,
        entry: Option<Entry>,
        sva: u32,
        dva: u32,
        size: u32,
    ) -> Flow {
        let node = (child >> 8) as u8;
        let cn = (child & 0xFF) as usize;
        if node != 0 && node != self.id {
            return self.migrate_out(
                pid,
                node,
                Request::Sys {
                    cmd,
                    child,
                    regs,
                    entry,
                    sva,
                    dva,
                    size,
                },
            );
        }
        let cpid = match self.child_of(pid, cn) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        if self.procs.get(cpid).unwrap().state != RunState::Stop {
            // 孩子没停稳，整个调用存起来，等它回来再重做
            let p = self.procs.get_mut(pid).unwrap();
            p.pending = Some(Request::Sys {
                cmd,
                child,
                regs,
                entry,
                sva,
                dva,
                size,
            });
            p.state = RunState::Wait;
            p.waiting_on = Some(cn as u8);
            return Flow::Blocked;
        }

        if let Err(e) = self.validate(cmd, sva, dva, size, true) {
            return Flow::Continue(Err(e));
        }

        if cmd.has(Cmd::REGS) {
            if let Some(st) = regs {
                let c = self.procs.get_mut(cpid).unwrap();
                c.sv = st;
                c.sv.tf.cs = UCODE_SEL;
                c.sv.tf.ds = UDATA_SEL;
                c.sv.tf.es = UDATA_SEL;
                c.sv.tf.ss = UDATA_SEL;
                c.sv.tf.eflags = (st.tf.eflags & FL_USER) | FL_IF;
                c.sv.tf.trapno = T_SYSCALL;
            }
        }
        if let Some(e) = entry {
            self.procs.get_mut(cpid).unwrap().staged = Some(e);
        }

        let ppd = self.procs.get(pid).unwrap().pdir;
        let cpd = self.procs.get(cpid).unwrap().pdir;
        match cmd.memop() {
            MemOp::Copy => copy(&mut self.arena, ppd, sva, cpd, dva, size),
            MemOp::Zero => remove(&mut self.arena, cpd, dva, size),
            _ => {}
        }
        if cmd.has(Cmd::PERM) && setperm(&mut self.arena, cpd, dva, size, cmd.perm()).is_none() {
            return Flow::Continue(Err(SysError::NoMem));
        }
        if cmd.has(Cmd::SNAP) {
            let crpd = self.procs.get(cpid).unwrap().rpdir;
            copy(&mut self.arena, cpd, USERLO, crpd, USERLO, USERHI - USERLO);
        }
        if cmd.has(Cmd::START) {
            self.start_child(cpid);
        }
        Flow::Continue(Ok(Resp::Unit))
    }

    fn do_get(
        &mut self,
        pid: ProcId,
        cmd: Cmd,
        child: u16,
        sva: u32,
        dva: u32,
        size: u32,
    ) -> Flow {
        let node = (child >> 8) as u8;
        let cn = (child & 0xFF) as usize;
        if node != 0 && node != self.id {
            return self.migrate_out(
                pid,
                node,
                Request::Sys {
                    cmd,
                    child,
                    regs: None,
                    entry: None,
                    sva,
                    dva,
                    size,
                },
            );
        }
        // 从没影子的孩子那里取东西，效果等于面对一个空白进程
        let cpid = match self.child_of(pid, cn) {
            Ok(c) => c,
            Err(flow) => return flow,
        };
        if self.procs.get(cpid).unwrap().state != RunState::Stop {
            let p = self.procs.get_mut(pid).unwrap();
            p.pending = Some(Request::Sys {
                cmd,
                child,
                regs: None,
                entry: None,
                sva,
                dva,
                size,
            });
            p.state = RunState::Wait;
            p.waiting_on = Some(cn as u8);
            return Flow::Blocked;
        }
        if let Err(e) = self.validate(cmd, sva, dva, size, false) {
            return Flow::Continue(Err(e));
        }

        let resp = if cmd.has(Cmd::REGS) {
            Resp::Regs(self.procs.get(cpid).unwrap().sv)
        } else {
            Resp::Unit
        };
        let ppd = self.procs.get(pid).unwrap().pdir;
        let cpd = self.procs.get(cpid).unwrap().pdir;
        match cmd.memop() {
            MemOp::Copy => copy(&mut self.arena, cpd, sva, ppd, dva, size),
            MemOp::Zero => remove(&mut self.arena, ppd, dva, size),
            MemOp::Merge => {
                let crpd = self.procs.get(cpid).unwrap().rpdir;
                if page_map::merge(&mut self.arena, crpd, cpd, sva, ppd, dva, size) {
                    log::warn!("merge reported conflicts");
                }
            }
            MemOp::None => {}
        }
        if cmd.has(Cmd::PERM) && setperm(&mut self.arena, ppd, dva, size, cmd.perm()).is_none() {
            return Flow::Continue(Err(SysError::NoMem));
        }
        Flow::Continue(Ok(resp))
    }

    fn do_ret(&mut self, pid: ProcId) -> Flow {
        let home = self.procs.get(pid).unwrap().home;
        if home.node() != self.id {
            // 流浪在外的进程先回家，回到家再停
            return self.migrate_out(
                pid,
                home.node(),
                Request::Sys {
                    cmd: Cmd::RET,
                    child: 0,
                    regs: None,
                    entry: None,
                    sva: 0,
                    dva: 0,
                    size: 0,
                },
            );
        }
        if Some(pid) == self.root {
            return self.root_io(pid);
        }
        self.stop_to_parent(pid, T_SYSCALL);
        Flow::Stopped
    }

    /// 停下来，该叫家长就叫家长。
    pub(crate) fn stop_to_parent(&mut self, pid: ProcId, trapno: u32) {
        let (parent, slot) = {
            let p = self.procs.get_mut(pid).unwrap();
            p.state = RunState::Stop;
            p.sv.tf.trapno = trapno;
            (p.parent, p.slot_in_parent)
        };
        if let Some(ppid) = parent {
            if let Some(par) = self.procs.get_mut(ppid) {
                if par.state == RunState::Wait && par.waiting_on == Some(slot) {
                    // 正等着呢，插队回去把攒着的调用做完
                    par.waiting_on = None;
                    par.state = RunState::Ready;
                    self.enqueue(ppid, true);
                }
            }
        }
    }

    fn trap_stop(&mut self, pid: ProcId, trapno: u32) {
        if let Some(p) = self.procs.get_mut(pid) {
            p.chan = None;
        }
        self.stop_to_parent(pid, trapno);
    }

    /// 发车：装了新执行体就开新线程，停着的老执行体还它欠的回复。
    pub(crate) fn start_child(&mut self, cpid: ProcId) {
        let staged = self.procs.get_mut(cpid).unwrap().staged.take();
        if let Some(entry) = staged {
            let gen = self.fresh_gen();
            {
                let p = self.procs.get_mut(cpid).unwrap();
                p.chan = None; // 旧执行体就此作废
                p.gen = gen;
            }
            let (reply, thread) = launch_entry(cpid, gen, self.tx.clone(), entry);
            let p = self.procs.get_mut(cpid).unwrap();
            p.chan = Some(ProcChan {
                reply,
                thread: Some(thread),
            });
            p.state = RunState::Ready;
            self.enqueue(cpid, false);
        } else if self.procs.get(cpid).unwrap().chan.is_some() {
            self.procs.get_mut(cpid).unwrap().state = RunState::Ready;
            self.enqueue(cpid, false);
            self.reply(cpid, Ok(Resp::Unit));
        } else {
            log::warn!("start of proc {cpid:?} with nothing to run");
        }
    }

    pub(crate) fn proc_alloc(&mut self, parent: Option<ProcId>, cn: u8) -> Option<ProcId> {
        let pdir = new_dir(&mut self.arena)?;
        let rpdir = match new_dir(&mut self.arena) {
            Some(r) => r,
            None => {
                free_dir(&mut self.arena, pdir);
                return None;
            }
        };
        let mut p = Proc::new(pdir, rpdir);
        p.parent = parent;
        p.slot_in_parent = cn;
        let pid = self.procs.alloc(p);
        self.procs.get_mut(pid).unwrap().home =
            Rr::cons(self.id, pid.0 as u32, PteFlags::empty());
        if let Some(pp) = parent {
            self.procs.get_mut(pp).unwrap().children[cn as usize] = Some(pid);
        }
        Some(pid)
    }

    // ------------------------------------------------------------------
    // 用户内存

    fn user_read(&mut self, pid: ProcId, va: u32, len: u32) -> Result<Resp, SysError> {
        let pd = self.procs.get(pid).unwrap().pdir;
        let mut buf = vec![0u8; len as usize];
        match self.kread(pd, va, &mut buf) {
            Ok(()) => Ok(Resp::Bytes(buf)),
            Err(t) => Err(SysError::Fault(t)),
        }
    }

    fn user_write(&mut self, pid: ProcId, va: u32, bytes: &[u8]) -> Result<Resp, SysError> {
        let pd = self.procs.get(pid).unwrap().pdir;
        match self.kwrite(pd, va, bytes) {
            Ok(()) => Ok(Resp::Unit),
            Err(t) => Err(SysError::Fault(t)),
        }
    }

    /// 从某个地址空间读。
    pub(crate) fn kread(&mut self, pd: PageDir, va: u32, buf: &mut [u8]) -> Result<(), u32> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = va.checked_add(off as u32).ok_or(T_PGFLT)?;
            if !(USERLO..USERHI).contains(&a) {
                return Err(T_PGFLT);
            }
            let in_page = PAGE_SIZE - (a as usize % PAGE_SIZE);
            let n = in_page.min(buf.len() - off);
            let Some(pfn) = translate(&self.arena, pd, a, PteFlags::empty()) else {
                return Err(T_PGFLT);
            };
            let data = self.arena.data(pfn);
            let at = a as usize % PAGE_SIZE;
            buf[off..off + n].copy_from_slice(&data[at..at + n]);
            off += n;
        }
        Ok(())
    }

    /// 向某个地址空间写，写时复制顺手在这里完成。
    pub(crate) fn kwrite(&mut self, pd: PageDir, va: u32, buf: &[u8]) -> Result<(), u32> {
        let mut off = 0usize;
        while off < buf.len() {
            let a = va.checked_add(off as u32).ok_or(T_PGFLT)?;
            if !(USERLO..USERHI).contains(&a) {
                return Err(T_PGFLT);
            }
            let in_page = PAGE_SIZE - (a as usize % PAGE_SIZE);
            let n = in_page.min(buf.len() - off);
            let mut pfn = None;
            for _ in 0..2 {
                if let Some(p) = translate(&self.arena, pd, a, PteFlags::W) {
                    pfn = Some(p);
                    break;
                }
                if page_fault(&mut self.arena, pd, a) == FaultFix::Reflect {
                    return Err(T_PGFLT);
                }
            }
            let Some(pfn) = pfn else {
                return Err(T_PGFLT);
            };
            let at = a as usize % PAGE_SIZE;
            self.arena.data_mut(pfn)[at..at + n].copy_from_slice(&buf[off..off + n]);
            off += n;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 根进程的文件区和控制台

    fn file_initroot(&mut self, pid: ProcId) {
        let pd = self.procs.get(pid).unwrap().pdir;
        let mut st = FileState::new_boxed();
        st.init_root();

        // 元数据区、控制台输入区和栈先给权限
        setperm(&mut self.arena, pd, FILESVA, STATE_PAGES, PteFlags::SYS_RW)
            .expect("out of frames at boot");
        setperm(
            &mut self.arena,
            pd,
            file_data(INO_CONSIN),
            PT_SIZE as u32,
            PteFlags::SYS_RW,
        )
        .expect("out of frames at boot");
        setperm(
            &mut self.arena,
            pd,
            STACKHI - PT_SIZE as u32,
            PT_SIZE as u32,
            PteFlags::SYS_RW,
        )
        .expect("out of frames at boot");

        // 预装程序进文件系统
        let images = std::mem::take(&mut self.staged_images);
        for (name, image) in &images {
            let Some(ino) = st.create(INO_ROOTDIR, name) else {
                log::warn!("no inode left for {name}");
                continue;
            };
            let fi = &mut st.fi[ino as usize];
            fi.mode = FileMode::REG.bits();
            fi.ver = 1;
            fi.size = image.len() as u32;
            setperm(
                &mut self.arena,
                pd,
                file_data(ino),
                PT_SIZE as u32,
                PteFlags::SYS_RW,
            )
            .expect("out of frames at boot");
            self.kwrite(pd, file_data(ino), image)
                .expect("boot image write failed");
        }

        self.kwrite(pd, FILESVA, st.as_bytes())
            .expect("boot state write failed");
    }

    /// 根进程的 RET 走到这里：搬运控制台，然后要么放行要么睡下等输入。
    fn root_io(&mut self, pid: ProcId) -> Flow {
        let pd = self.procs.get(pid).unwrap().pdir;
        let mut st = FileState::new_boxed();
        if self.kread(pd, FILESVA, st.as_bytes_mut()).is_err() {
            log::warn!("root file state unreadable");
            return Flow::Continue(Ok(Resp::Unit));
        }
        let mut did = false;

        // 吐输出
        let out_size = st.fi[INO_CONSOUT as usize].size;
        if out_size > self.cons_written {
            let n = (out_size - self.cons_written) as usize;
            let mut buf = vec![0u8; n];
            if self
                .kread(pd, file_data(INO_CONSOUT) + self.cons_written, &mut buf)
                .is_ok()
            {
                kprint!("{}", String::from_utf8_lossy(&buf));
                self.cons_log.extend_from_slice(&buf);
                self.cons_written = out_size;
                did = true;
            }
        }

        // 灌输入：部分文件只追加，版本不动
        if !self.cons_pending.is_empty() {
            let bytes: Vec<u8> = self.cons_pending.drain(..).collect();
            let size = st.fi[INO_CONSIN as usize].size;
            if self
                .kwrite(pd, file_data(INO_CONSIN) + size, &bytes)
                .is_ok()
            {
                st.fi[INO_CONSIN as usize].size = size + bytes.len() as u32;
                let _ = self.kwrite(pd, FILESVA, st.as_bytes());
                did = true;
            }
        }

        if st.exited != 0 {
            kprint!("root process exited with status {}\n", st.status as i32);
            return Flow::RootExit(st.status as i32);
        }
        if did {
            return Flow::Continue(Ok(Resp::Unit));
        }
        // 没动静，睡到有输入为止
        self.procs.get_mut(pid).unwrap().state = RunState::Stop;
        self.root_sleeping = true;
        Flow::Stopped
    }

    // ------------------------------------------------------------------
    // 测试探针

    /// 用户窗口里还剩多少远程引用。迁移收尾后应当是零。
    pub fn remote_entries(&self) -> usize {
        let mut count = 0;
        for (_, p) in self.procs.iter() {
            for slot in page_map::pdx(USERLO)..page_map::pdx(USERHI) {
                let pde = rd(&self.arena, p.pdir.0, slot);
                match pde.kind() {
                    PteKind::Remote(_) => count += 1,
                    PteKind::Local(tab) if pde.has(PteFlags::P) => {
                        for i in 0..ENTRIES {
                            if rd(&self.arena, tab, i).has(PteFlags::REMOTE) {
                                count += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        count
    }

    /// 读根进程的内存，测试对照用。
    pub fn peek_root(&mut self, va: u32, buf: &mut [u8]) -> bool {
        let Some(pid) = self.root else {
            return false;
        };
        let pd = self.procs.get(pid).unwrap().pdir;
        self.kread(pd, va, buf).is_ok()
    }

    /// 本节点进程槽里有几个人。
    pub fn proc_count(&self) -> usize {
        self.procs.iter().count()
    }

    /// 接待过几位外来进程。重复的迁移请求不会让这个数变大。
    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    /// 正在被调度的进程。
    pub fn current_pid(&self) -> Option<ProcId> {
        self.current
    }

    /// 时钟推进一拍；每 64 拍把在途的迁移和拉取请求重发一轮。
    pub(crate) fn ticks_bump(&mut self) {
        self.ticks += 1;
        if self.ticks & 63 != 0 {
            return;
        }
        let migr = self.migrlist.clone();
        for pid in migr {
            self.tx_migrq(pid);
        }
        let pulls = self.pulllist.clone();
        for pid in pulls {
            self.tx_pullrq(pid);
        }
    }
}
