//! 执行体与内核之间的通道。
//!
//! 每个发车的进程在自己的宿主线程上跑正文；所有陷入（系统调用和对
//! 自身地址空间的读写）都打包成 [`Request`] 发给节点，停在回复上。
//! 内核状态因此只有调度循环一个改写者，协作式调度照旧成立。

use proc_manage::ProcId;
use rendezvous::{Cmd, Entry, ProcState, ProgMain, Sys, SysApi, SysError};
use std::sync::mpsc::{Receiver, Sender};

/// 一次陷入。
pub enum Request {
    /// PUT/GET/RET 三件套（CPUTS 单独走 [`Request::Cputs`]）。
    Sys {
        /// 命令字。
        cmd: Cmd,
        /// 子进程字：低字节槽号，高字节节点。
        child: u16,
        /// 捎带的寄存器状态。
        regs: Option<ProcState>,
        /// 捎带的执行体（相当于寄存器块里的指令指针）。
        entry: Option<Entry>,
        /// 源地址。
        sva: u32,
        /// 目的地址。
        dva: u32,
        /// 长度。
        size: u32,
    },
    /// 读自己的内存。
    MemRead {
        /// 起始地址。
        va: u32,
        /// 长度。
        len: u32,
    },
    /// 写自己的内存。
    MemWrite {
        /// 起始地址。
        va: u32,
        /// 数据。
        bytes: Vec<u8>,
    },
    /// 控制台输出。
    Cputs(String),
    /// 查程序表。
    Program(String),
    /// 执行体没接住的错误，按陷阱反射给家长。
    #[allow(dead_code)]
    Trapped(u32),
}

/// 回复里带的数据。
pub enum Resp {
    /// 没有别的。
    Unit,
    /// 读出来的字节。
    Bytes(Vec<u8>),
    /// 子进程的寄存器状态。
    Regs(ProcState),
    /// 程序入口。
    Prog(ProgMain),
}

/// 迁移之后执行体改投的新地址。
pub struct Retarget {
    /// 新节点的请求通道。
    pub tx: Sender<Msg>,
    /// 在新节点上的进程号。
    pub pid: ProcId,
    /// 新的换代计数。
    pub gen: u32,
}

/// 一次陷入的回复。
pub struct Reply {
    /// 结果。
    pub result: Result<Resp, SysError>,
    /// 进程搬过家的话，往后去哪儿报到。
    pub retarget: Option<Retarget>,
}

/// 投进节点信箱的消息。
pub struct Msg {
    /// 谁发的。
    pub pid: ProcId,
    /// 它的换代计数，旧执行体的遗言靠这个滤掉。
    pub gen: u32,
    /// 内容。
    pub req: Request,
}

/// 执行体这头握着的联络方式。
pub struct ProcChan {
    /// 回复发到这里。
    pub reply: Sender<Reply>,
    /// 宿主线程。
    pub thread: Option<std::thread::JoinHandle<()>>,
}

impl ProcChan {
    /// 线程还活着吗。
    pub fn alive(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }
}

/// 执行体手里的环境：一来一回的远程调用。
pub struct UserEnv {
    pid: ProcId,
    gen: u32,
    tx: Sender<Msg>,
    rx: Receiver<Reply>,
}

impl UserEnv {
    pub(crate) fn new(pid: ProcId, gen: u32, tx: Sender<Msg>, rx: Receiver<Reply>) -> Self {
        Self { pid, gen, tx, rx }
    }

    fn call(&mut self, req: Request) -> Sys<Resp> {
        self.tx
            .send(Msg {
                pid: self.pid,
                gen: self.gen,
                req,
            })
            .map_err(|_| SysError::Terminated)?;
        let reply = self.rx.recv().map_err(|_| SysError::Terminated)?;
        if let Some(r) = reply.retarget {
            self.tx = r.tx;
            self.pid = r.pid;
            self.gen = r.gen;
        }
        reply.result
    }
}

impl SysApi for UserEnv {
    fn put(
        &mut self,
        cmd: Cmd,
        child: u16,
        regs: Option<&ProcState>,
        entry: Option<Entry>,
        sva: u32,
        dva: u32,
        size: u32,
    ) -> Sys<()> {
        self.call(Request::Sys {
            cmd,
            child,
            regs: regs.copied(),
            entry,
            sva,
            dva,
            size,
        })
        .map(|_| ())
    }

    fn get(
        &mut self,
        cmd: Cmd,
        child: u16,
        regs: Option<&mut ProcState>,
        sva: u32,
        dva: u32,
        size: u32,
    ) -> Sys<()> {
        let resp = self.call(Request::Sys {
            cmd,
            child,
            regs: None,
            entry: None,
            sva,
            dva,
            size,
        })?;
        if let (Some(out), Resp::Regs(st)) = (regs, resp) {
            *out = st;
        }
        Ok(())
    }

    fn ret(&mut self) -> Sys<()> {
        self.call(Request::Sys {
            cmd: Cmd::RET,
            child: 0,
            regs: None,
            entry: None,
            sva: 0,
            dva: 0,
            size: 0,
        })
        .map(|_| ())
    }

    fn cputs(&mut self, s: &str) -> Sys<()> {
        self.call(Request::Cputs(s.into())).map(|_| ())
    }

    fn mem_read(&mut self, va: u32, buf: &mut [u8]) -> Sys<()> {
        let resp = self.call(Request::MemRead {
            va,
            len: buf.len() as u32,
        })?;
        match resp {
            Resp::Bytes(b) if b.len() == buf.len() => {
                buf.copy_from_slice(&b);
                Ok(())
            }
            _ => Err(SysError::Fault(rendezvous::T_GPFLT)),
        }
    }

    fn mem_write(&mut self, va: u32, buf: &[u8]) -> Sys<()> {
        self.call(Request::MemWrite {
            va,
            bytes: buf.to_vec(),
        })
        .map(|_| ())
    }

    fn program(&mut self, name: &str) -> Sys<ProgMain> {
        match self.call(Request::Program(name.into()))? {
            Resp::Prog(p) => Ok(p),
            _ => Err(SysError::Fault(rendezvous::T_GPFLT)),
        }
    }
}

/// 把执行体架上线程。正文跑完还没退场的话，就一直停在会合点上，
/// 直到整个进程被回收。恐慌会带走线程，内核按陷阱处理尸体。
pub fn launch_entry(
    pid: ProcId,
    gen: u32,
    tx: Sender<Msg>,
    entry: Entry,
) -> (Sender<Reply>, std::thread::JoinHandle<()>) {
    let (rtx, rrx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let mut env = UserEnv::new(pid, gen, tx, rrx);
        let _code = entry(&mut env);
        loop {
            if env.ret().is_err() {
                break;
            }
        }
    });
    (rtx, handle)
}
