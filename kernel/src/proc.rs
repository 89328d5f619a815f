//! 进程槽的内核侧形态。

use crate::task::{ProcChan, Request};
use merge_fs::CHILD_SLOTS;
use net_proto::PageLevel;
use page_map::{PageDir, Rr};
use rendezvous::ProcState;

/// 进程运行状态。空槽不需要状态，槽位表自己管。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    /// 停在会合点上，家长可以对它操作。
    Stop,
    /// 在就绪队列里。
    Ready,
    /// 正在被调度执行。
    Run,
    /// 等某个孩子停下来。
    Wait,
    /// 正在迁出，等对端确认。
    Migr,
    /// 人在别的节点。
    Away,
    /// 在等页从线上回来。
    Pull,
}

/// 一次在途的页拉取。
pub struct PullJob {
    /// 在拉哪个远程页。
    pub rr: Rr,
    /// 页、页表还是页目录。
    pub level: PageLevel,
    /// 拉回来装进哪个本地帧。
    pub into: frame_alloc::Pfn,
    /// 三份里到了哪几份。
    pub arrived: u8,
}

/// 一个进程。
pub struct Proc {
    /// 运行状态。
    pub state: RunState,
    /// 保存的寄存器。
    pub sv: ProcState,
    /// 当前页目录。
    pub pdir: PageDir,
    /// 上次快照的页目录，归并的基准。
    pub rpdir: PageDir,
    /// 家长。根进程和外来进程没有。
    pub parent: Option<proc_manage::ProcId>,
    /// 自己在家长的孩子表里的位置。
    pub slot_in_parent: u8,
    /// 孩子表。
    pub children: [Option<proc_manage::ProcId>; CHILD_SLOTS],
    /// 家长态：在等哪个孩子。
    pub waiting_on: Option<u8>,
    /// 被打断、该重试的那次调用。
    pub pending: Option<Request>,
    /// 执行体的线下联络方式。
    pub chan: Option<ProcChan>,
    /// 换代计数，旧执行体的消息靠它过滤。
    pub gen: u32,
    /// 装好了但还没发车的执行体。
    pub staged: Option<rendezvous::Entry>,
    /// 下一次回复要不要告诉执行体改投新地址。
    pub retarget: bool,
    /// 出生地，跨节点的身份。
    pub home: Rr,
    /// 迁出目标节点。
    pub migrdest: u8,
    /// 在途的拉取。
    pub pull: Option<PullJob>,
    /// 拉取推进到的地址。
    pub pullva: u32,
}

impl Proc {
    /// 新槽，停着。
    pub fn new(pdir: PageDir, rpdir: PageDir) -> Self {
        let mut sv = ProcState::default();
        sv.tf.cs = rendezvous::UCODE_SEL;
        sv.tf.ds = rendezvous::UDATA_SEL;
        sv.tf.es = rendezvous::UDATA_SEL;
        sv.tf.ss = rendezvous::UDATA_SEL;
        sv.tf.trapno = rendezvous::T_SYSCALL;
        Self {
            state: RunState::Stop,
            sv,
            pdir,
            rpdir,
            parent: None,
            slot_in_parent: 0,
            children: [None; CHILD_SLOTS],
            waiting_on: None,
            pending: None,
            chan: None,
            gen: 0,
            staged: None,
            retarget: false,
            home: Rr(0),
            migrdest: 0,
            pull: None,
            pullva: 0,
        }
    }
}
