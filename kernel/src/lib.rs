//! 确定并行内核的宿主化身。
//!
//! 每个进程住在自己私有、可快照的地址空间里，只在 PUT/GET/RET 三个
//! 会合点上和父子交换状态。页管理靠写时复制和字节级三路归并；文件层
//! 在每个会合点上按版本号调和；网络层把进程整个迁去别的节点，页随后
//! 按需拉回。硬件在这里是数据结构：物理内存是帧仓库，页表是帧里的
//! 格子，用户正文在宿主线程上跑，所有陷入都串行穿过节点的调度循环，
//! 见 [`node`]。

#![deny(warnings)]

mod cluster;
mod image;
mod net;
mod node;
mod proc;
mod task;

pub use cluster::Cluster;
pub use image::ImageBuilder;
pub use node::{Node, NodeConfig, Program, RunOutcome, Step};
pub use task::UserEnv;

use console::log::LevelFilter;
use spin::Once;

/// 标准输出当控制台。
struct Stdout;

impl console::Sink for Stdout {
    fn put_str(&self, s: &str) {
        use std::io::Write;
        let mut out = std::io::stdout();
        let _ = out.write_all(s.as_bytes());
        let _ = out.flush();
    }
}

static STDOUT: Stdout = Stdout;
static INIT: Once<()> = Once::new();

/// 把控制台接到标准输出上。测试和使用者都从这里进。
pub fn init_console(level: LevelFilter) {
    INIT.call_once(|| console::init(&STDOUT, level));
}
