//! 各集成测试共用的小座架。

use kernel::{Node, NodeConfig, Program, RunOutcome};
use rendezvous::SysApi;

/// 起一个装好程序的单节点。
pub fn boot(programs: Vec<Program>) -> Node {
    kernel::init_console(console::log::LevelFilter::Warn);
    Node::new(NodeConfig {
        programs,
        ..Default::default()
    })
}

/// 给根进程配上标准的退出收尾，跑到头。
pub fn run_root(
    mut node: Node,
    body: impl FnOnce(&mut dyn SysApi) -> i32 + Send + 'static,
) -> (Node, RunOutcome) {
    node.launch(Box::new(move |env| {
        let code = body(env);
        let _ = user_lib::file::exit(env, code);
        code
    }));
    let out = node.run();
    (node, out)
}
