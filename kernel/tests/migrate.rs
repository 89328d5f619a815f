//! 跨节点迁移：往返、重复与丢包、拉取的完整性。

use kernel::{Cluster, NodeConfig};
use page_map::{ptaddr, PAGE_SIZE, PT_SIZE, SCRATCHLO, USERLO};
use rendezvous::{child_word, Cmd, SysApi};
use user_lib::fork::{fork, waitpid};
use user_lib::{grant_rw, wexitstatus};

const PG: u32 = PAGE_SIZE as u32;

fn two_nodes() -> Cluster {
    kernel::init_console(console::log::LevelFilter::Warn);
    Cluster::new(vec![
        NodeConfig {
            id: 1,
            ..Default::default()
        },
        NodeConfig {
            id: 2,
            ..Default::default()
        },
    ])
}

/// 在 1 号节点上装一个「孩子出趟远门」的根进程。
/// 孩子带着图案迁到 2 号，核对内存，在外头写一页，然后回家；
/// 家长在收尸之前亲眼确认那页改动跟着回来了。
fn launch_roundtrip_root(cluster: &mut Cluster) {
    cluster.node(1).launch(Box::new(|env| {
        let code = (|| {
            let va = USERLO + 200 * PG;
            grant_rw(env, ptaddr(va), PT_SIZE as u32)?;
            env.mem_write(va, &[0xC3; 48])?;

            let pid = fork(env, move |env| {
                // 去 2 号节点
                env.get(Cmd::GET, child_word(2, 0), None, 0, 0, 0).unwrap();
                // 记忆一字不差地跟过来了吗
                let mut buf = [0u8; 48];
                env.mem_read(va, &mut buf).unwrap();
                assert_eq!(buf, [0xC3; 48]);
                // 在外头留下新改动，回家时要带上
                env.mem_write(va + PG, &[0xD4; 16]).unwrap();
                // 返回值顺便证明寄存器状态也活着
                9
            })?;

            // 等孩子回家停稳，先翻它的空间：外头写的那页得在
            let stage = SCRATCHLO + 2 * PT_SIZE as u32;
            env.get(
                Cmd::GET | Cmd::COPY,
                child_word(0, pid as u8),
                None,
                ptaddr(va),
                stage,
                PT_SIZE as u32,
            )?;
            let mut buf = [0u8; 16];
            env.mem_read(stage + (va + PG - ptaddr(va)), &mut buf)?;
            assert_eq!(buf, [0xD4; 16]);

            let (_, status) = waitpid(env, pid as isize)?;
            Ok::<i32, user_lib::UserError>(wexitstatus(status))
        })()
        .unwrap_or(-1);
        let _ = user_lib::file::exit(env, code);
        code
    }));
}

#[test]
fn migration_round_trip_preserves_everything() {
    // S6：去一趟 2 号节点再回来，寄存器、内存和外头的改动都齐整
    let mut cluster = two_nodes();
    launch_roundtrip_root(&mut cluster);
    let code = cluster.pump_until_exit(1, 50_000);
    assert_eq!(code, Some(9));

    // 拉取完整性：两边的用户窗口里都不许再有远程引用
    assert_eq!(cluster.node(1).remote_entries(), 0);
    assert_eq!(cluster.node(2).remote_entries(), 0);
}

#[test]
fn duplicate_migrq_yields_one_process() {
    // 开头几帧全都送两遍：协议的每一步都得是幂等的
    let mut cluster = two_nodes();
    cluster.duplicate_frames(4);
    launch_roundtrip_root(&mut cluster);
    assert_eq!(cluster.pump_until_exit(1, 50_000), Some(9));
    // 2 号节点只接待了一位客人；多出来的那个槽是迁移 GET 自己造的空白孩子
    assert_eq!(cluster.node(2).guest_count(), 1);
    assert_eq!(cluster.node(2).proc_count(), 2);
}

#[test]
fn lost_frames_are_retransmitted() {
    // 前几帧全丢，迁移靠时钟重发照样走完
    let mut cluster = two_nodes();
    cluster.drop_frames(3);
    launch_roundtrip_root(&mut cluster);
    assert_eq!(cluster.pump_until_exit(1, 200_000), Some(9));
    assert_eq!(cluster.node(1).remote_entries(), 0);
    assert_eq!(cluster.node(2).remote_entries(), 0);
}

#[test]
fn remote_child_slot_reads_as_blank() {
    // 迁移用的 GET 对上的是一个从没存在过的孩子；
    // 对空白孩子取寄存器、搬空窗口也都必须安然返回
    let mut cluster = two_nodes();
    cluster.node(1).launch(Box::new(|env| {
        let code = (|| {
            let pid = fork(env, |env| {
                env.get(Cmd::GET, child_word(2, 0), None, 0, 0, 0).unwrap();
                // 在 2 号节点上向空白孩子要它的（空）窗口和寄存器
                let mut ps = rendezvous::ProcState::default();
                env.get(
                    Cmd::GET | Cmd::COPY | Cmd::REGS,
                    0,
                    Some(&mut ps),
                    USERLO,
                    SCRATCHLO,
                    PT_SIZE as u32,
                )
                .unwrap();
                assert_eq!(ps.tf.eip, 0);
                3
            })?;
            let (_, status) = waitpid(env, pid as isize)?;
            Ok::<i32, user_lib::UserError>(wexitstatus(status))
        })()
        .unwrap_or(-1);
        let _ = user_lib::file::exit(env, code);
        code
    }));
    assert_eq!(cluster.pump_until_exit(1, 50_000), Some(3));
}
