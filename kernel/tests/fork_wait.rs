//! 会合原语上的进程协议：fork、wait、写时复制和失败调用的原子性。

mod common;

use common::{boot, run_root};
use kernel::RunOutcome;
use page_map::{PAGE_SIZE, PT_SIZE, SCRATCHLO, USERLO};
use rendezvous::{child_word, Cmd, SysApi, SysError, T_PGFLT};
use user_lib::fork::{fork, waitpid};
use user_lib::{grant_rw, WEXITED, WSIGNALED};

const PG: u32 = PAGE_SIZE as u32;

#[test]
fn fork_wait_exit_keeps_parent_memory() {
    // S1：孩子改自己的副本、退 42；家长的字节纹丝不动
    let (_, out) = run_root(boot(vec![]), |env| {
        let va = USERLO + 16 * PG;
        grant_rw(env, va, PG).unwrap();
        env.mem_write(va, &[0x5A; 64]).unwrap();

        let pid = fork(env, move |env| {
            env.mem_write(va, &[0xA5; 64]).unwrap();
            let mut buf = [0u8; 64];
            env.mem_read(va, &mut buf).unwrap();
            assert_eq!(buf, [0xA5; 64]);
            42
        })
        .unwrap();

        let (got, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(got, pid);
        assert_eq!(status, WEXITED | 42);

        let mut buf = [0u8; 64];
        env.mem_read(va, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 64]);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn cow_fault_isolates_parent_write() {
    // S4：fork 之后家长再写，孩子看到的还是旧图案
    let (_, out) = run_root(boot(vec![]), |env| {
        let va = USERLO + 40 * PG;
        grant_rw(env, va, PG).unwrap();
        env.mem_write(va, &[0x11; 32]).unwrap();

        let pid = fork(env, move |env| {
            let mut buf = [0u8; 32];
            env.mem_read(va, &mut buf).unwrap();
            // 家长随后的覆写不可见
            assert_eq!(buf, [0x11; 32]);
            5
        })
        .unwrap();

        env.mem_write(va, &[0x22; 32]).unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED | 5);

        let mut buf = [0u8; 32];
        env.mem_read(va, &mut buf).unwrap();
        assert_eq!(buf, [0x22; 32]);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn trapped_child_reports_signal_status() {
    let (_, out) = run_root(boot(vec![]), |env| {
        let pid = fork(env, |_env| panic!("child goes down in flames")).unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_ne!(status & WSIGNALED, 0);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn rejected_put_leaves_both_sides_untouched() {
    // 没对齐的 PUT 必须一个字节都不动就失败
    let (_, out) = run_root(boot(vec![]), |env| {
        let va = USERLO + 8 * PG;
        grant_rw(env, va, PG).unwrap();
        env.mem_write(va, &[0x77; 16]).unwrap();

        let pid = fork(env, |env| {
            // 停一拍，给家长留出动手的窗口，然后正常退出
            let _ = env.ret();
            0
        })
        .unwrap();

        // 源地址没按 4 MiB 对齐
        let err = env
            .put(
                Cmd::PUT | Cmd::COPY,
                child_word(0, pid as u8),
                None,
                None,
                va,
                USERLO,
                PT_SIZE as u32,
            )
            .unwrap_err();
        assert_eq!(err, SysError::Fault(T_PGFLT));

        // 孩子那边的同一页还是继承来的旧图案
        env.get(
            Cmd::GET | Cmd::COPY,
            child_word(0, pid as u8),
            None,
            page_map::ptaddr(va),
            SCRATCHLO + 2 * PT_SIZE as u32,
            PT_SIZE as u32,
        )
        .unwrap();
        let mut buf = [0u8; 16];
        env.mem_read(SCRATCHLO + 2 * PT_SIZE as u32 + (va - page_map::ptaddr(va)), &mut buf)
            .unwrap();
        assert_eq!(buf, [0x77; 16]);

        // 家长自己的也没变
        env.mem_read(va, &mut buf).unwrap();
        assert_eq!(buf, [0x77; 16]);

        // 孩子还能善终
        env.put(
            Cmd::PUT | Cmd::START,
            child_word(0, pid as u8),
            None,
            None,
            0,
            0,
            0,
        )
        .unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn snapshot_then_merge_combines_disjoint_writes() {
    // 内核级的 SNAP + GET MERGE：快照随 COPY 一起拍下，
    // 之后两边各写一页，归并后两份改动都在家长这边
    let (_, out) = run_root(boot(vec![]), |env| {
        let base = USERLO + 100 * PG;
        grant_rw(env, page_map::ptaddr(base), PT_SIZE as u32).unwrap();
        env.mem_write(base, b"parent-before").unwrap();

        let entry: rendezvous::Entry = Box::new(move |env| {
            env.mem_write(base + PG, b"child-page").unwrap();
            let _ = env.ret();
            0
        });
        let ps = rendezvous::ProcState::default();
        env.put(
            Cmd::PUT | Cmd::REGS | Cmd::COPY | Cmd::SNAP | Cmd::START,
            child_word(0, 1),
            Some(&ps),
            Some(entry),
            user_lib::ALLVA,
            user_lib::ALLVA,
            user_lib::ALLSIZE,
        )
        .unwrap();

        // 家长这边写另一页
        env.mem_write(base + 2 * PG, b"parent-page").unwrap();

        // 等孩子停稳再收它的改动
        env.get(
            Cmd::GET | Cmd::MERGE,
            child_word(0, 1),
            None,
            page_map::ptaddr(base),
            page_map::ptaddr(base),
            PT_SIZE as u32,
        )
        .unwrap();

        let mut buf = [0u8; 10];
        env.mem_read(base + PG, &mut buf).unwrap();
        assert_eq!(&buf, b"child-page");
        let mut buf = [0u8; 11];
        env.mem_read(base + 2 * PG, &mut buf).unwrap();
        assert_eq!(&buf, b"parent-page");
        let mut buf = [0u8; 13];
        env.mem_read(base, &mut buf).unwrap();
        assert_eq!(&buf, b"parent-before");
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}
