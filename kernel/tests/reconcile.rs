//! 会合点上的文件系统调和：追加归并、冲突标记、两个方向的新文件。

mod common;

use common::{boot, run_root};
use kernel::RunOutcome;
use merge_fs::{FileMode, OpenFlags};
use rendezvous::SysApi;
use user_lib::file::{open, read, seek, write};
use user_lib::fork::{fork, waitpid};
use user_lib::{load_state, wexitstatus, WEXITED};

#[test]
fn append_append_becomes_one_log() {
    // S2：两边各自追加，等完之后两边看到同一份
    let (_, out) = run_root(boot(vec![]), |env| {
        let fd = open(env, "log", OpenFlags::CREAT | OpenFlags::RDWR).unwrap();
        write(env, fd, b"ABC").unwrap();

        let pid = fork(env, |env| {
            let fd = open(env, "log", OpenFlags::WRONLY | OpenFlags::APPEND).unwrap();
            write(env, fd, b"XYZ").unwrap();
            0
        })
        .unwrap();

        write(env, fd, b"PQ").unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED);

        // 基准段、孩子的尾巴、自己的尾巴
        seek(env, fd, 0).unwrap();
        let mut buf = [0u8; 16];
        let n = read(env, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ABCXYZPQ");

        // 没有冲突标记
        let st = load_state(env).unwrap();
        let ino = st.lookup(merge_fs::INO_ROOTDIR, "log").unwrap();
        assert!(!st.fi[ino as usize].mode().contains(FileMode::CONF));
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn double_overwrite_flags_conflict() {
    // S3：两边都覆写第一个字节，版本各自前进，结果是冲突标记
    let (_, out) = run_root(boot(vec![]), |env| {
        let fd = open(env, "cfg", OpenFlags::CREAT | OpenFlags::RDWR).unwrap();
        write(env, fd, b"AAA").unwrap();

        let pid = fork(env, |env| {
            let fd = open(env, "cfg", OpenFlags::RDWR).unwrap();
            write(env, fd, b"B").unwrap(); // 覆写字节 0，版本加一
            0
        })
        .unwrap();

        seek(env, fd, 0).unwrap();
        write(env, fd, b"C").unwrap(); // 家长也覆写字节 0
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED);

        let st = load_state(env).unwrap();
        let ino = st.lookup(merge_fs::INO_ROOTDIR, "cfg").unwrap();
        assert!(st.fi[ino as usize].mode().contains(FileMode::CONF));
        // 数据保持家长自己的样子，谁也没偷偷赢
        seek(env, fd, 0).unwrap();
        let mut buf = [0u8; 8];
        let n = read(env, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"CAA");
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn child_created_file_survives_the_child() {
    let (_, out) = run_root(boot(vec![]), |env| {
        let pid = fork(env, |env| {
            let fd = open(env, "result", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
            write(env, fd, b"all done").unwrap();
            7
        })
        .unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(wexitstatus(status), 7);

        let fd = open(env, "result", OpenFlags::RDONLY).unwrap();
        let mut buf = [0u8; 16];
        let n = read(env, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"all done");
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn parent_file_flows_into_running_child() {
    // 孩子等一个它出生时还不存在的文件；家长造出来，下一个会合点送过去
    let (_, out) = run_root(boot(vec![]), |env| {
        let pid = fork(env, |env| {
            loop {
                if let Ok(fd) = open(env, "late", OpenFlags::RDONLY) {
                    let mut buf = [0u8; 8];
                    let n = read(env, fd, &mut buf).unwrap();
                    if n > 0 {
                        assert_eq!(&buf[..n], b"gift");
                        return 1;
                    }
                }
                // 还没来，停在会合点上等下一轮
                if env.ret().is_err() {
                    return -1;
                }
            }
        })
        .unwrap();

        let fd = open(env, "late", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        write(env, fd, b"gift").unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(wexitstatus(status), 1);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn mkdir_and_unlink_propagate_as_versioned_changes() {
    // 目录诞生和删除都算修改：版本一跳，对端就看得见
    let (_, out) = run_root(boot(vec![]), |env| {
        let fd = open(env, "doomed", OpenFlags::CREAT | OpenFlags::WRONLY).unwrap();
        write(env, fd, b"bye").unwrap();

        let pid = fork(env, |env| {
            user_lib::file::mkdir(env, "d").unwrap();
            user_lib::file::unlink(env, "doomed").unwrap();
            0
        })
        .unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED);

        let st = load_state(env).unwrap();
        // 新目录到了家长这边
        let d = st.lookup(merge_fs::INO_ROOTDIR, "d").unwrap();
        assert!(st.fi[d as usize].mode().contains(FileMode::DIR));
        // 删除也跟了过来：lookup 不再认它
        assert_eq!(st.lookup(merge_fs::INO_ROOTDIR, "doomed"), None);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
}

#[test]
fn console_output_climbs_to_the_root() {
    // 孩子写标准输出，经逐级调和到根进程，退出时吐上主机控制台
    let (node, out) = run_root(boot(vec![]), |env| {
        let pid = fork(env, |env| {
            write(env, 1, b"hello from below\n").unwrap();
            0
        })
        .unwrap();
        let (_, status) = waitpid(env, pid as isize).unwrap();
        assert_eq!(status, WEXITED);
        0
    });
    assert_eq!(out, RunOutcome::Exited(0));
    let text = String::from_utf8_lossy(node.console_output()).into_owned();
    assert!(text.contains("hello from below"));
}

#[test]
fn console_input_reaches_a_waiting_child() {
    // 孩子等输入；节点闲下来之后喂进去，唤醒的链条一路通到孩子
    let mut node = boot(vec![]);
    node.launch(Box::new(|env| {
        let code = (|| {
            let pid = fork(env, |env| {
                let mut buf = [0u8; 8];
                loop {
                    let n = read(env, 0, &mut buf).unwrap();
                    if n > 0 {
                        return buf[0] as i32;
                    }
                    if env.ret().is_err() {
                        return -1;
                    }
                }
            })?;
            let (_, status) = waitpid(env, pid as isize)?;
            Ok::<i32, user_lib::UserError>(wexitstatus(status))
        })()
        .unwrap_or(-2);
        let _ = user_lib::file::exit(env, code);
        code
    }));

    // 没输入之前大家都只能干等
    assert_eq!(node.run(), RunOutcome::Idle);

    node.feed_input(b"!rest");
    match node.run() {
        RunOutcome::Exited(code) => assert_eq!(code, b'!' as i32),
        RunOutcome::Idle => panic!("input never reached the child"),
    }
}
