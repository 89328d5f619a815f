//! fork 与 wait：完全用 PUT/GET/RET 搭出来的进程协议，
//! 以及每个会合点上的文件系统调和。

use crate::{
    file, load_state, store_state, UResult, UserError, ALLSIZE, ALLVA, WEXITED, WSIGNALED,
};
use alloc::boxed::Box;
use merge_fs::{
    file_data, FileMode, FileState, CHILD_FORKED, CHILD_FREE, CHILD_RESERVED, CHILD_SLOTS,
    FILESVA, FILE_INODES, FILE_MAXSIZE,
};
use page_map::{PT_SIZE, SCRATCHLO, STACKHI};
use rendezvous::{Cmd, Entry, ProcState, Sys, SysApi, FL_IF, T_SYSCALL};

/// 派生一个子进程。整个用户窗口按写时复制进去，寄存器装好，直接发车。
/// 子进程跑 `child`，返回值就是退出码。家长这边拿到槽号。
pub fn fork(
    env: &mut dyn SysApi,
    child: impl FnOnce(&mut dyn SysApi) -> i32 + Send + 'static,
) -> UResult<usize> {
    let mut st = load_state(env)?;
    let pid = (1..CHILD_SLOTS)
        .find(|&i| st.child[i].state == CHILD_FREE)
        .ok_or(UserError::Again)?;

    let mut ps = ProcState::default();
    ps.tf.eax = 0; // 子进程眼里 fork 的返回值
    ps.tf.esp = STACKHI;
    ps.tf.eflags = FL_IF;

    let entry: Entry = Box::new(move |env: &mut dyn SysApi| {
        if child_arm(env).is_err() {
            return -1;
        }
        let code = child(env);
        let _ = file::exit(env, code);
        code
    });

    env.put(
        Cmd::PUT | Cmd::COPY | Cmd::REGS | Cmd::START,
        pid as u16,
        Some(&ps),
        Some(entry),
        ALLVA,
        ALLVA,
        ALLSIZE,
    )?;

    st.child[pid] = Default::default();
    st.child[pid].state = CHILD_FORKED;
    store_state(env, &st)?;
    Ok(pid)
}

/// 子进程落地后的第一件事：孩子表清空，给每个在用 inode 记下基准。
fn child_arm(env: &mut dyn SysApi) -> Sys<()> {
    let mut st = load_state(env)?;
    for c in st.child.iter_mut() {
        c.state = CHILD_FREE;
    }
    st.child[0].state = CHILD_RESERVED;
    for i in 1..FILE_INODES {
        let fi = &mut st.fi[i];
        if fi.is_alloced() {
            fi.rino = i as u32;
            fi.rver = fi.ver;
            fi.rlen = fi.size;
        }
    }
    store_state(env, &st)
}

/// 等任意一个子进程。
pub fn wait(env: &mut dyn SysApi) -> UResult<(usize, i32)> {
    waitpid(env, -1)
}

/// 等指定子进程（-1 表示随便）。反复与它会合并调和文件状态，
/// 直到它退出或者死于陷阱。返回（槽号，状态字）。
pub fn waitpid(env: &mut dyn SysApi, pid: isize) -> UResult<(usize, i32)> {
    let pid = {
        let st = load_state(env)?;
        let pid = if pid < 0 {
            (1..CHILD_SLOTS)
                .find(|&i| st.child[i].state == CHILD_FORKED)
                .ok_or(UserError::NoChild)?
        } else {
            pid as usize
        };
        if pid == 0 || pid >= CHILD_SLOTS || st.child[pid].state != CHILD_FORKED {
            return Err(UserError::NoChild);
        }
        pid
    };

    loop {
        // 等子进程停下，顺手把它的寄存器和文件状态页取过来
        let mut ps = ProcState::default();
        env.get(
            Cmd::GET | Cmd::COPY | Cmd::REGS,
            pid as u16,
            Some(&mut ps),
            FILESVA,
            SCRATCHLO,
            PT_SIZE as u32,
        )?;
        let mut cst = FileState::new_boxed();
        env.mem_read(SCRATCHLO, cst.as_bytes_mut())?;

        // 死于陷阱的孩子不调和，它留下的东西不可信
        if ps.tf.trapno != T_SYSCALL {
            log::warn!(
                "child {pid} took trap {} at {:#x}",
                ps.tf.trapno,
                ps.tf.eip
            );
            return finish(env, pid, WSIGNALED | ps.tf.trapno as i32);
        }

        let mut st = load_state(env)?;
        let moved = reconcile(env, pid, &mut st, &mut cst)?;

        if cst.exited != 0 {
            let status = WEXITED | (cst.status & 0xFF) as i32;
            store_state(env, &st)?;
            return finish(env, pid, status);
        }

        // 孩子在等新东西而这轮什么都没动，那就轮到我们自己停下，
        // 让我们的家长有机会灌点东西进来
        if !moved {
            store_state(env, &st)?;
            env.ret()?;
            st = load_state(env)?;
        }

        // 再调和一次，把新到的东西转给孩子
        reconcile(env, pid, &mut st, &mut cst)?;
        store_state(env, &st)?;

        // 合并后的文件状态页塞回去，孩子接着跑
        env.mem_write(SCRATCHLO, cst.as_bytes())?;
        env.put(
            Cmd::PUT | Cmd::COPY | Cmd::START,
            pid as u16,
            None,
            None,
            SCRATCHLO,
            FILESVA,
            PT_SIZE as u32,
        )?;
    }
}

/// 收尾：地址空间清空，槽位归还。
fn finish(env: &mut dyn SysApi, pid: usize, status: i32) -> UResult<(usize, i32)> {
    env.put(
        Cmd::PUT | Cmd::ZERO,
        pid as u16,
        None,
        None,
        ALLVA,
        ALLVA,
        ALLSIZE,
    )?;
    let mut st = load_state(env)?;
    st.child[pid].state = CHILD_FREE;
    store_state(env, &st)?;
    Ok((pid, status))
}

/// 双向调和两边的 inode 表。返回有没有数据动过。
///
/// 子进程给的每个字段都先过筛子再用：它坏了不能把家长也拖下水。
pub fn reconcile(
    env: &mut dyn SysApi,
    pid: usize,
    st: &mut FileState,
    cst: &mut FileState,
) -> Sys<bool> {
    let mut p2c = [0u32; FILE_INODES];
    let mut c2p = [0u32; FILE_INODES];
    for ino in [merge_fs::INO_CONSIN, merge_fs::INO_CONSOUT, merge_fs::INO_ROOTDIR] {
        p2c[ino as usize] = ino;
        c2p[ino as usize] = ino;
    }

    // 子侧先走：每个在用的子 inode 都要在家长那边有对应
    for cino in 1..FILE_INODES {
        let cfi = cst.fi[cino];
        if cfi.name[0] == 0 {
            continue;
        }
        if cfi.mode == 0 && cfi.rino == 0 {
            continue; // 在子进程里昙花一现的东西
        }
        if cfi.rino == 0 {
            let dino = cfi.dino as usize;
            if dino == 0 || dino >= FILE_INODES || c2p[dino] == 0 {
                log::warn!("reconcile: child inode {cino} under unmapped dir {dino}");
                continue;
            }
            match st.create(c2p[dino], cfi.name_str()) {
                Some(p) => cst.fi[cino].rino = p,
                None => continue, // 家长那边没地方了
            }
        }
        let cfi = cst.fi[cino];
        let pino = cfi.rino as usize;
        if pino == 0 || pino >= FILE_INODES {
            log::warn!("reconcile: child inode {cino} maps to bad {pino}");
            cst.fi[cino].rino = 0;
            continue;
        }
        let pfi = &st.fi[pino];
        // 已有映射必须自洽，不自洽就当没看见
        if p2c[pfi.dino as usize] != cfi.dino
            || pfi.name_str() != cfi.name_str()
            || cfi.rver > pfi.ver
            || cfi.rver > cfi.ver
        {
            log::warn!(
                "reconcile: fishy mapping {pino}/{cino}: dir {}/{} name {}/{} ver {}/{}({})",
                pfi.dino,
                cfi.dino,
                pfi.name_str(),
                cfi.name_str(),
                pfi.ver,
                cfi.ver,
                cfi.rver,
            );
            continue;
        }
        p2c[pino] = cino as u32;
        c2p[cino] = pino as u32;
    }

    // 家长侧补完：活着而没被映射的，去子进程那边开户
    for pino in 1..FILE_INODES {
        let pfi = st.fi[pino];
        if pfi.name[0] == 0 || pfi.mode == 0 || p2c[pino] != 0 {
            continue;
        }
        let cdino = p2c[pfi.dino as usize];
        if cdino == 0 {
            log::warn!("reconcile: parent inode {pino} under unmapped dir {}", pfi.dino);
            continue;
        }
        let Some(cino) = cst.create(cdino, pfi.name_str()) else {
            continue;
        };
        cst.fi[cino as usize].rino = pino as u32;
        p2c[pino] = cino;
        c2p[cino as usize] = pino as u32;
    }

    // 逐对调和
    let mut moved = false;
    for pino in 1..FILE_INODES {
        let cino = p2c[pino] as usize;
        if cino == 0 {
            continue;
        }
        moved |= reconcile_inode(env, pid, st, cst, pino, cino, &p2c, &c2p)?;
    }
    Ok(moved)
}

/// 调和一对 inode。
#[allow(clippy::too_many_arguments)]
fn reconcile_inode(
    env: &mut dyn SysApi,
    pid: usize,
    st: &mut FileState,
    cst: &mut FileState,
    pino: usize,
    cino: usize,
    p2c: &[u32; FILE_INODES],
    c2p: &[u32; FILE_INODES],
) -> Sys<bool> {
    let cfi = cst.fi[cino];
    let pfi = st.fi[pino];
    let rver = cfi.rver;
    let rlen = cfi.rlen;

    // 单调性筛查。被子进程破坏的对子跳过，绝不外传
    if cfi.ver < rver || pfi.ver < rver {
        log::warn!("reconcile: inode {pino}/{cino} version ran backwards");
        return Ok(false);
    }
    if (cfi.ver == rver && cfi.size < rlen) || (pfi.ver == rver && pfi.size < rlen) {
        log::warn!("reconcile: inode {pino}/{cino} shrank within a version");
        return Ok(false);
    }

    // 同版本、两边都越过基准长度：追加对追加，走字节归并
    if cfi.ver == rver && pfi.ver == rver && cfi.size > rlen && pfi.size > rlen {
        return merge_tails(env, pid, st, cst, pino, cino);
    }

    let child_changed = !(cfi.ver == rver && cfi.size == rlen);
    let parent_changed = !(pfi.ver == rver && pfi.size == rlen);

    if child_changed && parent_changed {
        // 各走各的版本，没法合。打上冲突标记，数据一个字节都不动
        st.fi[pino].mode |= FileMode::CONF.bits();
        cst.fi[cino].mode |= FileMode::CONF.bits();
        return Ok(true);
    }
    if child_changed {
        // 子进程赢：元数据抄过来，数据页整段拖过来。rino 不动
        let pfi = &mut st.fi[pino];
        pfi.name = cfi.name;
        pfi.ver = cfi.ver;
        pfi.mode = cfi.mode;
        pfi.size = cfi.size;
        if c2p[cfi.dino as usize] != 0 {
            pfi.dino = c2p[cfi.dino as usize];
        }
        let cfi = &mut cst.fi[cino];
        cfi.rver = cfi.ver;
        cfi.rlen = cfi.size;
        env.get(
            Cmd::GET | Cmd::COPY,
            pid as u16,
            None,
            file_data(cino as u32),
            file_data(pino as u32),
            PT_SIZE as u32,
        )?;
        return Ok(true);
    }
    if parent_changed {
        let cfi = &mut cst.fi[cino];
        cfi.name = pfi.name;
        cfi.ver = pfi.ver;
        cfi.mode = pfi.mode;
        cfi.size = pfi.size;
        if p2c[pfi.dino as usize] != 0 {
            cfi.dino = p2c[pfi.dino as usize];
        }
        cfi.rver = pfi.ver;
        cfi.rlen = pfi.size;
        env.put(
            Cmd::PUT | Cmd::COPY,
            pid as u16,
            None,
            None,
            file_data(pino as u32),
            file_data(cino as u32),
            PT_SIZE as u32,
        )?;
        return Ok(true);
    }
    Ok(false)
}

/// 追加对追加的文件内归并。两边最终都是
/// 基准段、子进程的尾巴、家长的尾巴，字节一致，长度一致。
fn merge_tails(
    env: &mut dyn SysApi,
    pid: usize,
    st: &mut FileState,
    cst: &mut FileState,
    pino: usize,
    cino: usize,
) -> Sys<bool> {
    let cfi = cst.fi[cino];
    let pfi = st.fi[pino];
    if !pfi.mode().contains(FileMode::REG) {
        return Ok(false); // 只有常规文件有数据可合
    }
    if pfi.mode != cfi.mode {
        log::warn!("merge: inode {pino}/{cino} modes diverge");
        return Ok(false);
    }
    let rlen = cfi.rlen;
    let cdif = cfi.size - rlen;
    let pdif = pfi.size - rlen;
    let total = rlen as u64 + cdif as u64 + pdif as u64;
    if total > FILE_MAXSIZE as u64 {
        log::warn!("merge: inode {pino}/{cino} would overflow, cancelled");
        return Ok(false);
    }
    let total = total as u32;

    // 子进程的数据页先拖到第二块暂存区
    let stage = SCRATCHLO + PT_SIZE as u32;
    env.get(
        Cmd::GET | Cmd::COPY,
        pid as u16,
        None,
        file_data(cino as u32),
        stage,
        PT_SIZE as u32,
    )?;

    let mut ctail = alloc::vec![0u8; cdif as usize];
    env.mem_read(stage + rlen, &mut ctail)?;
    let mut ptail = alloc::vec![0u8; pdif as usize];
    env.mem_read(file_data(pino as u32) + rlen, &mut ptail)?;

    // 家长侧：先让位，再接子进程的尾巴，自己的尾巴挪到最后
    env.mem_write(file_data(pino as u32) + rlen, &ctail)?;
    env.mem_write(file_data(pino as u32) + rlen + cdif, &ptail)?;
    // 子侧的尾巴本来就贴着基准段，家长的尾巴接在后面即可
    env.mem_write(stage + cfi.size, &ptail)?;
    env.put(
        Cmd::PUT | Cmd::COPY,
        pid as u16,
        None,
        None,
        stage,
        file_data(cino as u32),
        PT_SIZE as u32,
    )?;

    st.fi[pino].size = total;
    let cfi = &mut cst.fi[cino];
    cfi.size = total;
    cfi.rlen = total;
    Ok(true)
}
