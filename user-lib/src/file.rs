//! 描述符层：打开、读写、目录，以及退出协议。
//!
//! 所有元数据改动都遵守版本约定：追加只长 `size`，任何别的修改都把
//! `ver` 加一，冲突检测靠它才成立。

use crate::{grant_rw, load_state, store_state, UResult, UserError};
use alloc::{string::String, vec::Vec};
use merge_fs::{
    file_data, FileMode, FileState, OpenFlags, FD_COUNT, FILE_MAXSIZE, INO_ROOTDIR,
};
use page_map::PT_SIZE;
use rendezvous::{SysApi, SysError};

/// 从 `start` 出发解析路径，返回最后一个部件的 inode。
pub fn resolve(st: &FileState, start: u32, path: &str) -> Option<u32> {
    let mut cur = if path.starts_with('/') {
        INO_ROOTDIR
    } else {
        start
    };
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        match comp {
            "." => {}
            ".." => cur = st.fi[cur as usize].dino,
            _ => {
                let next = st.lookup(cur, comp)?;
                cur = next;
            }
        }
    }
    Some(cur)
}

/// 拆出（父目录 inode，最后部件）。
fn resolve_parent<'a>(st: &FileState, start: u32, path: &'a str) -> Option<(u32, &'a str)> {
    let trimmed = path.trim_end_matches('/');
    let (dir, base) = match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    };
    if base.is_empty() {
        return None;
    }
    let dino = if dir.is_empty() {
        if path.starts_with('/') {
            INO_ROOTDIR
        } else {
            start
        }
    } else {
        resolve(st, start, dir)?
    };
    if !st.fi[dino as usize].mode().contains(FileMode::DIR) {
        return None;
    }
    Some((dino, base))
}

/// 打开文件，返回描述符。
pub fn open(env: &mut dyn SysApi, path: &str, flags: OpenFlags) -> UResult<usize> {
    let mut st = load_state(env)?;
    let (dino, base) = resolve_parent(&st, st.cwd, path).ok_or(UserError::NotFound)?;
    let ino = match st.lookup(dino, base) {
        Some(ino) => {
            if flags.contains(OpenFlags::EXCL) {
                return Err(UserError::Exists);
            }
            if flags.contains(OpenFlags::TRUNC) && st.fi[ino as usize].size > 0 {
                let fi = &mut st.fi[ino as usize];
                fi.size = 0;
                fi.ver += 1;
            }
            ino
        }
        None => {
            if !flags.contains(OpenFlags::CREAT) {
                return Err(UserError::NotFound);
            }
            let ino = st.create(dino, base).ok_or(UserError::NoSpace)?;
            let fi = &mut st.fi[ino as usize];
            fi.mode = FileMode::REG.bits();
            fi.ver = 1; // 创建本身就是一次修改
            ino
        }
    };
    if flags.intersects(OpenFlags::WRONLY) {
        grant_rw(env, file_data(ino), PT_SIZE as u32)?;
    }
    let fd = (0..FD_COUNT)
        .find(|&i| st.fd[i].ino == 0)
        .ok_or(UserError::BadFd)?;
    st.fd[fd].ino = ino;
    st.fd[fd].flags = flags.bits();
    st.fd[fd].ofs = if flags.contains(OpenFlags::APPEND) {
        st.fi[ino as usize].size
    } else {
        0
    };
    store_state(env, &st)?;
    Ok(fd)
}

/// 关掉描述符。
pub fn close(env: &mut dyn SysApi, fd: usize) -> UResult<()> {
    let mut st = load_state(env)?;
    if fd >= FD_COUNT || st.fd[fd].ino == 0 {
        return Err(UserError::BadFd);
    }
    st.fd[fd] = Default::default();
    store_state(env, &st)?;
    Ok(())
}

/// 挪动读写位置。
pub fn seek(env: &mut dyn SysApi, fd: usize, ofs: u32) -> UResult<()> {
    let mut st = load_state(env)?;
    if fd >= FD_COUNT || st.fd[fd].ino == 0 {
        return Err(UserError::BadFd);
    }
    st.fd[fd].ofs = ofs;
    store_state(env, &st)?;
    Ok(())
}

/// 读。到头了给 0。
pub fn read(env: &mut dyn SysApi, fd: usize, buf: &mut [u8]) -> UResult<usize> {
    let mut st = load_state(env)?;
    if fd >= FD_COUNT || st.fd[fd].ino == 0 {
        return Err(UserError::BadFd);
    }
    let ino = st.fd[fd].ino;
    let fi = &st.fi[ino as usize];
    let ofs = st.fd[fd].ofs;
    let n = (fi.size.saturating_sub(ofs) as usize).min(buf.len());
    if n > 0 {
        env.mem_read(file_data(ino) + ofs, &mut buf[..n])?;
    }
    st.fd[fd].ofs = ofs + n as u32;
    store_state(env, &st)?;
    Ok(n)
}

/// 写。覆盖已有字节算一次修改，版本加一；纯追加只长 `size`。
pub fn write(env: &mut dyn SysApi, fd: usize, buf: &[u8]) -> UResult<usize> {
    let mut st = load_state(env)?;
    if fd >= FD_COUNT || st.fd[fd].ino == 0 {
        return Err(UserError::BadFd);
    }
    let ino = st.fd[fd].ino;
    let append = OpenFlags::from_bits_truncate(st.fd[fd].flags).contains(OpenFlags::APPEND);
    let fi = &st.fi[ino as usize];
    let ofs = if append { fi.size } else { st.fd[fd].ofs };
    let end = ofs as u64 + buf.len() as u64;
    if end > FILE_MAXSIZE as u64 {
        return Err(UserError::TooBig);
    }
    grant_rw(env, file_data(ino), PT_SIZE as u32)?;
    env.mem_write(file_data(ino) + ofs, buf)?;
    let fi = &mut st.fi[ino as usize];
    if ofs < fi.size {
        fi.ver += 1;
    }
    fi.size = fi.size.max(end as u32);
    st.fd[fd].ofs = end as u32;
    store_state(env, &st)?;
    Ok(buf.len())
}

/// 建目录。目录的诞生也是一次修改。
pub fn mkdir(env: &mut dyn SysApi, path: &str) -> UResult<()> {
    let mut st = load_state(env)?;
    let (dino, base) = resolve_parent(&st, st.cwd, path).ok_or(UserError::NotFound)?;
    if st.lookup(dino, base).is_some() {
        return Err(UserError::Exists);
    }
    let ino = st.create(dino, base).ok_or(UserError::NoSpace)?;
    let fi = &mut st.fi[ino as usize];
    fi.mode = FileMode::DIR.bits();
    fi.ver = 1;
    store_state(env, &st)?;
    Ok(())
}

/// 删除。名字留着，模式清零，版本加一让对端看得见。
pub fn unlink(env: &mut dyn SysApi, path: &str) -> UResult<()> {
    let mut st = load_state(env)?;
    let ino = resolve(&st, st.cwd, path).ok_or(UserError::NotFound)?;
    if ino < merge_fs::INO_GENERAL {
        return Err(UserError::BadFd);
    }
    let fi = &mut st.fi[ino as usize];
    fi.mode = 0;
    fi.size = 0;
    fi.ver += 1;
    store_state(env, &st)?;
    Ok(())
}

/// 列目录。
pub fn readdir(env: &mut dyn SysApi, path: &str) -> UResult<Vec<String>> {
    let st = load_state(env)?;
    let dino = resolve(&st, st.cwd, path).ok_or(UserError::NotFound)?;
    if !st.fi[dino as usize].mode().contains(FileMode::DIR) {
        return Err(UserError::NotFound);
    }
    Ok(st
        .dir_entries(dino)
        .map(|i| String::from(st.fi[i as usize].name_str()))
        .collect())
}

/// 退出：挂出状态，然后一直停在会合点上等家长收走。
/// 只有整个进程被回收时才回来，带着终止错误。
pub fn exit(env: &mut dyn SysApi, status: i32) -> SysError {
    let err = (|| -> Result<(), SysError> {
        let mut st = load_state(env)?;
        st.exited = 1;
        st.status = status as u32;
        store_state(env, &st)?;
        loop {
            env.ret()?;
        }
    })()
    .unwrap_err();
    err
}
