//! exec：在保留的 0 号孩子里把新程序搭好，再整个套到自己头上。

use crate::{file, load_state, UResult, UserError, ALLSIZE, ALLVA};
use alloc::{string::String, vec::Vec};
use merge_fs::{file_data, FILESVA, FILE_INODES};
use page_map::{PAGE_SIZE, PT_SIZE, SCRATCHLO, STACKHI};
use rendezvous::{Cmd, SysApi};
use xmas_elf::{program, ElfFile};

/// 可装载镜像的上限。暂存区装得下它，4 MiB 对齐。
pub const EXEMAX: u32 = 16 << 20;

/// 文件区整体的长度，exec 时原样带给新程序。
const FILE_AREA: u32 = FILE_INODES as u32 * PT_SIZE as u32;

/// 换掉自己：按 `path` 的镜像重建 0 号孩子，搭好参数栈，
/// 然后把 0 号的地址空间整个拷回来，从新程序的入口接着跑。
/// 返回新程序的退出码。
pub fn exec(env: &mut dyn SysApi, path: &str, args: &[&str]) -> UResult<i32> {
    // 0 号孩子从一张白纸开始
    env.put(
        Cmd::PUT | Cmd::ZERO,
        0,
        None,
        None,
        ALLVA,
        ALLVA,
        ALLSIZE,
    )?;

    // 镜像从文件层读出来
    let st = load_state(env)?;
    let ino = file::resolve(&st, st.cwd, path).ok_or(UserError::NotFound)?;
    let size = st.fi[ino as usize].size as usize;
    let name = String::from(st.fi[ino as usize].name_str());
    drop(st);
    let mut image = alloc::vec![0u8; size];
    env.mem_read(file_data(ino), &mut image)?;

    load_image(env, &image)?;
    let esp = copy_args(env, args)?;

    // Unix 侧的进程状态跟着走：文件区原样拷给新程序
    env.put(
        Cmd::PUT | Cmd::COPY,
        0,
        None,
        None,
        FILESVA,
        FILESVA,
        FILE_AREA,
    )?;

    // 新程序的正文在注册表里
    let main = env.program(&name)?;

    // 0 号的记忆盖住自己的，就此变身
    env.get(Cmd::GET | Cmd::COPY, 0, None, ALLVA, ALLVA, ALLSIZE)?;

    let code = main(env, esp);
    let _ = file::exit(env, code);
    Ok(code)
}

/// 把 ELF 的可装载段铺进暂存区，再一次性拷进 0 号孩子。
fn load_image(env: &mut dyn SysApi, image: &[u8]) -> UResult<()> {
    // 暂存区先清干净，段落才能从零页长出来
    env.get(Cmd::GET | Cmd::ZERO, 0, None, 0, SCRATCHLO, EXEMAX)?;

    let elf = ElfFile::new(image).map_err(|_| UserError::BadImage)?;
    let scratch_off = SCRATCHLO - ALLVA;
    for ph in elf.program_iter() {
        if !matches!(ph.get_type(), Ok(program::Type::Load)) {
            continue;
        }
        let valo = ph.virtual_addr() as u32;
        let memsz = ph.mem_size() as u32;
        let vahi = valo.checked_add(memsz).ok_or(UserError::BadImage)?;
        // 整个段必须落在镜像窗口里
        if valo < ALLVA || vahi > ALLVA + EXEMAX || vahi < valo {
            return Err(UserError::BadImage);
        }
        let filesz = ph.file_size() as usize;
        let off = ph.offset() as usize;
        if off + filesz > image.len() {
            return Err(UserError::BadImage);
        }

        let pagelo = valo & !(PAGE_SIZE as u32 - 1);
        let pagehi = (vahi + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1);
        env.get(
            Cmd::GET | Cmd::PERM | Cmd::READ | Cmd::WRITE,
            0,
            None,
            0,
            pagelo + scratch_off,
            pagehi - pagelo,
        )?;
        env.mem_write(valo + scratch_off, &image[off..off + filesz])?;
        // 只读段把写权限收回去
        if !ph.flags().is_write() {
            env.get(
                Cmd::GET | Cmd::PERM | Cmd::READ,
                0,
                None,
                0,
                pagelo + scratch_off,
                pagehi - pagelo,
            )?;
        }
    }

    env.put(
        Cmd::PUT | Cmd::COPY,
        0,
        None,
        None,
        SCRATCHLO,
        ALLVA,
        EXEMAX,
    )?;
    Ok(())
}

/// 在暂存区搭参数栈再拷到 0 号的栈顶段。字符串从顶上往下排，
/// 指针按搬家后的落点先修好，`argc` 压在最下面。返回新栈指针。
fn copy_args(env: &mut dyn SysApi, args: &[&str]) -> UResult<u32> {
    env.get(
        Cmd::GET | Cmd::ZERO | Cmd::PERM | Cmd::READ | Cmd::WRITE,
        0,
        None,
        0,
        SCRATCHLO,
        PT_SIZE as u32,
    )?;

    let top = SCRATCHLO + PT_SIZE as u32;
    let offset = STACKHI - top;
    let mut sp = top;
    let mut ptrs: Vec<u32> = Vec::with_capacity(args.len());
    for a in args {
        sp -= a.len() as u32 + 1; // 结尾的 NUL 本来就是零
        env.mem_write(sp, a.as_bytes())?;
        ptrs.push(sp + offset);
    }
    sp &= !3;
    sp -= 4 * (args.len() as u32 + 1);
    let vec_at = sp;
    for (i, p) in ptrs.iter().enumerate() {
        env.mem_write(vec_at + 4 * i as u32, &p.to_le_bytes())?;
    }
    sp -= 4;
    env.mem_write(sp, &(vec_at + offset).to_le_bytes())?;
    sp -= 4;
    env.mem_write(sp, &(args.len() as u32).to_le_bytes())?;

    env.put(
        Cmd::PUT | Cmd::COPY,
        0,
        None,
        None,
        SCRATCHLO,
        STACKHI - PT_SIZE as u32,
        PT_SIZE as u32,
    )?;
    Ok(sp + offset)
}

/// 新程序开场时从栈上把参数捡回来。
pub fn read_args(env: &mut dyn SysApi, esp: u32) -> UResult<Vec<String>> {
    let mut word = [0u8; 4];
    env.mem_read(esp, &mut word)?;
    let argc = u32::from_le_bytes(word) as usize;
    env.mem_read(esp + 4, &mut word)?;
    let argv = u32::from_le_bytes(word);
    let mut out = Vec::with_capacity(argc);
    for i in 0..argc {
        env.mem_read(argv + 4 * i as u32, &mut word)?;
        let mut at = u32::from_le_bytes(word);
        let mut s = Vec::new();
        loop {
            let mut b = [0u8; 1];
            env.mem_read(at, &mut b)?;
            if b[0] == 0 {
                break;
            }
            s.push(b[0]);
            at += 1;
        }
        out.push(String::from_utf8(s).map_err(|_| UserError::BadImage)?);
    }
    Ok(out)
}
