//! 手搓 32 位可执行镜像，预装程序和测试都用它。
//! 装载器那头用 xmas-elf 解析，这里只要把头写对。

use page_map::USERLO;

/// 一段待装载的内容。
struct Segment {
    va: u32,
    data: Vec<u8>,
    writable: bool,
}

/// 镜像装配器。
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<Segment>,
}

const EHSIZE: u32 = 52;
const PHSIZE: u32 = 32;

impl ImageBuilder {
    /// 新镜像，入口在 `entry`。
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// 默认入口在用户窗口起点。
    pub fn at_userlo() -> Self {
        Self::new(USERLO)
    }

    /// 加一段。
    pub fn segment(mut self, va: u32, data: &[u8], writable: bool) -> Self {
        self.segments.push(Segment {
            va,
            data: data.to_vec(),
            writable,
        });
        self
    }

    /// 出成品。
    pub fn build(self) -> Vec<u8> {
        let phnum = self.segments.len() as u32;
        let mut out = Vec::new();

        // ELF 头
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        push16(&mut out, 2); // ET_EXEC
        push16(&mut out, 3); // EM_386
        push32(&mut out, 1);
        push32(&mut out, self.entry);
        push32(&mut out, EHSIZE); // 程序头紧跟其后
        push32(&mut out, 0);
        push32(&mut out, 0);
        push16(&mut out, EHSIZE as u16);
        push16(&mut out, PHSIZE as u16);
        push16(&mut out, phnum as u16);
        push16(&mut out, 0);
        push16(&mut out, 0);
        push16(&mut out, 0);
        debug_assert_eq!(out.len() as u32, EHSIZE);

        // 程序头表
        let mut off = EHSIZE + phnum * PHSIZE;
        for s in &self.segments {
            push32(&mut out, 1); // PT_LOAD
            push32(&mut out, off);
            push32(&mut out, s.va);
            push32(&mut out, s.va);
            push32(&mut out, s.data.len() as u32);
            push32(&mut out, s.data.len() as u32);
            push32(&mut out, if s.writable { 4 | 2 } else { 4 | 1 });
            push32(&mut out, 4);
            off += s.data.len() as u32;
        }

        // 内容
        for s in &self.segments {
            out.extend_from_slice(&s.data);
        }
        out
    }
}

fn push16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
