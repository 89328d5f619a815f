//! 跨节点迁移和拉页的线上格式。
//!
//! 裸以太帧，以太类型 `0x9876`。节点号 1..=8 住在 MAC 地址的最后一个
//! 字节里。帧体以一个字节的消息类型开头，后面是小端的字。一页拆成
//! 三份上路，三份的大小是两端共用的常量。

#![no_std]
#![deny(warnings)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;
use page_map::{Rr, PAGE_SIZE};
use rendezvous::{ProcState, Regs};

/// 我们认领的以太类型。
pub const ETHERTYPE: u16 = 0x9876;
/// 集群规模上限；共享掩码只有一个字节。
pub const MAX_NODES: u8 = 8;
/// 以太头的长度。
pub const ETH_HLEN: usize = 14;

/// 第 `p` 份在页内的起点。
pub const fn part_off(p: usize) -> usize {
    p * PART_LEN[0]
}

/// 三份各自的大小。加起来恰好一页。
pub const PART_LEN: [usize; 3] = [1368, 1368, 1360];
const _: () = assert!(PART_LEN[0] + PART_LEN[1] + PART_LEN[2] == PAGE_SIZE);

const MAC_BASE: [u8; 5] = [0x52, 0x54, 0x98, 0x76, 0x00];

/// `node` 号节点的 MAC 地址。
pub fn mac(node: u8) -> [u8; 6] {
    let mut m = [0; 6];
    m[..5].copy_from_slice(&MAC_BASE);
    m[5] = node;
    m
}

const T_MIGRQ: u8 = 1;
const T_MIGRP: u8 = 2;
const T_PULLRQ: u8 = 3;
const T_PULLRP: u8 = 4;

/// 拉的是哪一层的页。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageLevel {
    /// 一页数据。
    Page,
    /// 一张页表；格子在上路前改写成远程引用。
    Table,
    /// 一张页目录；同样改写，收端到货后把内核槽换回自己的。
    Dir,
}

impl PageLevel {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Page),
            1 => Some(Self::Table),
            2 => Some(Self::Dir),
            _ => None,
        }
    }

    /// 线上的样子。
    pub fn byte(self) -> u8 {
        match self {
            Self::Page => 0,
            Self::Table => 1,
            Self::Dir => 2,
        }
    }

    /// 这一层的格子解出来指向哪一层。
    pub fn below(self) -> Option<Self> {
        match self {
            Self::Page => None,
            Self::Table => Some(Self::Page),
            Self::Dir => Some(Self::Table),
        }
    }
}

/// 迁移请求：这个进程想搬去目的节点住。收到确认之前按时钟重发。
#[derive(Clone, Debug, PartialEq)]
pub struct Migrq {
    /// 不变的身份：进程出生的节点和槽位。
    pub home: Rr,
    /// 页目录去哪里拉。
    pub pdir: Rr,
    /// 保存下来的寄存器状态。
    pub save: ProcState,
}

/// 迁移确认，按出生地引用认领。没有序号，重复了也无妨。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Migrp {
    /// 确认的是哪个进程。
    pub home: Rr,
}

/// 拉页请求。`need` 每一位对应一份还没到的。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pullrq {
    /// 想要的页。
    pub rr: Rr,
    /// 按哪一层解释它。
    pub level: PageLevel,
    /// 位 0..2：还缺哪几份。
    pub need: u8,
}

/// 拉回来的页的一份。
#[derive(Clone, Debug, PartialEq)]
pub struct Pullrp {
    /// 属于哪一页。
    pub rr: Rr,
    /// 份号 0..2。
    pub part: u8,
    /// 恰好 `PART_LEN[part]` 个字节。
    pub data: Vec<u8>,
}

/// 任意一种消息。
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// 见 [`Migrq`]。
    Migrq(Migrq),
    /// 见 [`Migrp`]。
    Migrp(Migrp),
    /// 见 [`Pullrq`]。
    Pullrq(Pullrq),
    /// 见 [`Pullrp`]。
    Pullrp(Pullrp),
}

/// 一帧为什么被丢掉。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetError {
    /// 短得不成话。
    Runt,
    /// 不是给我们的，或者来自集群之外。
    Stray,
    /// 以太类型或消息类型不认识。
    BadType,
    /// 长度对不上消息。
    BadLength,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::Runt => write!(f, "runt frame"),
            NetError::Stray => write!(f, "stray frame"),
            NetError::BadType => write!(f, "unrecognized type"),
            NetError::BadLength => write!(f, "bad length"),
        }
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// 组装一帧，从 `src` 发往 `dst`。
pub fn encode(src: u8, dst: u8, pkt: &Packet) -> Vec<u8> {
    debug_assert!(src != dst && (1..=MAX_NODES).contains(&dst));
    let mut out = Vec::with_capacity(ETH_HLEN + 80);
    out.extend_from_slice(&mac(dst));
    out.extend_from_slice(&mac(src));
    out.extend_from_slice(&ETHERTYPE.to_be_bytes());
    match pkt {
        Packet::Migrq(m) => {
            out.push(T_MIGRQ);
            put_u32(&mut out, m.home.0);
            put_u32(&mut out, m.pdir.0);
            for w in m.save.tf.to_words() {
                put_u32(&mut out, w);
            }
        }
        Packet::Migrp(m) => {
            out.push(T_MIGRP);
            put_u32(&mut out, m.home.0);
        }
        Packet::Pullrq(p) => {
            out.push(T_PULLRQ);
            put_u32(&mut out, p.rr.0);
            out.push(p.level.byte());
            out.push(p.need & 7);
        }
        Packet::Pullrp(p) => {
            debug_assert_eq!(p.data.len(), PART_LEN[p.part as usize]);
            out.push(T_PULLRP);
            put_u32(&mut out, p.rr.0);
            out.push(p.part);
            out.extend_from_slice(&p.data);
        }
    }
    out
}

/// 解析送到 `me` 号节点的一帧。给出来源节点和消息。
pub fn decode(me: u8, frame: &[u8]) -> Result<(u8, Packet), NetError> {
    if frame.len() < ETH_HLEN + 1 {
        return Err(NetError::Runt);
    }
    if frame[..6] != mac(me) {
        return Err(NetError::Stray);
    }
    if frame[6..11] != MAC_BASE || !(1..=MAX_NODES).contains(&frame[11]) {
        return Err(NetError::Stray);
    }
    let src = frame[11];
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE {
        return Err(NetError::BadType);
    }
    let body = &frame[ETH_HLEN..];
    let pkt = match body[0] {
        T_MIGRQ => {
            if body.len() != 1 + 4 + 4 + 64 {
                return Err(NetError::BadLength);
            }
            let mut words = [0u32; 16];
            for (i, w) in words.iter_mut().enumerate() {
                *w = get_u32(body, 9 + i * 4);
            }
            Packet::Migrq(Migrq {
                home: Rr(get_u32(body, 1)),
                pdir: Rr(get_u32(body, 5)),
                save: ProcState {
                    tf: Regs::from_words(words),
                },
            })
        }
        T_MIGRP => {
            if body.len() != 5 {
                return Err(NetError::BadLength);
            }
            Packet::Migrp(Migrp {
                home: Rr(get_u32(body, 1)),
            })
        }
        T_PULLRQ => {
            if body.len() != 7 {
                return Err(NetError::BadLength);
            }
            let level = PageLevel::from_byte(body[5]).ok_or(NetError::BadType)?;
            Packet::Pullrq(Pullrq {
                rr: Rr(get_u32(body, 1)),
                level,
                need: body[6] & 7,
            })
        }
        T_PULLRP => {
            if body.len() < 6 {
                return Err(NetError::BadLength);
            }
            let part = body[5];
            if part > 2 || body.len() != 6 + PART_LEN[part as usize] {
                return Err(NetError::BadLength);
            }
            Packet::Pullrp(Pullrp {
                rr: Rr(get_u32(body, 1)),
                part,
                data: body[6..].to_vec(),
            })
        }
        _ => return Err(NetError::BadType),
    };
    Ok((src, pkt))
}
