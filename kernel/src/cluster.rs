//! 多节点试验台：按轮次驱动各节点，在节点之间递送以太帧。
//!
//! 递送保序，但可以按需丢帧或复制帧，用来逼出协议的重传和幂等路径。

use crate::node::{BaggageStore, Node, NodeConfig, Step};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// 一组节点和它们之间的线。
pub struct Cluster {
    nodes: Vec<Node>,
    drop_next: usize,
    dup_next: usize,
}

impl Cluster {
    /// 按配置起一组节点。节点号必须互不相同。
    pub fn new(configs: Vec<NodeConfig>) -> Self {
        let store: BaggageStore = Rc::new(RefCell::new(BTreeMap::new()));
        let nodes: Vec<Node> = configs
            .into_iter()
            .map(|c| Node::new_shared(c, store.clone()))
            .collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                assert_ne!(a.node_id(), b.node_id());
            }
        }
        Self {
            nodes,
            drop_next: 0,
            dup_next: 0,
        }
    }

    /// 取某个节点。
    pub fn node(&mut self, id: u8) -> &mut Node {
        self.nodes
            .iter_mut()
            .find(|n| n.node_id() == id)
            .expect("no such node")
    }

    /// 接下来的 `n` 帧在线上丢掉。
    pub fn drop_frames(&mut self, n: usize) {
        self.drop_next += n;
    }

    /// 接下来的 `n` 帧送达两遍。
    pub fn duplicate_frames(&mut self, n: usize) {
        self.dup_next += n;
    }

    /// 驱动若干轮：每轮每个节点调度一个时间片、收发一轮帧、走一拍时钟。
    pub fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for i in 0..self.nodes.len() {
                let _ = self.nodes[i].step();
                let frames = self.nodes[i].take_outbox();
                for frame in frames {
                    if self.drop_next > 0 {
                        self.drop_next -= 1;
                        continue;
                    }
                    let copies = if self.dup_next > 0 {
                        self.dup_next -= 1;
                        2
                    } else {
                        1
                    };
                    // 目的节点号在目标 MAC 的最后一个字节里
                    let dst = frame[5];
                    for _ in 0..copies {
                        if let Some(n) = self.nodes.iter_mut().find(|n| n.node_id() == dst) {
                            n.rx_frame(&frame);
                        }
                    }
                }
                self.nodes[i].tick();
            }
        }
    }

    /// 驱动到某个节点的根进程退出，或轮次耗尽。
    pub fn pump_until_exit(&mut self, id: u8, max_rounds: usize) -> Option<i32> {
        for _ in 0..max_rounds {
            self.pump(1);
            if let Some(code) = self.node(id).exit_status() {
                return Some(code);
            }
        }
        self.node(id).exit_status()
    }

    /// 所有节点都闲着、线上也没帧了吗。
    pub fn quiet(&mut self) -> bool {
        self.nodes
            .iter_mut()
            .all(|n| n.step() == Step::Idle && n.take_outbox().is_empty())
    }
}
