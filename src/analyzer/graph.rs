use crate::history::StmtId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 依赖边类型，a -> b 表示 a 在该意义下先于 b
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DependencyType {
    /// a 写入的值被 b 读到
    WriteRead,
    /// a 写入的值被 b 覆盖
    WriteWrite,
    /// a 读到的值被 b 覆盖
    ReadWrite,
    /// a 结束早于 b 的第一条读写
    StartDepend,
    /// a 结束早于 b 的 BEGIN
    StrictStartDepend,
    /// 探针与被插桩语句
    InstrumentDepend,
    VersionSetDepend,
    OverwriteDepend,
    /// 同一事务内的程序顺序
    InnerDepend,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::WriteRead => "WRITE_READ",
            DependencyType::WriteWrite => "WRITE_WRITE",
            DependencyType::ReadWrite => "READ_WRITE",
            DependencyType::StartDepend => "START_DEPEND",
            DependencyType::StrictStartDepend => "STRICT_START_DEPEND",
            DependencyType::InstrumentDepend => "INSTRUMENT_DEPEND",
            DependencyType::VersionSetDepend => "VERSION_SET_DEPEND",
            DependencyType::OverwriteDepend => "OVERWRITE_DEPEND",
            DependencyType::InnerDepend => "INNER_DEPEND",
        }
    }

    /// WR / WW / RW
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DependencyType::WriteRead | DependencyType::WriteWrite | DependencyType::ReadWrite
        )
    }
}

pub type DepSet = BTreeSet<DependencyType>;

/// 语句级依赖图，以 StmtId 为键，语句队列变化后边仍然有效
pub type StmtGraph = BTreeMap<(StmtId, StmtId), DepSet>;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Commit,
    Abort,
    Undefined,
}

/// 事务级依赖图：n x n 的扁平矩阵，每格是一个依赖集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnGraph {
    n: usize,
    cells: Vec<DepSet>,
}

impl TxnGraph {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            cells: vec![DepSet::new(); n * n],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> &DepSet {
        &self.cells[i * self.n + j]
    }

    pub fn insert(&mut self, i: usize, j: usize, dt: DependencyType) {
        self.cells[i * self.n + j].insert(dt);
    }

    pub fn contains(&self, i: usize, j: usize, dt: DependencyType) -> bool {
        self.get(i, j).contains(&dt)
    }

    /// 某格是否含有给定集合中的任意依赖
    pub fn has_any(&self, i: usize, j: usize, wanted: &[DependencyType]) -> bool {
        let cell = self.get(i, j);
        wanted.iter().any(|dt| cell.contains(dt))
    }
}

/// 0/1 邻接矩阵，用于剥离检测环
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjMatrix {
    n: usize,
    cells: Vec<bool>,
}

impl AdjMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            cells: vec![false; n * n],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        self.cells[i * self.n + j]
    }

    pub fn set(&mut self, i: usize, j: usize, value: bool) {
        self.cells[i * self.n + j] = value;
    }

    pub fn edges(&self) -> Vec<(usize, usize)> {
        (0..self.n)
            .flat_map(|i| (0..self.n).map(move |j| (i, j)))
            .filter(|&(i, j)| self.get(i, j))
            .collect()
    }

    /// 反复删除入度为 0 的节点及其出边
    ///
    /// 图被删空返回 false，否则（剩余节点都有入边，即有环）返回 true。
    pub fn reduce_indegree(&mut self) -> bool {
        let mut deleted = vec![false; self.n];
        let mut deleted_num = 0;
        loop {
            if deleted_num == self.n {
                return false;
            }
            let zero = (0..self.n).find(|&i| !deleted[i] && !(0..self.n).any(|j| self.get(j, i)));
            let Some(idx) = zero else {
                return true;
            };
            deleted[idx] = true;
            deleted_num += 1;
            for j in 0..self.n {
                self.set(idx, j, false);
            }
        }
    }

    /// 反复删除出度为 0 的节点及其入边
    pub fn reduce_outdegree(&mut self) -> bool {
        let mut deleted = vec![false; self.n];
        let mut deleted_num = 0;
        loop {
            if deleted_num == self.n {
                return false;
            }
            let zero = (0..self.n).find(|&i| !deleted[i] && !(0..self.n).any(|j| self.get(i, j)));
            let Some(idx) = zero else {
                return true;
            };
            deleted[idx] = true;
            deleted_num += 1;
            for i in 0..self.n {
                self.set(i, idx, false);
            }
        }
    }
}

/// 按下标表示的可变工作图，排序算法在它上面删点删边
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkGraph {
    ins: Vec<BTreeSet<usize>>,
    outs: Vec<BTreeSet<usize>>,
}

impl WorkGraph {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            ins: vec![BTreeSet::new(); n],
            outs: vec![BTreeSet::new(); n],
        }
    }

    pub(crate) fn add_edge(&mut self, from: usize, to: usize) {
        self.outs[from].insert(to);
        self.ins[to].insert(from);
    }

    pub(crate) fn in_degree(&self, node: usize) -> usize {
        self.ins[node].len()
    }

    pub(crate) fn preds(&self, node: usize) -> &BTreeSet<usize> {
        &self.ins[node]
    }

    pub(crate) fn succs(&self, node: usize) -> &BTreeSet<usize> {
        &self.outs[node]
    }

    pub(crate) fn remove_out_edges(&mut self, node: usize) {
        let outs = std::mem::take(&mut self.outs[node]);
        for to in outs {
            self.ins[to].remove(&node);
        }
    }

    pub(crate) fn remove_node_edges(&mut self, node: usize) {
        self.remove_out_edges(node);
        let ins = std::mem::take(&mut self.ins[node]);
        for from in ins {
            self.outs[from].remove(&node);
        }
    }
}
