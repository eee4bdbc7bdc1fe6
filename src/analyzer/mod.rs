//! 依赖分析
//!
//! 从一次并发执行的轨迹（输出、实际 tid 队列、语句用途、事务状态）构建
//! 事务级和语句级依赖图，并提供：
//! - 异常检查：G1a、G1b、G1c、G2-item、GSIa、GSIb
//! - 环检测：check_any_transaction_cycle、check_txn_graph_cycle
//! - 排序：拓扑排序（带去环）、最长路径、全部拓扑序
//!
//! 分析器在每一轮中从冻结的轨迹一次性构建，之后只读（remove_conflict_edges 除外）。

pub mod build;
pub mod checks;
pub mod dump;
pub mod graph;
pub mod order;

pub use checks::{Anomaly, AnomalyKind, TxnCycle};
pub use graph::{AdjMatrix, DepSet, DependencyType, StmtGraph, TxnGraph, TxnStatus};

use crate::history::{History, RowOutput, StmtId, StmtOutput, StmtUsage};
use std::collections::{BTreeSet, HashMap};

/// 分析器的输入：一次执行的轨迹
#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// 执行前各表的内容，每张表一个输出
    pub init_outputs: Vec<StmtOutput>,
    pub outputs: Vec<StmtOutput>,
    pub tids: Vec<usize>,
    pub usages: Vec<StmtUsage>,
    /// 每个事务的最终状态，长度即事务数
    pub statuses: Vec<TxnStatus>,
}

#[derive(Debug, Clone)]
pub struct DependencyAnalyzer {
    /// 事务数 + 1（最后一个是初始事务）
    tid_num: usize,
    stmt_num: usize,
    primary_key_index: usize,
    version_key_index: usize,

    txn_status: Vec<TxnStatus>,
    tid_queue: Vec<usize>,
    usages: Vec<StmtUsage>,
    outputs: Vec<StmtOutput>,
    txn_size: Vec<usize>,

    stmt_ids: Vec<StmtId>,
    index_of: HashMap<StmtId, usize>,

    history: History,
    hash_to_output: HashMap<u64, RowOutput>,

    graph: TxnGraph,
    stmt_graph: StmtGraph,
    /// 探针块的邻接关系（INSTRUMENT_DEPEND 的无向视图）
    instrument_adj: Vec<BTreeSet<usize>>,

    tid_strict_begin: Vec<Option<usize>>,
    tid_begin: Vec<Option<usize>>,
    tid_end: Vec<Option<usize>>,
}

impl DependencyAnalyzer {
    /// 初始事务的 tid
    pub fn init_tid(&self) -> usize {
        self.tid_num - 1
    }

    /// 事务数（含初始事务）
    pub fn tid_num(&self) -> usize {
        self.tid_num
    }

    pub fn stmt_num(&self) -> usize {
        self.stmt_num
    }

    pub fn graph(&self) -> &TxnGraph {
        &self.graph
    }

    pub fn stmt_graph(&self) -> &StmtGraph {
        &self.stmt_graph
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn txn_status(&self) -> &[TxnStatus] {
        &self.txn_status
    }

    pub fn tid_queue(&self) -> &[usize] {
        &self.tid_queue
    }

    pub fn usages(&self) -> &[StmtUsage] {
        &self.usages
    }

    pub fn stmt_id(&self, idx: usize) -> StmtId {
        self.stmt_ids[idx]
    }

    pub fn queue_idx(&self, id: &StmtId) -> Option<usize> {
        self.index_of.get(id).copied()
    }

    /// 某行内容对应的原始输出
    pub fn row_output(&self, hash: u64) -> Option<&RowOutput> {
        self.hash_to_output.get(&hash)
    }

    /// (strict_begin, begin, end)
    pub fn txn_bounds(&self, tid: usize) -> (Option<usize>, Option<usize>, Option<usize>) {
        (
            self.tid_strict_begin[tid],
            self.tid_begin[tid],
            self.tid_end[tid],
        )
    }

    fn is_committed(&self, tid: usize) -> bool {
        self.txn_status[tid] == TxnStatus::Commit
    }

    /// 与语句通过 INSTRUMENT_DEPEND 连通的整个探针块（包括自身）
    pub fn get_instrumented_stmt_set(&self, queue_idx: usize) -> BTreeSet<usize> {
        let mut processed = BTreeSet::new();
        let mut pending = vec![queue_idx];
        while let Some(idx) = pending.pop() {
            if !processed.insert(idx) {
                continue;
            }
            for &next in &self.instrument_adj[idx] {
                if !processed.contains(&next) {
                    pending.push(next);
                }
            }
        }
        processed
    }

    /// 事务的第一条或最后一条语句（BEGIN / COMMIT / ABORT）
    fn is_txn_boundary(&self, id: &StmtId) -> bool {
        id.pos == 0 || self.txn_size[id.txn_id] == id.pos + 1
    }

    /// 去掉事务边界语句和已被替换的语句
    fn strip_boundaries(&self, path: Vec<StmtId>) -> Vec<StmtId> {
        path.into_iter()
            .filter(|id| !self.is_txn_boundary(id))
            .filter(|id| match self.queue_idx(id) {
                Some(idx) => self.usages[idx].kind != crate::history::StmtKind::Init,
                None => false,
            })
            .collect()
    }
}
