//! 隔离异常检查
//!
//! 每个检查都是 `(事务图, 事务状态)` 上的纯函数，分析器上的同名方法只是转调。
//! 环相关的检查使用剥离法：反复删除入度（再出度）为 0 的节点，删不空即有环。

use super::graph::{AdjMatrix, DependencyType, TxnGraph, TxnStatus};
use super::DependencyAnalyzer;
use crate::history::StmtKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error};

/// 检查种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    G1a,
    G1b,
    G1c,
    G2Item,
    GsiA,
    GsiB,
}

impl AnomalyKind {
    /// 运行顺序
    pub const ALL: [AnomalyKind; 6] = [
        AnomalyKind::G1a,
        AnomalyKind::G1b,
        AnomalyKind::G1c,
        AnomalyKind::G2Item,
        AnomalyKind::GsiA,
        AnomalyKind::GsiB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::G1a => "G1a",
            AnomalyKind::G1b => "G1b",
            AnomalyKind::G1c => "G1c",
            AnomalyKind::G2Item => "G2-item",
            AnomalyKind::GsiA => "GSIa",
            AnomalyKind::GsiB => "GSIb",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 检测到的异常及诊断信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anomaly {
    /// 已提交事务读到了中止事务的写
    G1a { aborted: usize, committed: usize },
    /// 读到了写者随后又覆盖掉的中间版本
    G1b { row_id: i64, writer: usize, reader: usize },
    /// 剥离后剩下的边
    G1c { edges: Vec<(usize, usize)> },
    G2Item { edges: Vec<(usize, usize)> },
    /// 有 WW/WR 但没有 START_DEPEND
    GsiA { from: usize, to: usize },
    GsiB { edges: Vec<(usize, usize)> },
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Anomaly::G1a { .. } => AnomalyKind::G1a,
            Anomaly::G1b { .. } => AnomalyKind::G1b,
            Anomaly::G1c { .. } => AnomalyKind::G1c,
            Anomaly::G2Item { .. } => AnomalyKind::G2Item,
            Anomaly::GsiA { .. } => AnomalyKind::GsiA,
            Anomaly::GsiB { .. } => AnomalyKind::GsiB,
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::G1a { aborted, committed } => {
                write!(f, "G1a: abort txn {} -> commit txn {}", aborted, committed)
            }
            Anomaly::G1b {
                row_id,
                writer,
                reader,
            } => write!(
                f,
                "G1b: txn {} read an intermediate version of row {} written by txn {}",
                reader, row_id, writer
            ),
            Anomaly::GsiA { from, to } => write!(f, "GSIa: txn {} -> txn {} without start dependency", from, to),
            Anomaly::G1c { edges } | Anomaly::G2Item { edges } | Anomaly::GsiB { edges } => {
                write!(f, "{}: cycle edges", self.kind())?;
                for (i, j) in edges {
                    write!(f, " {}->{}", i, j)?;
                }
                Ok(())
            }
        }
    }
}

/// 事务依赖图中的一个环
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnCycle {
    /// 环上的事务，按边的方向排列
    pub txns: Vec<usize>,
    /// (from, to, 类型)，最后一条边回到第一个事务
    pub edges: Vec<(usize, usize, DependencyType)>,
}

fn is_committed(status: &[TxnStatus], tid: usize) -> bool {
    status.get(tid) == Some(&TxnStatus::Commit)
}

/// 只包含已提交事务间给定依赖的 0/1 矩阵
fn committed_matrix(graph: &TxnGraph, status: &[TxnStatus], wanted: &[DependencyType]) -> AdjMatrix {
    let n = graph.size();
    let mut m = AdjMatrix::new(n);
    for i in (0..n).filter(|&i| is_committed(status, i)) {
        for j in (0..n).filter(|&j| is_committed(status, j)) {
            if graph.has_any(i, j, wanted) {
                m.set(i, j, true);
            }
        }
    }
    m
}

/// 剥离后仍有环则返回剩下的边
fn peel_cycle(mut m: AdjMatrix) -> Option<Vec<(usize, usize)>> {
    if !m.reduce_indegree() {
        return None;
    }
    if !m.reduce_outdegree() {
        return None;
    }
    Some(m.edges())
}

/// G1a：中止事务 j 到已提交事务 i 的 WR
pub fn check_g1a(graph: &TxnGraph, status: &[TxnStatus]) -> Option<Anomaly> {
    let n = graph.size();
    for j in (0..n).filter(|&j| status.get(j) == Some(&TxnStatus::Abort)) {
        for i in (0..n).filter(|&i| is_committed(status, i)) {
            if graph.contains(j, i, DependencyType::WriteRead) {
                error!(abort_txn = j, commit_txn = i, "find G1a");
                return Some(Anomaly::G1a {
                    aborted: j,
                    committed: i,
                });
            }
        }
    }
    None
}

/// G1c：已提交事务间 {WW, WR} 构成环
///
/// # 示例
///
/// ```
/// use rs_txncheck::analyzer::checks::check_g1c;
/// use rs_txncheck::analyzer::{DependencyType, TxnGraph, TxnStatus};
///
/// let mut graph = TxnGraph::new(2);
/// graph.insert(0, 1, DependencyType::WriteWrite);
/// graph.insert(1, 0, DependencyType::WriteRead);
///
/// let committed = [TxnStatus::Commit, TxnStatus::Commit];
/// assert!(check_g1c(&graph, &committed).is_some());
///
/// let aborted = [TxnStatus::Commit, TxnStatus::Abort];
/// assert!(check_g1c(&graph, &aborted).is_none());
/// ```
pub fn check_g1c(graph: &TxnGraph, status: &[TxnStatus]) -> Option<Anomaly> {
    let m = committed_matrix(
        graph,
        status,
        &[DependencyType::WriteWrite, DependencyType::WriteRead],
    );
    let edges = peel_cycle(m)?;
    error!(?edges, "have cycle in G1c");
    Some(Anomaly::G1c { edges })
}

/// G2-item：已提交事务间 {WW, WR, RW} 构成环
pub fn check_g2_item(graph: &TxnGraph, status: &[TxnStatus]) -> Option<Anomaly> {
    let m = committed_matrix(
        graph,
        status,
        &[
            DependencyType::WriteWrite,
            DependencyType::WriteRead,
            DependencyType::ReadWrite,
        ],
    );
    let edges = peel_cycle(m)?;
    error!(?edges, "have cycle in G2-item");
    Some(Anomaly::G2Item { edges })
}

/// GSIa：WW 或 WR 没有伴随 START_DEPEND
pub fn check_gsia(graph: &TxnGraph) -> Option<Anomaly> {
    let n = graph.size();
    for i in 0..n {
        for j in 0..n {
            if !graph.has_any(i, j, &[DependencyType::WriteWrite, DependencyType::WriteRead]) {
                continue;
            }
            if !graph.contains(i, j, DependencyType::StartDepend) {
                error!(txn_i = i, txn_j = j, "find GSIa");
                return Some(Anomaly::GsiA { from: i, to: j });
            }
        }
    }
    None
}

/// GSIb：{WW, WR, RW, STRICT_START} 上恰好含一条 RW 的环
///
/// 先去掉所有只有 RW 的边，再逐条加回，每次只保留一条。
/// 同时带有其他依赖的边保留不动，那种环由 G1c 报告。
pub fn check_gsib(graph: &TxnGraph, status: &[TxnStatus]) -> Option<Anomaly> {
    let mut m = committed_matrix(
        graph,
        status,
        &[
            DependencyType::WriteWrite,
            DependencyType::WriteRead,
            DependencyType::ReadWrite,
            DependencyType::StrictStartDepend,
        ],
    );
    if !m.reduce_indegree() || !m.reduce_outdegree() {
        return None;
    }

    let rw_edges: Vec<(usize, usize)> = m
        .edges()
        .into_iter()
        .filter(|&(i, j)| {
            graph.get(i, j).len() == 1 && graph.contains(i, j, DependencyType::ReadWrite)
        })
        .collect();
    for &(i, j) in &rw_edges {
        m.set(i, j, false);
    }

    for &(i, j) in &rw_edges {
        m.set(i, j, true);
        let mut probe = m.clone();
        if probe.reduce_indegree() {
            let edges = probe.edges();
            error!(?edges, rw_edge = ?(i, j), "have cycle in GSIb");
            return Some(Anomaly::GsiB { edges });
        }
        m.set(i, j, false);
    }
    None
}

struct CycleSearch<'a> {
    dsg: &'a [BTreeSet<(usize, DependencyType)>],
    visited: Vec<bool>,
    active: Vec<bool>,
    parent: Vec<Option<usize>>,
    parent_edge: Vec<Option<DependencyType>>,
    found: Option<TxnCycle>,
}

impl CycleSearch<'_> {
    fn dfs(&mut self, node: usize, parent: Option<usize>, dt: Option<DependencyType>) {
        if self.found.is_some() {
            return;
        }
        if self.active[node] {
            if let (Some(from), Some(closing)) = (parent, dt) {
                self.found = Some(self.reconstruct(node, from, closing));
            }
            return;
        }
        if self.visited[node] {
            return;
        }

        self.parent[node] = parent;
        self.parent_edge[node] = dt;
        self.active[node] = true;
        self.visited[node] = true;

        let dsg = self.dsg;
        for &(next, next_dt) in &dsg[node] {
            self.dfs(next, Some(node), Some(next_dt));
        }

        self.active[node] = false;
    }

    /// 从 from 沿 parent 回溯到 node，再反转
    fn reconstruct(&self, node: usize, from: usize, closing: DependencyType) -> TxnCycle {
        let mut txns = vec![from];
        let mut cur = from;
        while cur != node {
            match self.parent[cur] {
                Some(p) => {
                    txns.push(p);
                    cur = p;
                }
                None => break,
            }
        }
        txns.reverse();

        let mut edges = Vec::with_capacity(txns.len());
        for pair in txns.windows(2) {
            if let Some(dt) = self.parent_edge[pair[1]] {
                edges.push((pair[0], pair[1], dt));
            }
        }
        edges.push((from, node, closing));
        TxnCycle { txns, edges }
    }
}

/// 在邻接表上做 DFS，遇到活跃节点即重建环
pub fn find_cycle(dsg: &[BTreeSet<(usize, DependencyType)>]) -> Option<TxnCycle> {
    let n = dsg.len();
    let mut search = CycleSearch {
        dsg,
        visited: vec![false; n],
        active: vec![false; n],
        parent: vec![None; n],
        parent_edge: vec![None; n],
        found: None,
    };
    for i in 0..n {
        search.dfs(i, None, None);
    }
    search.found
}

/// 事务图的邻接表视图，忽略自环和 START / STRICT_START
pub fn txn_graph_adjacency(graph: &TxnGraph) -> Vec<BTreeSet<(usize, DependencyType)>> {
    let n = graph.size();
    let mut dsg = vec![BTreeSet::new(); n];
    for (i, out) in dsg.iter_mut().enumerate() {
        for j in (0..n).filter(|&j| j != i) {
            for &dt in graph.get(i, j) {
                if !is_start(dt) {
                    out.insert((j, dt));
                }
            }
        }
    }
    dsg
}

fn is_start(dt: DependencyType) -> bool {
    matches!(
        dt,
        DependencyType::StartDepend | DependencyType::StrictStartDepend
    )
}

impl DependencyAnalyzer {
    pub fn check_g1a(&self) -> Option<Anomaly> {
        check_g1a(self.graph(), self.txn_status())
    }

    /// G1b：写者在自己的结束之前又覆盖了被其他事务读到的版本
    pub fn check_g1b(&self) -> Option<Anomaly> {
        for row in self.history().rows() {
            let ops = &row.ops;
            for (i, first_write) in ops.iter().enumerate() {
                if first_write.usage != StmtKind::AfterWriteRead {
                    continue;
                }
                let tid = first_write.tid;
                let (_, _, end) = self.txn_bounds(tid);
                let txn_end = end.map_or(-1, |e| e as i64);

                let mut other_read = None;
                let mut second_write = None;
                for op in &ops[i + 1..] {
                    if op.stmt_idx.map_or(-1, |s| s as i64) > txn_end {
                        break;
                    }
                    if other_read.is_none() && op.write_op_id == first_write.write_op_id && op.tid != tid {
                        other_read = Some(op);
                    }
                    if second_write.is_none() && op.tid == tid && op.usage == StmtKind::BeforeWriteRead {
                        second_write = Some(op);
                    }
                    if let (Some(read), Some(rewrite)) = (other_read, second_write) {
                        error!(
                            tid,
                            first_write = ?self.row_output(first_write.hash),
                            reader = read.tid,
                            read_row = ?self.row_output(read.hash),
                            second_write = ?rewrite.stmt_idx,
                            "find G1b"
                        );
                        return Some(Anomaly::G1b {
                            row_id: row.row_id,
                            writer: tid,
                            reader: read.tid,
                        });
                    }
                }
            }
        }
        None
    }

    pub fn check_g1c(&self) -> Option<Anomaly> {
        check_g1c(self.graph(), self.txn_status())
    }

    pub fn check_g2_item(&self) -> Option<Anomaly> {
        check_g2_item(self.graph(), self.txn_status())
    }

    pub fn check_gsia(&self) -> Option<Anomaly> {
        check_gsia(self.graph())
    }

    pub fn check_gsib(&self) -> Option<Anomaly> {
        check_gsib(self.graph(), self.txn_status())
    }

    /// 依次运行选中的检查，返回第一个异常
    pub fn run_checks(&self, kinds: &[AnomalyKind]) -> Option<Anomaly> {
        for kind in AnomalyKind::ALL {
            if !kinds.contains(&kind) {
                continue;
            }
            let found = match kind {
                AnomalyKind::G1a => self.check_g1a(),
                AnomalyKind::G1b => self.check_g1b(),
                AnomalyKind::G1c => self.check_g1c(),
                AnomalyKind::G2Item => self.check_g2_item(),
                AnomalyKind::GsiA => self.check_gsia(),
                AnomalyKind::GsiB => self.check_gsib(),
            };
            if let Some(anomaly) = found {
                error!(%anomaly, "anomaly detected");
                return Some(anomaly);
            }
            debug!(check = %kind, "passed");
        }
        None
    }

    /// DSG 上的任意环：事务图的边加上跨事务的语句边，去掉 START 类依赖
    pub fn check_any_transaction_cycle(&self) -> Option<TxnCycle> {
        let mut dsg = txn_graph_adjacency(self.graph());
        for ((from, to), deps) in self.stmt_graph() {
            if from.txn_id == to.txn_id {
                continue;
            }
            for &dt in deps.iter().filter(|dt| !is_start(**dt)) {
                dsg[from.txn_id].insert((to.txn_id, dt));
            }
        }

        let cycle = find_cycle(&dsg)?;
        for (i, out) in dsg.iter().enumerate() {
            debug!(txn = i, edges = ?out, "dsg");
        }
        error!(txns = ?cycle.txns, "cycle found in the dependency graph");
        Some(cycle)
    }

    /// 去掉中止事务和初始事务后按 Kahn 剥离
    ///
    /// 返回 (环上节点, 已排序节点)。无环时前者为空。
    pub fn check_txn_graph_cycle(&self) -> (BTreeSet<usize>, Vec<usize>) {
        let n = self.tid_num();
        let mut removed: BTreeSet<usize> = (0..n)
            .filter(|&i| self.txn_status()[i] == TxnStatus::Abort)
            .collect();
        removed.insert(self.init_tid());

        let wanted = [
            DependencyType::WriteRead,
            DependencyType::WriteWrite,
            DependencyType::ReadWrite,
            DependencyType::VersionSetDepend,
            DependencyType::OverwriteDepend,
        ];
        let mut sorted = Vec::new();
        while removed.len() < n {
            let zero = (0..n).filter(|i| !removed.contains(i)).find(|&i| {
                !(0..n)
                    .filter(|j| !removed.contains(j))
                    .any(|j| self.graph().has_any(j, i, &wanted))
            });
            let Some(idx) = zero else {
                break;
            };
            removed.insert(idx);
            sorted.push(idx);
        }

        let cycle_nodes = (0..n).filter(|i| !removed.contains(i)).collect();
        (cycle_nodes, sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Trace;
    use crate::history::{StmtId, StmtUsage};

    fn committed(n: usize) -> Vec<TxnStatus> {
        vec![TxnStatus::Commit; n]
    }

    #[test]
    fn test_find_cycle_reports_all_nodes() {
        let mut g = TxnGraph::new(3);
        g.insert(0, 1, DependencyType::WriteWrite);
        g.insert(1, 2, DependencyType::WriteRead);
        g.insert(2, 0, DependencyType::WriteRead);
        let cycle = find_cycle(&txn_graph_adjacency(&g)).unwrap();
        let nodes: BTreeSet<usize> = cycle.txns.iter().copied().collect();
        assert_eq!(nodes, BTreeSet::from([0, 1, 2]));
        assert_eq!(cycle.edges.len(), 3);
        assert!(cycle.edges.contains(&(2, 0, DependencyType::WriteRead)));
    }

    #[test]
    fn test_start_edges_do_not_close_cycle() {
        let mut g = TxnGraph::new(2);
        g.insert(0, 1, DependencyType::WriteRead);
        g.insert(1, 0, DependencyType::StartDepend);
        assert!(find_cycle(&txn_graph_adjacency(&g)).is_none());
    }

    /// T0 和 T1 串行更新同一行
    fn serial_analyzer() -> DependencyAnalyzer {
        let row = |v: &str| vec![vec![v.to_string(), "1".to_string(), "0".to_string()]];
        let mut trace = Trace {
            init_outputs: vec![row("1")],
            statuses: committed(2),
            ..Default::default()
        };
        for (tid, before, after) in [(0, "1", "2"), (1, "2", "3")] {
            let stmts = [
                (StmtKind::Init, vec![]),
                (StmtKind::BeforeWriteRead, row(before)),
                (StmtKind::Update, vec![]),
                (StmtKind::AfterWriteRead, row(after)),
                (StmtKind::Init, vec![]),
            ];
            for (kind, output) in stmts {
                trace.outputs.push(output);
                trace.tids.push(tid);
                trace.usages.push(StmtUsage::on_table(kind, "t_0"));
            }
        }
        DependencyAnalyzer::new(trace, 1, 0).unwrap()
    }

    #[test]
    fn test_any_cycle_merges_cross_txn_stmt_edges() {
        let mut da = serial_analyzer();
        assert!(da.check_any_transaction_cycle().is_none());

        // 只靠 START 依赖闭合的环不算
        let back = (StmtId::new(1, 3), StmtId::new(0, 1));
        da.graph.insert(1, 0, DependencyType::StartDepend);
        da.stmt_graph
            .entry(back)
            .or_default()
            .insert(DependencyType::StrictStartDepend);
        assert!(da.check_any_transaction_cycle().is_none());

        // 事务内的语句边不参与
        da.stmt_graph
            .entry((StmtId::new(1, 3), StmtId::new(1, 1)))
            .or_default()
            .insert(DependencyType::ReadWrite);
        assert!(da.check_any_transaction_cycle().is_none());

        // 只存在于语句图中的跨事务依赖会合并进事务图
        da.stmt_graph
            .entry(back)
            .or_default()
            .insert(DependencyType::ReadWrite);
        assert!(!da.graph().contains(1, 0, DependencyType::ReadWrite));
        let cycle = da.check_any_transaction_cycle().unwrap();
        let nodes: BTreeSet<usize> = cycle.txns.iter().copied().collect();
        assert_eq!(nodes, BTreeSet::from([0, 1]));
        assert!(cycle.edges.contains(&(1, 0, DependencyType::ReadWrite)));
    }

    #[test]
    fn test_g1a() {
        let mut g = TxnGraph::new(3);
        g.insert(0, 1, DependencyType::WriteRead);
        let status = [TxnStatus::Abort, TxnStatus::Commit, TxnStatus::Commit];
        assert_eq!(
            check_g1a(&g, &status),
            Some(Anomaly::G1a {
                aborted: 0,
                committed: 1
            })
        );
        assert_eq!(check_g1a(&g, &committed(3)), None);
    }

    #[test]
    fn test_g2_item_needs_rw() {
        let mut g = TxnGraph::new(2);
        g.insert(0, 1, DependencyType::WriteWrite);
        g.insert(1, 0, DependencyType::ReadWrite);
        assert!(check_g1c(&g, &committed(2)).is_none());
        let found = check_g2_item(&g, &committed(2)).unwrap();
        assert_eq!(found.kind(), AnomalyKind::G2Item);
    }

    #[test]
    fn test_gsia() {
        let mut g = TxnGraph::new(2);
        g.insert(0, 1, DependencyType::WriteRead);
        g.insert(0, 1, DependencyType::StartDepend);
        assert!(check_gsia(&g).is_none());
        g.insert(1, 0, DependencyType::WriteWrite);
        assert_eq!(check_gsia(&g), Some(Anomaly::GsiA { from: 1, to: 0 }));
    }

    #[test]
    fn test_gsib_exactly_one_rw() {
        let mut g = TxnGraph::new(3);
        g.insert(0, 1, DependencyType::ReadWrite);
        g.insert(1, 2, DependencyType::WriteWrite);
        g.insert(2, 0, DependencyType::StrictStartDepend);
        assert!(check_gsib(&g, &committed(3)).is_some());

        let mut two = TxnGraph::new(3);
        two.insert(0, 1, DependencyType::ReadWrite);
        two.insert(1, 2, DependencyType::ReadWrite);
        two.insert(2, 0, DependencyType::WriteRead);
        assert!(check_gsib(&two, &committed(3)).is_none());
    }

    #[test]
    fn test_anomaly_display() {
        let a = Anomaly::G1c {
            edges: vec![(0, 1), (1, 0)],
        };
        assert_eq!(a.to_string(), "G1c: cycle edges 0->1 1->0");
        assert_eq!(AnomalyKind::G2Item.to_string(), "G2-item");
    }
}
