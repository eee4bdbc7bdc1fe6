//! 语句排序：最长路径、去环拓扑排序、全部拓扑序
//!
//! 所有算法都在 `WorkGraph` 副本上删点删边，不修改分析器本身的依赖图。
//! 探针块（被插桩语句及其探针）总是作为一个整体输出或删除。

use super::graph::{DepSet, DependencyType, WorkGraph};
use super::DependencyAnalyzer;
use crate::history::{StmtId, StmtKind};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// 按依赖类别给语句边赋权
///
/// - 只有 INNER：1
/// - 只有 STRICT_START：10
/// - 含 STRICT_START 或 INNER 以及其他依赖：100
/// - 含 WW / WR：100000
/// - 只有 VS / OW / RW：10000
fn edge_weight(deps: &DepSet) -> Option<u64> {
    let mut deps = deps.clone();
    deps.remove(&DependencyType::StartDepend);
    deps.remove(&DependencyType::InstrumentDepend);
    if deps.is_empty() {
        return None;
    }
    let has = |dt: DependencyType| deps.contains(&dt);
    let weight = if has(DependencyType::InnerDepend) && deps.len() == 1 {
        1
    } else if has(DependencyType::StrictStartDepend) && deps.len() == 1 {
        10
    } else if has(DependencyType::StrictStartDepend) || has(DependencyType::InnerDepend) {
        100
    } else if has(DependencyType::WriteWrite) || has(DependencyType::WriteRead) {
        100_000
    } else if has(DependencyType::VersionSetDepend)
        || has(DependencyType::OverwriteDepend)
        || has(DependencyType::ReadWrite)
    {
        10_000
    } else {
        return None;
    };
    Some(weight)
}

/// 拓扑排序只关心的依赖：去掉 START / STRICT_START / INNER 后非空
fn is_order_edge(deps: &DepSet) -> bool {
    deps.iter().any(|dt| {
        !matches!(
            dt,
            DependencyType::StartDepend | DependencyType::StrictStartDepend | DependencyType::InnerDepend
        )
    })
}

impl DependencyAnalyzer {
    /// 语句级依赖图在下标上的视图
    fn work_graph(&self, keep: impl Fn(usize, usize, &DepSet) -> bool) -> WorkGraph {
        let mut g = WorkGraph::new(self.stmt_num());
        for ((from, to), deps) in self.stmt_graph() {
            let (Some(i), Some(j)) = (self.queue_idx(from), self.queue_idx(to)) else {
                continue;
            };
            if keep(i, j, deps) {
                g.add_edge(i, j);
            }
        }
        g
    }

    fn stmt_committed(&self, idx: usize) -> bool {
        self.is_committed(self.tid_queue()[idx])
    }

    /// 块外指向块内的边数（忽略 ignored 中的前驱）
    fn block_has_indegree(g: &WorkGraph, block: &BTreeSet<usize>, ignored: &[bool]) -> bool {
        block.iter().any(|&b| {
            g.preds(b)
                .iter()
                .any(|p| !block.contains(p) && !ignored[*p])
        })
    }

    /// 冲突最明显的语句路径
    ///
    /// 在已提交语句的带权图上按 Kahn 顺序松弛求最长路径。
    /// 出现环时随机选一个剩余语句，把它的整个探针块真正删除后继续。
    pub fn longest_stmt_path<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<StmtId> {
        let n = self.stmt_num();
        let mut weights: HashMap<(usize, usize), u64> = HashMap::new();
        for ((from, to), deps) in self.stmt_graph() {
            let (Some(i), Some(j)) = (self.queue_idx(from), self.queue_idx(to)) else {
                continue;
            };
            if !self.stmt_committed(i) || !self.stmt_committed(j) {
                continue;
            }
            if let Some(w) = edge_weight(deps) {
                weights.insert((i, j), w);
            }
        }

        let mut dist_graph = WorkGraph::new(n);
        for &(i, j) in weights.keys() {
            dist_graph.add_edge(i, j);
        }
        let original = dist_graph.clone();

        let mut dist = vec![0u64; n];
        let mut dad: Vec<Option<usize>> = vec![None; n];
        let mut processed = vec![false; n];
        let mut really_deleted = vec![false; n];

        while (0..n).any(|i| !processed[i] && !really_deleted[i]) {
            let zero = (0..n).find(|&i| {
                !processed[i] && !really_deleted[i] && dist_graph.in_degree(i) == 0
            });

            let Some(node) = zero else {
                // 有环：随机删掉一个剩余语句及其探针块
                let mut remaining: Vec<usize> = (0..n)
                    .filter(|&i| !processed[i] && !really_deleted[i])
                    .collect();
                remaining.sort_by_key(|&i| self.stmt_id(i));
                let pick = remaining[rng.gen_range(0..remaining.len())];
                for idx in self.get_instrumented_stmt_set(pick) {
                    really_deleted[idx] = true;
                    dist_graph.remove_node_edges(idx);
                }
                debug!(stmt = %self.stmt_id(pick), "cycle in longest_stmt_path, delete one block");
                continue;
            };

            let mut best = 0;
            let mut best_dad = None;
            for &pred in original.preds(node) {
                if really_deleted[pred] {
                    continue;
                }
                let w = weights.get(&(pred, node)).copied().unwrap_or(0);
                if dist[pred] + w > best {
                    best = dist[pred] + w;
                    best_dad = Some(pred);
                }
            }
            dist[node] = best;
            dad[node] = best_dad;
            processed[node] = true;
            dist_graph.remove_out_edges(node);
        }

        let mut longest = 0;
        let mut end = None;
        for i in (0..n).filter(|&i| !really_deleted[i]) {
            if dist[i] > longest {
                longest = dist[i];
                end = Some(i);
            }
        }

        let mut path = Vec::new();
        let mut visited = vec![false; n];
        let mut cur = end;
        while let Some(idx) = cur {
            if visited[idx] {
                break;
            }
            visited[idx] = true;
            path.push(self.stmt_id(idx));
            cur = dad[idx];
        }
        path.reverse();
        debug!(length = longest, stmts = path.len(), "stmt path");

        self.strip_boundaries(path)
    }

    /// 以探针块为单位的拓扑排序
    ///
    /// 每次从队尾往前找第一个没有外部入边的块输出；找不到说明有环，
    /// 删除内外边数最多的块后重试，此时返回的标志为 true。
    /// 中止事务的语句和 `deleted` 中的语句不参与排序。
    pub fn topological_sort_path(&self, deleted: &BTreeSet<StmtId>) -> (Vec<StmtId>, bool) {
        let n = self.stmt_num();
        let mut deleted_idx = vec![false; n];
        for id in deleted {
            if let Some(i) = self.queue_idx(id) {
                deleted_idx[i] = true;
            }
        }
        for (i, flag) in deleted_idx.iter_mut().enumerate() {
            if !self.stmt_committed(i) {
                *flag = true;
            }
        }

        let mut g = self.work_graph(|_, _, deps| is_order_edge(deps));
        for i in (0..n).filter(|&i| deleted_idx[i]) {
            g.remove_node_edges(i);
        }

        let mut outputted = vec![false; n];
        let mut path = Vec::new();
        let mut delete_flag = false;
        let none_ignored = vec![false; n];

        while (0..n).any(|i| !outputted[i] && !deleted_idx[i]) {
            let mut checked = vec![false; n];
            let mut zero_block = None;
            // 尽量使用逆序
            for i in (0..n).rev() {
                if checked[i] || outputted[i] || deleted_idx[i] {
                    continue;
                }
                let block = self.get_instrumented_stmt_set(i);
                for &b in &block {
                    checked[b] = true;
                }
                if !Self::block_has_indegree(&g, &block, &none_ignored) {
                    zero_block = Some(block);
                    break;
                }
            }

            if let Some(block) = zero_block {
                for b in block {
                    if outputted[b] || deleted_idx[b] {
                        continue;
                    }
                    path.push(self.stmt_id(b));
                    outputted[b] = true;
                    g.remove_node_edges(b);
                }
                continue;
            }

            delete_flag = true;
            let mut checked = vec![false; n];
            let mut target = None;
            let mut max_edge_num = 0;
            for i in 0..n {
                if checked[i] || outputted[i] || deleted_idx[i] {
                    continue;
                }
                let block = self.get_instrumented_stmt_set(i);
                let mut edge_num = 0;
                for &b in &block {
                    checked[b] = true;
                    edge_num += g.preds(b).iter().filter(|p| !block.contains(p)).count();
                    edge_num += g.succs(b).iter().filter(|s| !block.contains(s)).count();
                }
                if edge_num >= max_edge_num {
                    max_edge_num = edge_num;
                    target = Some(block);
                }
            }
            let Some(block) = target else {
                break;
            };
            debug!(stmts = ?block, max_edge_num, "cycle in topological_sort_path, delete block");
            for b in block {
                deleted_idx[b] = true;
                g.remove_node_edges(b);
            }
        }

        (self.strip_boundaries(path), delete_flag)
    }

    /// 枚举探针块的全部拓扑序，最多 limit 条
    pub fn get_all_topo_sort_paths(&self, limit: usize) -> Vec<Vec<StmtId>> {
        let n = self.stmt_num();
        let mut total = Vec::new();
        if limit == 0 {
            return total;
        }

        let deleted: BTreeSet<StmtId> = (0..n)
            .filter(|&i| !self.stmt_committed(i) || self.usages()[i].kind == StmtKind::Init)
            .map(|i| self.stmt_id(i))
            .collect();
        let (path, _) = self.topological_sort_path(&deleted);
        let on_path: BTreeSet<usize> = path.iter().filter_map(|id| self.queue_idx(id)).collect();
        let removed: Vec<bool> = (0..n).map(|i| !on_path.contains(&i)).collect();

        let g = self.work_graph(|_, _, deps| is_order_edge(deps));

        let mut stack: Vec<(Vec<StmtId>, Vec<bool>)> = vec![(Vec::new(), removed)];
        while let Some((prefix, removed)) = stack.pop() {
            let candidates = self.available_blocks(&g, &removed);
            if candidates.is_empty() {
                total.push(prefix);
                if total.len() % 1000 == 0 {
                    debug!(total = total.len(), "topological paths");
                }
                if total.len() >= limit {
                    break;
                }
                continue;
            }
            // 逆序入栈，按下标升序展开
            for block in candidates.into_iter().rev() {
                let mut next_prefix = prefix.clone();
                let mut next_removed = removed.clone();
                for b in block {
                    if !next_removed[b] {
                        next_prefix.push(self.stmt_id(b));
                        next_removed[b] = true;
                    }
                }
                stack.push((next_prefix, next_removed));
            }
        }
        total
    }

    fn available_blocks(&self, g: &WorkGraph, removed: &[bool]) -> Vec<BTreeSet<usize>> {
        let n = self.stmt_num();
        let mut visited = vec![false; n];
        let mut blocks = Vec::new();
        for i in 0..n {
            if visited[i] || removed[i] {
                continue;
            }
            let block = self.get_instrumented_stmt_set(i);
            for &b in &block {
                visited[b] = true;
            }
            if !Self::block_has_indegree(g, &block, removed) {
                blocks.push(block);
            }
        }
        blocks
    }

    /// 去掉路径上相邻语句间的 WR / WW / RW，清空的边直接删除
    pub fn remove_conflict_edges(&mut self, path: &[StmtId]) {
        for pair in path.windows(2) {
            let key = (pair[0], pair[1]);
            let emptied = match self.stmt_graph.get_mut(&key) {
                Some(deps) => {
                    deps.retain(|dt| !dt.is_conflict());
                    deps.is_empty()
                }
                None => false,
            };
            if emptied {
                self.stmt_graph.remove(&key);
            }
        }
    }

    /// 路径上相邻语句之间是否还有 WR / WW / RW
    pub fn path_has_conflict(&self, path: &[StmtId]) -> bool {
        path.windows(2).any(|pair| {
            self.stmt_graph()
                .get(&(pair[0], pair[1]))
                .is_some_and(|deps| deps.iter().any(|dt| dt.is_conflict()))
        })
    }

    /// 路径的单行描述，相邻语句之间标出 0/1/2/3/4 = WR/WW/RW/STRICT_START/INSTRUMENT
    pub fn describe_path(&self, path: &[StmtId]) -> String {
        let mut out = String::new();
        for (i, id) in path.iter().enumerate() {
            out.push_str(&format!("({}.{})-", id.txn_id, id.pos));
            if let Some(next) = path.get(i + 1) {
                if let Some(deps) = self.stmt_graph().get(&(*id, *next)) {
                    for (dt, mark) in [
                        (DependencyType::WriteRead, '0'),
                        (DependencyType::WriteWrite, '1'),
                        (DependencyType::ReadWrite, '2'),
                        (DependencyType::StrictStartDepend, '3'),
                        (DependencyType::InstrumentDepend, '4'),
                    ] {
                        if deps.contains(&dt) {
                            out.push(mark);
                        }
                    }
                }
            }
            out.push_str("->");
        }
        out
    }
}
