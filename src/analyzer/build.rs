//! 依赖图的构建流水线
//!
//! 顺序固定：
//! 1. 记录版本历史并检查 (主键, 版本) 唯一
//! 2. 探针依赖 (INSTRUMENT_DEPEND)，同时校验探针相邻关系
//! 3. 按行扫描版本链，建立 WR / WW / RW
//! 4. START / STRICT_START
//! 5. VERSION_SET（依赖第 4 步之后的状态）
//! 6. OVERWRITE
//! 7. 事务内程序顺序 (INNER_DEPEND)

use super::graph::{DependencyType, StmtGraph, TxnGraph, TxnStatus};
use super::{DependencyAnalyzer, Trace};
use crate::error::{CheckerError, CheckerResult};
use crate::history::{hash_row, stmt_ids, History, OperateUnit, RowOutput, StmtKind, StmtOutput};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error};

type PkVersionSet = BTreeSet<(i64, i64)>;

fn parse_key(row: &RowOutput, idx: usize, stmt_idx: Option<usize>) -> CheckerResult<i64> {
    let cell = row.get(idx).ok_or_else(|| CheckerError::InvalidOutput {
        stmt_idx,
        detail: format!("row {:?} has no column {}", row, idx),
    })?;
    cell.trim().parse::<i64>().map_err(|_| CheckerError::InvalidOutput {
        stmt_idx,
        detail: format!("column {} of row {:?} is not an integer", idx, row),
    })
}

/// 读出一行的 (主键, 版本)
pub(crate) fn pk_version(
    row: &RowOutput,
    primary_key_index: usize,
    version_key_index: usize,
    stmt_idx: Option<usize>,
) -> CheckerResult<(i64, i64)> {
    Ok((
        parse_key(row, primary_key_index, stmt_idx)?,
        parse_key(row, version_key_index, stmt_idx)?,
    ))
}

/// -1 表示不存在，与下标比较时使用
fn signed(idx: Option<usize>) -> i64 {
    idx.map_or(-1, |v| v as i64)
}

impl DependencyAnalyzer {
    pub fn new(
        trace: Trace,
        primary_key_index: usize,
        version_key_index: usize,
    ) -> CheckerResult<Self> {
        let Trace {
            init_outputs,
            outputs,
            tids,
            usages,
            mut statuses,
        } = trace;

        if outputs.len() != tids.len() || outputs.len() != usages.len() {
            error!(
                outputs = outputs.len(),
                tids = tids.len(),
                usages = usages.len(),
                "total output, tid queue and usage queue sizes are not equal"
            );
            return Err(CheckerError::LengthMismatch {
                outputs: outputs.len(),
                tids: tids.len(),
                usages: usages.len(),
            });
        }

        let t_num = statuses.len();
        if let Some((idx, &tid)) = tids.iter().enumerate().find(|(_, &t)| t >= t_num) {
            return Err(CheckerError::InvalidOutput {
                stmt_idx: Some(idx),
                detail: format!("tid {} is out of range (txn num {})", tid, t_num),
            });
        }

        let tid_num = t_num + 1;
        statuses.push(TxnStatus::Commit); // 初始事务
        let stmt_num = outputs.len();

        let mut txn_size = vec![0; tid_num];
        for &tid in &tids {
            txn_size[tid] += 1;
        }
        let ids = stmt_ids(&tids);
        let index_of = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut analyzer = Self {
            tid_num,
            stmt_num,
            primary_key_index,
            version_key_index,
            txn_status: statuses,
            tid_queue: tids,
            usages,
            outputs,
            txn_size,
            stmt_ids: ids,
            index_of,
            history: History::new(),
            hash_to_output: HashMap::new(),
            graph: TxnGraph::new(tid_num),
            stmt_graph: StmtGraph::new(),
            instrument_adj: vec![BTreeSet::new(); stmt_num],
            tid_strict_begin: vec![None; tid_num],
            tid_begin: vec![None; tid_num],
            tid_end: vec![None; tid_num],
        };

        analyzer.record_history(&init_outputs)?;

        debug!(stmt_num, "checking if the pk, vk are all distinct");
        analyzer.check_version_distinct()?;

        // 先建立探针依赖，确保插桩结构正确
        analyzer.build_stmt_instrument_dependency()?;

        let history = std::mem::take(&mut analyzer.history);
        let item_result = analyzer.build_item_dependency(&history);
        analyzer.history = history;
        item_result?;

        analyzer.build_start_dependency();
        analyzer.build_vs_dependency()?;
        analyzer.build_ow_dependency()?;
        analyzer.build_stmt_inner_dependency();

        debug!(
            tid_num,
            stmt_edges = analyzer.stmt_graph.len(),
            "dependency graph built"
        );
        Ok(analyzer)
    }

    fn record_history(&mut self, init_outputs: &[StmtOutput]) -> CheckerResult<()> {
        let init_tid = self.init_tid();
        let mut units = Vec::new();

        // 初始事务写入的版本
        for row in init_outputs.iter().flatten() {
            let (row_id, write_op_id) =
                pk_version(row, self.primary_key_index, self.version_key_index, None)?;
            let hash = hash_row(row);
            self.hash_to_output.insert(hash, row.clone());
            units.push(OperateUnit {
                usage: StmtKind::AfterWriteRead,
                write_op_id,
                tid: init_tid,
                stmt_idx: None,
                row_id,
                hash,
            });
        }

        // 空输出不参与分析，写语句本身通过前后探针分析
        for (i, output) in self.outputs.iter().enumerate() {
            for row in output {
                let (row_id, write_op_id) =
                    pk_version(row, self.primary_key_index, self.version_key_index, Some(i))?;
                let hash = hash_row(row);
                self.hash_to_output.insert(hash, row.clone());
                units.push(OperateUnit {
                    usage: self.usages[i].kind,
                    write_op_id,
                    tid: self.tid_queue[i],
                    stmt_idx: Some(i),
                    row_id,
                    hash,
                });
            }
        }

        for unit in units {
            self.history.insert(unit);
        }
        Ok(())
    }

    fn check_version_distinct(&self) -> CheckerResult<()> {
        let mut seen = PkVersionSet::new();
        for i in 0..self.stmt_num {
            if self.usages[i].kind != StmtKind::AfterWriteRead {
                continue;
            }
            let (pairs, _) = self.pk_version_set(i)?;
            for (pk, version) in pairs {
                if !seen.insert((pk, version)) {
                    error!(pk, version, "pk, vk are not distinct");
                    return Err(CheckerError::NotDistinct { pk, version });
                }
            }
        }
        Ok(())
    }

    /// 一条语句输出中的 (主键, 版本) 集合和主键集合
    pub(crate) fn pk_version_set(&self, stmt_idx: usize) -> CheckerResult<(PkVersionSet, BTreeSet<i64>)> {
        let mut pairs = PkVersionSet::new();
        let mut keys = BTreeSet::new();
        for row in &self.outputs[stmt_idx] {
            let (pk, version) =
                pk_version(row, self.primary_key_index, self.version_key_index, Some(stmt_idx))?;
            pairs.insert((pk, version));
            keys.insert(pk);
        }
        Ok((pairs, keys))
    }

    pub(crate) fn add_stmt_edge(&mut self, from: usize, to: usize, dt: DependencyType) {
        let key = (self.stmt_ids[from], self.stmt_ids[to]);
        self.stmt_graph.entry(key).or_default().insert(dt);
        if dt == DependencyType::InstrumentDepend {
            self.instrument_adj[from].insert(to);
            self.instrument_adj[to].insert(from);
        }
    }

    /// 从探针出发按方向找到它插桩的普通语句，必须在同一事务内
    fn find_instrumented_stmt(&self, probe: usize, forward: bool) -> CheckerResult<usize> {
        let tid = self.tid_queue[probe];
        let mut idx = probe;
        loop {
            if self.tid_queue[idx] != tid {
                return Err(CheckerError::adjacency(
                    probe,
                    "different transaction id, no instrumented stmt found",
                ));
            }
            if !self.usages[idx].is_instrumentation() {
                return Ok(idx);
            }
            idx = match (forward, idx) {
                (true, i) if i + 1 < self.stmt_num => i + 1,
                (false, i) if i > 0 => i - 1,
                _ => {
                    return Err(CheckerError::adjacency(
                        probe,
                        "idx out of range, no instrumented stmt found",
                    ))
                }
            };
        }
    }

    fn build_stmt_instrument_dependency(&mut self) -> CheckerResult<()> {
        for i in 0..self.stmt_num {
            let tid = self.tid_queue[i];
            match self.usages[i].kind {
                StmtKind::BeforeWriteRead => {
                    if i + 1 >= self.stmt_num {
                        return Err(CheckerError::adjacency(i, "BEFORE_WRITE_READ is the last stmt"));
                    }
                    if self.tid_queue[i + 1] != tid {
                        return Err(CheckerError::adjacency(i, "BEFORE_WRITE_READ: next_tid != cur_tid"));
                    }
                    if !matches!(self.usages[i + 1].kind, StmtKind::Update | StmtKind::Delete) {
                        return Err(CheckerError::adjacency(
                            i,
                            "BEFORE_WRITE_READ is not followed by UPDATE or DELETE",
                        ));
                    }
                    self.add_stmt_edge(i, i + 1, DependencyType::InstrumentDepend);
                }
                StmtKind::AfterWriteRead => {
                    if i == 0 {
                        return Err(CheckerError::adjacency(i, "AFTER_WRITE_READ is the first stmt"));
                    }
                    if self.tid_queue[i - 1] != tid {
                        return Err(CheckerError::adjacency(i, "AFTER_WRITE_READ: prev_tid != cur_tid"));
                    }
                    if !matches!(self.usages[i - 1].kind, StmtKind::Update | StmtKind::Insert) {
                        return Err(CheckerError::adjacency(
                            i,
                            "AFTER_WRITE_READ does not follow UPDATE or INSERT",
                        ));
                    }
                    self.add_stmt_edge(i - 1, i, DependencyType::InstrumentDepend);
                }
                StmtKind::VersionSetRead => {
                    let mut normal = i + 1;
                    loop {
                        if normal >= self.stmt_num {
                            return Err(CheckerError::adjacency(
                                i,
                                "VERSION_SET_READ: cannot find the normal one",
                            ));
                        }
                        if self.tid_queue[normal] != tid {
                            return Err(CheckerError::adjacency(
                                i,
                                format!("VERSION_SET_READ: next_tid != cur_tid at {}", normal),
                            ));
                        }
                        if matches!(
                            self.usages[normal].kind,
                            StmtKind::Select | StmtKind::Update | StmtKind::Delete | StmtKind::Insert
                        ) {
                            break;
                        }
                        normal += 1;
                    }
                    self.add_stmt_edge(i, normal, DependencyType::InstrumentDepend);
                }
                StmtKind::BeforePredicateMatch | StmtKind::PredicateMatch => {
                    let target = self.find_instrumented_stmt(i, true)?;
                    self.add_stmt_edge(target, i, DependencyType::InstrumentDepend);
                }
                StmtKind::AfterPredicateMatch => {
                    let target = self.find_instrumented_stmt(i, false)?;
                    self.add_stmt_edge(target, i, DependencyType::InstrumentDepend);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 按行扫描版本链：每个读找最近的同内容 AWR，BWR 额外建立 WW 和 RW
    fn build_item_dependency(&mut self, history: &History) -> CheckerResult<()> {
        let init_tid = self.init_tid();
        for row in history.rows() {
            let ops = &row.ops;
            for (i, op) in ops.iter().enumerate() {
                // 初始事务不依赖其他事务
                if op.tid == init_tid || op.usage == StmtKind::AfterWriteRead {
                    continue;
                }
                self.build_directly_depends(ops, i, DependencyType::WriteRead)?;
                if op.usage == StmtKind::BeforeWriteRead {
                    self.build_directly_depends(ops, i, DependencyType::WriteWrite)?;
                    self.build_directly_item_anti_dependency(ops, i);
                }
            }
        }
        Ok(())
    }

    /// 找到产生该行镜像的最近一次写（严格比较内容哈希），建立 WR 或 WW
    fn build_directly_depends(
        &mut self,
        ops: &[OperateUnit],
        idx: usize,
        dt: DependencyType,
    ) -> CheckerResult<()> {
        let target = &ops[idx];
        let write = ops[..idx]
            .iter()
            .rev()
            .find(|op| op.usage == StmtKind::AfterWriteRead && op.hash == target.hash);

        let Some(write) = write else {
            error!(
                stmt_idx = ?target.stmt_idx,
                tid = target.tid,
                row = ?self.hash_to_output.get(&target.hash),
                "cannot find the corresponding write"
            );
            for op in ops.iter().filter(|op| op.usage == StmtKind::AfterWriteRead) {
                debug!(
                    stmt_idx = ?op.stmt_idx,
                    row = ?self.hash_to_output.get(&op.hash),
                    "candidate AFTER_WRITE_READ"
                );
            }
            return Err(CheckerError::MissingWrite {
                stmt_idx: target.stmt_idx,
                tid: target.tid,
            });
        };

        if let (Some(from), Some(to)) = (write.stmt_idx, target.stmt_idx) {
            self.add_stmt_edge(from, to, dt);
        }
        if write.tid != target.tid {
            self.graph.insert(write.tid, target.tid, dt);
        }
        Ok(())
    }

    /// 所有读到被覆盖版本的 SELECT / AWR 都反依赖于这次写（不只是最近的一个）
    fn build_directly_item_anti_dependency(&mut self, ops: &[OperateUnit], idx: usize) {
        let target = &ops[idx];
        for op in ops {
            if op.usage != StmtKind::Select && op.usage != StmtKind::AfterWriteRead {
                continue;
            }
            if op.write_op_id != target.write_op_id {
                continue;
            }
            if let (Some(from), Some(to)) = (op.stmt_idx, target.stmt_idx) {
                self.add_stmt_edge(from, to, DependencyType::ReadWrite);
            }
            if op.tid != target.tid {
                self.graph.insert(op.tid, target.tid, DependencyType::ReadWrite);
            }
        }
    }

    /// 第一条语句是严格的开始 (BEGIN)，第二条才算真正开始，有些 DBMS 在第一次读写时才建立快照
    fn build_start_dependency(&mut self) {
        let mut used_begin = vec![false; self.tid_num];
        for i in 0..self.stmt_num {
            let tid = self.tid_queue[i];
            if !used_begin[tid] {
                used_begin[tid] = true;
                self.tid_strict_begin[tid] = Some(i);
                continue;
            }
            if self.tid_begin[tid].is_none() {
                self.tid_begin[tid] = Some(i);
            }
            self.tid_end[tid] = Some(i);
        }

        for i in 0..self.tid_num {
            for j in 0..self.tid_num {
                if i == j {
                    continue;
                }
                let end = signed(self.tid_end[i]);
                if end < signed(self.tid_begin[j]) {
                    self.graph.insert(i, j, DependencyType::StartDepend);
                    self.build_stmt_start_dependency(i, j, DependencyType::StartDepend);
                }
                if end < signed(self.tid_strict_begin[j]) {
                    self.graph.insert(i, j, DependencyType::StrictStartDepend);
                    self.build_stmt_start_dependency(i, j, DependencyType::StrictStartDepend);
                }
            }
        }
    }

    fn build_stmt_start_dependency(&mut self, prev_tid: usize, later_tid: usize, dt: DependencyType) {
        for i in 0..self.stmt_num {
            if self.tid_queue[i] != prev_tid {
                continue;
            }
            for j in (i + 1)..self.stmt_num {
                if self.tid_queue[j] == later_tid {
                    self.add_stmt_edge(i, j, dt);
                }
            }
        }
    }

    /// 写入的版本出现在其他事务的版本集合读中：writer -> reader
    fn build_vs_dependency(&mut self) -> CheckerResult<()> {
        for i in 0..self.stmt_num {
            if self.usages[i].kind != StmtKind::VersionSetRead {
                continue;
            }
            let i_tid = self.tid_queue[i];
            let (i_pairs, _) = self.pk_version_set(i)?;

            for j in 0..self.stmt_num {
                let j_tid = self.tid_queue[j];
                match self.usages[j].kind {
                    StmtKind::Update | StmtKind::Insert => {
                        let awr = j + 1;
                        if awr >= self.stmt_num || self.usages[awr].kind != StmtKind::AfterWriteRead {
                            return Err(CheckerError::adjacency(
                                awr,
                                "build_VS_dependency: after_write_idx is not AFTER_WRITE_READ",
                            ));
                        }
                        let (awr_pairs, _) = self.pk_version_set(awr)?;
                        if !i_pairs.is_disjoint(&awr_pairs) && i_tid != j_tid {
                            self.graph.insert(j_tid, i_tid, DependencyType::VersionSetDepend);
                        }
                    }
                    // DELETE 应当产生一个隐藏版本，语义尚未确定，不建立版本集合依赖
                    StmtKind::Delete => continue,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn build_ow_dependency(&mut self) -> CheckerResult<()> {
        let positions = |kind: StmtKind| -> Vec<usize> {
            (0..self.stmt_num)
                .filter(|&i| self.usages[i].kind == kind)
                .collect()
        };
        let bpms = positions(StmtKind::BeforePredicateMatch);
        let apms = positions(StmtKind::AfterPredicateMatch);
        let pms = positions(StmtKind::PredicateMatch);
        let writes: Vec<usize> = (0..self.stmt_num)
            .filter(|&i| self.usages[i].kind.is_write())
            .collect();

        if apms.len() != bpms.len() || apms.len() != writes.len() * pms.len() {
            error!(
                nr_apm = apms.len(),
                nr_bpm = bpms.len(),
                nr_update_operations = writes.len(),
                total_nr_predicate_matches = pms.len(),
                "predicate probe count mismatch"
            );
            return Err(CheckerError::Instrument(format!(
                "nr_apm {} / nr_bpm {} != nr_writes {} * nr_predicates {}",
                apms.len(),
                bpms.len(),
                writes.len(),
                pms.len()
            )));
        }

        for (p, &pm) in pms.iter().enumerate() {
            let vsr_begin = pm + 1;
            if vsr_begin >= self.stmt_num || self.usages[vsr_begin].kind != StmtKind::VersionSetRead {
                return Err(CheckerError::adjacency(pm, "vsr_begin is not VERSION_SET_READ"));
            }
            let mut vsr_end = vsr_begin;
            while vsr_end + 1 < self.stmt_num
                && self.usages[vsr_end + 1].kind == StmtKind::VersionSetRead
            {
                vsr_end += 1;
            }

            for (u, &w) in writes.iter().enumerate() {
                // 第 u 个写语句的第 p 个谓词探针
                let k = u * pms.len() + p;
                let (bpm, apm) = (bpms[k], apms[k]);
                let w_tid = self.tid_queue[w];
                if self.tid_queue[bpm] != w_tid || self.tid_queue[apm] != w_tid {
                    return Err(CheckerError::adjacency(
                        w,
                        "predicate probes belong to another transaction",
                    ));
                }
                // DELETE 不产生新版本，没有写后读
                if self.usages[w].kind == StmtKind::Delete {
                    continue;
                }
                let awr = w + 1;
                if awr >= self.stmt_num
                    || self.usages[awr].kind != StmtKind::AfterWriteRead
                    || self.tid_queue[awr] != w_tid
                {
                    return Err(CheckerError::adjacency(w, "awr is not AFTER_WRITE_READ"));
                }

                if self.check_if_stmt_is_overwritten(pm, vsr_begin, vsr_end, awr, bpm, apm)? {
                    self.add_stmt_edge(pm, w, DependencyType::OverwriteDepend);
                }
            }
        }
        Ok(())
    }

    /// 写语句安装的某行版本比谓词的版本集合读看到的更新，
    /// 并且该行只出现在 BPM / APM 其中之一
    fn check_if_stmt_is_overwritten(
        &self,
        predicate_match: usize,
        vsr_begin: usize,
        vsr_end: usize,
        awr: usize,
        bpm: usize,
        apm: usize,
    ) -> CheckerResult<bool> {
        if bpm > awr || apm < awr {
            return Err(CheckerError::adjacency(
                awr,
                "bpm_stmt > overwrite_awr_stmt || apm_stmt < overwrite_awr_stmt",
            ));
        }
        let pm_tid = self.tid_queue[predicate_match];
        if self.tid_queue[vsr_begin] != pm_tid || self.tid_queue[vsr_end] != pm_tid {
            return Err(CheckerError::adjacency(
                predicate_match,
                "version set reads belong to another transaction",
            ));
        }

        let (_, bpm_pk) = self.pk_version_set(bpm)?;
        let (_, apm_pk) = self.pk_version_set(apm)?;
        let (awr_pairs, _) = self.pk_version_set(awr)?;

        let mut vsr_versions: BTreeMap<i64, i64> = BTreeMap::new();
        for vsr in vsr_begin..=vsr_end {
            let (pairs, _) = self.pk_version_set(vsr)?;
            vsr_versions.extend(pairs);
        }

        let mut higher = BTreeSet::new();
        for (pk, v_awr) in awr_pairs {
            let Some(&v_vsr) = vsr_versions.get(&pk) else {
                continue;
            };
            if self.check_which_version_is_higher(pk, v_awr, v_vsr)? {
                higher.insert(pk);
            }
        }

        Ok(higher
            .iter()
            .any(|pk| bpm_pk.contains(pk) != apm_pk.contains(pk)))
    }

    /// 在行的版本链中，v1 最后一次出现是否晚于 v2
    pub(crate) fn check_which_version_is_higher(&self, row_id: i64, v1: i64, v2: i64) -> CheckerResult<bool> {
        let not_found = |v: i64| CheckerError::InvalidOutput {
            stmt_idx: None,
            detail: format!("version {} of row {} not found in history", v, row_id),
        };
        let row = self.history.row(row_id).ok_or_else(|| not_found(v1))?;
        let last = |v: i64| row.ops.iter().rposition(|op| op.write_op_id == v);
        let v1_idx = last(v1).ok_or_else(|| not_found(v1))?;
        let v2_idx = last(v2).ok_or_else(|| not_found(v2))?;
        Ok(v1_idx > v2_idx)
    }

    fn build_stmt_inner_dependency(&mut self) {
        for i in 0..self.stmt_num {
            let tid = self.tid_queue[i];
            for j in 0..i {
                if self.tid_queue[j] == tid {
                    self.add_stmt_edge(j, i, DependencyType::InnerDepend);
                }
            }
        }
    }
}
