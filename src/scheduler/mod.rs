//! 交错调度
//!
//! 按 tid 队列把各事务的语句交错发给各自的连接：
//! - 被阻塞的事务暂停，后续语句都不发送
//! - 每次提交或回滚之后，重试此前被阻塞的语句
//! - 主循环结束后反复重试，直到不再有进展
//!
//! 实际执行顺序记录在 `real_*` 队列中，供依赖分析使用。
//! block scheduling 把实际顺序作为新的预期顺序重新执行，直到两者一致。

use crate::analyzer::TxnStatus;
use crate::config::CheckerConfig;
use crate::dut::{DbErrorKind, DbmsAdapter, DbmsConnector, TableContent};
use crate::error::{CheckerError, CheckerResult};
use crate::history::{StmtId, StmtKind, StmtOutput, StmtUsage};
use crate::instrument::instrument;
use crate::sql::{Schema, Statement};
use crate::testcase::TestCase;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// 一个事务的执行状态
#[derive(Debug)]
pub struct Transaction<A> {
    pub(crate) conn: A,
    pub(crate) stmts: Vec<Statement>,
    pub(crate) status: TxnStatus,
    pub(crate) outputs: Vec<StmtOutput>,
    /// 每条已执行语句的错误信息，成功为空串
    pub(crate) errs: Vec<String>,
    pub(crate) blocked: bool,
}

impl<A> Transaction<A> {
    fn new(conn: A, stmts: Vec<Statement>, status: TxnStatus) -> Self {
        Self {
            conn,
            stmts,
            status,
            outputs: Vec::new(),
            errs: Vec::new(),
            blocked: false,
        }
    }

    pub fn stmts(&self) -> &[Statement] {
        &self.stmts
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn outputs(&self) -> &[StmtOutput] {
        &self.outputs
    }

    pub fn errs(&self) -> &[String] {
        &self.errs
    }
}

/// 单条语句的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// 执行完成（成功或普通失败）
    Executed(StmtOutput),
    Blocked,
    /// 适配器认为可以跳过，记录为占位符
    Skipped,
}

/// 生成预期的交错顺序
///
/// # 算法说明
///
/// 维护可用事务集合和并发事务集合（都按 tid 有序）：
/// - 并发集合未满时，从可用集合随机取一个事务，加入并发集合
/// - 并发集合已满时，只从并发集合中随机取
///
/// 事务的语句全部入队后从两个集合中移除。没有语句的事务不会出现在队列中。
pub fn assign_txn_id<R: Rng + ?Sized>(
    stmt_nums: &[usize],
    max_concurrent: usize,
    rng: &mut R,
) -> Vec<usize> {
    let max_concurrent = max_concurrent.max(1);
    let mut available: BTreeSet<usize> = (0..stmt_nums.len()).filter(|&t| stmt_nums[t] > 0).collect();
    let mut concurrent: BTreeSet<usize> = BTreeSet::new();
    let mut inserted = vec![0usize; stmt_nums.len()];
    let mut queue = Vec::with_capacity(stmt_nums.iter().sum());

    while !available.is_empty() {
        let pool = if concurrent.len() < max_concurrent {
            &available
        } else {
            &concurrent
        };
        let idx = rng.gen_range(0..pool.len());
        let Some(&tid) = pool.iter().nth(idx) else {
            break;
        };
        concurrent.insert(tid);

        queue.push(tid);
        inserted[tid] += 1;
        if inserted[tid] >= stmt_nums[tid] {
            available.remove(&tid);
            concurrent.remove(&tid);
        }
    }
    queue
}

/// 一次并发测试的全部状态
pub struct TransactionTest<C: DbmsConnector> {
    pub(crate) connector: C,
    pub(crate) schema: Schema,
    pub(crate) config: CheckerConfig,
    pub(crate) txns: Vec<Transaction<C::Conn>>,

    pub(crate) stmt_queue: Vec<Statement>,
    pub(crate) tid_queue: Vec<usize>,
    pub(crate) usages: Vec<StmtUsage>,

    pub(crate) init_content: TableContent,
    pub(crate) real_tids: Vec<usize>,
    pub(crate) real_stmts: Vec<Statement>,
    pub(crate) real_outputs: Vec<StmtOutput>,
    pub(crate) real_usages: Vec<StmtUsage>,
    pub(crate) trans_content: TableContent,

    pub(crate) normal_outputs: Vec<StmtOutput>,
    pub(crate) normal_errs: Vec<String>,
    pub(crate) normal_content: TableContent,
}

impl<C: DbmsConnector> TransactionTest<C> {
    fn with_queues(
        connector: C,
        schema: Schema,
        config: CheckerConfig,
        txn_stmts: Vec<(Vec<Statement>, TxnStatus)>,
        stmt_queue: Vec<Statement>,
        tid_queue: Vec<usize>,
        usages: Vec<StmtUsage>,
    ) -> CheckerResult<Self> {
        let mut txns = Vec::with_capacity(txn_stmts.len());
        for (stmts, status) in txn_stmts {
            txns.push(Transaction::new(connector.connect()?, stmts, status));
        }
        Ok(Self {
            connector,
            schema,
            config,
            txns,
            stmt_queue,
            tid_queue,
            usages,
            init_content: TableContent::new(),
            real_tids: Vec::new(),
            real_stmts: Vec::new(),
            real_outputs: Vec::new(),
            real_usages: Vec::new(),
            trans_content: TableContent::new(),
            normal_outputs: Vec::new(),
            normal_errs: Vec::new(),
            normal_content: TableContent::new(),
        })
    }

    /// 由生成好的事务体构建测试
    ///
    /// 每个事务体前加 BEGIN，后加 COMMIT 或 ROLLBACK（按状态），
    /// 再按 `assign_txn_id` 的结果交错。数据库需要事先准备好并完成 backup。
    pub fn from_generated<R: Rng + ?Sized>(
        connector: C,
        schema: Schema,
        bodies: Vec<Vec<Statement>>,
        statuses: Vec<TxnStatus>,
        config: CheckerConfig,
        rng: &mut R,
    ) -> CheckerResult<Self> {
        if bodies.len() != statuses.len() {
            return Err(CheckerError::Unschedulable(format!(
                "{} transaction bodies but {} statuses",
                bodies.len(),
                statuses.len()
            )));
        }

        let begin = connector.begin_stmt();
        let mut txn_stmts = Vec::with_capacity(bodies.len());
        for (body, status) in bodies.into_iter().zip(statuses) {
            let status = match status {
                TxnStatus::Abort => TxnStatus::Abort,
                _ => TxnStatus::Commit,
            };
            let mut stmts = Vec::with_capacity(body.len() + 2);
            stmts.push(Statement::begin(&begin));
            stmts.extend(body);
            stmts.push(end_stmt(&connector, status));
            txn_stmts.push((stmts, status));
        }

        let stmt_nums: Vec<usize> = txn_stmts.iter().map(|(s, _)| s.len()).collect();
        let tid_queue = assign_txn_id(&stmt_nums, config.max_concurrent_txn, rng);
        let mut next_pos = vec![0usize; txn_stmts.len()];
        let mut stmt_queue = Vec::with_capacity(tid_queue.len());
        for &tid in &tid_queue {
            stmt_queue.push(txn_stmts[tid].0[next_pos[tid]].clone());
            next_pos[tid] += 1;
        }
        let usages = vec![StmtUsage::new(StmtKind::Init); stmt_queue.len()];
        info!(
            txn_num = txn_stmts.len(),
            stmt_num = stmt_queue.len(),
            "transaction test generated"
        );

        Self::with_queues(connector, schema, config, txn_stmts, stmt_queue, tid_queue, usages)
    }

    /// 由持久化的用例重建测试
    ///
    /// 事务的最后一条语句是回滚时状态为 Abort，否则为 Commit；没有语句的事务视为 Abort。
    pub fn from_test_case(
        connector: C,
        schema: Schema,
        case: &TestCase,
        config: CheckerConfig,
    ) -> CheckerResult<Self> {
        if case.tids.len() != case.stmts.len() || case.usages.len() != case.stmts.len() {
            return Err(CheckerError::Parse {
                line: 0,
                message: format!(
                    "stmt queue {}, tid queue {} and usage queue {} sizes differ",
                    case.stmts.len(),
                    case.tids.len(),
                    case.usages.len()
                ),
            });
        }

        let mut per_txn: Vec<Vec<Statement>> = vec![Vec::new(); case.txn_num()];
        for (stmt, &tid) in case.stmts.iter().zip(&case.tids) {
            per_txn[tid].push(stmt.clone());
        }
        let txn_stmts = per_txn
            .into_iter()
            .map(|stmts| {
                let status = match stmts.last() {
                    Some(last) if !is_abort(last) => TxnStatus::Commit,
                    _ => TxnStatus::Abort,
                };
                (stmts, status)
            })
            .collect();

        Self::with_queues(
            connector,
            schema,
            config,
            txn_stmts,
            case.stmts.clone(),
            case.tids.clone(),
            case.usages.clone(),
        )
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn trans_num(&self) -> usize {
        self.txns.len()
    }

    pub fn stmt_num(&self) -> usize {
        self.stmt_queue.len()
    }

    pub fn txn(&self, tid: usize) -> &Transaction<C::Conn> {
        &self.txns[tid]
    }

    pub fn statuses(&self) -> Vec<TxnStatus> {
        self.txns.iter().map(|t| t.status).collect()
    }

    pub fn stmt_queue(&self) -> &[Statement] {
        &self.stmt_queue
    }

    pub fn tid_queue(&self) -> &[usize] {
        &self.tid_queue
    }

    pub fn usages(&self) -> &[StmtUsage] {
        &self.usages
    }

    pub fn real_tid_queue(&self) -> &[usize] {
        &self.real_tids
    }

    pub fn real_stmt_queue(&self) -> &[Statement] {
        &self.real_stmts
    }

    pub fn real_outputs(&self) -> &[StmtOutput] {
        &self.real_outputs
    }

    pub fn real_usages(&self) -> &[StmtUsage] {
        &self.real_usages
    }

    pub fn init_content(&self) -> &TableContent {
        &self.init_content
    }

    pub fn trans_content(&self) -> &TableContent {
        &self.trans_content
    }

    /// 当前的预期队列
    pub fn to_test_case(&self) -> TestCase {
        TestCase::new(
            self.stmt_queue.clone(),
            self.tid_queue.clone(),
            self.usages.clone(),
        )
    }

    /// 按队列重建每个事务的语句列表
    fn rebuild_txn_stmts(&mut self) {
        for txn in &mut self.txns {
            txn.stmts.clear();
        }
        for (stmt, &tid) in self.stmt_queue.iter().zip(&self.tid_queue) {
            self.txns[tid].stmts.push(stmt.clone());
        }
    }

    /// 对预期队列插桩，并同步各事务的语句列表
    pub fn instrument_txn_stmts(&mut self) -> CheckerResult<()> {
        let out = instrument(&self.stmt_queue, &self.tid_queue, &self.schema)?;
        self.stmt_queue = out.stmts;
        self.tid_queue = out.tids;
        self.usages = out.usages;
        self.rebuild_txn_stmts();
        Ok(())
    }

    /// 去掉全部探针，只保留普通语句、事务控制语句和占位符
    pub fn clean_instrument(&mut self) {
        let mut stmts = Vec::with_capacity(self.stmt_queue.len());
        let mut tids = Vec::with_capacity(self.tid_queue.len());
        let mut usages = Vec::with_capacity(self.usages.len());
        for ((stmt, &tid), usage) in self.stmt_queue.iter().zip(&self.tid_queue).zip(&self.usages) {
            if usage.is_instrumentation() {
                continue;
            }
            stmts.push(stmt.clone());
            tids.push(tid);
            usages.push(usage.clone());
        }
        self.stmt_queue = stmts;
        self.tid_queue = tids;
        self.usages = usages;
        self.rebuild_txn_stmts();
    }

    /// 改变事务的最终状态，同时替换事务列表和队列中的 COMMIT / ROLLBACK
    ///
    /// 状态没有变化时返回 false。
    pub fn change_txn_status(&mut self, tid: usize, status: TxnStatus) -> bool {
        if status == TxnStatus::Undefined {
            warn!(tid, "illegal final status");
            return false;
        }
        let txn = &mut self.txns[tid];
        if txn.status == status {
            return false;
        }
        txn.status = status;
        let end = end_stmt(&self.connector, status);
        txn.stmts.pop();
        txn.stmts.push(end.clone());

        for (stmt, &t) in self.stmt_queue.iter_mut().zip(&self.tid_queue) {
            if t == tid && stmt.is_commit_or_abort() {
                *stmt = end.clone();
            }
        }
        true
    }

    /// 执行队列中 `pos` 位置的语句
    pub fn trans_test_unit(&mut self, pos: usize) -> CheckerResult<UnitOutcome> {
        let tid = self.tid_queue[pos];
        let sql = self.stmt_queue[pos].to_string();
        let show = self.config.show_str(&sql);
        let txn = &mut self.txns[tid];

        let err = match txn.conn.execute(&sql) {
            Ok(result) => {
                txn.outputs.push(result.rows.clone());
                txn.errs.push(String::new());
                debug!(tid, pos = txn.outputs.len() - 1, "T{} S{}: {}", tid, txn.outputs.len() - 1, show);
                return Ok(UnitOutcome::Executed(result.rows));
            }
            Err(e) => e,
        };
        warn!(tid, pos = txn.outputs.len(), error = %err, "T{} S{}: {}: fail", tid, txn.outputs.len(), show);

        match err.kind {
            DbErrorKind::ConnectionLost => return Err(err.into()),
            DbErrorKind::Blocked => return Ok(UnitOutcome::Blocked),
            DbErrorKind::Skipped => {
                txn.outputs.push(StmtOutput::new());
                txn.errs.push(String::new());
                return Ok(UnitOutcome::Skipped);
            }
            _ => {}
        }

        if !self.stmt_queue[pos].is_commit() {
            txn.outputs.push(StmtOutput::new());
            txn.errs.push(err.to_string());
            return Ok(UnitOutcome::Executed(StmtOutput::new()));
        }

        // 提交失败，改为回滚
        let abort = end_stmt(&self.connector, TxnStatus::Abort);
        txn.status = TxnStatus::Abort;
        txn.stmts.pop();
        txn.stmts.push(abort.clone());
        self.stmt_queue[pos] = abort.clone();

        match txn.conn.execute(&abort.to_string()) {
            Ok(_) => {
                txn.outputs.push(StmtOutput::new());
                txn.errs.push(String::new());
                debug!(tid, "T{} S{}: {}", tid, txn.outputs.len() - 1, abort);
                Ok(UnitOutcome::Executed(StmtOutput::new()))
            }
            Err(e) if e.kind == DbErrorKind::ConnectionLost => Err(e.into()),
            Err(e) => {
                warn!(tid, error = %e, "abort after a failed commit also failed");
                Ok(UnitOutcome::Blocked)
            }
        }
    }

    fn record_executed(&mut self, pos: usize, output: StmtOutput) {
        self.real_tids.push(self.tid_queue[pos]);
        self.real_stmts.push(self.stmt_queue[pos].clone());
        self.real_outputs.push(output);
        self.real_usages.push(self.usages[pos].clone());
    }

    fn record_skipped(&mut self, pos: usize) {
        self.real_tids.push(self.tid_queue[pos]);
        self.real_stmts.push(Statement::placeholder());
        self.real_outputs.push(StmtOutput::new());
        self.real_usages.push(StmtUsage::new(StmtKind::Init));
    }

    /// 处理一次执行结果；返回语句是否已完成
    fn settle(&mut self, pos: usize, outcome: UnitOutcome, executed: &mut [bool]) -> bool {
        let tid = self.tid_queue[pos];
        match outcome {
            UnitOutcome::Executed(output) => {
                self.txns[tid].blocked = false;
                executed[pos] = true;
                self.record_executed(pos, output);
                true
            }
            UnitOutcome::Skipped => {
                self.txns[tid].blocked = false;
                executed[pos] = true;
                self.record_skipped(pos);
                true
            }
            UnitOutcome::Blocked => {
                self.txns[tid].blocked = true;
                false
            }
        }
    }

    /// 重试 `cur_stmt_num` 之前尚未执行的语句
    ///
    /// 先给每个被阻塞事务的第一条待执行语句一次机会，再顺序扫描其余语句。
    /// 扫描中执行了提交或回滚时，递归重试它之前的语句。
    pub fn retry_block_stmt(&mut self, cur_stmt_num: usize, executed: &mut [bool]) -> CheckerResult<()> {
        debug!(cur_stmt_num, "retrying process begin");

        let mut tried = BTreeSet::new();
        for i in 0..cur_stmt_num {
            if executed[i] {
                continue;
            }
            let tid = self.tid_queue[i];
            if !self.txns[tid].blocked || !tried.insert(tid) {
                continue;
            }
            let outcome = self.trans_test_unit(i)?;
            self.settle(i, outcome, executed);
        }

        for pos in 0..cur_stmt_num {
            let tid = self.tid_queue[pos];
            if self.txns[tid].blocked || executed[pos] {
                continue;
            }
            let outcome = self.trans_test_unit(pos)?;
            let ran = matches!(outcome, UnitOutcome::Executed(_));
            self.settle(pos, outcome, executed);
            if ran && self.stmt_queue[pos].is_commit_or_abort() {
                self.retry_block_stmt(pos, executed)?;
            }
        }
        debug!(cur_stmt_num, "retrying process end");
        Ok(())
    }

    /// 按预期队列并发执行一遍
    ///
    /// 开始前清空执行状态并恢复数据库，结束后记录实际队列和最终表内容。
    pub fn trans_test(&mut self) -> CheckerResult<()> {
        self.clear_execution_status()?;
        self.connector.reset_to_backup()?;
        let tables = self.schema.table_names();
        self.init_content = self.connector.get_content(&tables)?;

        let stmt_num = self.stmt_queue.len();
        debug!(stmt_num, "transaction test");
        let mut executed = vec![false; stmt_num];

        for idx in 0..stmt_num {
            let tid = self.tid_queue[idx];
            if self.txns[tid].blocked {
                continue;
            }
            let outcome = self.trans_test_unit(idx)?;
            let ran = matches!(outcome, UnitOutcome::Executed(_));
            self.settle(idx, outcome, &mut executed);
            if ran && self.stmt_queue[idx].is_commit_or_abort() {
                self.retry_block_stmt(idx, &mut executed)?;
            }
        }

        loop {
            let old_executed = executed.iter().filter(|&&e| e).count();
            self.retry_block_stmt(stmt_num, &mut executed)?;
            let new_executed = executed.iter().filter(|&&e| e).count();
            if old_executed == new_executed {
                break;
            }
        }

        if stmt_num > 0 && !executed.iter().any(|&e| e) {
            return Err(CheckerError::Unschedulable(
                "no statement could be executed".to_string(),
            ));
        }
        if let Some(stmt_idx) = executed.iter().position(|&e| !e) {
            error!(stmt_idx, "some stmt is still not executed");
            return Err(CheckerError::StillBlocked { stmt_idx });
        }
        if self.real_stmts.len() != stmt_num {
            error!(
                real = self.real_stmts.len(),
                expected = stmt_num,
                "real stmt queue size is not equal to stmt num"
            );
            return Err(CheckerError::QueueMismatch {
                real: self.real_stmts.len(),
                expected: stmt_num,
            });
        }

        self.trans_content = self.connector.get_content(&tables)?;
        Ok(())
    }

    /// 反复执行，直到实际顺序与预期顺序一致
    ///
    /// 不一致时把实际顺序作为新的预期顺序。超过 `max_schedule_rounds` 轮仍不一致则放弃本轮。
    pub fn block_scheduling(&mut self) -> CheckerResult<()> {
        info!("block scheduling");
        let mut round = 0;
        loop {
            debug!(round, "scheduling");
            self.trans_test()?;
            if self.tid_queue == self.real_tids {
                break;
            }
            self.stmt_queue = std::mem::take(&mut self.real_stmts);
            self.tid_queue = std::mem::take(&mut self.real_tids);
            self.usages = std::mem::take(&mut self.real_usages);
            self.clear_execution_status()?;
            round += 1;
            if round > self.config.max_schedule_rounds {
                return Err(CheckerError::Unschedulable(format!(
                    "the schedule is still changing after {} rounds",
                    round
                )));
            }
        }
        self.clear_execution_status()?;
        info!(round, "schedule round");
        Ok(())
    }

    /// 让队列向给定的语句路径靠拢
    ///
    /// - 把队列中已替换的语句（事务控制、占位符）同步回各事务
    /// - 不在路径中的事务改为回滚
    /// - 路径中事务的其他普通语句替换为占位符
    ///
    /// 有任何改动时清空执行状态并返回 true。
    pub fn refine_stmt_queue(&mut self, path: &[StmtId]) -> CheckerResult<bool> {
        let mut pos_of_txn = vec![0usize; self.txns.len()];
        for (stmt, &tid) in self.stmt_queue.iter().zip(&self.tid_queue) {
            let pos = pos_of_txn[tid];
            if stmt.is_replaced() {
                if let Some(slot) = self.txns[tid].stmts.get_mut(pos) {
                    *slot = stmt.clone();
                }
            }
            pos_of_txn[tid] += 1;
        }

        let exist_tid: BTreeSet<usize> = path.iter().map(|id| id.txn_id).collect();
        let exist_stmt: BTreeSet<StmtId> = path.iter().copied().collect();

        let mut refined = false;
        for tid in 0..self.txns.len() {
            if exist_tid.contains(&tid) {
                continue;
            }
            if self.change_txn_status(tid, TxnStatus::Abort) {
                refined = true;
            }
        }

        let mut pos_of_txn = vec![0usize; self.txns.len()];
        for i in 0..self.stmt_queue.len() {
            let tid = self.tid_queue[i];
            if !exist_tid.contains(&tid) {
                continue;
            }
            let id = StmtId::new(tid, pos_of_txn[tid]);
            pos_of_txn[tid] += 1;
            // 探针在重新插桩时重建，不需要替换
            if exist_stmt.contains(&id)
                || self.stmt_queue[i].is_replaced()
                || self.usages[i].is_instrumentation()
            {
                continue;
            }
            debug!(txn = id.txn_id, pos = id.pos, "refining");
            refined = true;
            self.stmt_queue[i] = Statement::placeholder();
            self.usages[i] = StmtUsage::new(StmtKind::Init);
        }

        if !refined {
            return Ok(false);
        }
        self.clear_execution_status()?;
        Ok(true)
    }

    /// 清空执行状态：重新建立连接，清空输出、阻塞标记和实际队列
    pub fn clear_execution_status(&mut self) -> CheckerResult<()> {
        for txn in &mut self.txns {
            txn.conn = self.connector.connect()?;
            txn.outputs.clear();
            txn.errs.clear();
            txn.blocked = false;
        }
        self.init_content.clear();
        self.real_tids.clear();
        self.real_stmts.clear();
        self.real_outputs.clear();
        self.real_usages.clear();
        self.trans_content.clear();
        self.normal_outputs.clear();
        self.normal_errs.clear();
        self.normal_content.clear();
        Ok(())
    }
}

fn end_stmt<C: DbmsConnector>(connector: &C, status: TxnStatus) -> Statement {
    match status {
        TxnStatus::Abort => Statement::abort(&connector.abort_stmt()),
        _ => Statement::commit(&connector.commit_stmt()),
    }
}

fn is_abort(stmt: &Statement) -> bool {
    stmt.is_commit_or_abort() && !stmt.is_commit()
}
