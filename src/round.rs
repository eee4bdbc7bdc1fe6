//! 一轮完整的测试
//!
//! 插桩 → 并发执行 → 依赖分析 → 按最长语句路径细化队列 → 见证回放，
//! 然后从初始分析器中删掉已经验证过的冲突边，换下一条路径，直到路径上没有冲突边。

use crate::analyzer::{Anomaly, DependencyAnalyzer, Trace, TxnStatus};
use crate::config::CheckerConfig;
use crate::dut::DbmsConnector;
use crate::error::{CheckerError, CheckerResult};
use crate::history::{StmtId, StmtUsage};
use crate::scheduler::TransactionTest;
use crate::sql::{Schema, Statement};
use crate::testcase::{save_bug_report, BugReport, TestCase};
use crate::witness::WitnessMismatch;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// 一轮测试的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// 依赖图上检查到隔离异常
    Anomaly(Anomaly),
    /// 见证路径的顺序回放与并发执行不一致
    WitnessMismatch {
        mismatch: WitnessMismatch,
        path: Vec<StmtId>,
    },
    Clean,
}

impl RoundOutcome {
    pub fn is_bug(&self) -> bool {
        !matches!(self, RoundOutcome::Clean)
    }
}

/// 由配置中的种子创建随机数生成器
pub fn seeded_rng(config: &CheckerConfig) -> StdRng {
    StdRng::seed_from_u64(config.seed)
}

/// 执行一个持久化的用例并分析，返回检查到的异常
pub fn reproduce<C: DbmsConnector>(
    connector: C,
    schema: Schema,
    case: &TestCase,
    config: CheckerConfig,
) -> CheckerResult<Option<Anomaly>> {
    let mut test = TransactionTest::from_test_case(connector, schema, case, config)?;
    test.trans_test()?;
    let (_, anomaly) = test.analyze_txn_dependency()?;
    Ok(anomaly)
}

struct Snapshot {
    stmt_queue: Vec<Statement>,
    tid_queue: Vec<usize>,
    usages: Vec<StmtUsage>,
    txns: Vec<(Vec<Statement>, TxnStatus)>,
}

impl<C: DbmsConnector> TransactionTest<C> {
    /// 用最近一次并发执行的轨迹构建分析器，并运行启用的检查
    pub fn analyze_txn_dependency(&self) -> CheckerResult<(DependencyAnalyzer, Option<Anomaly>)> {
        let trace = Trace {
            init_outputs: self.init_content.values().cloned().collect(),
            outputs: self.real_outputs.clone(),
            tids: self.real_tids.clone(),
            usages: self.real_usages.clone(),
            statuses: self.statuses(),
        };
        let da = DependencyAnalyzer::new(
            trace,
            self.config.primary_key_index,
            self.config.version_key_index,
        )?;

        let anomaly = da.run_checks(&self.config.enabled_checks);
        if let Some(anomaly) = &anomaly {
            error!(kind = %anomaly.kind(), "{} violate!!", anomaly);
            da.print_dependency_graph();
        }
        Ok((da, anomaly))
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            stmt_queue: self.stmt_queue.clone(),
            tid_queue: self.tid_queue.clone(),
            usages: self.usages.clone(),
            txns: self
                .txns
                .iter()
                .map(|t| (t.stmts.clone(), t.status))
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: &Snapshot) {
        self.stmt_queue = snapshot.stmt_queue.clone();
        self.tid_queue = snapshot.tid_queue.clone();
        self.usages = snapshot.usages.clone();
        for (tid, (stmts, status)) in snapshot.txns.iter().enumerate() {
            self.txns[tid].stmts = stmts.clone();
            self.change_txn_status(tid, *status);
        }
    }

    /// 多轮语句级测试
    ///
    /// # 算法说明
    ///
    /// 1. 插桩并执行，分析得到初始依赖图；有异常直接返回
    /// 2. 取初始图上的最长语句路径，反复细化队列（清除探针、block scheduling、重新插桩执行），
    ///    直到路径稳定
    /// 3. 顺序重放路径，与并发结果比较
    /// 4. 从初始图删除该路径上的 WR/WW/RW 边，重新求路径；没有冲突边则结束
    /// 5. 否则恢复初始队列和事务状态，继续下一轮，最多 `max_refine_rounds` 轮
    pub fn multi_stmt_round_test<R: Rng + ?Sized>(&mut self, rng: &mut R) -> CheckerResult<RoundOutcome> {
        self.instrument_txn_stmts()?;
        self.trans_test()?;
        let (mut init_da, anomaly) = self.analyze_txn_dependency()?;
        if let Some(anomaly) = anomaly {
            return Ok(RoundOutcome::Anomaly(anomaly));
        }
        let mut path = init_da.longest_stmt_path(rng);
        let snapshot = self.snapshot();

        for round in 0..self.config.max_refine_rounds {
            info!(round, path = %init_da.describe_path(&path), "one round test");
            let ideal = path.clone();

            let mut refinements = 0;
            while self.refine_stmt_queue(&path)? {
                refinements += 1;
                if refinements > self.config.max_refine_rounds {
                    return Err(CheckerError::Unschedulable(format!(
                        "stmt queue is still changing after {} refinements",
                        refinements
                    )));
                }
                self.clean_instrument();
                self.block_scheduling()?;
                self.instrument_txn_stmts()?;
                self.trans_test()?;
                let (da, anomaly) = self.analyze_txn_dependency()?;
                if let Some(anomaly) = anomaly {
                    return Ok(RoundOutcome::Anomaly(anomaly));
                }
                path = da.longest_stmt_path(rng);
                debug!(path = %da.describe_path(&path), "stmt path for refining");
            }

            self.normal_stmt_test(&path)?;
            if let Some(mismatch) = self.check_normal_stmt_result(&path)? {
                error!(%mismatch, "witness replay differs from the concurrent execution");
                return Ok(RoundOutcome::WitnessMismatch { mismatch, path });
            }

            init_da.remove_conflict_edges(&ideal);
            path = init_da.longest_stmt_path(rng);
            debug!(path = %init_da.describe_path(&path), "next test stmt path");
            if !init_da.path_has_conflict(&path) {
                return Ok(RoundOutcome::Clean);
            }

            // 回到初始队列，重新执行一遍，使并发结果与初始分析一致
            self.restore(&snapshot);
            self.trans_test()?;
        }

        warn!(
            rounds = self.config.max_refine_rounds,
            "stop refining, paths with conflict edges remain"
        );
        Ok(RoundOutcome::Clean)
    }

    /// block scheduling 之后做一轮多语句测试
    pub fn run<R: Rng + ?Sized>(&mut self, rng: &mut R) -> CheckerResult<RoundOutcome> {
        self.block_scheduling()?;
        self.multi_stmt_round_test(rng)
    }

    pub fn bug_report(&self, outcome: &RoundOutcome) -> Option<BugReport> {
        let (description, anomaly) = match outcome {
            RoundOutcome::Anomaly(anomaly) => (anomaly.to_string(), Some(anomaly.clone())),
            RoundOutcome::WitnessMismatch { mismatch, .. } => (mismatch.to_string(), None),
            RoundOutcome::Clean => return None,
        };
        Some(BugReport {
            description,
            anomaly,
            config: self.config.clone(),
            statuses: self.statuses(),
        })
    }

    /// 发现问题时把当前队列和报告保存到 `output_dir`
    pub fn save_bug(&self, outcome: &RoundOutcome) -> CheckerResult<Option<PathBuf>> {
        let Some(report) = self.bug_report(outcome) else {
            return Ok(None);
        };
        let dir = save_bug_report(&self.config.output_dir, &self.to_test_case(), &report)?;
        Ok(Some(dir))
    }
}
