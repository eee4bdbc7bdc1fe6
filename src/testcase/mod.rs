//! 测试用例持久化与最小化
//!
//! 一个用例就是三条等长队列：语句、tid、用途。保存格式：
//! - `stmts.sql`：每条语句后跟一个空行
//! - `tid.txt`：每行一个 tid
//! - `stmt_use.txt`：每行一个用途编码
//!
//! 最小化先尝试整事务删除，再尝试单语句删除（连同它的探针），
//! 保留调用方判定仍能复现的每一次删除。

use crate::analyzer::{Anomaly, TxnStatus};
use crate::config::CheckerConfig;
use crate::error::{CheckerError, CheckerResult};
use crate::history::{StmtKind, StmtUsage};
use crate::sql::Statement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const STMT_FILE: &str = "stmts.sql";
pub const TID_FILE: &str = "tid.txt";
pub const USAGE_FILE: &str = "stmt_use.txt";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub stmts: Vec<Statement>,
    pub tids: Vec<usize>,
    pub usages: Vec<StmtUsage>,
}

impl TestCase {
    pub fn new(stmts: Vec<Statement>, tids: Vec<usize>, usages: Vec<StmtUsage>) -> Self {
        Self {
            stmts,
            tids,
            usages,
        }
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    /// 最大 tid + 1
    pub fn txn_num(&self) -> usize {
        self.tids.iter().max().map_or(0, |&t| t + 1)
    }

    /// `stmts.sql` 以空行分隔语句，含空行的语句在写任何文件之前就被拒绝
    pub fn save(&self, dir: &Path) -> CheckerResult<()> {
        for (idx, stmt) in self.stmts.iter().enumerate() {
            let text = stmt.to_string();
            if text.trim().is_empty() {
                return Err(CheckerError::Unsaveable {
                    idx,
                    reason: "empty statement".to_string(),
                });
            }
            if text.contains("\n\n") || text.contains("\n\r\n") {
                return Err(CheckerError::Unsaveable {
                    idx,
                    reason: "statement contains a blank line".to_string(),
                });
            }
        }
        fs::create_dir_all(dir)?;

        let mut stmt_file = fs::File::create(dir.join(STMT_FILE))?;
        for stmt in &self.stmts {
            writeln!(stmt_file, "{}", stmt)?;
            writeln!(stmt_file)?;
        }

        let mut tid_file = fs::File::create(dir.join(TID_FILE))?;
        for tid in &self.tids {
            writeln!(tid_file, "{}", tid)?;
        }

        let mut usage_file = fs::File::create(dir.join(USAGE_FILE))?;
        for usage in &self.usages {
            writeln!(usage_file, "{}", usage.kind.code())?;
        }
        debug!(dir = %dir.display(), stmt_num = self.len(), "test case saved");
        Ok(())
    }

    /// 额外写出 `conn_<tid>> <stmt>` 形式的可读脚本和可读用途文件
    pub fn save_with_conn(&self, path: &Path) -> CheckerResult<()> {
        let mut conn_file = fs::File::create(path)?;
        for (stmt, tid) in self.stmts.iter().zip(&self.tids) {
            writeln!(conn_file, "conn_{}> {}", tid, stmt)?;
        }

        let readable = PathBuf::from(format!("{}_usage_readable.txt", path.display()));
        let mut usage_file = fs::File::create(readable)?;
        for usage in &self.usages {
            writeln!(usage_file, "{}", usage.kind.as_str())?;
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> CheckerResult<Self> {
        let stmt_text = fs::read_to_string(dir.join(STMT_FILE))?;
        let stmts: Vec<Statement> = stmt_text
            .split("\n\n")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Statement::from_sql)
            .collect();

        let tid_text = fs::read_to_string(dir.join(TID_FILE))?;
        let mut tids = Vec::new();
        for (line_no, line) in non_empty_lines(&tid_text) {
            let tid = line.parse::<usize>().map_err(|e| CheckerError::Parse {
                line: line_no,
                message: format!("bad tid {:?}: {}", line, e),
            })?;
            tids.push(tid);
        }

        let usage_text = fs::read_to_string(dir.join(USAGE_FILE))?;
        let mut kinds = Vec::new();
        for (line_no, line) in non_empty_lines(&usage_text) {
            let kind = line
                .parse::<u8>()
                .ok()
                .and_then(StmtKind::from_code)
                .ok_or_else(|| CheckerError::Parse {
                    line: line_no,
                    message: format!("bad usage code {:?}", line),
                })?;
            kinds.push(kind);
        }

        if stmts.len() != tids.len() || stmts.len() != kinds.len() {
            return Err(CheckerError::Parse {
                line: 0,
                message: format!(
                    "stmt num {}, tid num {} and usage num {} are not equal",
                    stmts.len(),
                    tids.len(),
                    kinds.len()
                ),
            });
        }

        let usages = stmts
            .iter()
            .zip(kinds)
            .map(|(stmt, kind)| restore_usage(stmt, kind))
            .collect();
        Ok(Self {
            stmts,
            tids,
            usages,
        })
    }

    fn retain_by_index(&mut self, keep: impl Fn(usize) -> bool) {
        let flags: Vec<bool> = (0..self.len()).map(keep).collect();
        let mut it = flags.iter();
        self.stmts.retain(|_| *it.next().unwrap_or(&true));
        let mut it = flags.iter();
        self.tids.retain(|_| *it.next().unwrap_or(&true));
        let mut it = flags.iter();
        self.usages.retain(|_| *it.next().unwrap_or(&true));
    }

    fn remove(&mut self, idx: usize) {
        self.stmts.remove(idx);
        self.tids.remove(idx);
        self.usages.remove(idx);
    }

    fn kind_at(&self, idx: usize) -> Option<StmtKind> {
        self.usages.get(idx).map(|u| u.kind)
    }

    fn count(&self, kind: StmtKind) -> usize {
        self.usages.iter().filter(|u| u.kind == kind).count()
    }

    /// 删除第 `ordinals` 个谓词对应的 BPM 或 APM
    ///
    /// 每个写语句前后都有一组完整的 BPM/APM，第 k 个对应第 k 个 PM。
    fn remove_aligned(&mut self, kind: StmtKind, ordinals: &BTreeSet<usize>, nr_matches: usize) {
        let mut seen = 0;
        let mut doomed = BTreeSet::new();
        for (i, usage) in self.usages.iter().enumerate() {
            if usage.kind != kind {
                continue;
            }
            if ordinals.contains(&seen) {
                doomed.insert(i);
            }
            seen = (seen + 1) % nr_matches;
        }
        self.retain_by_index(|i| !doomed.contains(&i));
    }

    /// 删除一个事务及其 PM 对应的 BPM/APM，更大的 tid 依次减一
    pub fn delete_txn(&mut self, tid: usize) {
        let nr_matches = self.count(StmtKind::PredicateMatch);
        if nr_matches > 0 {
            let ordinals: BTreeSet<usize> = self
                .usages
                .iter()
                .zip(&self.tids)
                .filter(|(u, _)| u.kind == StmtKind::PredicateMatch)
                .enumerate()
                .filter(|(_, (_, t))| **t == tid)
                .map(|(ordinal, _)| ordinal)
                .collect();
            self.remove_aligned(StmtKind::BeforePredicateMatch, &ordinals, nr_matches);
            self.remove_aligned(StmtKind::AfterPredicateMatch, &ordinals, nr_matches);
        }

        let tids = self.tids.clone();
        self.retain_by_index(|i| tids[i] != tid);
        for t in &mut self.tids {
            if *t > tid {
                *t -= 1;
            }
        }
    }

    /// 删除一条普通语句及其探针
    ///
    /// 事务控制语句和探针本身不能删除，返回 false。
    pub fn delete_stmt(&mut self, idx: usize) -> bool {
        if idx >= self.len() {
            return false;
        }
        if matches!(self.stmts[idx], Statement::Txn(_)) || self.usages[idx].is_instrumentation() {
            return false;
        }

        if self.kind_at(idx + 1) == Some(StmtKind::AfterWriteRead) {
            self.remove(idx + 1);
        }
        self.remove(idx);

        // cur 指向被删语句原位置之前的元素
        let mut cur = idx.checked_sub(1);
        while let Some(c) = cur {
            match self.kind_at(c) {
                Some(StmtKind::BeforeWriteRead) | Some(StmtKind::VersionSetRead) => {
                    self.remove(c);
                    cur = c.checked_sub(1);
                }
                _ => break,
            }
        }

        if let Some(mut c) = cur.filter(|&c| self.kind_at(c) == Some(StmtKind::PredicateMatch)) {
            let nr_predicates = self.count(StmtKind::PredicateMatch);
            let smaller = self.usages[..c]
                .iter()
                .filter(|u| u.kind == StmtKind::PredicateMatch)
                .count();
            for kind in [StmtKind::BeforePredicateMatch, StmtKind::AfterPredicateMatch] {
                let mut seen = 0;
                let mut poz = 0;
                while poz < self.len() {
                    if self.usages[poz].kind != kind {
                        poz += 1;
                        continue;
                    }
                    let hit = seen == smaller;
                    seen = (seen + 1) % nr_predicates;
                    if hit {
                        self.remove(poz);
                        if poz < c {
                            c -= 1;
                        }
                    } else {
                        poz += 1;
                    }
                }
            }
            if self.kind_at(c) == Some(StmtKind::PredicateMatch) {
                self.remove(c);
            } else {
                warn!(idx = c, "predicate match moved while deleting its probes");
            }
            cur = c.checked_sub(1);
        }

        while let Some(c) = cur {
            if self.kind_at(c) != Some(StmtKind::BeforePredicateMatch) {
                break;
            }
            self.remove(c);
            cur = c.checked_sub(1);
        }

        let next = cur.map_or(0, |c| c + 1);
        while self.kind_at(next) == Some(StmtKind::AfterPredicateMatch) {
            self.remove(next);
        }
        true
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

/// 文件里只记录用途编码，目标表从语句本身恢复
fn restore_usage(stmt: &Statement, kind: StmtKind) -> StmtUsage {
    let table = match (stmt, kind) {
        (Statement::Select(select), StmtKind::BeforeWriteRead)
        | (Statement::Select(select), StmtKind::AfterWriteRead)
        | (Statement::Select(select), StmtKind::VersionSetRead) => Some(select.table.as_str()),
        _ if kind.is_write() => stmt.victim(),
        _ => None,
    };
    match table {
        Some(t) => StmtUsage::on_table(kind, t),
        None => StmtUsage::new(kind),
    }
}

/// 尽量缩小一个能复现问题的用例
///
/// # 算法说明
///
/// 1. 先确认原用例能复现，否则返回 None
/// 2. 依次尝试删除每个事务，能复现就保留删除（tid 会重新编号，所以停在原位继续）
/// 3. 依次尝试删除每条普通语句（连同它的探针），同样保留成功的删除
///
/// 语句数没有变化时返回 None。
pub fn minimize<F>(case: &TestCase, mut reproduce: F) -> Option<TestCase>
where
    F: FnMut(&TestCase) -> bool,
{
    if !reproduce(case) {
        info!("the test case does not reproduce");
        return None;
    }

    let mut best = case.clone();
    let mut tid = 0;
    while tid < best.txn_num() {
        let mut candidate = best.clone();
        candidate.delete_txn(tid);
        if reproduce(&candidate) {
            info!(tid, "succeed to delete txn");
            best = candidate;
        } else {
            tid += 1;
        }
    }

    let mut idx = 0;
    while idx < best.len() {
        let mut candidate = best.clone();
        if candidate.delete_stmt(idx) && reproduce(&candidate) {
            info!(idx, "succeed to delete stmt");
            best = candidate;
        } else {
            idx += 1;
        }
    }

    if best.len() == case.len() {
        return None;
    }
    Some(best)
}

/// 与用例一起保存的诊断信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BugReport {
    pub description: String,
    pub anomaly: Option<Anomaly>,
    pub config: CheckerConfig,
    pub statuses: Vec<TxnStatus>,
}

impl BugReport {
    pub fn save(&self, dir: &Path) -> CheckerResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(REPORT_FILE), json)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> CheckerResult<Self> {
        let text = fs::read_to_string(dir.join(REPORT_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// 在 `output_dir` 下找第一个未使用的 `bug_<n>_trans` 目录，写入用例和报告
pub fn save_bug_report(output_dir: &Path, case: &TestCase, report: &BugReport) -> CheckerResult<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let mut n = 0;
    let dir = loop {
        let candidate = output_dir.join(format!("bug_{}_trans", n));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    case.save(&dir)?;
    report.save(&dir)?;
    info!(dir = %dir.display(), "bug report saved");
    Ok(dir)
}
