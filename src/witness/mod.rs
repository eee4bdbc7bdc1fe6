//! 见证回放
//!
//! 把一条语句路径在单个连接上顺序重放，与并发执行的结果对比：
//! 最终表内容、路径上语句的输出、以及是否出错。
//! 行的顺序不重要，比较前先规范化浮点数再把每行哈希后排序。

use crate::dut::{DbErrorKind, DbmsAdapter, DbmsConnector, TableContent};
use crate::error::{CheckerError, CheckerResult};
use crate::history::{hash_row, StmtId, StmtOutput};
use crate::scheduler::TransactionTest;
use std::fmt;
use tracing::{debug, warn};

/// 并发执行与顺序回放不一致的地方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WitnessMismatch {
    /// 最终表内容不同
    Content,
    /// 路径上语句的输出不同
    Output,
    ErrorCount { concurrent: usize, witness: usize },
    /// 只有一方出错
    ErrorPresence {
        index: usize,
        concurrent: String,
        witness: String,
    },
}

impl fmt::Display for WitnessMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WitnessMismatch::Content => write!(f, "trans_db_content is not equal to normal_stmt_db_content"),
            WitnessMismatch::Output => write!(f, "txn output is not equal to normal stmt one"),
            WitnessMismatch::ErrorCount {
                concurrent,
                witness,
            } => write!(
                f,
                "txn error info size {} is not equal to normal stmt one {}",
                concurrent, witness
            ),
            WitnessMismatch::ErrorPresence {
                index,
                concurrent,
                witness,
            } => write!(
                f,
                "txn error info is not equal to normal stmt one at {}: {:?} vs {:?}",
                index, concurrent, witness
            ),
        }
    }
}

/// 带小数点的数字保留两位小数，按六位小数输出
fn normalize_cell(cell: &str) -> String {
    if !cell.contains('.') {
        return cell.to_string();
    }
    match cell.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => format!("{:.6}", (value * 100.0).round() / 100.0),
        _ => cell.to_string(),
    }
}

fn hashed_rows(output: &StmtOutput) -> Vec<u64> {
    let mut hashes: Vec<u64> = output
        .iter()
        .map(|row| {
            let normalized: Vec<String> = row.iter().map(|c| normalize_cell(c)).collect();
            hash_row(&normalized)
        })
        .collect();
    hashes.sort_unstable();
    hashes
}

/// 逐条语句比较输出，忽略行顺序
pub fn compare_output(a: &[StmtOutput], b: &[StmtOutput]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| hashed_rows(x) == hashed_rows(y))
}

/// 表集合相同，且每张表按 `compare_output` 的规则相等
pub fn compare_content(a: &TableContent, b: &TableContent) -> bool {
    if a.len() != b.len() {
        debug!(a = a.len(), b = b.len(), "table num not equal");
        return false;
    }
    for (table, rows) in a {
        let Some(other) = b.get(table) else {
            debug!(table = %table, "table is missing");
            return false;
        };
        if hashed_rows(rows) != hashed_rows(other) {
            debug!(table = %table, "table content not equal");
            return false;
        }
    }
    true
}

impl<C: DbmsConnector> TransactionTest<C> {
    fn path_stmt(&self, id: &StmtId) -> CheckerResult<&crate::sql::Statement> {
        self.txns
            .get(id.txn_id)
            .and_then(|t| t.stmts.get(id.pos))
            .ok_or_else(|| CheckerError::InvalidOutput {
                stmt_idx: None,
                detail: format!("path stmt {} does not exist", id),
            })
    }

    /// 在一个新连接上顺序重放路径
    pub fn normal_stmt_test(&mut self, path: &[StmtId]) -> CheckerResult<()> {
        debug!(path_len = path.len(), "normal testing");
        self.normal_outputs.clear();
        self.normal_errs.clear();

        self.connector.reset_to_backup()?;
        let mut conn = self.connector.connect()?;
        for id in path {
            let sql = self.path_stmt(id)?.to_string();
            let show = self.config.show_str(&sql);
            match conn.execute(&sql) {
                Ok(result) => {
                    debug!(tid = id.txn_id, pos = id.pos, "T{}P{}: {}", id.txn_id, id.pos, show);
                    self.normal_outputs.push(result.rows);
                    self.normal_errs.push(String::new());
                }
                Err(e) if e.kind == DbErrorKind::ConnectionLost => return Err(e.into()),
                Err(e) => {
                    warn!(tid = id.txn_id, pos = id.pos, error = %e, "T{}P{}: {}: fail", id.txn_id, id.pos, show);
                    self.normal_outputs.push(StmtOutput::new());
                    if e.kind == DbErrorKind::Skipped {
                        self.normal_errs.push(String::new());
                    } else {
                        self.normal_errs.push(e.to_string());
                    }
                }
            }
        }
        drop(conn);

        let tables = self.schema.table_names();
        self.normal_content = self.connector.get_content(&tables)?;
        Ok(())
    }

    /// 对比并发执行与顺序回放，一致时返回 None
    ///
    /// 两边都出错但错误信息不同是允许的。
    pub fn check_normal_stmt_result(&self, path: &[StmtId]) -> CheckerResult<Option<WitnessMismatch>> {
        if !compare_content(&self.trans_content, &self.normal_content) {
            warn!("trans_db_content is not equal to normal_stmt_db_content");
            return Ok(Some(WitnessMismatch::Content));
        }

        let mut outputs = Vec::with_capacity(path.len());
        let mut errs = Vec::with_capacity(path.len());
        for id in path {
            let txn = self.txns.get(id.txn_id);
            let (Some(output), Some(err)) = (
                txn.and_then(|t| t.outputs.get(id.pos)),
                txn.and_then(|t| t.errs.get(id.pos)),
            ) else {
                return Err(CheckerError::InvalidOutput {
                    stmt_idx: None,
                    detail: format!("no concurrent output for path stmt {}", id),
                });
            };
            outputs.push(output.clone());
            errs.push(err.clone());
        }

        if !compare_output(&outputs, &self.normal_outputs) {
            warn!("txn output is not equal to normal stmt one");
            return Ok(Some(WitnessMismatch::Output));
        }

        if errs.len() != self.normal_errs.len() {
            return Ok(Some(WitnessMismatch::ErrorCount {
                concurrent: errs.len(),
                witness: self.normal_errs.len(),
            }));
        }
        for (index, (concurrent, witness)) in errs.iter().zip(&self.normal_errs).enumerate() {
            if concurrent == witness || (!concurrent.is_empty() && !witness.is_empty()) {
                continue;
            }
            warn!(index, concurrent = %concurrent, witness = %witness, "txn error info is not equal to normal stmt one");
            return Ok(Some(WitnessMismatch::ErrorPresence {
                index,
                concurrent: concurrent.clone(),
                witness: witness.clone(),
            }));
        }
        Ok(None)
    }
}
