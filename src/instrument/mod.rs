//! 插桩
//!
//! 在每个写语句前后插入读探针，捕获它看到和产生的行版本：
//! - BPM / APM：所有谓词在写之前 / 之后匹配到的行
//! - PM：本语句自己的谓词
//! - VSR：语句涉及的每张表的版本集合
//! - BWR / AWR：写之前的镜像和写之后的镜像
//!
//! 探针和被插桩语句位于同一事务并且相邻，因此观察到的恰好是该语句看到的版本。

use crate::error::{CheckerError, CheckerResult};
use crate::history::{StmtKind, StmtUsage};
use crate::sql::{
    involved_tables, DeleteStmt, Expr, InsertStmt, SelectStmt, Schema, Statement, Table,
    UpdateStmt,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// 版本列名
pub const VERSION_COLUMN: &str = "wkey";

/// 插桩后的语句队列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instrumented {
    pub stmts: Vec<Statement>,
    pub tids: Vec<usize>,
    pub usages: Vec<StmtUsage>,
}

impl Instrumented {
    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    fn push(&mut self, stmt: Statement, tid: usize, usage: StmtUsage) {
        self.stmts.push(stmt);
        self.tids.push(tid);
        self.usages.push(usage);
    }
}

/// 对语句队列插桩
pub fn instrument(stmts: &[Statement], tids: &[usize], schema: &Schema) -> CheckerResult<Instrumented> {
    if stmts.len() != tids.len() {
        return Err(CheckerError::Instrument(format!(
            "stmt queue size {} is not equal to tid queue size {}",
            stmts.len(),
            tids.len()
        )));
    }
    debug!(stmt_num = stmts.len(), "instrumenting the statements");

    let mut instrumentor = Instrumentor {
        schema,
        predicates: extract_predicates(stmts)?,
        out: Instrumented::default(),
    };
    for (i, (stmt, &tid)) in stmts.iter().zip(tids).enumerate() {
        match stmt {
            Statement::Update(update) => instrumentor.handle_update(update, tid, i)?,
            Statement::Delete(delete) => instrumentor.handle_delete(delete, tid, i),
            Statement::Insert(insert) => instrumentor.handle_insert(insert, tid, i)?,
            Statement::Select(select) => instrumentor.handle_select(select, tid, i),
            Statement::Txn(_) | Statement::Opaque(_) => {
                instrumentor
                    .out
                    .push(stmt.clone(), tid, StmtUsage::new(StmtKind::Init))
            }
        }
    }

    debug!(final_stmt_num = instrumentor.out.len(), "instrumentation done");
    Ok(instrumentor.out)
}

/// 提取谓词：UPDATE / DELETE 的 WHERE 还原成 SELECT，SELECT 就是自身，INSERT 没有谓词
fn extract_predicates(stmts: &[Statement]) -> CheckerResult<BTreeMap<usize, SelectStmt>> {
    let mut predicates = BTreeMap::new();
    for (i, stmt) in stmts.iter().enumerate() {
        match stmt {
            Statement::Update(s) => {
                predicates.insert(i, SelectStmt::matching(&s.victim, s.search.clone()));
            }
            Statement::Delete(s) => {
                predicates.insert(i, SelectStmt::matching(&s.victim, s.search.clone()));
            }
            Statement::Select(s) => {
                predicates.insert(i, s.clone());
            }
            Statement::Insert(_) | Statement::Txn(_) => {}
            Statement::Opaque(text) => {
                // 不透明语句只能是占位符之类，不能是真正的读
                if text.contains("SELECT * FROM") {
                    return Err(CheckerError::Instrument(format!(
                        "unexpected SELECT * FROM in opaque statement {}",
                        i
                    )));
                }
            }
        }
    }
    Ok(predicates)
}

struct Instrumentor<'a> {
    schema: &'a Schema,
    predicates: BTreeMap<usize, SelectStmt>,
    out: Instrumented,
}

impl<'a> Instrumentor<'a> {
    fn find_table(&self, name: &str, stmt: &Statement) -> CheckerResult<&'a Table> {
        self.schema.find_table(name).ok_or_else(|| {
            CheckerError::Instrument(format!("cannot find table {} of statement: {}", name, stmt))
        })
    }

    fn wkey_index(table: &Table, stmt: &Statement) -> CheckerResult<usize> {
        table.column_index(VERSION_COLUMN).ok_or_else(|| {
            CheckerError::Instrument(format!("cannot find wkey in statement: {}", stmt))
        })
    }

    fn require_equal_op(&self, what: &str) -> CheckerResult<()> {
        if self.schema.operators.iter().any(|op| op.name == "=") {
            Ok(())
        } else {
            Err(CheckerError::Instrument(format!(
                "instrument {} statement: cannot find = operator",
                what
            )))
        }
    }

    /// AWR：`SELECT * FROM t WHERE (t.wkey = value)`
    fn after_write_read(table: &str, value: Expr) -> Statement {
        Statement::Select(SelectStmt::matching(
            table,
            Some(Expr::eq(Expr::column(table, VERSION_COLUMN), value)),
        ))
    }

    fn push_before_predicates(&mut self, tid: usize, stmt_idx: usize) {
        let bpms: Vec<SelectStmt> = self.predicates.values().cloned().collect();
        for predicate in bpms {
            self.out.push(
                Statement::Select(predicate),
                tid,
                StmtUsage::new(StmtKind::BeforePredicateMatch),
            );
        }
        self.push_predicate_match(tid, stmt_idx);
    }

    fn push_predicate_match(&mut self, tid: usize, stmt_idx: usize) {
        if let Some(predicate) = self.predicates.get(&stmt_idx).cloned() {
            self.out.push(
                Statement::Select(predicate),
                tid,
                StmtUsage::new(StmtKind::PredicateMatch),
            );
        }
    }

    fn push_after_predicates(&mut self, tid: usize) {
        let apms: Vec<SelectStmt> = self.predicates.values().cloned().collect();
        for predicate in apms {
            self.out.push(
                Statement::Select(predicate),
                tid,
                StmtUsage::new(StmtKind::AfterPredicateMatch),
            );
        }
    }

    fn push_version_set_reads(&mut self, tid: usize, tables: &BTreeSet<String>) {
        for table in tables {
            self.out.push(
                Statement::Select(SelectStmt::all_rows(table)),
                tid,
                StmtUsage::on_table(StmtKind::VersionSetRead, table),
            );
        }
    }

    fn handle_update(&mut self, update: &UpdateStmt, tid: usize, stmt_idx: usize) -> CheckerResult<()> {
        let stmt = Statement::Update(update.clone());
        let table = self.find_table(&update.victim, &stmt)?;
        Self::wkey_index(table, &stmt)?;
        let wkey_value = update
            .set_list
            .iter()
            .find(|(name, _)| name == VERSION_COLUMN)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                CheckerError::Instrument(format!("cannot find wkey = expr in statement: {}", stmt))
            })?;
        self.require_equal_op("update")?;

        let victim = update.victim.as_str();
        let tables = involved_tables(&stmt.to_string());

        self.push_before_predicates(tid, stmt_idx);
        self.push_version_set_reads(tid, &tables);
        self.out.push(
            Statement::Select(SelectStmt::matching(victim, update.search.clone())),
            tid,
            StmtUsage::on_table(StmtKind::BeforeWriteRead, victim),
        );
        self.out
            .push(stmt, tid, StmtUsage::on_table(StmtKind::Update, victim));
        self.out.push(
            Self::after_write_read(victim, wkey_value),
            tid,
            StmtUsage::on_table(StmtKind::AfterWriteRead, victim),
        );
        self.push_after_predicates(tid);
        Ok(())
    }

    fn handle_delete(&mut self, delete: &DeleteStmt, tid: usize, stmt_idx: usize) {
        let stmt = Statement::Delete(delete.clone());
        let victim = delete.victim.as_str();
        let tables = involved_tables(&stmt.to_string());

        self.push_before_predicates(tid, stmt_idx);
        self.push_version_set_reads(tid, &tables);
        self.out.push(
            Statement::Select(SelectStmt::matching(victim, delete.search.clone())),
            tid,
            StmtUsage::on_table(StmtKind::BeforeWriteRead, victim),
        );
        // 行被删除，不需要写后读
        self.out
            .push(stmt, tid, StmtUsage::on_table(StmtKind::Delete, victim));
        self.push_after_predicates(tid);
    }

    fn handle_insert(&mut self, insert: &InsertStmt, tid: usize, stmt_idx: usize) -> CheckerResult<()> {
        let stmt = Statement::Insert(insert.clone());
        let table = self.find_table(&insert.victim, &stmt)?;
        let wkey_idx = Self::wkey_index(table, &stmt)?;
        let wkey_value = insert
            .values
            .first()
            .and_then(|tuple| tuple.get(wkey_idx))
            .cloned()
            .ok_or_else(|| {
                CheckerError::Instrument(format!("cannot find wkey value in statement: {}", stmt))
            })?;
        self.require_equal_op("insert")?;

        let victim = insert.victim.as_str();
        // 插入的值可能依赖其他表，目标表本身不需要版本集合读
        let mut tables = involved_tables(&stmt.to_string());
        tables.remove(victim);

        self.push_before_predicates(tid, stmt_idx);
        self.push_version_set_reads(tid, &tables);
        self.out
            .push(stmt, tid, StmtUsage::on_table(StmtKind::Insert, victim));
        self.out.push(
            Self::after_write_read(victim, wkey_value),
            tid,
            StmtUsage::on_table(StmtKind::AfterWriteRead, victim),
        );
        self.push_after_predicates(tid);
        Ok(())
    }

    fn handle_select(&mut self, select: &SelectStmt, tid: usize, stmt_idx: usize) {
        let stmt = Statement::Select(select.clone());
        let tables = involved_tables(&stmt.to_string());

        self.push_predicate_match(tid, stmt_idx);
        self.push_version_set_reads(tid, &tables);
        self.out.push(stmt, tid, StmtUsage::new(StmtKind::Select));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{parse_statement, Statement, Table};

    fn schema() -> Schema {
        Schema::new(vec![Table::new(
            "t_0",
            &[("wkey", "INT"), ("pkey", "INT"), ("c0", "INT")],
        )])
        .with_int_comparisons()
    }

    fn parse(text: &str) -> Statement {
        parse_statement(text).unwrap()
    }

    fn kinds(out: &Instrumented) -> Vec<StmtKind> {
        out.usages.iter().map(|u| u.kind).collect()
    }

    #[test]
    fn test_update_layout() {
        let stmts = vec![
            Statement::begin("BEGIN"),
            parse("UPDATE t_0 SET wkey = 5, c0 = 1 WHERE (t_0.pkey = 1)"),
            Statement::commit("COMMIT"),
        ];
        let out = instrument(&stmts, &[0, 0, 0], &schema()).unwrap();
        assert_eq!(
            kinds(&out),
            vec![
                StmtKind::Init,
                StmtKind::BeforePredicateMatch,
                StmtKind::PredicateMatch,
                StmtKind::VersionSetRead,
                StmtKind::BeforeWriteRead,
                StmtKind::Update,
                StmtKind::AfterWriteRead,
                StmtKind::AfterPredicateMatch,
                StmtKind::Init,
            ]
        );
        assert!(out.tids.iter().all(|&t| t == 0));
        assert_eq!(out.stmts[3].to_string(), "SELECT * FROM t_0");
        assert_eq!(
            out.stmts[4].to_string(),
            "SELECT * FROM t_0 WHERE (t_0.pkey = 1)"
        );
        assert_eq!(
            out.stmts[6].to_string(),
            "SELECT * FROM t_0 WHERE (t_0.wkey = 5)"
        );
        assert_eq!(out.usages[5].target_table.as_deref(), Some("t_0"));
    }

    #[test]
    fn test_insert_and_select_layout() {
        let stmts = vec![
            parse("INSERT INTO t_0 VALUES (7, 3, 0)"),
            parse("SELECT * FROM t_0 WHERE (t_0.c0 > 0)"),
        ];
        let out = instrument(&stmts, &[0, 1], &schema()).unwrap();
        // 一个谓词（SELECT），INSERT 不做目标表的版本集合读
        assert_eq!(
            kinds(&out),
            vec![
                StmtKind::BeforePredicateMatch,
                StmtKind::Insert,
                StmtKind::AfterWriteRead,
                StmtKind::AfterPredicateMatch,
                StmtKind::PredicateMatch,
                StmtKind::VersionSetRead,
                StmtKind::Select,
            ]
        );
        assert_eq!(out.tids, vec![0, 0, 0, 0, 1, 1, 1]);
        assert_eq!(
            out.stmts[2].to_string(),
            "SELECT * FROM t_0 WHERE (t_0.wkey = 7)"
        );
    }

    #[test]
    fn test_missing_wkey_assignment() {
        let stmts = vec![parse("UPDATE t_0 SET c0 = 1")];
        let err = instrument(&stmts, &[0], &schema()).unwrap_err();
        assert!(matches!(err, CheckerError::Instrument(_)));
    }

    #[test]
    fn test_missing_equal_operator() {
        let schema = Schema::new(vec![Table::new("t_0", &[("wkey", "INT"), ("pkey", "INT")])]);
        let stmts = vec![parse("INSERT INTO t_0 VALUES (1, 1)")];
        assert!(instrument(&stmts, &[0], &schema).is_err());
    }

    #[test]
    fn test_opaque_read_rejected() {
        let stmts = vec![Statement::Opaque("SELECT * FROM t_0 LIMIT 1".to_string())];
        assert!(instrument(&stmts, &[0], &schema()).is_err());

        let stmts = vec![Statement::placeholder()];
        let out = instrument(&stmts, &[0], &schema()).unwrap();
        assert_eq!(kinds(&out), vec![StmtKind::Init]);
    }
}
