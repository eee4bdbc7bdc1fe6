// 集成测试共用的辅助函数
#![allow(dead_code)]

use rs_txncheck::dut::{DbmsConnector, IsolationLevel, MemoryDbms};
use rs_txncheck::history::{StmtKind, StmtOutput, StmtUsage};
use rs_txncheck::sql::{Literal, Schema, Statement, Table};
use rs_txncheck::TestCase;

/// 用 RUST_LOG 控制测试输出
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn rows(data: &[&[&str]]) -> StmtOutput {
    data.iter()
        .map(|r| r.iter().map(|c| c.to_string()).collect())
        .collect()
}

/// t_0 (wkey, pkey, c0)
pub fn schema() -> Schema {
    Schema::new(vec![Table::new(
        "t_0",
        &[("wkey", "INT"), ("pkey", "INT"), ("c0", "INT")],
    )])
    .with_int_comparisons()
}

/// 两行初始数据 (1, 1, 10) 和 (2, 2, 20)，已完成 backup
pub fn memory_db(isolation: IsolationLevel) -> MemoryDbms {
    let db = MemoryDbms::with_schema(&schema(), isolation);
    db.insert_committed(
        "t_0",
        vec![
            vec![Literal::Int(1), Literal::Int(1), Literal::Int(10)],
            vec![Literal::Int(2), Literal::Int(2), Literal::Int(20)],
        ],
    )
    .unwrap();
    db.backup().unwrap();
    db
}

pub fn stmt(text: &str) -> Statement {
    match text {
        "BEGIN" => Statement::begin("BEGIN"),
        "COMMIT" => Statement::commit("COMMIT"),
        "ROLLBACK" => Statement::abort("ROLLBACK"),
        _ => Statement::from_sql(text),
    }
}

/// 由 (tid, sql) 列表构建未插桩的用例
pub fn case(queue: &[(usize, &str)]) -> TestCase {
    TestCase::new(
        queue.iter().map(|(_, sql)| stmt(sql)).collect(),
        queue.iter().map(|(tid, _)| *tid).collect(),
        vec![StmtUsage::new(StmtKind::Init); queue.len()],
    )
}
