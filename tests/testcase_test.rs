// 用例持久化测试
// 测试保存/加载、可读脚本、错误输入和问题报告目录编号

mod common;

use common::{case, init_tracing};
use rs_txncheck::analyzer::Anomaly;
use rs_txncheck::history::{StmtKind, StmtUsage};
use rs_txncheck::sql::Statement;
use rs_txncheck::testcase::{save_bug_report, BugReport, STMT_FILE, TID_FILE, USAGE_FILE};
use rs_txncheck::{CheckerConfig, CheckerError, TestCase, TxnStatus};
use std::fs;
use tempfile::TempDir;

fn sample_case() -> TestCase {
    let mut c = case(&[
        (0, "BEGIN"),
        (1, "BEGIN"),
        (0, "UPDATE t_0 SET wkey = 3, c0 = 11 WHERE (t_0.pkey = 1)"),
        (1, "SELECT * FROM t_0 WHERE (t_0.pkey = 1)"),
        (0, "ROLLBACK"),
        (1, "COMMIT"),
    ]);
    c.usages[2] = StmtUsage::on_table(StmtKind::Update, "t_0");
    c.usages[3] = StmtUsage::new(StmtKind::Select);
    c
}

#[test]
fn test_save_and_load() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let original = sample_case();
    original.save(dir.path()).unwrap();

    let loaded = TestCase::load(dir.path()).unwrap();
    assert_eq!(loaded.len(), original.len());
    assert_eq!(loaded.tids, original.tids);
    for (a, b) in loaded.stmts.iter().zip(&original.stmts) {
        assert_eq!(a.to_string(), b.to_string());
    }
    let kinds: Vec<StmtKind> = loaded.usages.iter().map(|u| u.kind).collect();
    let expected: Vec<StmtKind> = original.usages.iter().map(|u| u.kind).collect();
    assert_eq!(kinds, expected);
    // 写语句的目标表可以从语句本身恢复
    assert_eq!(loaded.usages[2].target_table.as_deref(), Some("t_0"));
    assert_eq!(loaded.txn_num(), 2);
}

#[test]
fn test_load_rejects_bad_input() {
    let dir = TempDir::new().unwrap();
    sample_case().save(dir.path()).unwrap();

    // tid 不是数字
    fs::write(dir.path().join(TID_FILE), "0\n1\nx\n1\n0\n1\n").unwrap();
    match TestCase::load(dir.path()) {
        Err(CheckerError::Parse { line, .. }) => assert_eq!(line, 3),
        other => panic!("unexpected result: {:?}", other),
    }

    // 队列长度不一致
    fs::write(dir.path().join(TID_FILE), "0\n1\n").unwrap();
    assert!(matches!(
        TestCase::load(dir.path()),
        Err(CheckerError::Parse { .. })
    ));

    // 未知的用途编码
    sample_case().save(dir.path()).unwrap();
    fs::write(dir.path().join(USAGE_FILE), "0\n0\n250\n0\n0\n0\n").unwrap();
    assert!(matches!(
        TestCase::load(dir.path()),
        Err(CheckerError::Parse { .. })
    ));

    // 缺少文件
    fs::remove_file(dir.path().join(STMT_FILE)).unwrap();
    assert!(matches!(TestCase::load(dir.path()), Err(CheckerError::Io(_))));
}

#[test]
fn test_save_rejects_stmts_with_blank_lines() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("case");

    // 字符串常量里的空行会和语句分隔符混淆
    let mut bad = sample_case();
    bad.stmts[3] = Statement::from_sql("SELECT * FROM t_0 WHERE (t_0.c0 = 'a\n\nb')");
    match bad.save(&target) {
        Err(CheckerError::Unsaveable { idx, .. }) => assert_eq!(idx, 3),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!target.exists());

    let mut empty = sample_case();
    empty.stmts[2] = Statement::Opaque(String::new());
    assert!(matches!(
        empty.save(&target),
        Err(CheckerError::Unsaveable { idx: 2, .. })
    ));

    // 单个换行可以正常往返
    let mut multi_line = sample_case();
    multi_line.stmts[3] = Statement::from_sql("SELECT * FROM t_0 WHERE (t_0.c0 = 'a\nb')");
    multi_line.save(&target).unwrap();
    let loaded = TestCase::load(&target).unwrap();
    assert_eq!(loaded.len(), 6);
    assert_eq!(loaded.stmts[3].to_string(), multi_line.stmts[3].to_string());
}

#[test]
fn test_save_with_conn() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("case.sql");
    sample_case().save_with_conn(&path).unwrap();

    let script = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = script.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "conn_0> BEGIN");
    assert_eq!(lines[3], "conn_1> SELECT * FROM t_0 WHERE (t_0.pkey = 1)");

    let readable = fs::read_to_string(dir.path().join("case.sql_usage_readable.txt")).unwrap();
    let kinds: Vec<&str> = readable.lines().collect();
    assert_eq!(kinds.len(), 6);
    assert_eq!(kinds[2], StmtKind::Update.as_str());
}

#[test]
fn test_bug_report_directories() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let report = BugReport {
        description: "G1a: abort txn 0 -> commit txn 1".to_string(),
        anomaly: Some(Anomaly::G1a {
            aborted: 0,
            committed: 1,
        }),
        config: CheckerConfig::new().with_seed(9),
        statuses: vec![TxnStatus::Abort, TxnStatus::Commit],
    };

    let first = save_bug_report(dir.path(), &sample_case(), &report).unwrap();
    let second = save_bug_report(dir.path(), &sample_case(), &report).unwrap();
    assert_eq!(first, dir.path().join("bug_0_trans"));
    assert_eq!(second, dir.path().join("bug_1_trans"));

    let loaded = BugReport::load(&first).unwrap();
    assert_eq!(loaded, report);
    assert_eq!(TestCase::load(&second).unwrap().len(), 6);
}
