// 见证回放测试

mod common;

use common::{case, init_tracing, memory_db, rows, schema};
use rs_txncheck::dut::IsolationLevel;
use rs_txncheck::history::StmtId;
use rs_txncheck::witness::{compare_content, compare_output, WitnessMismatch};
use rs_txncheck::{seeded_rng, CheckerConfig, TestCase, TransactionTest};

fn conflicting_updates() -> TestCase {
    case(&[
        (0, "BEGIN"),
        (1, "BEGIN"),
        (0, "UPDATE t_0 SET wkey = 3, c0 = 11 WHERE (t_0.pkey = 1)"),
        (1, "UPDATE t_0 SET wkey = 4, c0 = 12 WHERE (t_0.pkey = 1)"),
        (0, "COMMIT"),
        (1, "COMMIT"),
    ])
}

/// 调度、插桩并执行一遍
fn executed_test() -> TransactionTest<rs_txncheck::MemoryDbms> {
    let mut test = TransactionTest::from_test_case(
        memory_db(IsolationLevel::ReadCommitted),
        schema(),
        &conflicting_updates(),
        CheckerConfig::new(),
    )
    .unwrap();
    test.block_scheduling().unwrap();
    test.instrument_txn_stmts().unwrap();
    test.trans_test().unwrap();
    test
}

#[test]
fn test_longest_path_replays_identically() {
    init_tracing();
    let mut test = executed_test();
    let (da, anomaly) = test.analyze_txn_dependency().unwrap();
    assert!(anomaly.is_none());

    let mut rng = seeded_rng(test.config());
    let path = da.longest_stmt_path(&mut rng);
    assert!(!path.is_empty());

    test.normal_stmt_test(&path).unwrap();
    assert_eq!(test.check_normal_stmt_result(&path).unwrap(), None);
}

#[test]
fn test_partial_path_changes_content() {
    init_tracing();
    let mut test = executed_test();

    // 只回放 T0，T1 的更新没有出现在最终内容里
    let len = test.txn(0).stmts().len();
    let path: Vec<StmtId> = (1..len - 1).map(|pos| StmtId::new(0, pos)).collect();
    test.normal_stmt_test(&path).unwrap();
    assert_eq!(
        test.check_normal_stmt_result(&path).unwrap(),
        Some(WitnessMismatch::Content)
    );
}

#[test]
fn test_missing_path_stmt_is_an_error() {
    let mut test = executed_test();
    let path = vec![StmtId::new(5, 0)];
    assert!(test.normal_stmt_test(&path).is_err());
}

#[test]
fn test_compare_real_contents() {
    let test = executed_test();
    assert!(compare_content(test.init_content(), test.init_content()));
    assert!(!compare_content(test.init_content(), test.trans_content()));

    let a = vec![rows(&[&["4", "1", "12"], &["2", "2", "20"]])];
    let b = vec![test.trans_content()["t_0"].clone()];
    assert!(compare_output(&a, &b));
}
