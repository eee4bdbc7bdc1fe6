// 依赖分析测试
// 测试版本唯一性、最近写匹配、环检测、各类异常检查和排序算法

mod common;

use common::{init_tracing, rows};
use rs_txncheck::analyzer::checks::{check_g1c, check_gsib, find_cycle, txn_graph_adjacency};
use rs_txncheck::analyzer::{Anomaly, DependencyType, TxnGraph};
use rs_txncheck::history::{StmtId, StmtKind, StmtOutput, StmtUsage};
use rs_txncheck::{AnomalyKind, CheckerError, DependencyAnalyzer, Trace, TxnStatus};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;

fn usage(kind: StmtKind) -> StmtUsage {
    StmtUsage::on_table(kind, "t_0")
}

fn trace(queue: &[(usize, StmtKind, StmtOutput)], txn_num: usize) -> Trace {
    Trace {
        init_outputs: vec![rows(&[&["1", "1", "10"], &["5", "2", "20"]])],
        outputs: queue.iter().map(|(_, _, o)| o.clone()).collect(),
        tids: queue.iter().map(|(t, _, _)| *t).collect(),
        usages: queue.iter().map(|(_, k, _)| usage(*k)).collect(),
        statuses: vec![TxnStatus::Commit; txn_num],
    }
}

fn v1() -> StmtOutput {
    rows(&[&["1", "1", "10"]])
}

fn v2() -> StmtOutput {
    rows(&[&["2", "1", "11"]])
}

fn v3() -> StmtOutput {
    rows(&[&["3", "1", "12"]])
}

// 辅助函数：两个事务先后更新同一行
//
// T0: BEGIN, BWR v1, UPDATE, AWR v2, COMMIT
// T1: BEGIN, BWR v2, UPDATE, AWR v3, COMMIT
fn serial_updates() -> Trace {
    trace(
        &[
            (0, StmtKind::Init, vec![]),
            (0, StmtKind::BeforeWriteRead, v1()),
            (0, StmtKind::Update, vec![]),
            (0, StmtKind::AfterWriteRead, v2()),
            (0, StmtKind::Init, vec![]),
            (1, StmtKind::Init, vec![]),
            (1, StmtKind::BeforeWriteRead, v2()),
            (1, StmtKind::Update, vec![]),
            (1, StmtKind::AfterWriteRead, v3()),
            (1, StmtKind::Init, vec![]),
        ],
        2,
    )
}

// 辅助函数：T0 写出 v2 后在提交前又把它覆盖成 v3
//
// `read_early` 为真时 T1 在两次写之间读到 v2，否则 T1 在 T0 提交后才读到 v3
fn overwritten_before_commit(read_early: bool) -> Trace {
    let mut queue = vec![
        (0, StmtKind::Init, vec![]),
        (0, StmtKind::BeforeWriteRead, v1()),
        (0, StmtKind::Update, vec![]),
        (0, StmtKind::AfterWriteRead, v2()),
    ];
    if read_early {
        queue.push((1, StmtKind::Init, vec![]));
        queue.push((1, StmtKind::Select, v2()));
        queue.push((1, StmtKind::Init, vec![]));
    }
    queue.extend([
        (0, StmtKind::BeforeWriteRead, v2()),
        (0, StmtKind::Update, vec![]),
        (0, StmtKind::AfterWriteRead, v3()),
        (0, StmtKind::Init, vec![]),
    ]);
    if !read_early {
        queue.push((1, StmtKind::Init, vec![]));
        queue.push((1, StmtKind::Select, v3()));
        queue.push((1, StmtKind::Init, vec![]));
    }
    trace(&queue, 2)
}

// 辅助函数：T0 先读 v1，T1 覆盖成 v2 并提交，T0 再覆盖 v2
//
// T0 -RW-> T1 -WR/WW-> T0
fn read_then_overwritten() -> Trace {
    trace(
        &[
            (0, StmtKind::Init, vec![]),
            (0, StmtKind::Select, v1()),
            (1, StmtKind::Init, vec![]),
            (1, StmtKind::BeforeWriteRead, v1()),
            (1, StmtKind::Update, vec![]),
            (1, StmtKind::AfterWriteRead, v2()),
            (1, StmtKind::Init, vec![]),
            (0, StmtKind::BeforeWriteRead, v2()),
            (0, StmtKind::Update, vec![]),
            (0, StmtKind::AfterWriteRead, v3()),
            (0, StmtKind::Init, vec![]),
        ],
        2,
    )
}

fn analyzer(trace: Trace) -> DependencyAnalyzer {
    DependencyAnalyzer::new(trace, 1, 0).unwrap()
}

#[test]
fn test_duplicate_version_is_fatal() {
    init_tracing();
    // 两个事务写出了同一个 (主键, 版本)
    let trace = Trace {
        init_outputs: vec![],
        outputs: vec![
            vec![],
            rows(&[&["5", "3", "0"]]),
            vec![],
            rows(&[&["5", "3", "1"]]),
        ],
        tids: vec![0, 0, 1, 1],
        usages: vec![
            usage(StmtKind::Insert),
            usage(StmtKind::AfterWriteRead),
            usage(StmtKind::Insert),
            usage(StmtKind::AfterWriteRead),
        ],
        statuses: vec![TxnStatus::Commit, TxnStatus::Commit],
    };

    let err = DependencyAnalyzer::new(trace, 1, 0).unwrap_err();
    assert!(matches!(err, CheckerError::NotDistinct { pk: 3, version: 5 }));
    assert!(err.is_invariant_violation());
}

#[test]
fn test_nearest_write_is_matched() {
    init_tracing();
    let da = analyzer(serial_updates());
    let init_tid = da.init_tid();
    assert_eq!(init_tid, 2);

    // T1 的 BWR 看到的是 T0 写的 v2，而不是初始版本
    assert!(da.graph().contains(0, 1, DependencyType::WriteWrite));
    assert!(da.graph().contains(0, 1, DependencyType::WriteRead));
    assert!(da.graph().contains(0, 1, DependencyType::ReadWrite));
    assert!(!da.graph().contains(init_tid, 1, DependencyType::WriteWrite));
    assert!(da.graph().contains(init_tid, 0, DependencyType::WriteWrite));

    let edge = (StmtId::new(0, 3), StmtId::new(1, 1));
    let deps = da.stmt_graph().get(&edge).unwrap();
    assert!(deps.contains(&DependencyType::WriteWrite));
    assert!(deps.contains(&DependencyType::StartDepend));
    assert!(!deps.contains(&DependencyType::InnerDepend));

    // 探针和被插桩语句连成一个块
    let block = da.get_instrumented_stmt_set(2);
    assert_eq!(block, BTreeSet::from([1, 2, 3]));
}

#[test]
fn test_serial_history_has_no_anomaly() {
    init_tracing();
    let da = analyzer(serial_updates());
    assert_eq!(da.run_checks(&AnomalyKind::ALL), None);
    assert!(da.check_any_transaction_cycle().is_none());

    let (cycle, sorted) = da.check_txn_graph_cycle();
    assert!(cycle.is_empty());
    assert_eq!(sorted, vec![0, 1]);
}

#[test]
fn test_g1b_intermediate_read() {
    init_tracing();
    let da = analyzer(overwritten_before_commit(true));
    let expected = Anomaly::G1b {
        row_id: 1,
        writer: 0,
        reader: 1,
    };
    assert_eq!(da.check_g1b(), Some(expected.clone()));
    assert_eq!(da.run_checks(&AnomalyKind::ALL), Some(expected));
    assert_eq!(da.run_checks(&[AnomalyKind::G1a, AnomalyKind::G1c]), None);

    // T1 在 T0 结束后才读，读到的是最终版本
    let da = analyzer(overwritten_before_commit(false));
    assert_eq!(da.check_g1b(), None);
    assert_eq!(da.run_checks(&AnomalyKind::ALL), None);
}

#[test]
fn test_any_transaction_cycle_on_interleaved_history() {
    init_tracing();
    let da = analyzer(read_then_overwritten());
    assert!(da.graph().contains(0, 1, DependencyType::ReadWrite));
    assert!(da.graph().contains(1, 0, DependencyType::WriteRead));

    let cycle = da.check_any_transaction_cycle().unwrap();
    let nodes: BTreeSet<usize> = cycle.txns.iter().copied().collect();
    assert_eq!(nodes, BTreeSet::from([0, 1]));
    assert_eq!(cycle.edges.len(), cycle.txns.len());
    assert!(cycle.edges.iter().any(|(from, to, _)| (*from, *to) == (0, 1)));
    assert!(cycle.edges.iter().any(|(from, to, _)| (*from, *to) == (1, 0)));
    assert!(cycle.edges.iter().all(|(_, _, dt)| !matches!(
        dt,
        DependencyType::StartDepend | DependencyType::StrictStartDepend
    )));

    let (cycle_nodes, sorted) = da.check_txn_graph_cycle();
    assert_eq!(cycle_nodes, BTreeSet::from([0, 1]));
    assert!(sorted.is_empty());

    // 环上有一条 RW，G1c 不报，G2-item 报
    assert_eq!(da.check_g1c(), None);
    assert_eq!(
        da.run_checks(&AnomalyKind::ALL).map(|a| a.kind()),
        Some(AnomalyKind::G2Item)
    );
}

#[test]
fn test_malformed_traces_are_rejected() {
    let mut trace = serial_updates();
    trace.tids.pop();
    assert!(matches!(
        DependencyAnalyzer::new(trace, 1, 0),
        Err(CheckerError::LengthMismatch { .. })
    ));

    // AWR 不能是第一条语句
    let trace = Trace {
        init_outputs: vec![],
        outputs: vec![rows(&[&["1", "1", "0"]])],
        tids: vec![0],
        usages: vec![usage(StmtKind::AfterWriteRead)],
        statuses: vec![TxnStatus::Commit],
    };
    assert!(matches!(
        DependencyAnalyzer::new(trace, 1, 0),
        Err(CheckerError::MalformedAdjacency { idx: 0, .. })
    ));

    // 读到的版本没有任何写入产生
    let trace = Trace {
        init_outputs: vec![],
        outputs: vec![rows(&[&["9", "1", "0"]])],
        tids: vec![0],
        usages: vec![StmtUsage::new(StmtKind::Select)],
        statuses: vec![TxnStatus::Commit],
    };
    assert!(matches!(
        DependencyAnalyzer::new(trace, 1, 0),
        Err(CheckerError::MissingWrite { tid: 0, .. })
    ));
}

#[test]
fn test_cycle_detection() {
    let mut g = TxnGraph::new(3);
    g.insert(0, 1, DependencyType::WriteWrite);
    g.insert(1, 2, DependencyType::WriteRead);
    g.insert(2, 0, DependencyType::WriteRead);

    let cycle = find_cycle(&txn_graph_adjacency(&g)).unwrap();
    let nodes: BTreeSet<usize> = cycle.txns.iter().copied().collect();
    assert_eq!(nodes, BTreeSet::from([0, 1, 2]));

    // 去掉 2 -> 0 后无环
    let mut g = TxnGraph::new(3);
    g.insert(0, 1, DependencyType::WriteWrite);
    g.insert(1, 2, DependencyType::WriteRead);
    assert!(find_cycle(&txn_graph_adjacency(&g)).is_none());
}

#[test]
fn test_g1c_ignores_aborted_transactions() {
    let mut g = TxnGraph::new(3);
    g.insert(0, 1, DependencyType::WriteWrite);
    g.insert(1, 2, DependencyType::WriteRead);
    g.insert(2, 0, DependencyType::WriteWrite);

    let committed = [TxnStatus::Commit; 3];
    let found = check_g1c(&g, &committed).unwrap();
    assert_eq!(found.kind(), AnomalyKind::G1c);

    let aborted = [TxnStatus::Commit, TxnStatus::Abort, TxnStatus::Commit];
    assert!(check_g1c(&g, &aborted).is_none());
}

#[test]
fn test_gsib_requires_exactly_one_rw() {
    let committed = [TxnStatus::Commit; 3];

    let mut one = TxnGraph::new(3);
    one.insert(0, 1, DependencyType::ReadWrite);
    one.insert(1, 2, DependencyType::WriteRead);
    one.insert(2, 0, DependencyType::WriteWrite);
    assert_eq!(check_gsib(&one, &committed).map(|a| a.kind()), Some(AnomalyKind::GsiB));

    let mut two = TxnGraph::new(3);
    two.insert(0, 1, DependencyType::ReadWrite);
    two.insert(1, 2, DependencyType::ReadWrite);
    two.insert(2, 0, DependencyType::WriteWrite);
    assert!(check_gsib(&two, &committed).is_none());
}

#[test]
fn test_topological_sort_visits_every_stmt_once() {
    let da = analyzer(serial_updates());
    let (path, deleted_any) = da.topological_sort_path(&BTreeSet::new());
    assert!(!deleted_any);

    // BEGIN / COMMIT 不在路径中
    let expected: BTreeSet<StmtId> = [(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3)]
        .into_iter()
        .map(|(t, p)| StmtId::new(t, p))
        .collect();
    let visited: BTreeSet<StmtId> = path.iter().copied().collect();
    assert_eq!(visited, expected);
    assert_eq!(path.len(), expected.len());

    // 每条非 START / INNER 的边都从前指向后
    for (i, from) in path.iter().enumerate() {
        for to in &path[..i] {
            if let Some(deps) = da.stmt_graph().get(&(*from, *to)) {
                assert!(deps.iter().all(|dt| matches!(
                    dt,
                    DependencyType::StartDepend
                        | DependencyType::StrictStartDepend
                        | DependencyType::InnerDepend
                )));
            }
        }
    }
}

#[test]
fn test_all_topo_sort_paths() {
    let da = analyzer(serial_updates());
    let paths = da.get_all_topo_sort_paths(10);
    let expected: Vec<StmtId> = [(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3)]
        .into_iter()
        .map(|(t, p)| StmtId::new(t, p))
        .collect();
    assert_eq!(paths, vec![expected]);
    assert!(da.get_all_topo_sort_paths(0).is_empty());
}

#[test]
fn test_longest_path_follows_conflicts() {
    let mut da = analyzer(serial_updates());
    let mut rng = StdRng::seed_from_u64(1);
    let path = da.longest_stmt_path(&mut rng);

    let expected: Vec<StmtId> = [(0, 1), (0, 2), (0, 3), (1, 1), (1, 2), (1, 3)]
        .into_iter()
        .map(|(t, p)| StmtId::new(t, p))
        .collect();
    assert_eq!(path, expected);
    assert!(da.path_has_conflict(&path));
    assert!(da.describe_path(&path).contains("(0.3)-0123->(1.1)"));

    da.remove_conflict_edges(&path);
    assert!(!da.path_has_conflict(&path));
    // 只剩 START 依赖的边保留
    let edge = (StmtId::new(0, 3), StmtId::new(1, 1));
    assert!(da.stmt_graph().contains_key(&edge));
}

#[test]
fn test_dependency_graph_dump() {
    let da = analyzer(serial_updates());
    let dump = da.dependency_graph_dump();
    assert!(dump.contains("|     0"));
    assert!(dump.contains("|     2"));
    assert_eq!(dump.lines().count(), da.tid_num() + 1);
}
