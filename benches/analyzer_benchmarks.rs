use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rs_txncheck::history::{StmtKind, StmtOutput, StmtUsage};
use rs_txncheck::{AnomalyKind, DependencyAnalyzer, Trace, TxnStatus};

const ROWS: usize = 4;

fn row(version: usize, pk: usize) -> StmtOutput {
    vec![vec![version.to_string(), pk.to_string(), "0".to_string()]]
}

/// 串行执行的 `txn_num` 个事务，每个事务更新一行
fn create_serial_trace(txn_num: usize) -> Trace {
    let mut trace = Trace {
        init_outputs: vec![(1..=ROWS).flat_map(|pk| row(pk, pk)).collect()],
        ..Default::default()
    };
    let mut current: Vec<usize> = (0..=ROWS).collect();
    let mut next_version = 100;

    for tid in 0..txn_num {
        let pk = tid % ROWS + 1;
        let before = current[pk];
        let after = next_version;
        next_version += 1;
        current[pk] = after;

        let stmts = [
            (StmtKind::Init, vec![]),
            (StmtKind::BeforeWriteRead, row(before, pk)),
            (StmtKind::Update, vec![]),
            (StmtKind::AfterWriteRead, row(after, pk)),
            (StmtKind::Init, vec![]),
        ];
        for (kind, output) in stmts {
            trace.outputs.push(output);
            trace.tids.push(tid);
            trace.usages.push(StmtUsage::on_table(kind, "t_0"));
        }
        trace.statuses.push(TxnStatus::Commit);
    }
    trace
}

fn bench_build_analyzer(c: &mut Criterion) {
    let trace = create_serial_trace(50);

    c.bench_function("build_analyzer_50_txns", |b| {
        b.iter(|| DependencyAnalyzer::new(black_box(trace.clone()), 1, 0))
    });
}

fn bench_run_checks(c: &mut Criterion) {
    let da = DependencyAnalyzer::new(create_serial_trace(50), 1, 0).unwrap();

    c.bench_function("run_all_checks_50_txns", |b| {
        b.iter(|| black_box(&da).run_checks(&AnomalyKind::ALL))
    });
}

fn bench_longest_path(c: &mut Criterion) {
    let da = DependencyAnalyzer::new(create_serial_trace(20), 1, 0).unwrap();
    let mut rng = StdRng::seed_from_u64(0);

    c.bench_function("longest_stmt_path_20_txns", |b| {
        b.iter(|| black_box(&da).longest_stmt_path(&mut rng))
    });
}

criterion_group!(benches, bench_build_analyzer, bench_run_checks, bench_longest_path);
criterion_main!(benches);
