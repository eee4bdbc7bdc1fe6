//! rs-txncheck: 数据库事务隔离级别的黑盒测试工具
//!
//! 对一组生成的事务做插桩，交错执行到被测数据库上，
//! 用各语句的输出重建版本历史和依赖图，检查 G1a/G1b/G1c/G2-item/GSIa/GSIb 等异常，
//! 再按依赖图上的最长语句路径顺序回放，与并发结果对比。

pub mod analyzer;
pub mod config;
pub mod dut;
pub mod error;
pub mod history;
pub mod instrument;
pub mod round;
pub mod scheduler;
pub mod sql;
pub mod testcase;
pub mod witness;

pub use crate::analyzer::{Anomaly, AnomalyKind, DependencyAnalyzer, Trace, TxnStatus};
pub use crate::config::CheckerConfig;
pub use crate::dut::{DbmsAdapter, DbmsConnector, IsolationLevel, MemoryDbms};
pub use crate::error::{CheckerError, CheckerResult};
pub use crate::round::{reproduce, seeded_rng, RoundOutcome};
pub use crate::scheduler::TransactionTest;
pub use crate::testcase::{minimize, TestCase};
