//! 错误类型
//!
//! 检测器的错误分为以下几类：
//! - 内部不变量被破坏（插桩错误、版本重复、找不到对应写入、邻接关系异常）
//! - 本轮无法调度（丢弃本轮，不是 bug）
//! - DBMS 适配器上报的基础设施故障
//! - 测试用例持久化相关的 IO / 解析错误
//!
//! 调用方只根据变体分类，不匹配错误信息文本。

use crate::dut::{DbError, DbErrorKind};
use thiserror::Error;

pub type CheckerResult<T> = Result<T, CheckerError>;

#[derive(Debug, Error)]
pub enum CheckerError {
    /// 插桩失败：缺少 wkey 列、缺少 `wkey = expr`、缺少 `=` 运算符等
    #[error("[INSTRUMENT_ERR] {0}")]
    Instrument(String),

    /// AWR 观察到的 (主键, 版本) 对出现重复
    #[error("pk, vk are not distinct: pk {pk}, vk {version}")]
    NotDistinct { pk: i64, version: i64 },

    /// 读到的行镜像在版本链中找不到对应的写入
    #[error("cannot find the corresponding write (stmt {stmt_idx:?}, txn {tid})")]
    MissingWrite { stmt_idx: Option<usize>, tid: usize },

    /// 探针与被插桩语句的相邻关系不符合约定
    #[error("[INSTRUMENT_ERR] malformed adjacency at {idx}: {reason}")]
    MalformedAdjacency { idx: usize, reason: String },

    /// 输出、tid 队列和用途队列长度不一致
    #[error("length mismatch: outputs {outputs}, tids {tids}, usages {usages}")]
    LengthMismatch {
        outputs: usize,
        tids: usize,
        usages: usize,
    },

    /// 输出中主键或版本列不是整数
    #[error("invalid output of stmt {stmt_idx:?}: {detail}")]
    InvalidOutput {
        stmt_idx: Option<usize>,
        detail: String,
    },

    /// 调度结束后仍有语句处于阻塞状态
    #[error("some stmt is still not executed: {stmt_idx}")]
    StillBlocked { stmt_idx: usize },

    /// 实际执行队列长度与语句数不一致
    #[error("real stmt queue size {real} is not equal to stmt num {expected}")]
    QueueMismatch { real: usize, expected: usize },

    /// 本轮无法调度，丢弃测试用例
    #[error("round is unschedulable: {0}")]
    Unschedulable(String),

    #[error("dbms failure: {0}")]
    Dbms(#[from] DbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 语句文本为空或含空行，无法写入以空行分隔的用例文件
    #[error("stmt {idx} cannot be saved: {reason}")]
    Unsaveable { idx: usize, reason: String },

    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckerError {
    /// 是否只需丢弃本轮（而不是向上升级）
    ///
    /// 连接丢失等基础设施故障需要外层重启服务器，其余错误都只丢弃本轮。
    pub fn discards_round(&self) -> bool {
        match self {
            CheckerError::Dbms(e) => e.kind != DbErrorKind::ConnectionLost,
            CheckerError::Io(_) => false,
            _ => true,
        }
    }

    /// 是否是内部不变量被破坏
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CheckerError::Instrument(_)
                | CheckerError::NotDistinct { .. }
                | CheckerError::MissingWrite { .. }
                | CheckerError::MalformedAdjacency { .. }
                | CheckerError::LengthMismatch { .. }
                | CheckerError::InvalidOutput { .. }
                | CheckerError::StillBlocked { .. }
                | CheckerError::QueueMismatch { .. }
        )
    }

    pub(crate) fn adjacency(idx: usize, reason: impl Into<String>) -> Self {
        CheckerError::MalformedAdjacency {
            idx,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let lost = CheckerError::Dbms(DbError::new(DbErrorKind::ConnectionLost, "gone"));
        assert!(!lost.discards_round());

        let timeout = CheckerError::Dbms(DbError::new(DbErrorKind::Timeout, "slow"));
        assert!(timeout.discards_round());
        assert!(!timeout.is_invariant_violation());

        let dup = CheckerError::NotDistinct { pk: 1, version: 2 };
        assert!(dup.discards_round());
        assert!(dup.is_invariant_violation());
    }

    #[test]
    fn test_display() {
        let err = CheckerError::Instrument("cannot find wkey".to_string());
        assert_eq!(err.to_string(), "[INSTRUMENT_ERR] cannot find wkey");
    }
}
