//! 版本历史
//!
//! 记录每一行被观察到的版本链：
//! - `StmtKind` / `StmtUsage`：语句用途（普通语句或探针）
//! - `StmtId`：`(事务, 事务内位置)`，在语句队列变化后仍然有效
//! - `OperateUnit`：对某一行的一次读写观察
//! - `History`：按行聚合的只追加版本链

use serde::{Deserialize, Serialize};
use std::fmt;

/// 一行输出：每列的字符串表示
pub type RowOutput = Vec<String>;
/// 一条语句的全部输出行
pub type StmtOutput = Vec<RowOutput>;

/// 语句用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StmtKind {
    Init,
    Select,
    Update,
    Insert,
    Delete,
    BeforeWriteRead,
    AfterWriteRead,
    VersionSetRead,
    BeforePredicateMatch,
    AfterPredicateMatch,
    PredicateMatch,
    /// 被删除语句遗留下来的前置探针
    OldInstrumentationBefore,
    /// 被删除语句遗留下来的后置探针
    OldInstrumentationAfter,
}

impl StmtKind {
    pub const ALL: [StmtKind; 13] = [
        StmtKind::Init,
        StmtKind::Select,
        StmtKind::Update,
        StmtKind::Insert,
        StmtKind::Delete,
        StmtKind::BeforeWriteRead,
        StmtKind::AfterWriteRead,
        StmtKind::VersionSetRead,
        StmtKind::BeforePredicateMatch,
        StmtKind::AfterPredicateMatch,
        StmtKind::PredicateMatch,
        StmtKind::OldInstrumentationBefore,
        StmtKind::OldInstrumentationAfter,
    ];

    /// 持久化文件中使用的整数编码
    pub fn code(&self) -> u8 {
        match self {
            StmtKind::Init => 0,
            StmtKind::Select => 1,
            StmtKind::Update => 2,
            StmtKind::Insert => 3,
            StmtKind::Delete => 4,
            StmtKind::BeforeWriteRead => 5,
            StmtKind::AfterWriteRead => 6,
            StmtKind::VersionSetRead => 7,
            StmtKind::BeforePredicateMatch => 8,
            StmtKind::AfterPredicateMatch => 9,
            StmtKind::PredicateMatch => 10,
            StmtKind::OldInstrumentationBefore => 11,
            StmtKind::OldInstrumentationAfter => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StmtKind::Init => "INIT_TYPE",
            StmtKind::Select => "SELECT_READ",
            StmtKind::Update => "UPDATE_WRITE",
            StmtKind::Insert => "INSERT_WRITE",
            StmtKind::Delete => "DELETE_WRITE",
            StmtKind::BeforeWriteRead => "BEFORE_WRITE_READ",
            StmtKind::AfterWriteRead => "AFTER_WRITE_READ",
            StmtKind::VersionSetRead => "VERSION_SET_READ",
            StmtKind::BeforePredicateMatch => "BEFORE_PREDICATE_MATCH",
            StmtKind::AfterPredicateMatch => "AFTER_PREDICATE_MATCH",
            StmtKind::PredicateMatch => "PREDICATE_MATCH",
            StmtKind::OldInstrumentationBefore => "OLD_INSTRUMENTATION_BEFORE",
            StmtKind::OldInstrumentationAfter => "OLD_INSTRUMENTATION_AFTER",
        }
    }

    pub fn is_instrumentation(&self) -> bool {
        matches!(
            self,
            StmtKind::BeforePredicateMatch
                | StmtKind::AfterPredicateMatch
                | StmtKind::PredicateMatch
                | StmtKind::VersionSetRead
                | StmtKind::BeforeWriteRead
                | StmtKind::AfterWriteRead
                | StmtKind::OldInstrumentationBefore
                | StmtKind::OldInstrumentationAfter
        )
    }

    /// 探针是否位于被插桩语句之前；非探针返回 None
    pub fn instrumentation_is_before(&self) -> Option<bool> {
        match self {
            StmtKind::BeforePredicateMatch
            | StmtKind::BeforeWriteRead
            | StmtKind::PredicateMatch
            | StmtKind::VersionSetRead
            | StmtKind::OldInstrumentationBefore => Some(true),
            StmtKind::AfterPredicateMatch
            | StmtKind::AfterWriteRead
            | StmtKind::OldInstrumentationAfter => Some(false),
            _ => None,
        }
    }

    /// 语句被删除后，原位置上的用途
    pub fn transform_to_deleted(&self) -> StmtKind {
        match self.instrumentation_is_before() {
            Some(true) => StmtKind::OldInstrumentationBefore,
            Some(false) => StmtKind::OldInstrumentationAfter,
            None => StmtKind::Init,
        }
    }

    /// UPDATE / DELETE / INSERT
    pub fn is_write(&self) -> bool {
        matches!(self, StmtKind::Update | StmtKind::Delete | StmtKind::Insert)
    }
}

impl fmt::Display for StmtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 语句用途及目标表
///
/// SELECT 可能读多张表，因此不记录目标表。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StmtUsage {
    pub kind: StmtKind,
    pub target_table: Option<String>,
}

impl StmtUsage {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            target_table: None,
        }
    }

    pub fn on_table(kind: StmtKind, table: &str) -> Self {
        Self {
            kind,
            target_table: Some(table.to_string()),
        }
    }

    pub fn is_instrumentation(&self) -> bool {
        self.kind.is_instrumentation()
    }
}

impl From<StmtKind> for StmtUsage {
    fn from(kind: StmtKind) -> Self {
        StmtUsage::new(kind)
    }
}

impl PartialEq<StmtKind> for StmtUsage {
    fn eq(&self, other: &StmtKind) -> bool {
        self.kind == *other
    }
}

impl fmt::Display for StmtUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

/// 语句标识：事务号和事务内位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StmtId {
    pub txn_id: usize,
    pub pos: usize,
}

impl StmtId {
    pub fn new(txn_id: usize, pos: usize) -> Self {
        Self { txn_id, pos }
    }

    /// 由全局下标计算：统计该事务在 `idx` 之前（含）出现的次数
    pub fn from_queue(tid_queue: &[usize], idx: usize) -> Self {
        let txn_id = tid_queue[idx];
        let pos = tid_queue[..idx].iter().filter(|&&t| t == txn_id).count();
        Self { txn_id, pos }
    }

    /// 转回全局下标，找不到返回 None
    pub fn to_queue_idx(&self, tid_queue: &[usize]) -> Option<usize> {
        tid_queue
            .iter()
            .enumerate()
            .filter(|(_, &t)| t == self.txn_id)
            .nth(self.pos)
            .map(|(i, _)| i)
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}.{})", self.txn_id, self.pos)
    }
}

/// 一次批量计算整个队列的 StmtId
pub fn stmt_ids(tid_queue: &[usize]) -> Vec<StmtId> {
    let mut seen: Vec<usize> = Vec::new();
    tid_queue
        .iter()
        .map(|&tid| {
            if seen.len() <= tid {
                seen.resize(tid + 1, 0);
            }
            let id = StmtId::new(tid, seen[tid]);
            seen[tid] += 1;
            id
        })
        .collect()
}

/// 对某一行的一次观察
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperateUnit {
    pub usage: StmtKind,
    /// 行版本号 (write_op_id)
    pub write_op_id: i64,
    pub tid: usize,
    /// 初始事务的观察没有语句下标
    pub stmt_idx: Option<usize>,
    pub row_id: i64,
    pub hash: u64,
}

/// 一行的版本链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowHistory {
    pub row_id: i64,
    pub ops: Vec<OperateUnit>,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    rows: Vec<RowHistory>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加到对应行的版本链，不存在则新建
    pub fn insert(&mut self, unit: OperateUnit) {
        match self.rows.iter_mut().find(|r| r.row_id == unit.row_id) {
            Some(row) => row.ops.push(unit),
            None => self.rows.push(RowHistory {
                row_id: unit.row_id,
                ops: vec![unit],
            }),
        }
    }

    pub fn row(&self, row_id: i64) -> Option<&RowHistory> {
        self.rows.iter().find(|r| r.row_id == row_id)
    }

    pub fn rows(&self) -> &[RowHistory] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// 行内容的弱哈希：base 131 乘法哈希
pub fn hash_row(row: &[String]) -> u64 {
    row.iter()
        .flat_map(|cell| cell.bytes())
        .fold(0u64, |hash, b| hash.wrapping_mul(131).wrapping_add(b as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes() {
        for kind in StmtKind::ALL {
            assert_eq!(StmtKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(StmtKind::from_code(13), None);
        assert_eq!(StmtKind::AfterWriteRead.as_str(), "AFTER_WRITE_READ");
    }

    #[test]
    fn test_transform_to_deleted() {
        assert_eq!(
            StmtKind::VersionSetRead.transform_to_deleted(),
            StmtKind::OldInstrumentationBefore
        );
        assert_eq!(
            StmtKind::AfterPredicateMatch.transform_to_deleted(),
            StmtKind::OldInstrumentationAfter
        );
        assert_eq!(StmtKind::Update.transform_to_deleted(), StmtKind::Init);
        assert!(StmtKind::OldInstrumentationAfter.is_instrumentation());
        assert!(!StmtKind::Select.is_instrumentation());
    }

    #[test]
    fn test_stmt_id_conversion() {
        let tids = vec![0, 1, 0, 2, 1, 0];
        let id = StmtId::from_queue(&tids, 5);
        assert_eq!(id, StmtId::new(0, 2));
        assert_eq!(id.to_queue_idx(&tids), Some(5));
        assert_eq!(StmtId::new(2, 1).to_queue_idx(&tids), None);

        let all = stmt_ids(&tids);
        for (i, id) in all.iter().enumerate() {
            assert_eq!(*id, StmtId::from_queue(&tids, i));
        }
    }

    #[test]
    fn test_history_insert() {
        let mut h = History::new();
        for (row_id, version) in [(1, 10), (2, 20), (1, 11)] {
            h.insert(OperateUnit {
                usage: StmtKind::AfterWriteRead,
                write_op_id: version,
                tid: 0,
                stmt_idx: Some(0),
                row_id,
                hash: 0,
            });
        }
        assert_eq!(h.len(), 2);
        let row = h.row(1).unwrap();
        let versions: Vec<i64> = row.ops.iter().map(|o| o.write_op_id).collect();
        assert_eq!(versions, vec![10, 11]);
    }

    #[test]
    fn test_hash_row() {
        let a = vec!["1".to_string(), "2".to_string()];
        let b = vec!["12".to_string()];
        // 拼接后内容相同，哈希相同
        assert_eq!(hash_row(&a), hash_row(&b));
        assert_ne!(hash_row(&a), hash_row(&["2".to_string(), "1".to_string()]));
        assert_eq!(hash_row(&[]), 0);
    }
}
