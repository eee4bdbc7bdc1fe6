//! 被测 DBMS 的适配接口
//!
//! 检测器只依赖这里的两个 trait：
//! - `DbmsConnector`：数据库级操作（建立连接、重置、备份恢复、导出表内容、事务控制语句文本）
//! - `DbmsAdapter`：一个会话，按顺序执行语句
//!
//! 执行失败时返回带 `DbErrorKind` 的 `DbError`，调用方只按种类分支。

pub mod memory;

pub use memory::{IsolationLevel, MemoryConnection, MemoryDbms};

use crate::history::StmtOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// 执行失败的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbErrorKind {
    /// 等待锁，语句没有产生任何效果
    Blocked,
    /// 适配器认定可以接受的错误（例如故意制造的约束冲突），语句视为跳过
    Skipped,
    Syntax,
    Timeout,
    /// 服务器已经不可用，需要外层重启
    ConnectionLost,
    Other,
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbErrorKind::Blocked => "blocked",
            DbErrorKind::Skipped => "skipped",
            DbErrorKind::Syntax => "syntax",
            DbErrorKind::Timeout => "timeout",
            DbErrorKind::ConnectionLost => "connection lost",
            DbErrorKind::Other => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind}] {message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Blocked, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Syntax, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Other, message)
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// 一条语句的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub rows: StmtOutput,
    pub affected: usize,
}

/// 表名 -> 全部行
pub type TableContent = BTreeMap<String, StmtOutput>;

/// 一个数据库会话
pub trait DbmsAdapter {
    fn execute(&mut self, sql: &str) -> DbResult<QueryResult>;
}

/// 数据库级操作
pub trait DbmsConnector {
    type Conn: DbmsAdapter;

    /// 打开一个新会话
    fn connect(&self) -> DbResult<Self::Conn>;

    /// 清空数据库
    fn reset(&self) -> DbResult<()>;

    fn backup(&self) -> DbResult<()>;
    fn reset_to_backup(&self) -> DbResult<()>;

    /// 各表当前已提交的内容
    fn get_content(&self, tables: &[String]) -> DbResult<TableContent>;

    fn begin_stmt(&self) -> String {
        "BEGIN".to_string()
    }

    fn commit_stmt(&self) -> String {
        "COMMIT".to_string()
    }

    fn abort_stmt(&self) -> String {
        "ROLLBACK".to_string()
    }
}
