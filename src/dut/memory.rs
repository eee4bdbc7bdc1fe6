//! 内存参考 DBMS
//!
//! 单进程、基于行写锁的小型数据库，用来在没有真实服务器时驱动调度器和分析器：
//! - 所有会话共享一个存储 (`Rc<RefCell<..>>`)
//! - 写操作对目标行加写锁，直到提交或回滚才释放
//! - 写到被其他会话锁住的行返回 `Blocked`，且不产生任何效果
//! - 不在 `BEGIN` 之内的写语句自动提交
//!
//! 支持 ReadUncommitted 和 ReadCommitted 两种隔离级别。

use super::{DbError, DbResult, DbmsAdapter, DbmsConnector, QueryResult, TableContent};
use crate::history::{RowOutput, StmtOutput};
use crate::sql::{
    parse_statement, BinaryOp, DeleteStmt, Expr, InsertStmt, Literal, Projection, Schema,
    SelectStmt, Statement, TxnKind, UpdateStmt, SPACE_HOLDER_STMT,
};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, trace};

/// 事务隔离级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// 读未提交：可以看到其他会话尚未提交的写
    ReadUncommitted,
    /// 读已提交
    #[default]
    ReadCommitted,
}

type SessionId = u64;

/// 未提交的写：持有者和新镜像（None 表示删除）
#[derive(Debug, Clone)]
struct PendingWrite {
    owner: SessionId,
    image: Option<Vec<Literal>>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    committed: Option<Vec<Literal>>,
    pending: Option<PendingWrite>,
}

#[derive(Debug, Clone)]
struct TableData {
    columns: Vec<String>,
    rows: Vec<StoredRow>,
}

#[derive(Debug)]
struct Store {
    isolation: IsolationLevel,
    tables: BTreeMap<String, TableData>,
    backup: Option<BTreeMap<String, TableData>>,
    /// 会话是否处于显式事务中
    in_txn: HashMap<SessionId, bool>,
    /// 被阻塞的会话 -> 持有锁的会话
    waits_for: HashMap<SessionId, SessionId>,
    next_session: SessionId,
}

fn visible(isolation: IsolationLevel, row: &StoredRow, session: SessionId) -> Option<&Vec<Literal>> {
    match &row.pending {
        Some(p) if p.owner == session || isolation == IsolationLevel::ReadUncommitted => p.image.as_ref(),
        _ => row.committed.as_ref(),
    }
}

fn render(cell: &Literal) -> String {
    match cell {
        Literal::Int(v) => v.to_string(),
        Literal::Text(s) => s.clone(),
        Literal::Bool(true) => "1".to_string(),
        Literal::Bool(false) => "0".to_string(),
        Literal::Null => "NULL".to_string(),
    }
}

fn compare(a: &Literal, b: &Literal) -> Option<Ordering> {
    match (a, b) {
        (Literal::Int(x), Literal::Int(y)) => Some(x.cmp(y)),
        (Literal::Text(x), Literal::Text(y)) => Some(x.cmp(y)),
        (Literal::Bool(x), Literal::Bool(y)) => Some(x.cmp(y)),
        (Literal::Int(x), Literal::Bool(y)) => Some(x.cmp(&(*y as i64))),
        (Literal::Bool(x), Literal::Int(y)) => Some((*x as i64).cmp(y)),
        _ => None,
    }
}

fn truthy(value: &Literal) -> bool {
    match value {
        Literal::Bool(b) => *b,
        Literal::Int(v) => *v != 0,
        Literal::Text(_) | Literal::Null => false,
    }
}

/// 在一行上求值；没有行时只允许常量
fn eval(expr: &Expr, columns: &[String], row: Option<&[Literal]>) -> DbResult<Literal> {
    match expr {
        Expr::Column { name, .. } => {
            let idx = columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| DbError::other(format!("unknown column {}", name)))?;
            row.and_then(|r| r.get(idx))
                .cloned()
                .ok_or_else(|| DbError::other(format!("column {} used without a row", name)))
        }
        Expr::Literal(lit) => Ok(lit.clone()),
        Expr::Not(inner) => match eval(inner, columns, row)? {
            Literal::Null => Ok(Literal::Null),
            v => Ok(Literal::Bool(!truthy(&v))),
        },
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, columns, row)? == Literal::Null;
            Ok(Literal::Bool(is_null != *negated))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, columns, row)?;
            let r = eval(rhs, columns, row)?;
            match op {
                BinaryOp::And => Ok(Literal::Bool(truthy(&l) && truthy(&r))),
                BinaryOp::Or => Ok(Literal::Bool(truthy(&l) || truthy(&r))),
                BinaryOp::Add | BinaryOp::Sub => match (&l, &r) {
                    (Literal::Int(x), Literal::Int(y)) => Ok(Literal::Int(if *op == BinaryOp::Add {
                        x.wrapping_add(*y)
                    } else {
                        x.wrapping_sub(*y)
                    })),
                    (Literal::Null, _) | (_, Literal::Null) => Ok(Literal::Null),
                    _ => Err(DbError::other(format!("cannot apply {} to {} and {}", op.as_str(), l, r))),
                },
                _ => {
                    let Some(ord) = compare(&l, &r) else {
                        return Ok(Literal::Null);
                    };
                    let result = match op {
                        BinaryOp::Eq => ord == Ordering::Equal,
                        BinaryOp::NotEq => ord != Ordering::Equal,
                        BinaryOp::Lt => ord == Ordering::Less,
                        BinaryOp::LtEq => ord != Ordering::Greater,
                        BinaryOp::Gt => ord == Ordering::Greater,
                        BinaryOp::GtEq => ord != Ordering::Less,
                        _ => false,
                    };
                    Ok(Literal::Bool(result))
                }
            }
        }
    }
}

fn matches(search: &Option<Expr>, columns: &[String], row: &[Literal]) -> DbResult<bool> {
    match search {
        Some(expr) => Ok(truthy(&eval(expr, columns, Some(row))?)),
        None => Ok(true),
    }
}

impl Store {
    fn table(&self, name: &str) -> DbResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::other(format!("no such table: {}", name)))
    }

    fn table_mut(&mut self, name: &str) -> DbResult<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| DbError::other(format!("no such table: {}", name)))
    }

    fn select(&self, session: SessionId, select: &SelectStmt) -> DbResult<StmtOutput> {
        let table = self.table(&select.table)?;
        let mut out = Vec::new();
        for row in &table.rows {
            let Some(image) = visible(self.isolation, row, session) else {
                continue;
            };
            if !matches(&select.search, &table.columns, image)? {
                continue;
            }
            let cells: RowOutput = match &select.projection {
                Projection::Star => image.iter().map(render).collect(),
                Projection::Columns(exprs) => exprs
                    .iter()
                    .map(|e| eval(e, &table.columns, Some(image)).map(|v| render(&v)))
                    .collect::<DbResult<_>>()?,
            };
            out.push(cells);
        }
        Ok(out)
    }

    /// 找到可见且满足谓词的行；任何一行被其他会话锁住时返回锁的持有者
    fn lock_targets(
        &self,
        session: SessionId,
        victim: &str,
        search: &Option<Expr>,
    ) -> DbResult<Result<Vec<usize>, SessionId>> {
        let table = self.table(victim)?;
        let mut targets = Vec::new();
        for (idx, row) in table.rows.iter().enumerate() {
            let Some(image) = visible(self.isolation, row, session) else {
                continue;
            };
            if !matches(search, &table.columns, image)? {
                continue;
            }
            if let Some(p) = &row.pending {
                if p.owner != session {
                    trace!(row = idx, table = victim, owner = p.owner, "row is locked");
                    return Ok(Err(p.owner));
                }
            }
            targets.push(idx);
        }
        Ok(Ok(targets))
    }

    /// 记录等待关系；形成环时回滚当前会话的事务
    fn wait_for(&mut self, session: SessionId, owner: SessionId) -> DbResult<usize> {
        let mut cur = owner;
        let mut steps = 0;
        while let Some(&next) = self.waits_for.get(&cur) {
            if next == session || steps > self.waits_for.len() {
                break;
            }
            cur = next;
            steps += 1;
        }
        let deadlock = cur == session || self.waits_for.get(&cur) == Some(&session);
        if deadlock {
            debug!(session, owner, "deadlock detected, rolling back");
            self.finish(session, false);
            return Err(DbError::other(
                "deadlock found when trying to get lock, transaction rolled back",
            ));
        }
        self.waits_for.insert(session, owner);
        Err(DbError::blocked(format!("waiting for the lock held by session {}", owner)))
    }

    fn update(&mut self, session: SessionId, update: &UpdateStmt) -> DbResult<usize> {
        let targets = match self.lock_targets(session, &update.victim, &update.search)? {
            Ok(targets) => targets,
            Err(owner) => return self.wait_for(session, owner),
        };
        let isolation = self.isolation;
        let table = self.table_mut(&update.victim)?;

        // 先全部求值，出错时不留下部分更新
        let mut images = Vec::with_capacity(targets.len());
        for &idx in &targets {
            let old = visible(isolation, &table.rows[idx], session)
                .cloned()
                .unwrap_or_default();
            let mut new = old.clone();
            for (name, value) in &update.set_list {
                let col = table
                    .columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| DbError::other(format!("unknown column {}", name)))?;
                new[col] = eval(value, &table.columns, Some(&old))?;
            }
            images.push(new);
        }
        for (idx, image) in targets.iter().zip(images) {
            table.rows[*idx].pending = Some(PendingWrite {
                owner: session,
                image: Some(image),
            });
        }
        Ok(targets.len())
    }

    fn delete(&mut self, session: SessionId, delete: &DeleteStmt) -> DbResult<usize> {
        let targets = match self.lock_targets(session, &delete.victim, &delete.search)? {
            Ok(targets) => targets,
            Err(owner) => return self.wait_for(session, owner),
        };
        let table = self.table_mut(&delete.victim)?;
        for &idx in &targets {
            table.rows[idx].pending = Some(PendingWrite {
                owner: session,
                image: None,
            });
        }
        Ok(targets.len())
    }

    fn insert(&mut self, session: SessionId, insert: &InsertStmt) -> DbResult<usize> {
        let table = self.table_mut(&insert.victim)?;
        let mut images = Vec::with_capacity(insert.values.len());
        for tuple in &insert.values {
            if tuple.len() != table.columns.len() {
                return Err(DbError::other(format!(
                    "column count {} does not match value count {}",
                    table.columns.len(),
                    tuple.len()
                )));
            }
            let image = tuple
                .iter()
                .map(|e| eval(e, &table.columns, None))
                .collect::<DbResult<Vec<_>>>()?;
            images.push(image);
        }
        let count = images.len();
        for image in images {
            table.rows.push(StoredRow {
                committed: None,
                pending: Some(PendingWrite {
                    owner: session,
                    image: Some(image),
                }),
            });
        }
        Ok(count)
    }

    fn finish(&mut self, session: SessionId, commit: bool) {
        for table in self.tables.values_mut() {
            for row in &mut table.rows {
                let owned = matches!(&row.pending, Some(p) if p.owner == session);
                if !owned {
                    continue;
                }
                if let Some(p) = row.pending.take() {
                    if commit {
                        row.committed = p.image;
                    }
                }
            }
            table
                .rows
                .retain(|row| row.committed.is_some() || row.pending.is_some());
        }
        self.in_txn.insert(session, false);
        self.waits_for.remove(&session);
    }

    fn execute(&mut self, session: SessionId, sql: &str) -> DbResult<QueryResult> {
        if sql.trim() == SPACE_HOLDER_STMT {
            return Ok(QueryResult::default());
        }
        let stmt = parse_statement(sql).map_err(DbError::syntax)?;
        self.waits_for.remove(&session);
        let in_txn = self.in_txn.get(&session).copied().unwrap_or(false);

        let affected = match &stmt {
            Statement::Txn(ctl) => {
                match ctl.kind {
                    TxnKind::Begin => {
                        self.in_txn.insert(session, true);
                    }
                    TxnKind::Commit => self.finish(session, true),
                    TxnKind::Abort => self.finish(session, false),
                }
                return Ok(QueryResult::default());
            }
            Statement::Select(select) => {
                let rows = self.select(session, select)?;
                return Ok(QueryResult { rows, affected: 0 });
            }
            Statement::Update(update) => self.update(session, update)?,
            Statement::Delete(delete) => self.delete(session, delete)?,
            Statement::Insert(insert) => self.insert(session, insert)?,
            Statement::Opaque(text) => return Err(DbError::syntax(format!("cannot execute: {}", text))),
        };

        if !in_txn {
            self.finish(session, true);
        }
        Ok(QueryResult {
            rows: Vec::new(),
            affected,
        })
    }

    /// 放弃所有未提交的写，所有会话回到非事务状态
    fn drop_pending(&mut self) {
        for table in self.tables.values_mut() {
            for row in &mut table.rows {
                row.pending = None;
            }
            table.rows.retain(|row| row.committed.is_some());
        }
        for flag in self.in_txn.values_mut() {
            *flag = false;
        }
        self.waits_for.clear();
    }
}

/// 内存数据库，克隆后共享同一个存储
#[derive(Debug, Clone)]
pub struct MemoryDbms {
    store: Rc<RefCell<Store>>,
}

impl MemoryDbms {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            store: Rc::new(RefCell::new(Store {
                isolation,
                tables: BTreeMap::new(),
                backup: None,
                in_txn: HashMap::new(),
                waits_for: HashMap::new(),
                next_session: 0,
            })),
        }
    }

    /// 按 schema 建表
    pub fn with_schema(schema: &Schema, isolation: IsolationLevel) -> Self {
        let db = Self::new(isolation);
        for table in &schema.tables {
            let columns = table.columns.iter().map(|c| c.name.clone()).collect();
            db.create_table(&table.name, columns);
        }
        db
    }

    pub fn create_table(&self, name: &str, columns: Vec<String>) {
        self.store.borrow_mut().tables.insert(
            name.to_string(),
            TableData {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// 直接写入已提交的行，用于准备初始数据
    pub fn insert_committed(&self, table: &str, rows: Vec<Vec<Literal>>) -> DbResult<()> {
        let mut store = self.store.borrow_mut();
        let data = store.table_mut(table)?;
        for row in rows {
            if row.len() != data.columns.len() {
                return Err(DbError::other(format!(
                    "row {:?} does not match the columns of {}",
                    row, table
                )));
            }
            data.rows.push(StoredRow {
                committed: Some(row),
                pending: None,
            });
        }
        Ok(())
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.store.borrow().isolation
    }
}

/// 内存数据库上的一个会话，断开时回滚未提交的写
#[derive(Debug)]
pub struct MemoryConnection {
    id: SessionId,
    store: Rc<RefCell<Store>>,
}

impl MemoryConnection {
    pub fn session_id(&self) -> u64 {
        self.id
    }
}

impl DbmsAdapter for MemoryConnection {
    fn execute(&mut self, sql: &str) -> DbResult<QueryResult> {
        let mut store = self
            .store
            .try_borrow_mut()
            .map_err(|_| DbError::other("store is busy"))?;
        let result = store.execute(self.id, sql);
        trace!(session = self.id, ok = result.is_ok(), "memory dbms execute");
        result
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Ok(mut store) = self.store.try_borrow_mut() {
            store.finish(self.id, false);
            store.in_txn.remove(&self.id);
        }
    }
}

impl DbmsConnector for MemoryDbms {
    type Conn = MemoryConnection;

    fn connect(&self) -> DbResult<MemoryConnection> {
        let mut store = self.store.borrow_mut();
        let id = store.next_session;
        store.next_session += 1;
        store.in_txn.insert(id, false);
        Ok(MemoryConnection {
            id,
            store: Rc::clone(&self.store),
        })
    }

    fn reset(&self) -> DbResult<()> {
        let mut store = self.store.borrow_mut();
        for table in store.tables.values_mut() {
            table.rows.clear();
        }
        for flag in store.in_txn.values_mut() {
            *flag = false;
        }
        store.waits_for.clear();
        Ok(())
    }

    fn backup(&self) -> DbResult<()> {
        let mut store = self.store.borrow_mut();
        store.drop_pending();
        store.backup = Some(store.tables.clone());
        debug!(tables = store.tables.len(), "memory dbms backup");
        Ok(())
    }

    fn reset_to_backup(&self) -> DbResult<()> {
        let mut store = self.store.borrow_mut();
        let backup = store
            .backup
            .clone()
            .ok_or_else(|| DbError::other("no backup to restore"))?;
        store.tables = backup;
        store.drop_pending();
        Ok(())
    }

    fn get_content(&self, tables: &[String]) -> DbResult<TableContent> {
        let store = self.store.borrow();
        let mut content = TableContent::new();
        for name in tables {
            let table = store.table(name)?;
            let mut rows: Vec<&Vec<Literal>> = table
                .rows
                .iter()
                .filter_map(|row| row.committed.as_ref())
                .collect();
            rows.sort_by(|a, b| match (a.first(), b.first()) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
            content.insert(
                name.clone(),
                rows.into_iter()
                    .map(|r| r.iter().map(render).collect())
                    .collect(),
            );
        }
        Ok(content)
    }
}
