//! 受限 SQL 方言的 AST
//!
//! 每种语句只携带自身需要的字段（目标表、谓词、SET 列表、VALUES 元组）。
//! `Display` 输出规范化文本：二元表达式总是带括号，保证重新解析后结构不变。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 跳过语句的占位符
pub const SPACE_HOLDER_STMT: &str = "SELECT 1 FROM (SELECT 1) AS subq_0 WHERE 0 <> 0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Int(i64),
    Text(String),
    Bool(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{}", v),
            Literal::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Bool(true) => write!(f, "TRUE"),
            Literal::Bool(false) => write!(f, "FALSE"),
            Literal::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
        }
    }

    /// 根据 schema 中的运算符名查找对应的二元运算
    pub fn from_operator_name(name: &str) -> Option<Self> {
        let op = match name.to_ascii_uppercase().as_str() {
            "=" => BinaryOp::Eq,
            "<>" | "!=" => BinaryOp::NotEq,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::LtEq,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::GtEq,
            "AND" => BinaryOp::And,
            "OR" => BinaryOp::Or,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
}

impl Expr {
    pub fn column(table: &str, name: &str) -> Self {
        Expr::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn bare_column(name: &str) -> Self {
        Expr::Column {
            table: None,
            name: name.to_string(),
        }
    }

    pub fn int(v: i64) -> Self {
        Expr::Literal(Literal::Int(v))
    }

    pub fn text(s: &str) -> Self {
        Expr::Literal(Literal::Text(s.to_string()))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Eq, lhs, rhs)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column { table: Some(t), name } => write!(f, "{}.{}", t, name),
            Expr::Column { table: None, name } => write!(f, "{}", name),
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.as_str(), rhs),
            Expr::Not(inner) => write!(f, "(NOT {})", inner),
            Expr::IsNull { expr, negated: false } => write!(f, "({} IS NULL)", expr),
            Expr::IsNull { expr, negated: true } => write!(f, "({} IS NOT NULL)", expr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Projection {
    Star,
    Columns(Vec<Expr>),
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Projection::Star => write!(f, "*"),
            Projection::Columns(cols) => {
                let parts: Vec<String> = cols.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectStmt {
    pub projection: Projection,
    pub table: String,
    pub search: Option<Expr>,
}

impl SelectStmt {
    /// `SELECT * FROM table`
    pub fn all_rows(table: &str) -> Self {
        Self {
            projection: Projection::Star,
            table: table.to_string(),
            search: None,
        }
    }

    /// `SELECT * FROM table WHERE search`
    pub fn matching(table: &str, search: Option<Expr>) -> Self {
        Self {
            projection: Projection::Star,
            table: table.to_string(),
            search,
        }
    }
}

impl fmt::Display for SelectStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {} FROM {}", self.projection, self.table)?;
        if let Some(search) = &self.search {
            write!(f, " WHERE {}", search)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateStmt {
    pub victim: String,
    pub set_list: Vec<(String, Expr)>,
    pub search: Option<Expr>,
}

impl fmt::Display for UpdateStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sets: Vec<String> = self
            .set_list
            .iter()
            .map(|(name, value)| format!("{} = {}", name, value))
            .collect();
        write!(f, "UPDATE {} SET {}", self.victim, sets.join(", "))?;
        if let Some(search) = &self.search {
            write!(f, " WHERE {}", search)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteStmt {
    pub victim: String,
    pub search: Option<Expr>,
}

impl fmt::Display for DeleteStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", self.victim)?;
        if let Some(search) = &self.search {
            write!(f, " WHERE {}", search)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InsertStmt {
    pub victim: String,
    /// 按表列顺序给出的 VALUES 元组
    pub values: Vec<Vec<Expr>>,
}

impl fmt::Display for InsertStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tuples: Vec<String> = self
            .values
            .iter()
            .map(|tuple| {
                let items: Vec<String> = tuple.iter().map(|e| e.to_string()).collect();
                format!("({})", items.join(", "))
            })
            .collect();
        write!(f, "INSERT INTO {} VALUES {}", self.victim, tuples.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    Begin,
    Commit,
    Abort,
}

/// 事务控制语句，保留适配器给出的原始文本
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnControl {
    pub kind: TxnKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Insert(InsertStmt),
    Txn(TxnControl),
    /// 无法解析或不需要解析的语句文本（包括占位符）
    Opaque(String),
}

impl Statement {
    pub fn placeholder() -> Self {
        Statement::Opaque(SPACE_HOLDER_STMT.to_string())
    }

    pub fn begin(text: &str) -> Self {
        Statement::Txn(TxnControl {
            kind: TxnKind::Begin,
            text: text.to_string(),
        })
    }

    pub fn commit(text: &str) -> Self {
        Statement::Txn(TxnControl {
            kind: TxnKind::Commit,
            text: text.to_string(),
        })
    }

    pub fn abort(text: &str) -> Self {
        Statement::Txn(TxnControl {
            kind: TxnKind::Abort,
            text: text.to_string(),
        })
    }

    pub fn txn_kind(&self) -> Option<TxnKind> {
        match self {
            Statement::Txn(ctl) => Some(ctl.kind),
            _ => None,
        }
    }

    pub fn is_commit(&self) -> bool {
        self.txn_kind() == Some(TxnKind::Commit)
    }

    pub fn is_commit_or_abort(&self) -> bool {
        matches!(self.txn_kind(), Some(TxnKind::Commit) | Some(TxnKind::Abort))
    }

    /// 已被替换的语句：事务控制语句和不透明文本（包括占位符）
    pub fn is_replaced(&self) -> bool {
        matches!(self, Statement::Txn(_) | Statement::Opaque(_))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Statement::Opaque(text) if text == SPACE_HOLDER_STMT)
    }

    /// 写语句的目标表
    pub fn victim(&self) -> Option<&str> {
        match self {
            Statement::Update(s) => Some(&s.victim),
            Statement::Delete(s) => Some(&s.victim),
            Statement::Insert(s) => Some(&s.victim),
            _ => None,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => write!(f, "{}", s),
            Statement::Update(s) => write!(f, "{}", s),
            Statement::Delete(s) => write!(f, "{}", s),
            Statement::Insert(s) => write!(f, "{}", s),
            Statement::Txn(ctl) => write!(f, "{}", ctl.text),
            Statement::Opaque(text) => write!(f, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_update() {
        let stmt = Statement::Update(UpdateStmt {
            victim: "t_0".to_string(),
            set_list: vec![
                ("wkey".to_string(), Expr::int(7)),
                ("c0".to_string(), Expr::text("it's")),
            ],
            search: Some(Expr::eq(Expr::column("t_0", "pkey"), Expr::int(1))),
        });
        assert_eq!(
            stmt.to_string(),
            "UPDATE t_0 SET wkey = 7, c0 = 'it''s' WHERE (t_0.pkey = 1)"
        );
    }

    #[test]
    fn test_render_insert_and_select() {
        let insert = InsertStmt {
            victim: "t_1".to_string(),
            values: vec![vec![Expr::int(3), Expr::int(10), Expr::Literal(Literal::Null)]],
        };
        assert_eq!(insert.to_string(), "INSERT INTO t_1 VALUES (3, 10, NULL)");

        let select = SelectStmt::all_rows("t_1");
        assert_eq!(select.to_string(), "SELECT * FROM t_1");
    }

    #[test]
    fn test_txn_helpers() {
        assert!(Statement::commit("COMMIT").is_commit());
        assert!(Statement::abort("ROLLBACK").is_commit_or_abort());
        assert!(!Statement::begin("BEGIN").is_commit_or_abort());
        assert!(Statement::placeholder().is_placeholder());
        assert!(Statement::placeholder().is_replaced());
        assert_eq!(Statement::placeholder().to_string(), SPACE_HOLDER_STMT);
    }
}
