pub mod ast;
pub mod parser;
pub mod schema;

pub use ast::{
    BinaryOp, DeleteStmt, Expr, InsertStmt, Literal, Projection, SelectStmt, Statement,
    TxnControl, TxnKind, UpdateStmt, SPACE_HOLDER_STMT,
};
pub use parser::{parse_expr, parse_statement};
pub use schema::{Column, Operator, Schema, Table};

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[(\s])(t_[^).\s;,]*)").expect("valid table name pattern"));

/// 提取语句文本中引用的所有 `t_` 前缀表名
pub fn involved_tables(text: &str) -> BTreeSet<String> {
    TABLE_NAME
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_involved_tables() {
        let tables = involved_tables(
            "UPDATE t_1 SET wkey = 3 WHERE (t_1.c0 IN (SELECT c1 FROM t_0)) AND (t_1.pkey = 2)",
        );
        let expected: BTreeSet<String> = ["t_0", "t_1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tables, expected);

        assert!(involved_tables("SELECT 1 FROM (SELECT 1) AS subq_0 WHERE 0 <> 0").is_empty());

        // 同一个正则在多次调用之间复用
        let again = involved_tables("DELETE FROM t_1 WHERE (t_1.pkey = 2)");
        assert_eq!(again, BTreeSet::from(["t_1".to_string()]));
        assert_eq!(
            involved_tables("INSERT INTO t_2 VALUES (1, 2, 3)"),
            BTreeSet::from(["t_2".to_string()])
        );
    }
}
