use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: &str, columns: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t)| Column {
                    name: n.to_string(),
                    type_name: t.to_string(),
                })
                .collect(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// 二元运算符签名：`left name right -> result`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    pub left: String,
    pub right: String,
    pub result: String,
}

/// 插桩需要的 schema 信息：表、列和运算符
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
    pub operators: Vec<Operator>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self {
            tables,
            operators: Vec::new(),
        }
    }

    pub fn with_operator(mut self, name: &str, left: &str, right: &str, result: &str) -> Self {
        self.operators.push(Operator {
            name: name.to_string(),
            left: left.to_string(),
            right: right.to_string(),
            result: result.to_string(),
        });
        self
    }

    /// 整数表的常用 schema：比较运算符都定义在 INT 上
    pub fn with_int_comparisons(self) -> Self {
        ["=", "<>", "<", "<=", ">", ">="]
            .iter()
            .fold(self, |s, op| s.with_operator(op, "INT", "INT", "BOOL"))
    }

    pub fn find_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn find_operator(&self, name: &str, left: &str, right: &str) -> Option<&Operator> {
        self.operators
            .iter()
            .find(|op| op.name == name && op.left == left && op.right == right)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }
}
