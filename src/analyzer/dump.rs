use super::graph::{DependencyType, TxnGraph};
use super::DependencyAnalyzer;
use std::fmt::Write;
use tracing::debug;

/// 矩阵每格依次显示的依赖，存在时显示下标数字
const DUMP_COLUMNS: [DependencyType; 6] = [
    DependencyType::WriteRead,
    DependencyType::WriteWrite,
    DependencyType::ReadWrite,
    DependencyType::VersionSetDepend,
    DependencyType::OverwriteDepend,
    DependencyType::StrictStartDepend,
];

/// 事务 x 事务的文本矩阵
pub fn dump_txn_graph(graph: &TxnGraph) -> String {
    let n = graph.size();
    let mut out = String::from("  ");
    for i in 0..n {
        if i < 10 {
            let _ = write!(out, "|     {}", i);
        } else {
            let _ = write!(out, "|    {}", i);
        }
    }
    out.push_str("|\n");

    for i in 0..n {
        if i < 10 {
            let _ = write!(out, " {}", i);
        } else {
            let _ = write!(out, "{}", i);
        }
        for j in 0..n {
            out.push('|');
            for (digit, dt) in DUMP_COLUMNS.iter().enumerate() {
                if graph.contains(i, j, *dt) {
                    let _ = write!(out, "{}", digit);
                } else {
                    out.push(' ');
                }
            }
        }
        out.push_str("|\n");
    }
    out
}

impl DependencyAnalyzer {
    pub fn dependency_graph_dump(&self) -> String {
        dump_txn_graph(self.graph())
    }

    pub fn print_dependency_graph(&self) {
        debug!("dependency graph:\n{}", self.dependency_graph_dump());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_layout() {
        let mut g = TxnGraph::new(2);
        g.insert(0, 1, DependencyType::WriteRead);
        g.insert(0, 1, DependencyType::StrictStartDepend);
        g.insert(1, 0, DependencyType::ReadWrite);
        let dump = dump_txn_graph(&g);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines[0], "  |     0|     1|");
        assert_eq!(lines[1], " 0|      |0    5|");
        assert_eq!(lines[2], " 1|  2   |      |");
    }

    #[test]
    fn test_dump_two_digit_ids() {
        let g = TxnGraph::new(11);
        let dump = dump_txn_graph(&g);
        let lines: Vec<&str> = dump.lines().collect();
        assert!(lines[0].ends_with("|    10|"));
        assert!(lines[11].starts_with("10|"));
    }
}
