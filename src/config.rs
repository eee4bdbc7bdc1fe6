//! 检测器配置
//!
//! 定义调度、分析和见证回放相关的配置选项

use crate::analyzer::AnomalyKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 默认的最大并发事务数
pub const MAX_CONCURRENT_TXN_NUM: usize = 5;

/// 检测器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// 同时处于活动状态的事务上限
    pub max_concurrent_txn: usize,
    /// 输出中主键所在列
    pub primary_key_index: usize,
    /// 输出中版本号 (wkey) 所在列
    pub version_key_index: usize,
    /// 随机数种子
    pub seed: u64,
    /// 枚举全部拓扑序时的路径上限
    pub topo_path_limit: usize,
    /// 需要执行的异常检查
    pub enabled_checks: Vec<AnomalyKind>,
    /// block scheduling 的最大轮数
    pub max_schedule_rounds: usize,
    /// 见证路径细化的最大轮数
    pub max_refine_rounds: usize,
    /// 日志中语句显示的最大字符数
    pub show_characters: usize,
    /// bug 用例输出目录
    pub output_dir: PathBuf,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_txn: MAX_CONCURRENT_TXN_NUM,
            primary_key_index: 1,
            version_key_index: 0,
            seed: 0,
            topo_path_limit: 1000,
            enabled_checks: vec![AnomalyKind::G1a, AnomalyKind::G1b, AnomalyKind::G1c],
            max_schedule_rounds: 32,
            max_refine_rounds: 16,
            show_characters: 100,
            output_dir: PathBuf::from("found_bugs"),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用全部异常检查（包括 G2-item、GSIa、GSIb）
    pub fn all_checks() -> Self {
        Self {
            enabled_checks: AnomalyKind::ALL.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_concurrent_txn(mut self, num: usize) -> Self {
        self.max_concurrent_txn = num.max(1);
        self
    }

    pub fn with_key_columns(mut self, primary_key_index: usize, version_key_index: usize) -> Self {
        self.primary_key_index = primary_key_index;
        self.version_key_index = version_key_index;
        self
    }

    pub fn with_checks(mut self, checks: Vec<AnomalyKind>) -> Self {
        self.enabled_checks = checks;
        self
    }

    pub fn with_topo_path_limit(mut self, limit: usize) -> Self {
        self.topo_path_limit = limit;
        self
    }

    pub fn with_max_schedule_rounds(mut self, rounds: usize) -> Self {
        self.max_schedule_rounds = rounds;
        self
    }

    pub fn with_max_refine_rounds(mut self, rounds: usize) -> Self {
        self.max_refine_rounds = rounds;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// 截断语句文本用于日志显示
    pub fn show_str(&self, stmt: &str) -> String {
        stmt.chars()
            .take(self.show_characters)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect()
    }
}
