use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use taskfleet_core::models::WorkerNode;

/// 在已经过滤好的候选Worker中选出一个
pub trait WorkerSelector: Send + Sync {
    fn select<'a>(&self, candidates: &'a [WorkerNode]) -> Option<&'a WorkerNode>;

    fn name(&self) -> &str;
}

pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelector for RoundRobinSelector {
    fn select<'a>(&self, candidates: &'a [WorkerNode]) -> Option<&'a WorkerNode> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let selected = &candidates[index];
        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            selected.id,
            index,
            candidates.len()
        );
        Some(selected)
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}

/// 选择负载率最低的Worker，负载相同时取ID较小者保证结果稳定
#[derive(Default)]
pub struct LoadBasedSelector;

impl LoadBasedSelector {
    pub fn new() -> Self {
        Self
    }
}

impl WorkerSelector for LoadBasedSelector {
    fn select<'a>(&self, candidates: &'a [WorkerNode]) -> Option<&'a WorkerNode> {
        let selected = candidates.iter().min_by(|a, b| {
            a.load_percentage()
                .partial_cmp(&b.load_percentage())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })?;
        debug!(
            "负载均衡策略选择Worker: {} (负载: {:.1}%)",
            selected.id,
            selected.load_percentage()
        );
        Some(selected)
    }

    fn name(&self) -> &str {
        "load_based"
    }
}

/// 按配置名创建选择器，未知名称回退到负载均衡
pub fn selector_from_name(name: &str) -> Arc<dyn WorkerSelector> {
    match name {
        "round_robin" => Arc::new(RoundRobinSelector::new()),
        _ => Arc::new(LoadBasedSelector::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::worker_node;

    #[test]
    fn test_load_based_picks_least_loaded() {
        let workers = vec![
            worker_node("w1", 3, 4),
            worker_node("w2", 1, 4),
            worker_node("w3", 2, 4),
        ];
        let selected = LoadBasedSelector::new().select(&workers).unwrap();
        assert_eq!(selected.id, "w2");
    }

    #[test]
    fn test_load_based_breaks_ties_by_id() {
        let workers = vec![worker_node("w2", 1, 4), worker_node("w1", 1, 4)];
        assert_eq!(LoadBasedSelector::new().select(&workers).unwrap().id, "w1");
    }

    #[test]
    fn test_round_robin_cycles() {
        let workers = vec![worker_node("w1", 0, 4), worker_node("w2", 0, 4)];
        let selector = RoundRobinSelector::new();
        let picks: Vec<String> = (0..4)
            .map(|_| selector.select(&workers).unwrap().id.clone())
            .collect();
        assert_eq!(picks, vec!["w1", "w2", "w1", "w2"]);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(LoadBasedSelector::new().select(&[]).is_none());
        assert!(RoundRobinSelector::new().select(&[]).is_none());
        assert_eq!(selector_from_name("round_robin").name(), "round_robin");
        assert_eq!(selector_from_name("unknown").name(), "load_based");
    }
}
