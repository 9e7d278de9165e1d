//! 服务实例选择策略
//!
//! 在发现得到的实例列表里挑选一个实例，策略本身不关心列表怎么来。

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::service::Service;

/// 选择策略 trait
pub trait Strategy: Send + Sync {
    /// 从实例列表中选出一个实例，列表为空时返回 `None`
    fn choose<'a>(&self, services: &'a [Service]) -> Option<&'a Service>;
}

/// 轮询策略
///
/// 计数器在同一实例的所有调用间共享。列表在并发增删时不保证严格公平，
/// 但对长度为 N 的稳定列表，任意连续 N 次调用会把每个下标各访问一次。
#[derive(Default)]
pub struct RoundRobinStrategy {
    index: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Strategy for RoundRobinStrategy {
    fn choose<'a>(&self, services: &'a [Service]) -> Option<&'a Service> {
        if services.is_empty() {
            return None;
        }
        let now_index = self.index.fetch_add(1, Ordering::Relaxed);
        services.get(now_index % services.len())
    }
}

/// 随机策略
#[derive(Default)]
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for RandomStrategy {
    fn choose<'a>(&self, services: &'a [Service]) -> Option<&'a Service> {
        if services.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..services.len());
        services.get(index)
    }
}

/// 空策略，永远不提供实例，用于关闭服务提供
#[derive(Default)]
pub struct NullStrategy;

impl NullStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Strategy for NullStrategy {
    fn choose<'a>(&self, _services: &'a [Service]) -> Option<&'a Service> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_services(count: usize) -> Vec<Service> {
        (0..count)
            .map(|i| {
                Service::builder("acme-rpc-echo")
                    .id(format!("instance-{}", i))
                    .host("127.0.0.1")
                    .port(9000 + i as u16)
                    .build()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let strategy = RoundRobinStrategy::new();
        let services = make_services(4);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let chosen = strategy.choose(&services).unwrap();
            seen.push(chosen.id().to_string());
        }
        seen.sort();
        let mut expected: Vec<String> =
            services.iter().map(|s| s.id().to_string()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_round_robin_is_sequential() {
        let strategy = RoundRobinStrategy::new();
        let services = make_services(3);

        let first = strategy.choose(&services).unwrap().id().to_string();
        let second = strategy.choose(&services).unwrap().id().to_string();
        let third = strategy.choose(&services).unwrap().id().to_string();
        let fourth = strategy.choose(&services).unwrap().id().to_string();
        assert_ne!(first, second);
        assert_ne!(second, third);
        // 第四次回到起点
        assert_eq!(first, fourth);
    }

    #[test]
    fn test_round_robin_empty_returns_none() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.choose(&[]).is_none());
    }

    #[test]
    fn test_random_empty_returns_none() {
        let strategy = RandomStrategy::new();
        assert!(strategy.choose(&[]).is_none());
    }

    #[test]
    fn test_random_distribution() {
        let strategy = RandomStrategy::new();
        let services = make_services(3);

        let mut counts = [0usize; 3];
        let trials = 3000;
        for _ in 0..trials {
            let chosen = strategy.choose(&services).unwrap();
            let index = services.iter().position(|s| s.id() == chosen.id()).unwrap();
            counts[index] += 1;
        }

        // 经验频率收敛到 1/3，允许一定波动
        let expected = trials / 3;
        for count in counts {
            assert!(
                count > expected / 2 && count < expected * 2,
                "unbalanced selection counts: {:?}",
                counts
            );
        }
    }

    #[test]
    fn test_null_strategy_returns_none() {
        let strategy = NullStrategy::new();
        let services = make_services(2);
        assert!(strategy.choose(&services).is_none());
    }
}
