//! 设备淘汰策略
//!
//! 注册表大小达到 `max` 时触发，按最近活跃时间从旧到新淘汰，直到剩余 `min` 个。
//! 记录已不存在的条目视为最旧，最先淘汰；时间相同按 clientId 排序。

use crate::config::TokenConfig;
use crate::error::{Result, TokenError};

/// 注册表中的一个设备条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub client_id: String,
    pub token: String,
    /// 对应 Session 记录的 latestTime；记录不存在时为 `None`
    pub latest_time: Option<i64>,
}

/// 单次淘汰的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// 未达到上限，无需淘汰
    Skipped,
    /// 淘汰了 n 个设备
    Evicted(usize),
    /// 两次事务均冲突，本次放弃
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    min: usize,
    max: usize,
}

impl EvictionPolicy {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        if min == 0 || min >= max {
            return Err(TokenError::Configuration(format!(
                "allow_devices requires 0 < min < max (min={}, max={})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        Self::new(config.min_devices, config.max_devices)
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn should_evict(&self, len: usize) -> bool {
        len >= self.max
    }

    /// 计算需要淘汰的条目，未达到上限时返回空
    pub fn plan(&self, mut entries: Vec<RegistryEntry>) -> Vec<RegistryEntry> {
        if !self.should_evict(entries.len()) {
            return Vec::new();
        }
        let excess = entries.len() - self.min;
        entries.sort_by(|a, b| {
            a.latest_time
                .cmp(&b.latest_time)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        entries.truncate(excess);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client: &str, time: Option<i64>) -> RegistryEntry {
        RegistryEntry {
            client_id: client.to_string(),
            token: format!("t-{}", client),
            latest_time: time,
        }
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(EvictionPolicy::new(10, 10).is_err());
        assert!(EvictionPolicy::new(0, 5).is_err());
        assert!(EvictionPolicy::new(2, 5).is_ok());
    }

    #[test]
    fn test_below_max_plans_nothing() {
        let policy = EvictionPolicy::new(2, 4).unwrap();
        let entries = (0..3).map(|i| entry(&format!("c{}", i), Some(i))).collect();
        assert!(policy.plan(entries).is_empty());
    }

    #[test]
    fn test_plan_evicts_oldest_down_to_min() {
        let policy = EvictionPolicy::new(2, 4).unwrap();
        let entries = vec![
            entry("c1", Some(400)),
            entry("c2", Some(100)),
            entry("c3", Some(300)),
            entry("c4", Some(200)),
            entry("c5", Some(500)),
        ];
        let victims: Vec<_> = policy
            .plan(entries)
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        assert_eq!(victims, vec!["c2", "c4", "c3"]);
    }

    #[test]
    fn test_missing_records_go_first_and_ties_by_client() {
        let policy = EvictionPolicy::new(1, 4).unwrap();
        let entries = vec![
            entry("b", Some(100)),
            entry("z", None),
            entry("a", Some(100)),
            entry("y", Some(50)),
        ];
        let victims: Vec<_> = policy
            .plan(entries)
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        assert_eq!(victims, vec!["z", "y", "a"]);
    }
}
