//! 刷新预载缓存
//!
//! 发现侧的本地缓存：容量与时间双重约束。
//! 读到超过刷新窗口的条目时同步返回旧值，同时把键交给
//! 专用的单工作者后台任务异步重载；重载失败保留旧值。
//! 未命中时同步加载一次；加载失败返回 `None`，由调用方降级。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 缓存加载器，由各后端发现实现提供
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> std::result::Result<V, Box<dyn std::error::Error + Send + Sync>>;
}

struct Entry<V> {
    value: V,
    loaded_at: Instant,
    refreshing: bool,
}

/// 刷新预载缓存
pub struct RefreshAheadCache<K, V> {
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
    loader: Arc<dyn CacheLoader<K, V>>,
    refresh_after: Duration,
    max_entries: usize,
    reload_tx: mpsc::UnboundedSender<K>,
}

impl<K, V> RefreshAheadCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// 创建缓存并启动后台重载任务，任务随 `shutdown` 取消
    pub fn new(
        loader: Arc<dyn CacheLoader<K, V>>,
        refresh_after: Duration,
        max_entries: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let entries: Arc<RwLock<HashMap<K, Entry<V>>>> = Arc::new(RwLock::new(HashMap::new()));
        let (reload_tx, mut reload_rx) = mpsc::unbounded_channel::<K>();

        let worker_entries = entries.clone();
        let worker_loader = loader.clone();
        tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    key = reload_rx.recv() => match key {
                        Some(key) => key,
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                };

                match worker_loader.load(&key).await {
                    Ok(value) => {
                        let mut map = worker_entries.write().await;
                        // 重载期间条目可能已被淘汰，淘汰后的结果直接丢弃
                        if let Some(entry) = map.get_mut(&key) {
                            entry.value = value;
                            entry.loaded_at = Instant::now();
                            entry.refreshing = false;
                            debug!(key = ?key, "cache entry refreshed");
                        }
                    }
                    Err(e) => {
                        let mut map = worker_entries.write().await;
                        if let Some(entry) = map.get_mut(&key) {
                            entry.refreshing = false;
                        }
                        warn!(key = ?key, error = %e, "cache reload failed, keeping stale value");
                    }
                }
            }
        });

        Self {
            entries,
            loader,
            refresh_after,
            max_entries,
            reload_tx,
        }
    }

    /// 读取一个键
    ///
    /// 命中且新鲜：直接返回；命中但过了刷新窗口：返回旧值并触发异步重载；
    /// 未命中：同步加载，加载失败返回 `None`。
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut needs_refresh = false;
        let stale = {
            let map = self.entries.read().await;
            match map.get(key) {
                Some(entry) => {
                    if entry.loaded_at.elapsed() < self.refresh_after {
                        return Some(entry.value.clone());
                    }
                    needs_refresh = !entry.refreshing;
                    Some(entry.value.clone())
                }
                None => None,
            }
        };

        if let Some(value) = stale {
            if needs_refresh {
                let mut map = self.entries.write().await;
                if let Some(entry) = map.get_mut(key) {
                    if !entry.refreshing {
                        entry.refreshing = true;
                        let _ = self.reload_tx.send(key.clone());
                    }
                }
            }
            return Some(value);
        }

        // 未命中，同步加载
        match self.loader.load(key).await {
            Ok(value) => {
                let mut map = self.entries.write().await;
                Self::evict_if_full(&mut map, key, self.max_entries);
                map.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        loaded_at: Instant::now(),
                        refreshing: false,
                    },
                );
                Some(value)
            }
            Err(e) => {
                warn!(key = ?key, error = %e, "cache load failed");
                None
            }
        }
    }

    /// 原子修改一个条目（监听事件驱动的写入口）
    ///
    /// 闭包收到当前值（可能不存在），返回 `Some` 写回、返回 `None` 删除。
    pub async fn update<F>(&self, key: &K, f: F)
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let mut map = self.entries.write().await;
        let current = map.get(key).map(|e| e.value.clone());
        match f(current) {
            Some(value) => {
                Self::evict_if_full(&mut map, key, self.max_entries);
                map.insert(
                    key.clone(),
                    Entry {
                        value,
                        loaded_at: Instant::now(),
                        refreshing: false,
                    },
                );
            }
            None => {
                map.remove(key);
            }
        }
    }

    /// 直接写入一个条目
    pub async fn put(&self, key: K, value: V) {
        self.update(&key, |_| Some(value)).await;
    }

    /// 删除一个条目
    pub async fn invalidate(&self, key: &K) {
        self.update(key, |_| None).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn evict_if_full(map: &mut HashMap<K, Entry<V>>, incoming: &K, max_entries: usize) {
        if map.contains_key(incoming) || map.len() < max_entries {
            return;
        }
        // 容量已满时淘汰最久未加载的条目
        if let Some(oldest) = map
            .iter()
            .min_by_key(|(_, entry)| entry.loaded_at)
            .map(|(key, _)| key.clone())
        {
            map.remove(&oldest);
        }
    }
}
