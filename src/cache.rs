// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 压缩结果缓存。
//!
//! 以 `sha256(编码名, 原始内容)` 为键保存压缩后的字节。条目只用 `peek` 访问，
//! 因此 `LruCache` 中的顺序就是插入顺序，`pop_lru` 淘汰的是最早插入的条目。
//! 同一个键的并发未命中共享一个 `OnceCell`，只会压缩一次。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::param::HttpEncoding;

pub type CacheKey = [u8; 32];

pub fn cache_key(encoding: HttpEncoding, payload: &[u8]) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(encoding.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone)]
struct Slot {
    cell: Arc<OnceCell<Bytes>>,
    created_at: Instant,
    /// 压缩完成前为 0
    size: usize,
}

struct CacheState {
    entries: LruCache<CacheKey, Slot>,
    total_bytes: usize,
}

/// 一次查询的结果
#[derive(Debug, Clone)]
pub struct Lookup {
    pub bytes: Bytes,
    /// 是否直接使用了已有（或其他请求正在生成）的结果
    pub hit: bool,
}

pub struct CompressionCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_bytes: usize,
    evictions: AtomicU64,
}

impl CompressionCache {
    pub fn new(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            ttl,
            max_bytes,
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 查询缓存，未命中时调用 `compress` 生成结果并保存。
    ///
    /// 互斥锁只在查找和记账时持有，压缩本身在锁外进行。
    pub async fn get_or_compress<F, Fut, E>(&self, key: CacheKey, compress: F) -> Result<Lookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
    {
        let cell = {
            let mut state = self.lock();
            let live = match state.entries.peek(&key) {
                Some(slot) if slot.created_at.elapsed() < self.ttl => Some(Arc::clone(&slot.cell)),
                _ => None,
            };
            match live {
                Some(cell) => cell,
                None => {
                    if let Some(expired) = state.entries.pop(&key) {
                        state.total_bytes -= expired.size;
                        debug!("压缩缓存条目过期，重新生成");
                    }
                    let cell = Arc::new(OnceCell::new());
                    state.entries.push(
                        key,
                        Slot {
                            cell: Arc::clone(&cell),
                            created_at: Instant::now(),
                            size: 0,
                        },
                    );
                    cell
                }
            }
        };

        let mut ran = false;
        let result = cell
            .get_or_try_init(|| {
                ran = true;
                compress()
            })
            .await
            .map(Bytes::clone);

        match result {
            Ok(bytes) => {
                if ran {
                    self.account(&key, &cell, bytes.len());
                }
                Ok(Lookup { bytes, hit: !ran })
            }
            Err(e) => {
                let mut state = self.lock();
                let same = state
                    .entries
                    .peek(&key)
                    .map_or(false, |slot| Arc::ptr_eq(&slot.cell, &cell));
                if same {
                    if let Some(slot) = state.entries.pop(&key) {
                        state.total_bytes -= slot.size;
                    }
                }
                Err(e)
            }
        }
    }

    /// 记录新条目的大小，超出预算时从最早插入的条目开始淘汰
    fn account(&self, key: &CacheKey, cell: &Arc<OnceCell<Bytes>>, size: usize) {
        let mut state = self.lock();
        let updated = match state.entries.peek_mut(key) {
            Some(slot) if Arc::ptr_eq(&slot.cell, cell) => {
                slot.size = size;
                true
            }
            _ => false,
        };
        if !updated {
            return;
        }
        state.total_bytes += size;
        while state.total_bytes > self.max_bytes {
            match state.entries.pop_lru() {
                Some((_, slot)) => {
                    state.total_bytes -= slot.size;
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }
}
