//! 流行病学先验调整模块
//!
//! 根据地区疾病流行排名对分类器输出做乘法上调：
//! adjusted = min(1.0, p + boost * p)
//!
//! 调整后不做归一化，分布之和可能大于1。排名服务不可用或为空时原样透传。

use crate::core::error::{TriageError, TriageResult};
use crate::core::models::{DiseaseVocabulary, ProbabilityDistribution, ServiceConfig};
use crate::storage::database::Database;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 精确匹配第0名的上调系数
const EXACT_BASE: f64 = 0.30;
const EXACT_STEP: f64 = 0.02;
/// 子串匹配第0名的上调系数
const SUBSTRING_BASE: f64 = 0.15;
const SUBSTRING_STEP: f64 = 0.01;

/// 计算某疾病的上调系数
///
/// 先按排名顺序找忽略大小写的精确匹配，找不到再找子串匹配（任一方向）。
/// 空白排名项先被剔除，不占名次。排名太靠后时系数不会小于0。
pub fn boost<S: AsRef<str>>(disease: &str, ranking: &[S]) -> f64 {
    boost_lowercase(&disease.trim().to_lowercase(), &clean_ranking(ranking))
}

/// 小写化并剔除空白项，名次按剔除后的顺序计算
fn clean_ranking<S: AsRef<str>>(ranking: &[S]) -> Vec<String> {
    ranking
        .iter()
        .map(|r| r.as_ref().trim().to_lowercase())
        .filter(|r| !r.is_empty())
        .collect()
}

fn boost_lowercase(name: &str, ranked: &[String]) -> f64 {
    if name.is_empty() {
        return 0.0;
    }
    if let Some(i) = ranked.iter().position(|r| r == name) {
        return (EXACT_BASE - EXACT_STEP * i as f64).max(0.0);
    }
    if let Some(i) = ranked
        .iter()
        .position(|r| name.contains(r.as_str()) || r.contains(name))
    {
        return (SUBSTRING_BASE - SUBSTRING_STEP * i as f64).max(0.0);
    }
    0.0
}

/// 调整结果
#[derive(Debug, Clone)]
pub struct PriorAdjustment {
    /// 调整后的分布（未归一化）
    pub distribution: ProbabilityDistribution,
    /// 是否实际做了调整
    pub applied: bool,
    /// 分类器原始第一名下标
    pub original_top: Option<usize>,
    /// 调整后第一名下标
    pub adjusted_top: Option<usize>,
}

impl PriorAdjustment {
    /// 不调整，原样透传
    pub fn passthrough(distribution: ProbabilityDistribution) -> Self {
        let top = distribution.argmax();
        Self {
            distribution,
            applied: false,
            original_top: top,
            adjusted_top: top,
        }
    }

    /// 调整是否改变了第一名
    pub fn top_changed(&self) -> bool {
        self.original_top != self.adjusted_top
    }
}

/// 按排名调整分布
pub fn adjust<S: AsRef<str>>(
    distribution: &ProbabilityDistribution,
    diseases: &DiseaseVocabulary,
    ranking: &[S],
) -> PriorAdjustment {
    let ranked = clean_ranking(ranking);
    if ranked.is_empty() {
        return PriorAdjustment::passthrough(distribution.clone());
    }

    let values: Vec<f64> = distribution
        .values()
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let b = diseases
                .get(i)
                .map(|name| boost_lowercase(&name.trim().to_lowercase(), &ranked))
                .unwrap_or(0.0);
            (p + b * p).min(1.0)
        })
        .collect();

    // 输入已在 [0,1] 且 boost >= 0，结果仍在 [0,1]
    let adjusted = ProbabilityDistribution::new(values)
        .unwrap_or_else(|_| distribution.clone());
    let original_top = distribution.argmax();
    let adjusted_top = adjusted.argmax();

    PriorAdjustment {
        distribution: adjusted,
        applied: true,
        original_top,
        adjusted_top,
    }
}

pub type RankingFuture<'a> = Pin<Box<dyn Future<Output = TriageResult<Vec<String>>> + Send + 'a>>;

/// 疾病流行排名服务
pub trait PopularityProvider: Send + Sync {
    /// 返回某地区按流行程度排序的疾病名（小写）
    fn ranking<'a>(&'a self, region: &'a str) -> RankingFuture<'a>;
}

/// 通过HTTP获取流行排名（WHO或自建端点）
pub struct HttpPopularityProvider {
    config: ServiceConfig,
    client: reqwest::Client,
}

impl HttpPopularityProvider {
    pub fn new(config: ServiceConfig, timeout: Duration) -> TriageResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::Configuration(format!("HTTP客户端创建失败: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn fetch(&self, region: &str) -> TriageResult<Vec<String>> {
        if !self.config.is_enabled() {
            return Err(TriageError::UpstreamUnavailable("未配置流行病学API".to_string()));
        }

        let mut req = self.client.get(self.config.api_url.trim());
        if !region.trim().is_empty() {
            req = req.query(&[("region", region.trim())]);
        }
        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let value: serde_json::Value = req.send().await?.error_for_status()?.json().await?;
        Ok(parse_popular_names(&value))
    }
}

impl PopularityProvider for HttpPopularityProvider {
    fn ranking<'a>(&'a self, region: &'a str) -> RankingFuture<'a> {
        Box::pin(self.fetch(region))
    }
}

/// 兼容多种响应格式：列表、OData风格的 {"value": [...]}、单个对象
///
/// 列表项可以是字符串，也可以是带 name/disease/title 字段的对象。
pub fn parse_popular_names(value: &serde_json::Value) -> Vec<String> {
    let single;
    let items: &[serde_json::Value] = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => match map.get("value").or_else(|| map.get("data")) {
            Some(serde_json::Value::Array(items)) => items,
            _ => {
                single = [value.clone()];
                &single
            }
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => ["name", "disease", "title"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str())),
            _ => None,
        })
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    names: Vec<String>,
    fetched_at: DateTime<Utc>,
}

/// 带TTL缓存的排名服务
///
/// 内存缓存按地区保存，可选写入SQLite，重启后仍可命中。只缓存非空结果。
pub struct CachedPopularityProvider {
    inner: Arc<dyn PopularityProvider>,
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    store: Option<Arc<Mutex<Database>>>,
}

impl CachedPopularityProvider {
    pub fn new(inner: Arc<dyn PopularityProvider>, ttl: chrono::Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// 使用数据库持久化缓存
    pub fn with_store(mut self, store: Arc<Mutex<Database>>) -> Self {
        self.store = Some(store);
        self
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.fetched_at < self.ttl
    }

    fn cached(&self, region: &str, now: DateTime<Utc>) -> Option<Vec<String>> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(region)?;
        self.is_fresh(entry, now).then(|| entry.names.clone())
    }

    fn remember_in_memory(&self, region: &str, names: Vec<String>, fetched_at: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(region.to_string(), CacheEntry { names, fetched_at });
        }
    }

    /// 从数据库读取仍在有效期内的排名，SQLite 访问放到阻塞线程池
    async fn load_persisted(&self, region: &str, now: DateTime<Utc>) -> Option<Vec<String>> {
        let store = Arc::clone(self.store.as_ref()?);
        let key = region.to_string();
        let loaded = tokio::task::spawn_blocking(move || match store.lock() {
            Ok(db) => db.load_ranking(&key),
            Err(_) => Ok(None),
        })
        .await;

        match loaded {
            Ok(Ok(Some((names, fetched_at)))) => {
                if now - fetched_at >= self.ttl {
                    return None;
                }
                self.remember_in_memory(region, names.clone(), fetched_at);
                Some(names)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                tracing::warn!("读取排名缓存失败: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("读取排名缓存的任务失败: {}", e);
                None
            }
        }
    }

    async fn persist(&self, region: &str, names: &[String], now: DateTime<Utc>) {
        let Some(store) = self.store.as_ref().map(Arc::clone) else {
            return;
        };
        let key = region.to_string();
        let names = names.to_vec();
        let saved = tokio::task::spawn_blocking(move || match store.lock() {
            Ok(db) => db.save_ranking(&key, &names, now),
            Err(_) => Ok(()),
        })
        .await;

        match saved {
            Ok(Err(e)) => tracing::warn!("保存排名缓存失败: {}", e),
            Err(e) => tracing::warn!("保存排名缓存的任务失败: {}", e),
            Ok(Ok(())) => {}
        }
    }

    /// 以给定时间查询（便于测试TTL）
    pub async fn ranking_at(&self, region: &str, now: DateTime<Utc>) -> TriageResult<Vec<String>> {
        if let Some(names) = self.cached(region, now) {
            tracing::debug!("排名缓存命中: {}", region);
            return Ok(names);
        }
        if let Some(names) = self.load_persisted(region, now).await {
            tracing::debug!("排名缓存命中（数据库）: {}", region);
            return Ok(names);
        }

        let names = self.inner.ranking(region).await?;
        if !names.is_empty() {
            self.remember_in_memory(region, names.clone(), now);
            self.persist(region, &names, now).await;
        }
        Ok(names)
    }
}

impl PopularityProvider for CachedPopularityProvider {
    fn ranking<'a>(&'a self, region: &'a str) -> RankingFuture<'a> {
        Box::pin(self.ranking_at(region, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Vocabulary;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn diseases(items: &[&str]) -> DiseaseVocabulary {
        Vocabulary::new(items.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_boost_exact_by_rank() {
        let ranking = ["Dengue", "Influenza", "Cholera"];
        assert!((boost("dengue", &ranking) - 0.30).abs() < 1e-12);
        assert!((boost("INFLUENZA", &ranking) - 0.28).abs() < 1e-12);
        assert!((boost("Cholera", &ranking) - 0.26).abs() < 1e-12);
        assert_eq!(boost("Measles", &ranking), 0.0);
    }

    #[test]
    fn test_boost_substring_either_direction() {
        let ranking = ["malaria", "dengue fever"];
        // 疾病名包含排名项
        assert!((boost("Cerebral malaria", &ranking) - 0.15).abs() < 1e-12);
        // 排名项包含疾病名
        assert!((boost("Dengue", &ranking) - 0.14).abs() < 1e-12);
    }

    #[test]
    fn test_exact_takes_precedence_over_earlier_substring() {
        let ranking = ["influenza a", "flu", "influenza"];
        assert!((boost("influenza", &ranking) - 0.26).abs() < 1e-12);
    }

    #[test]
    fn test_boost_ignores_blank_entries_and_floors_at_zero() {
        assert_eq!(boost("flu", &["", "  "]), 0.0);
        let mut ranking: Vec<String> = (0..20).map(|i| format!("d{}", i)).collect();
        ranking.push("late".to_string());
        assert_eq!(boost("late", &ranking), 0.0);
    }

    #[test]
    fn test_blank_entries_do_not_take_a_rank() {
        let ranking = ["", "dengue", "  ", "flu"];
        assert!((boost("Dengue", &ranking) - 0.30).abs() < 1e-12);
        assert!((boost("Flu", &ranking) - 0.28).abs() < 1e-12);
    }

    #[test]
    fn test_adjust_applies_boost_of_each_disease() {
        let vocab = diseases(&["Dengue", "Flu", "Cerebral malaria", "Measles"]);
        let dist = ProbabilityDistribution::new(vec![0.4, 0.3, 0.2, 0.1]).unwrap();
        let ranking = ["", "dengue", " ", "FLU", "malaria"];
        let adj = adjust(&dist, &vocab, &ranking);
        for (i, name) in vocab.entries().iter().enumerate() {
            let p = dist.get(i).unwrap();
            let expected = (p + boost(name, &ranking) * p).min(1.0);
            assert!((adj.distribution.get(i).unwrap() - expected).abs() < 1e-12, "{}", name);
        }
        assert!((adj.distribution.get(0).unwrap() - 0.4 * 1.30).abs() < 1e-12);
        assert_eq!(adj.distribution.get(3), Some(0.1));
    }

    #[test]
    fn test_adjust_caps_at_one_and_is_not_renormalized() {
        let vocab = diseases(&["Dengue", "Flu"]);
        let dist = ProbabilityDistribution::new(vec![0.95, 0.05]).unwrap();
        let adj = adjust(&dist, &vocab, &["dengue", "flu"]);
        assert!(adj.applied);
        assert_eq!(adj.distribution.get(0), Some(1.0));
        assert!((adj.distribution.get(1).unwrap() - 0.05 * 1.28).abs() < 1e-12);
        assert!(adj.distribution.sum() > 1.0);
    }

    #[test]
    fn test_adjust_can_change_top_disease() {
        let vocab = diseases(&["Angina", "Dengue"]);
        let dist = ProbabilityDistribution::new(vec![0.40, 0.35]).unwrap();
        let adj = adjust(&dist, &vocab, &["Dengue"]);
        assert_eq!(adj.original_top, Some(0));
        assert_eq!(adj.adjusted_top, Some(1));
        assert!(adj.top_changed());
    }

    #[test]
    fn test_empty_ranking_passes_through_bit_for_bit() {
        let vocab = diseases(&["A", "B"]);
        let dist = ProbabilityDistribution::new(vec![0.123456789, 0.876543211]).unwrap();
        let empty: [&str; 0] = [];
        let adj = adjust(&dist, &vocab, &empty);
        assert!(!adj.applied);
        assert_eq!(adj.distribution, dist);
        assert!(!adj.top_changed());
    }

    #[test]
    fn test_parse_popular_names_formats() {
        let list = serde_json::json!(["Dengue ", {"name": "Flu"}, {"title": "COVID-19"}, 3]);
        assert_eq!(parse_popular_names(&list), vec!["dengue", "flu", "covid-19"]);

        let odata = serde_json::json!({"value": [{"disease": "Malaria"}, {"other": 1}]});
        assert_eq!(parse_popular_names(&odata), vec!["malaria"]);

        let single = serde_json::json!({"name": "Cholera"});
        assert_eq!(parse_popular_names(&single), vec!["cholera"]);

        assert!(parse_popular_names(&serde_json::json!(null)).is_empty());
    }

    struct CountingProvider {
        calls: AtomicUsize,
        names: Vec<String>,
    }

    impl PopularityProvider for CountingProvider {
        fn ranking<'a>(&'a self, _region: &'a str) -> RankingFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let names = self.names.clone();
            Box::pin(async move { Ok(names) })
        }
    }

    #[tokio::test]
    async fn test_cache_respects_ttl() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            names: vec!["dengue".to_string()],
        });
        let cached = CachedPopularityProvider::new(inner.clone(), chrono::Duration::hours(24));
        let t0 = Utc::now();

        cached.ranking_at("VN", t0).await.unwrap();
        cached.ranking_at("VN", t0 + chrono::Duration::hours(23)).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.ranking_at("VN", t0 + chrono::Duration::hours(25)).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        // 不同地区独立缓存
        cached.ranking_at("TH", t0).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_ranking_not_cached() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            names: Vec::new(),
        });
        let cached = CachedPopularityProvider::new(inner.clone(), chrono::Duration::hours(24));
        let t0 = Utc::now();
        assert!(cached.ranking_at("VN", t0).await.unwrap().is_empty());
        assert!(cached.ranking_at("VN", t0).await.unwrap().is_empty());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_survives_restart_through_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(Database::open(&dir.path().join("cache.db")).unwrap()));
        let t0 = Utc::now();

        let first = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            names: vec!["dengue".to_string(), "flu".to_string()],
        });
        CachedPopularityProvider::new(first.clone(), chrono::Duration::hours(24))
            .with_store(db.clone())
            .ranking_at("VN", t0)
            .await
            .unwrap();

        let second = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            names: Vec::new(),
        });
        let names = CachedPopularityProvider::new(second.clone(), chrono::Duration::hours(24))
            .with_store(db)
            .ranking_at("VN", t0 + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(names, vec!["dengue", "flu"]);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_busy_store_does_not_stall_the_runtime() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            names: vec!["dengue".to_string()],
        });
        let cached = Arc::new(
            CachedPopularityProvider::new(inner.clone(), chrono::Duration::hours(24))
                .with_store(Arc::clone(&db)),
        );

        // 另一个线程长时间占用数据库
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                let _guard = db.lock().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(400));
            })
        };
        locked_rx.recv().unwrap();

        let lookup = {
            let cached = Arc::clone(&cached);
            tokio::spawn(async move { cached.ranking("VN").await })
        };

        // 单线程运行时上的其他任务仍能按时推进
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(lookup.await.unwrap().unwrap(), vec!["dengue"]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_http_provider_unconfigured_is_upstream_error() {
        let provider =
            HttpPopularityProvider::new(ServiceConfig::default(), Duration::from_secs(1)).unwrap();
        let err = provider.ranking("VN").await.unwrap_err();
        assert!(matches!(err, TriageError::UpstreamUnavailable(_)));
    }
}
