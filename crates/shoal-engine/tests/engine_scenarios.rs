//! End-to-end behavior of engine, executor and cache working together.

use async_trait::async_trait;
use bytes::Bytes;
use shoal_engine::admin::RuleAdmin;
use shoal_engine::cache::{CacheError, CacheManager, CacheStrategy, InMemoryL2, L2Cache};
use shoal_engine::engine::MatchEngine;
use shoal_engine::executor::{DelayConfig, ExecutorConfig, ResponseExecutor};
use shoal_engine::model::{MatchContext, Protocol, Rule};
use shoal_engine::repository::{
    InMemoryRuleRepository, RepositoryError, RuleFilter, RuleRepository,
};
use shoal_engine::scripting::{SandboxConfig, ScriptSandbox};
use shoal_engine::MockService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Repository wrapper counting namespace reads.
struct CountingRepository {
    inner: Arc<InMemoryRuleRepository>,
    reads: AtomicUsize,
}

impl CountingRepository {
    fn new(inner: Arc<InMemoryRuleRepository>) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleRepository for CountingRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Rule>, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_id(id).await
    }

    async fn find_enabled_by_environment(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Vec<Rule>, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .find_enabled_by_environment(project_id, environment_id)
            .await
    }

    async fn list(
        &self,
        filter: &RuleFilter,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Rule>, RepositoryError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.list(filter, skip, limit).await
    }
}

/// L2 wrapper counting writes.
struct CountingL2 {
    inner: InMemoryL2,
    sets: AtomicUsize,
}

#[async_trait]
impl L2Cache for CountingL2 {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear().await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "counting"
    }
}

struct Harness {
    repository: Arc<InMemoryRuleRepository>,
    counting: Arc<CountingRepository>,
    l2: Arc<CountingL2>,
    cache: Arc<CacheManager>,
    engine: Arc<MatchEngine>,
    service: MockService,
}

fn harness(rules_yaml: &str) -> Harness {
    let rules: Vec<Rule> = serde_yaml::from_str(rules_yaml).unwrap();
    let repository = Arc::new(InMemoryRuleRepository::from_rules(rules).unwrap());
    let counting = Arc::new(CountingRepository::new(repository.clone()));
    let l2 = Arc::new(CountingL2 {
        inner: InMemoryL2::new(),
        sets: AtomicUsize::new(0),
    });
    let cache = Arc::new(CacheManager::with_l2(CacheStrategy::default(), l2.clone()));
    let sandbox = Arc::new(ScriptSandbox::new(SandboxConfig::default()));
    let engine = Arc::new(MatchEngine::new(
        cache.clone(),
        counting.clone(),
        sandbox.clone(),
    ));
    let executor = Arc::new(ResponseExecutor::new(ExecutorConfig::default(), sandbox));
    let service = MockService::new(engine.clone(), executor);
    Harness {
        repository,
        counting,
        l2,
        cache,
        engine,
        service,
    }
}

fn get(path: &str) -> MatchContext {
    MatchContext::new(Protocol::Http, "shop", "dev")
        .with_method("GET")
        .with_path(path)
}

const RULE_A_AND_B: &str = r#"
- id: rule-b
  project_id: shop
  environment_id: dev
  priority: 10
  match: { type: simple, method: GET, path: /api/users }
  response: { type: static, content: { body: "from b" } }
- id: rule-a
  project_id: shop
  environment_id: dev
  priority: 100
  match: { type: simple, method: GET, path: /api/users }
  response: { type: static, content: { body: "from a" } }
"#;

#[tokio::test]
async fn test_higher_priority_rule_wins() {
    let h = harness(RULE_A_AND_B);
    let rule = h.engine.find_match(&get("/api/users")).await.unwrap().unwrap();
    assert_eq!(rule.id, "rule-a");

    let resp = h.service.handle(&get("/api/users")).await;
    assert_eq!(resp.body_str(), "from a");
}

#[tokio::test]
async fn test_single_matching_rule_is_returned() {
    let h = harness(
        r#"
- id: users
  project_id: shop
  environment_id: dev
  match: { type: simple, method: GET, path: /api/users }
- id: orders
  project_id: shop
  environment_id: dev
  match: { type: simple, method: GET, path: /api/orders }
"#,
    );
    let rule = h.engine.find_match(&get("/api/orders")).await.unwrap().unwrap();
    assert_eq!(rule.id, "orders");
}

#[tokio::test]
async fn test_disabled_rule_yields_default_response() {
    let h = harness(
        r#"
- id: rule-c
  project_id: shop
  environment_id: dev
  priority: 5
  enabled: false
  match: { type: simple, method: GET, path: /api/users }
  response: { type: static, content: { body: "never" } }
"#,
    );
    assert!(h.engine.find_match(&get("/api/users")).await.unwrap().is_none());

    let resp = h.service.handle(&get("/api/users")).await;
    assert_eq!(resp.status_code, 404);
    assert!(resp.body_str().contains("no_matching_rule"));
    assert!(resp.rule_id.is_none());
}

#[tokio::test]
async fn test_empty_rule_set_is_not_an_error() {
    let h = harness("[]");
    assert!(h.engine.find_match(&get("/anything")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_static_ok_without_added_latency() {
    let h = harness(
        r#"
- id: ok
  project_id: shop
  environment_id: dev
  match: { type: simple }
  response: { type: static, content: { status_code: 200, body: ok } }
"#,
    );
    let start = Instant::now();
    let resp = h.service.handle(&get("/ping")).await;
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body_str(), "ok");
    assert_eq!(resp.delay_ms, 0);
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_cold_start_reads_repository_once() {
    let h = harness(RULE_A_AND_B);

    h.engine.find_match(&get("/api/users")).await.unwrap();
    assert_eq!(h.counting.reads(), 1);
    assert_eq!(h.l2.sets.load(Ordering::SeqCst), 1);

    h.engine.find_match(&get("/api/users")).await.unwrap();
    assert_eq!(h.counting.reads(), 1);
    assert_eq!(h.l2.sets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_set_then_get_skips_repository() {
    let h = harness("[]");
    h.cache
        .set("rule:id:x", Bytes::from_static(b"v"), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        h.cache.get("rule:id:x").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );
    assert_eq!(h.counting.reads(), 0);
}

#[tokio::test]
async fn test_repeated_delete_is_a_noop() {
    let h = harness("[]");
    h.cache
        .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
        .await
        .unwrap();
    for _ in 0..3 {
        h.cache.delete("k").await.unwrap();
    }
    assert!(h.cache.get("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_admin_mutation_invalidates_cached_rule_set() {
    let h = harness(RULE_A_AND_B);
    let admin = RuleAdmin::new(h.repository.clone(), h.cache.clone());

    h.engine.find_match(&get("/api/users")).await.unwrap();
    assert_eq!(h.counting.reads(), 1);

    admin.disable("rule-a").await.unwrap();
    let rule = h.engine.find_match(&get("/api/users")).await.unwrap().unwrap();
    assert_eq!(rule.id, "rule-b");
    assert_eq!(h.counting.reads(), 2);

    admin.delete("rule-b").await.unwrap();
    assert!(h.engine.find_match(&get("/api/users")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_l1_evicts_lowest_frequency_entry() {
    let strategy = CacheStrategy {
        l1_max_entries: 3,
        ..Default::default()
    };
    let cache = CacheManager::new(strategy);
    let ttl = Duration::from_secs(60);
    for key in ["a", "b", "c"] {
        cache.set(key, Bytes::from_static(b"v"), ttl).await.unwrap();
    }
    for _ in 0..3 {
        cache.get("a").await.unwrap();
        cache.get("c").await.unwrap();
    }
    cache.get("b").await.unwrap();

    cache.set("d", Bytes::from_static(b"v"), ttl).await.unwrap();

    let stats = cache.stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.l1_entries, 3);
    assert!(cache.get("b").await.unwrap().is_none());
    assert!(cache.get("a").await.unwrap().is_some());
    assert!(cache.get("d").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delayed_response_honors_bounds() {
    let h = harness(
        r#"
- id: slow
  project_id: shop
  environment_id: dev
  match: { type: simple }
  response:
    type: static
    content: { body: slow }
    delay: { type: random, min: 50, max: 150 }
"#,
    );
    let start = Instant::now();
    let resp = h.service.handle(&get("/slow")).await;
    let elapsed = start.elapsed();
    assert!((50..=150).contains(&resp.delay_ms));
    assert!(elapsed >= Duration::from_millis(50));
}

#[test]
fn test_delay_distributions_stay_in_range() {
    let random = DelayConfig::Random { min: 50, max: 150 };
    let normal = DelayConfig::Normal {
        mean: 100.0,
        stddev: 20.0,
    };
    for _ in 0..1000 {
        assert!((50..=150).contains(&random.resolve_ms(60_000)));
        assert!(normal.resolve_ms(60_000) < 1_000);
    }

    // Mostly-negative draws clamp to zero instead of wrapping.
    let skewed = DelayConfig::Normal {
        mean: 10.0,
        stddev: 100.0,
    };
    let draws: Vec<u64> = (0..1000).map(|_| skewed.resolve_ms(60_000)).collect();
    assert!(draws.contains(&0));
    assert!(draws.iter().all(|&ms| ms < 1_000));
}
