//! # switchyard-host — Service Monitor
//!
//! Per-service admission control (sliding-window quota, failure-triggered
//! circuit breaker), outcome recording, manual health probes and status
//! composition.
//!
//! State per service lives behind its own mutex so concurrent calls to
//! different services never contend, and concurrent calls to the same
//! service never lose samples. No lock is held across an `.await`.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_shared::{
    now_ms, CallSample, CircuitState, HealthLabel, ManualCheck, PolicyPatch, QuotaUsage,
    ServiceDescriptor, ServicePolicy, ServiceStatus, SwitchyardError,
};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::store::CatalogStore;

/// Samples retained per service.
pub const SAMPLE_CAPACITY: usize = 200;
/// Samples considered by status composition.
pub const STATUS_WINDOW: usize = 50;
/// Quota accounting window.
pub const QUOTA_WINDOW_MS: u64 = 60_000;
const DEGRADED_ERROR_RATE: f64 = 0.3;
const DEGRADED_STREAK: u32 = 2;

/// Runtime-only metrics for one service.
#[derive(Debug, Default, Clone)]
pub struct ServiceMetrics {
    calls: VecDeque<CallSample>,
    window: VecDeque<u64>,
    consecutive_failures: u32,
    circuit_open_until: Option<u64>,
    last_success_at: Option<u64>,
    last_error_at: Option<u64>,
    last_error_message: Option<String>,
    last_manual_check: Option<ManualCheck>,
}

impl ServiceMetrics {
    /// Drop quota entries strictly older than `now - 60s`.
    fn prune_window(&mut self, now: u64) {
        let floor = now.saturating_sub(QUOTA_WINDOW_MS);
        while self.window.front().is_some_and(|ts| *ts < floor) {
            self.window.pop_front();
        }
    }

    fn circuit_open_at(&self, now: u64) -> bool {
        self.circuit_open_until.is_some_and(|until| now < until)
    }

    pub fn sample_count(&self) -> usize {
        self.calls.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn circuit_open_until(&self) -> Option<u64> {
        self.circuit_open_until
    }
}

pub struct ServiceMonitor {
    metrics: RwLock<HashMap<String, Arc<Mutex<ServiceMetrics>>>>,
    policies: RwLock<HashMap<String, ServicePolicy>>,
    store: Arc<dyn CatalogStore>,
    client: reqwest::Client,
    health_check_cap: Duration,
}

impl ServiceMonitor {
    pub fn new(store: Arc<dyn CatalogStore>, config: &MonitorConfig) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            store,
            client: reqwest::Client::new(),
            health_check_cap: Duration::from_millis(config.health_check_cap_ms),
        }
    }

    /// Seed entries for known services and load persisted policies.
    ///
    /// Persisted documents deserialize field by field over the defaults, so a
    /// stored `failure_threshold` alone leaves the other knobs at default.
    pub async fn hydrate(&self, services: &[ServiceDescriptor]) -> Result<(), SwitchyardError> {
        let persisted = self.store.load_policies().await?;
        {
            let mut policies = self.policies.write();
            policies.clear();
            for (name, policy) in persisted {
                policies.insert(name, policy);
            }
        }
        for descriptor in services {
            self.entry(&descriptor.name);
        }
        info!(
            services = services.len(),
            policies = self.policies.read().len(),
            "Service monitor hydrated"
        );
        Ok(())
    }

    fn entry(&self, name: &str) -> Arc<Mutex<ServiceMetrics>> {
        if let Some(entry) = self.metrics.read().get(name) {
            return entry.clone();
        }
        self.metrics
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop all runtime state and the in-memory policy for a service.
    pub fn forget(&self, name: &str) {
        self.metrics.write().remove(name);
        self.policies.write().remove(name);
        debug!(service = %name, "Monitor state discarded");
    }

    /// [`forget`](Self::forget) plus removal of the persisted policy.
    pub async fn discard(&self, name: &str) -> Result<(), SwitchyardError> {
        self.forget(name);
        self.store.delete_policy(name).await
    }

    /// Snapshot of the raw metrics, mostly for diagnostics and tests.
    pub fn metrics(&self, name: &str) -> Option<ServiceMetrics> {
        self.metrics.read().get(name).map(|m| m.lock().clone())
    }

    // ── Policy ──────────────────────────────────────────────────────────

    /// Active policy, or defaults when none was configured.
    pub fn policy(&self, name: &str) -> ServicePolicy {
        self.policies.read().get(name).cloned().unwrap_or_default()
    }

    /// Replace the in-memory policy. Unspecified fields take defaults.
    pub fn set_policy(&self, name: &str, patch: PolicyPatch) -> ServicePolicy {
        let policy = patch.into_policy();
        self.policies
            .write()
            .insert(name.to_string(), policy.clone());
        info!(
            service = %name,
            limit_per_minute = ?policy.quota.limit_per_minute,
            burst = policy.quota.burst_multiplier,
            failure_threshold = policy.circuit_breaker.failure_threshold,
            cooldown_seconds = policy.circuit_breaker.cooldown_seconds,
            minimum_samples = policy.circuit_breaker.minimum_samples,
            "Service policy updated"
        );
        policy
    }

    /// Write the current policy to the store.
    pub async fn persist_policy(&self, name: &str) -> Result<ServicePolicy, SwitchyardError> {
        let policy = self.policy(name);
        self.store.save_policy(name, &policy).await?;
        Ok(policy)
    }

    // ── Admission ───────────────────────────────────────────────────────

    pub fn before_call(&self, name: &str) -> Result<(), SwitchyardError> {
        self.before_call_at(name, now_ms())
    }

    /// Admission check at an explicit instant.
    pub fn before_call_at(&self, name: &str, now: u64) -> Result<(), SwitchyardError> {
        let policy = self.policy(name);
        let entry = self.entry(name);
        let mut m = entry.lock();

        if let Some(until) = m.circuit_open_until {
            if now < until {
                return Err(SwitchyardError::CircuitOpen {
                    service: name.to_string(),
                    open_until_ms: until,
                });
            }
            m.circuit_open_until = None;
            m.consecutive_failures = 0;
            info!(service = %name, "Circuit cooldown elapsed; closing");
        }

        let ceiling = policy.quota.ceiling();
        if let Some(ceiling) = ceiling {
            m.prune_window(now);
            let used = m.window.len();
            if used >= ceiling {
                debug!(service = %name, used, ceiling, "Quota exhausted");
                return Err(SwitchyardError::QuotaExceeded {
                    service: name.to_string(),
                    used,
                    ceiling,
                });
            }
        }

        // Admitted calls hold their slot from here on, including while in flight.
        let window_cap = ceiling.map_or(SAMPLE_CAPACITY, |c| c.max(SAMPLE_CAPACITY));
        m.window.push_back(now);
        while m.window.len() > window_cap {
            m.window.pop_front();
        }
        Ok(())
    }

    // ── Recording ───────────────────────────────────────────────────────

    pub fn observe_call(&self, name: &str, sample: CallSample) {
        let policy = self.policy(name);
        let entry = self.entry(name);
        let mut m = entry.lock();
        let ts = sample.timestamp;

        m.calls.push_back(sample.clone());
        while m.calls.len() > SAMPLE_CAPACITY {
            m.calls.pop_front();
        }

        if sample.success {
            m.consecutive_failures = 0;
            m.last_success_at = Some(ts);
            return;
        }

        m.consecutive_failures += 1;
        m.last_error_at = Some(ts);
        m.last_error_message = sample.error_message.clone();

        let breaker = &policy.circuit_breaker;
        if m.calls.len() >= breaker.minimum_samples
            && m.consecutive_failures >= breaker.failure_threshold
        {
            let until = ts.saturating_add(breaker.cooldown_seconds.saturating_mul(1000));
            let streak = m.consecutive_failures;
            let message = format!(
                "Circuit opened after {streak} consecutive failures; last error: {}",
                sample.error_message.as_deref().unwrap_or("unknown")
            );
            m.circuit_open_until = Some(until);
            m.last_manual_check = Some(ManualCheck {
                status: HealthLabel::Unreachable,
                checked_at: ts,
                latency_ms: None,
                http_status: None,
                message: Some(message),
            });
            warn!(
                service = %name,
                consecutive_failures = streak,
                open_until = until,
                "Circuit opened"
            );
        }
    }

    // ── Manual health check ─────────────────────────────────────────────

    /// Existence probe against the base address; no payload.
    pub async fn check_health(&self, descriptor: &ServiceDescriptor) -> ManualCheck {
        let timeout = Duration::from_millis(descriptor.timeout_ms).min(self.health_check_cap);
        let started = Instant::now();
        let outcome = self
            .client
            .head(&descriptor.base_url)
            .timeout(timeout)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let checked_at = now_ms();

        let check = match outcome {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                ManualCheck {
                    status: HealthLabel::Healthy,
                    checked_at,
                    latency_ms: Some(latency_ms),
                    http_status: Some(resp.status().as_u16()),
                    message: None,
                }
            }
            Ok(resp) => ManualCheck {
                status: HealthLabel::Degraded,
                checked_at,
                latency_ms: Some(latency_ms),
                http_status: Some(resp.status().as_u16()),
                message: Some(format!("Probe answered {}", resp.status())),
            },
            Err(e) => ManualCheck {
                status: HealthLabel::Unreachable,
                checked_at,
                latency_ms: Some(latency_ms),
                http_status: None,
                message: Some(if e.is_timeout() {
                    format!("Probe timed out after {}ms", timeout.as_millis())
                } else {
                    e.to_string()
                }),
            },
        };

        info!(
            service = %descriptor.name,
            status = ?check.status,
            latency_ms,
            "Manual health check"
        );

        let entry = self.entry(&descriptor.name);
        let mut m = entry.lock();
        if check.status == HealthLabel::Healthy {
            m.consecutive_failures = 0;
        }
        m.last_manual_check = Some(check.clone());
        check
    }

    // ── Status ──────────────────────────────────────────────────────────

    pub fn status(&self, name: &str) -> ServiceStatus {
        self.status_at(name, now_ms())
    }

    pub fn status_at(&self, name: &str, now: u64) -> ServiceStatus {
        let policy = self.policy(name);
        let entry = self.entry(name);
        let mut m = entry.lock();
        m.prune_window(now);

        let skip = m.calls.len().saturating_sub(STATUS_WINDOW);
        let recent: Vec<&CallSample> = m.calls.iter().skip(skip).collect();
        let success_count = recent.iter().filter(|s| s.success).count();
        let failure_count = recent.len() - success_count;
        let error_rate = if recent.is_empty() {
            0.0
        } else {
            failure_count as f64 / recent.len() as f64
        };

        let mut latencies: Vec<u64> = recent
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();
        latencies.sort_unstable();
        let (p50_ms, p95_ms) = percentiles(&latencies);

        let circuit_open = m.circuit_open_at(now);
        let health = if circuit_open {
            HealthLabel::Unreachable
        } else if error_rate > DEGRADED_ERROR_RATE || m.consecutive_failures >= DEGRADED_STREAK {
            HealthLabel::Degraded
        } else {
            HealthLabel::Healthy
        };

        ServiceStatus {
            name: name.to_string(),
            health,
            success_count,
            failure_count,
            p50_ms,
            p95_ms,
            quota: QuotaUsage {
                used: m.window.len(),
                ceiling: policy.quota.ceiling(),
            },
            circuit: CircuitState {
                open: circuit_open,
                open_until: if circuit_open {
                    m.circuit_open_until
                } else {
                    None
                },
            },
            consecutive_failures: m.consecutive_failures,
            last_success_at: m.last_success_at,
            last_error_at: m.last_error_at,
            last_error_message: m.last_error_message.clone(),
            last_manual_check: m.last_manual_check.clone(),
            policy,
        }
    }

    /// Status of every service the monitor has seen, ordered by name.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let mut names: Vec<String> = self.metrics.read().keys().cloned().collect();
        names.sort();
        let now = now_ms();
        names.iter().map(|n| self.status_at(n, now)).collect()
    }
}

/// Nearest-rank p50/p95 over an ascending slice.
fn percentiles(sorted: &[u64]) -> (Option<u64>, Option<u64>) {
    let n = sorted.len();
    if n == 0 {
        return (None, None);
    }
    let p50 = sorted[n / 2];
    let p95 = sorted[(n - 1).min(n * 95 / 100)];
    (Some(p50), Some(p95))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn monitor() -> ServiceMonitor {
        ServiceMonitor::new(Arc::new(MemoryStore::new()), &MonitorConfig::default())
    }

    fn fail(monitor: &ServiceMonitor, name: &str, at: u64) {
        monitor.observe_call(name, CallSample::failure(at, 10, "connection refused"));
    }

    #[test]
    fn circuit_opens_exactly_when_streak_and_samples_are_met() {
        for threshold in 1..=5u32 {
            for minimum in 1..=8usize {
                let m = monitor();
                m.set_policy(
                    "svc",
                    PolicyPatch {
                        failure_threshold: Some(threshold),
                        minimum_samples: Some(minimum),
                        ..Default::default()
                    },
                );
                let opens_at = (threshold as usize).max(minimum);
                for i in 1..=opens_at + 3 {
                    fail(&m, "svc", 1_000 + i as u64);
                    let open = m.metrics("svc").unwrap().circuit_open_until().is_some();
                    assert_eq!(
                        open,
                        i >= opens_at,
                        "threshold={threshold} minimum={minimum} call={i}"
                    );
                }
            }
        }
    }

    #[test]
    fn success_breaks_the_streak() {
        let m = monitor();
        for i in 0..4 {
            fail(&m, "svc", 1_000 + i);
        }
        // 4 samples < minimum 5: still closed despite streak 4.
        assert!(m.metrics("svc").unwrap().circuit_open_until().is_none());
        m.observe_call("svc", CallSample::success(2_000, 5));
        fail(&m, "svc", 2_001);
        fail(&m, "svc", 2_002);
        assert!(m.metrics("svc").unwrap().circuit_open_until().is_none());
        fail(&m, "svc", 2_003);
        assert_eq!(
            m.metrics("svc").unwrap().circuit_open_until(),
            Some(2_003 + 60_000)
        );
    }

    #[test]
    fn open_circuit_rejects_then_lazily_closes() {
        let m = monitor();
        for i in 0..5 {
            fail(&m, "svc", 10_000 + i);
        }
        let until = m.metrics("svc").unwrap().circuit_open_until().unwrap();
        assert_eq!(until, 10_004 + 60_000);

        let err = m.before_call_at("svc", until - 1).unwrap_err();
        assert_eq!(err.code(), "circuit_open");
        assert_eq!(m.status_at("svc", until - 1).health, HealthLabel::Unreachable);

        m.before_call_at("svc", until).unwrap();
        let metrics = m.metrics("svc").unwrap();
        assert_eq!(metrics.circuit_open_until(), None);
        assert_eq!(metrics.consecutive_failures(), 0);
    }

    #[test]
    fn circuit_trip_leaves_synthetic_unreachable_check() {
        let m = monitor();
        for i in 0..5 {
            fail(&m, "svc", 1 + i);
        }
        let status = m.status_at("svc", 10);
        let check = status.last_manual_check.unwrap();
        assert_eq!(check.status, HealthLabel::Unreachable);
        assert!(check.message.unwrap().contains("connection refused"));
        assert!(status.circuit.open);
        assert_eq!(status.circuit.open_until, Some(5 + 60_000));
    }

    #[test]
    fn quota_admits_ceiling_then_rejects() {
        let m = monitor();
        m.set_policy(
            "svc",
            PolicyPatch {
                limit_per_minute: Some(5),
                burst_multiplier: Some(1.5),
                ..Default::default()
            },
        );
        // ceil(5 * 1.5) = 8
        let start = 100_000;
        for i in 0..8 {
            m.before_call_at("svc", start + i).unwrap();
            m.observe_call("svc", CallSample::success(start + i, 3));
        }
        let err = m.before_call_at("svc", start + 8).unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");
        assert!(matches!(
            err,
            SwitchyardError::QuotaExceeded { used: 8, ceiling: 8, .. }
        ));

        // The first entry ages out once it is strictly older than now - 60s.
        assert!(m.before_call_at("svc", start + QUOTA_WINDOW_MS).is_err());
        m.before_call_at("svc", start + QUOTA_WINDOW_MS + 1).unwrap();
    }

    #[test]
    fn quota_ceiling_above_sample_capacity_is_enforced() {
        let m = monitor();
        m.set_policy(
            "bulk",
            PolicyPatch {
                limit_per_minute: Some(250),
                burst_multiplier: Some(1.0),
                ..Default::default()
            },
        );
        for i in 0..250 {
            m.before_call_at("bulk", 1_000 + i).unwrap();
            m.observe_call("bulk", CallSample::success(1_000 + i, 1));
        }
        assert!(m.before_call_at("bulk", 1_300).is_err());
        assert_eq!(m.metrics("bulk").unwrap().sample_count(), SAMPLE_CAPACITY);
    }

    #[test]
    fn admission_takes_the_quota_slot_before_the_outcome() {
        let m = monitor();
        m.set_policy(
            "svc",
            PolicyPatch {
                limit_per_minute: Some(2),
                burst_multiplier: Some(1.0),
                ..Default::default()
            },
        );
        m.before_call_at("svc", 1_000).unwrap();
        m.before_call_at("svc", 1_001).unwrap();
        let err = m.before_call_at("svc", 1_002).unwrap_err();
        assert_eq!(err.code(), "quota_exceeded");

        // Late outcomes do not consume further slots.
        m.observe_call("svc", CallSample::success(1_500, 4));
        m.observe_call("svc", CallSample::failure(1_501, 4, "boom"));
        assert_eq!(m.status_at("svc", 2_000).quota.used, 2);
    }

    #[test]
    fn huge_cooldown_saturates() {
        let m = monitor();
        m.set_policy(
            "svc",
            PolicyPatch {
                failure_threshold: Some(1),
                minimum_samples: Some(1),
                cooldown_seconds: Some(u64::MAX),
                ..Default::default()
            },
        );
        fail(&m, "svc", 1_000);
        assert_eq!(m.metrics("svc").unwrap().circuit_open_until(), Some(u64::MAX));
        let err = m.before_call_at("svc", 10_000_000).unwrap_err();
        assert_eq!(err.code(), "circuit_open");
    }

    #[test]
    fn default_policy_has_no_quota_ceiling() {
        let m = monitor();
        for i in 0..500 {
            m.before_call_at("svc", 1_000 + i).unwrap();
            m.observe_call("svc", CallSample::success(1_000 + i, 1));
        }
        let status = m.status_at("svc", 1_500);
        assert_eq!(status.quota.ceiling, None);
        assert_eq!(status.policy, ServicePolicy::default());
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        assert_eq!(percentiles(&[]), (None, None));
        assert_eq!(percentiles(&[7]), (Some(7), Some(7)));
        let values: Vec<u64> = (1..=20).collect();
        // n=20: p50 -> index 10, p95 -> index 19
        assert_eq!(percentiles(&values), (Some(11), Some(20)));
        let values: Vec<u64> = (1..=10).collect();
        // n=10: p50 -> index 5, p95 -> min(9, 9)
        assert_eq!(percentiles(&values), (Some(6), Some(10)));
    }

    #[test]
    fn status_only_considers_recent_window() {
        let m = monitor();
        // 100 old failures interleaved with successes so the breaker never trips.
        for i in 0..100u64 {
            if i % 2 == 0 {
                fail(&m, "svc", i);
            } else {
                m.observe_call("svc", CallSample::success(i, 100));
            }
        }
        for i in 0..50u64 {
            m.observe_call("svc", CallSample::success(1_000 + i, i + 1));
        }
        let status = m.status_at("svc", 2_000);
        assert_eq!(status.success_count, 50);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.health, HealthLabel::Healthy);
        assert_eq!(status.p50_ms, Some(26));
        assert_eq!(status.p95_ms, Some(48));
    }

    #[test]
    fn degraded_on_error_rate_or_streak() {
        let m = monitor();
        m.observe_call("rate", CallSample::success(1, 1));
        m.observe_call("rate", CallSample::success(2, 1));
        fail(&m, "rate", 3);
        m.observe_call("rate", CallSample::success(4, 1));
        fail(&m, "rate", 5);
        m.observe_call("rate", CallSample::success(6, 1));
        // 2/6 > 0.3
        assert_eq!(m.status_at("rate", 10).health, HealthLabel::Degraded);

        for i in 0..10 {
            m.observe_call("streak", CallSample::success(i, 1));
        }
        fail(&m, "streak", 20);
        assert_eq!(m.status_at("streak", 30).health, HealthLabel::Healthy);
        fail(&m, "streak", 21);
        assert_eq!(m.status_at("streak", 30).health, HealthLabel::Degraded);
    }

    #[tokio::test]
    async fn persisted_partial_policy_merges_over_defaults_on_hydrate() {
        let store = Arc::new(MemoryStore::new());
        let partial: ServicePolicy =
            serde_json::from_str(r#"{"circuit_breaker": {"failure_threshold": 9}}"#).unwrap();
        store.save_policy("svc", &partial).await.unwrap();

        let m = ServiceMonitor::new(store, &MonitorConfig::default());
        m.hydrate(&[]).await.unwrap();
        let policy = m.policy("svc");
        assert_eq!(policy.circuit_breaker.failure_threshold, 9);
        assert_eq!(policy.circuit_breaker.cooldown_seconds, 60);
        assert_eq!(policy.circuit_breaker.minimum_samples, 5);
    }

    #[tokio::test]
    async fn persist_policy_writes_current_policy() {
        let store = Arc::new(MemoryStore::new());
        let m = ServiceMonitor::new(store.clone(), &MonitorConfig::default());
        m.set_policy(
            "svc",
            PolicyPatch {
                limit_per_minute: Some(60),
                ..Default::default()
            },
        );
        m.persist_policy("svc").await.unwrap();
        let doc = store.snapshot().await;
        assert_eq!(doc.policies["svc"].quota.limit_per_minute, Some(60));
    }

    #[test]
    fn forget_discards_metrics_and_policy() {
        let m = monitor();
        m.set_policy(
            "svc",
            PolicyPatch {
                failure_threshold: Some(1),
                minimum_samples: Some(1),
                ..Default::default()
            },
        );
        fail(&m, "svc", 1);
        m.forget("svc");
        assert!(m.metrics("svc").is_none());
        assert_eq!(m.policy("svc"), ServicePolicy::default());
    }
}
