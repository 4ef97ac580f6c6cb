use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::{KernelError, KernelResult};

/// Admission-control partition key: API key, then session id, then source address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn resolve(
        api_key: Option<&str>,
        session_id: Option<&str>,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        peer: Option<IpAddr>,
    ) -> Self {
        fn non_empty(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }
        if let Some(key) = non_empty(api_key) {
            return Self(format!("key:{key}"));
        }
        if let Some(session) = non_empty(session_id) {
            return Self(format!("session:{session}"));
        }
        let first_hop = forwarded_for.and_then(|v| non_empty(v.split(',').next()));
        if let Some(addr) = first_hop.or_else(|| non_empty(real_ip)) {
            return Self(format!("addr:{addr}"));
        }
        match peer {
            Some(ip) => Self(format!("addr:{ip}")),
            None => Self("addr:unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_requests: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub burst_limit: usize,
    pub burst_window: Duration,
    pub categories: BTreeMap<String, WindowLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            burst_limit: 5,
            burst_window: Duration::from_secs(10),
            categories: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, category: &str) -> WindowLimit {
        self.categories
            .get(category)
            .copied()
            .unwrap_or(WindowLimit {
                max_requests: self.max_requests,
                window: self.window,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    BurstLimitExceeded,
    RateLimitExceeded,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::BurstLimitExceeded => "burst_limit_exceeded",
            DenyReason::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: usize,
    pub limit: usize,
    pub reset_at: Instant,
    pub retry_after_secs: u64,
    pub reason: Option<DenyReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub current_requests: usize,
    pub max_requests: usize,
    pub window_seconds: u64,
    pub burst_requests: usize,
    pub burst_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalRateStats {
    pub active_identities: usize,
    pub tracked_windows: usize,
    pub total_requests_in_window: usize,
    pub max_requests: usize,
    pub window_seconds: u64,
    pub burst_limit: usize,
    pub burst_window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    identity: String,
    category: String,
}

#[derive(Debug, Default)]
struct RateWindow {
    primary: VecDeque<Instant>,
    burst: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration, burst_window: Duration) {
        while let Some(front) = self.primary.front() {
            if now.saturating_duration_since(*front) >= window {
                self.primary.pop_front();
            } else {
                break;
            }
        }
        while let Some(front) = self.burst.front() {
            if now.saturating_duration_since(*front) >= burst_window {
                self.burst.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.burst.is_empty()
    }
}

/// Sliding-window admission control over a primary and a burst horizon.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<WindowKey, RateWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        info!(
            max_requests = config.max_requests,
            window_secs = config.window.as_secs(),
            burst_limit = config.burst_limit,
            "rate limiter ready"
        );
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn admit(&self, identity: &ClientIdentity, category: &str) -> AdmissionDecision {
        self.admit_at(identity, category, Instant::now())
    }

    /// Never denies because of its own failure: internal errors admit the request.
    pub fn admit_at(
        &self,
        identity: &ClientIdentity,
        category: &str,
        now: Instant,
    ) -> AdmissionDecision {
        match self.try_admit(identity, category, now) {
            Ok(decision) => {
                if let Some(reason) = decision.reason {
                    warn!(
                        identity = identity.as_str(),
                        category,
                        reason = reason.as_str(),
                        retry_after = decision.retry_after_secs,
                        "request denied by rate limiter"
                    );
                }
                decision
            }
            Err(err) => {
                warn!(identity = identity.as_str(), category, error = %err, "rate limiter failed open");
                let limit = self.config.limit_for(category);
                AdmissionDecision {
                    allowed: true,
                    remaining: limit.max_requests,
                    limit: limit.max_requests,
                    reset_at: now + limit.window,
                    retry_after_secs: 0,
                    reason: None,
                }
            }
        }
    }

    fn try_admit(
        &self,
        identity: &ClientIdentity,
        category: &str,
        now: Instant,
    ) -> KernelResult<AdmissionDecision> {
        let limit = self.config.limit_for(category);
        let burst_window = self.config.burst_window;
        let key = WindowKey {
            identity: identity.as_str().to_string(),
            category: category.to_string(),
        };
        let mut window = self.windows.entry(key).or_default();

        // Keep both sequences non-decreasing even if callers race on `now`.
        let now = window.primary.back().map_or(now, |last| now.max(*last));
        window.prune(now, limit.window, burst_window);

        if window.burst.len() >= self.config.burst_limit {
            let reset_at = window
                .burst
                .front()
                .map(|oldest| *oldest + burst_window)
                .unwrap_or(now + burst_window);
            return Ok(AdmissionDecision {
                allowed: false,
                remaining: 0,
                limit: limit.max_requests,
                reset_at,
                retry_after_secs: burst_window.as_secs().max(1),
                reason: Some(DenyReason::BurstLimitExceeded),
            });
        }

        if window.primary.len() >= limit.max_requests {
            let oldest = *window.primary.front().ok_or_else(|| {
                KernelError::InvalidConfig(format!(
                    "category {category} allows {} requests",
                    limit.max_requests
                ))
            })?;
            let reset_at = oldest
                .checked_add(limit.window)
                .ok_or_else(|| KernelError::Clock("window end overflows".to_string()))?;
            let wait = reset_at.saturating_duration_since(now);
            let mut retry_after = wait.as_secs();
            if wait.subsec_nanos() > 0 {
                retry_after += 1;
            }
            return Ok(AdmissionDecision {
                allowed: false,
                remaining: 0,
                limit: limit.max_requests,
                reset_at,
                retry_after_secs: retry_after.max(1),
                reason: Some(DenyReason::RateLimitExceeded),
            });
        }

        window.primary.push_back(now);
        window.burst.push_back(now);
        Ok(AdmissionDecision {
            allowed: true,
            remaining: limit.max_requests.saturating_sub(window.primary.len()),
            limit: limit.max_requests,
            reset_at: now + limit.window,
            retry_after_secs: 0,
            reason: None,
        })
    }

    /// Administrative reset of every category window held by `identity`.
    pub fn reset(&self, identity: &ClientIdentity) -> usize {
        let before = self.windows.len();
        self.windows.retain(|key, _| key.identity != identity.as_str());
        let removed = before.saturating_sub(self.windows.len());
        info!(identity = identity.as_str(), removed, "rate limits reset");
        removed
    }

    pub fn stats(&self, identity: &ClientIdentity, category: &str) -> WindowStats {
        let limit = self.config.limit_for(category);
        let key = WindowKey {
            identity: identity.as_str().to_string(),
            category: category.to_string(),
        };
        let (current, burst) = match self.windows.get_mut(&key) {
            Some(mut window) => {
                window.prune(Instant::now(), limit.window, self.config.burst_window);
                (window.primary.len(), window.burst.len())
            }
            None => (0, 0),
        };
        WindowStats {
            current_requests: current,
            max_requests: limit.max_requests,
            window_seconds: limit.window.as_secs(),
            burst_requests: burst,
            burst_limit: self.config.burst_limit,
        }
    }

    pub fn global_stats(&self) -> GlobalRateStats {
        let now = Instant::now();
        self.windows.retain(|key, window| {
            let limit = self.config.limit_for(&key.category);
            window.prune(now, limit.window, self.config.burst_window);
            !window.is_empty()
        });

        let mut identities = HashSet::new();
        let mut total = 0;
        for entry in self.windows.iter() {
            identities.insert(entry.key().identity.clone());
            total += entry.value().primary.len();
        }
        GlobalRateStats {
            active_identities: identities.len(),
            tracked_windows: self.windows.len(),
            total_requests_in_window: total,
            max_requests: self.config.max_requests,
            window_seconds: self.config.window.as_secs(),
            burst_limit: self.config.burst_limit,
            burst_window_seconds: self.config.burst_window.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: usize, burst_limit: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
            burst_limit,
            burst_window: Duration::from_secs(10),
            categories: BTreeMap::new(),
        })
    }

    #[test]
    fn denies_excess_and_recovers_after_window() {
        let limiter = limiter(3, 100);
        let client = ClientIdentity::new("addr:10.0.0.1");
        let t0 = Instant::now();

        for i in 0..3 {
            let d = limiter.admit_at(&client, "chat", t0 + Duration::from_millis(i));
            assert!(d.allowed);
            assert_eq!(d.remaining, 2 - i as usize);
        }
        let denied = limiter.admit_at(&client, "chat", t0 + Duration::from_secs(1));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::RateLimitExceeded));
        assert_eq!(denied.retry_after_secs, 59);

        let later = limiter.admit_at(&client, "chat", t0 + Duration::from_secs(60));
        assert!(later.allowed);
    }

    #[test]
    fn burst_window_is_checked_first() {
        let limiter = limiter(30, 2);
        let client = ClientIdentity::new("session:s1");
        let t0 = Instant::now();

        assert!(limiter.admit_at(&client, "chat", t0).allowed);
        assert!(limiter.admit_at(&client, "chat", t0).allowed);
        let denied = limiter.admit_at(&client, "chat", t0 + Duration::from_secs(1));
        assert!(!denied.allowed);
        assert_eq!(denied.reason, Some(DenyReason::BurstLimitExceeded));
        assert_eq!(denied.retry_after_secs, 10);

        assert!(limiter
            .admit_at(&client, "chat", t0 + Duration::from_secs(10))
            .allowed);
    }

    #[test]
    fn categories_have_disjoint_counters() {
        let limiter = limiter(1, 100);
        let client = ClientIdentity::new("key:abc");
        let t0 = Instant::now();

        assert!(limiter.admit_at(&client, "chat", t0).allowed);
        assert!(!limiter.admit_at(&client, "chat", t0).allowed);
        assert!(limiter.admit_at(&client, "admin", t0).allowed);
    }

    #[test]
    fn category_override_applies_its_own_limit() {
        let mut config = RateLimitConfig::default();
        config.burst_limit = 100;
        config.categories.insert(
            "admin".to_string(),
            WindowLimit {
                max_requests: 1,
                window: Duration::from_secs(3600),
            },
        );
        let limiter = RateLimiter::new(config);
        let client = ClientIdentity::new("key:ops");
        let t0 = Instant::now();

        assert!(limiter.admit_at(&client, "admin", t0).allowed);
        let denied = limiter.admit_at(&client, "admin", t0);
        assert_eq!(denied.limit, 1);
        assert_eq!(denied.retry_after_secs, 3600);
    }

    #[test]
    fn reset_clears_every_category_of_an_identity() {
        let limiter = limiter(1, 100);
        let client = ClientIdentity::new("addr:1.2.3.4");
        let other = ClientIdentity::new("addr:5.6.7.8");
        let t0 = Instant::now();
        limiter.admit_at(&client, "chat", t0);
        limiter.admit_at(&client, "admin", t0);
        limiter.admit_at(&other, "chat", t0);

        assert_eq!(limiter.reset(&client), 2);
        assert!(limiter.admit_at(&client, "chat", t0).allowed);
        assert!(!limiter.admit_at(&other, "chat", t0).allowed);
    }

    #[test]
    fn internal_error_fails_open() {
        let limiter = limiter(0, 100);
        let client = ClientIdentity::new("addr:9.9.9.9");
        let decision = limiter.admit_at(&client, "chat", Instant::now());
        assert!(decision.allowed);
        assert_eq!(decision.reason, None);
    }

    #[test]
    fn identity_priority_is_key_then_session_then_address() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            ClientIdentity::resolve(Some("k1"), Some("s1"), Some("1.1.1.1"), None, Some(peer))
                .as_str(),
            "key:k1"
        );
        assert_eq!(
            ClientIdentity::resolve(None, Some("s1"), Some("1.1.1.1"), None, Some(peer)).as_str(),
            "session:s1"
        );
        assert_eq!(
            ClientIdentity::resolve(None, None, Some(" 2.2.2.2, 3.3.3.3"), Some("4.4.4.4"), None)
                .as_str(),
            "addr:2.2.2.2"
        );
        assert_eq!(
            ClientIdentity::resolve(None, Some("  "), None, None, Some(peer)).as_str(),
            "addr:127.0.0.1"
        );
        assert_eq!(
            ClientIdentity::resolve(None, None, None, None, None).as_str(),
            "addr:unknown"
        );
    }

    #[test]
    fn global_stats_drop_expired_windows() {
        let limiter = limiter(10, 100);
        let client = ClientIdentity::new("addr:old");
        limiter.admit_at(&client, "chat", Instant::now());
        let stats = limiter.global_stats();
        assert_eq!(stats.active_identities, 1);
        assert_eq!(stats.total_requests_in_window, 1);
    }
}
