//! Sliding-window rate limiting over the shared key-value store.
//!
//! Each `(limit, identifier)` pair owns one sorted set at
//! `{prefix}:{limit}:{identifier}` holding one member per admitted request,
//! scored by admission time in milliseconds. A check atomically drops
//! members older than the window and admits the request only if fewer than
//! `limit` remain, so concurrent processes can never over-admit.
//!
//! Denied requests are not recorded and do not extend the window.
//!
//! # Failure policy
//!
//! When the store is unreachable the limiter fails open: the request is
//! allowed and a warning is logged. Availability wins over strict
//! enforcement, matching the cache.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{duration_ms, SharedClock};
use crate::error::ConfigError;
use crate::metrics::{LimitDecision, MetricsCollector};
use crate::queue::codec::generate_id;
use crate::store::SharedStore;

/// Named limits of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitKind {
    /// Sign-in attempts.
    Auth,
    /// Enqueueing or invoking AI generation.
    AiGeneration,
    QuizSubmission,
    Upload,
    /// General API traffic.
    Api,
}

impl LimitKind {
    pub const ALL: [LimitKind; 5] = [
        LimitKind::Auth,
        LimitKind::AiGeneration,
        LimitKind::QuizSubmission,
        LimitKind::Upload,
        LimitKind::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Auth => "auth",
            LimitKind::AiGeneration => "ai-generation",
            LimitKind::QuizSubmission => "quiz-submission",
            LimitKind::Upload => "upload",
            LimitKind::Api => "api",
        }
    }

    /// Built-in rule for this limit.
    pub fn default_rule(&self) -> RateLimitRule {
        let (limit, window_secs) = match self {
            LimitKind::Auth => (5, 900),
            LimitKind::AiGeneration => (10, 60),
            LimitKind::QuizSubmission => (20, 60),
            LimitKind::Upload => (10, 3600),
            LimitKind::Api => (100, 60),
        };
        RateLimitRule::new(self.as_str(), limit, Duration::from_secs(window_secs))
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LimitKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = LimitKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown limit '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Metric label shared by every rule checked through
/// [`RateLimiter::check_rule`].
pub const CUSTOM_LIMIT_LABEL: &str = "custom";

/// `limit` requests per `window`, under a name used in the store key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub name: String,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "rate limit name must not be empty".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "rate limit '{}' must allow at least one request",
                self.name
            )));
        }
        if duration_ms(self.window) == 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "rate limit '{}' window must be at least 1ms",
                self.name
            )));
        }
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests still admissible in the current window.
    pub remaining: u32,
    /// When the oldest admission leaves the window (ms since epoch).
    pub reset_at_ms: i64,
}

impl RateLimitDecision {
    /// Milliseconds until another request could be admitted; zero if allowed.
    pub fn retry_after_ms(&self, now_ms: i64) -> i64 {
        if self.allowed {
            0
        } else {
            (self.reset_at_ms - now_ms).max(0)
        }
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Key prefix for the window sets.
    pub prefix: String,
    /// Allow everything without touching the store. Local development only.
    pub bypass: bool,
    /// Per-limit replacements for the built-in rules.
    pub overrides: HashMap<LimitKind, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            prefix: "ratelimit".to_string(),
            bypass: false,
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Replaces the built-in rule for `kind`.
    pub fn with_rule(mut self, kind: LimitKind, limit: u32, window: Duration) -> Self {
        self.overrides
            .insert(kind, RateLimitRule::new(kind.as_str(), limit, window));
        self
    }

    /// Effective rule for `kind`.
    pub fn rule(&self, kind: LimitKind) -> RateLimitRule {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_rule())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "rate limit prefix must not be empty".to_string(),
            ));
        }
        for kind in LimitKind::ALL {
            self.rule(kind).validate()?;
        }
        Ok(())
    }
}

/// Sliding-window limiter shared by every process that talks to the store.
pub struct RateLimiter {
    store: SharedStore,
    clock: SharedClock,
    config: RateLimitConfig,
    metrics: MetricsCollector,
}

impl RateLimiter {
    /// Creates a limiter.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if a rule or the prefix is invalid.
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        config: RateLimitConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.bypass {
            warn!("Rate limiting is bypassed; every request will be allowed");
        }
        Ok(Self {
            store,
            clock,
            config,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Store key of the window for `(name, identifier)`.
    pub fn window_key(&self, name: &str, identifier: &str) -> String {
        format!("{}:{}:{}", self.config.prefix, name, identifier)
    }

    /// Checks and, if allowed, records one request against a named limit.
    pub async fn check(&self, kind: LimitKind, identifier: &str) -> RateLimitDecision {
        let rule = self.config.rule(kind);
        self.admit(&rule, kind.as_str(), identifier).await
    }

    /// Checks and, if allowed, records one request against an ad-hoc rule.
    ///
    /// The rule name keys the window in the store; metrics for every ad-hoc
    /// rule share the [`CUSTOM_LIMIT_LABEL`] label.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if the rule is invalid. Nothing
    /// is recorded in that case.
    pub async fn check_rule(
        &self,
        rule: &RateLimitRule,
        identifier: &str,
    ) -> Result<RateLimitDecision, ConfigError> {
        rule.validate()?;
        Ok(self.admit(rule, CUSTOM_LIMIT_LABEL, identifier).await)
    }

    async fn admit(
        &self,
        rule: &RateLimitRule,
        metric_label: &str,
        identifier: &str,
    ) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let window_ms = duration_ms(rule.window);
        let unrestricted = RateLimitDecision {
            allowed: true,
            limit: rule.limit,
            remaining: rule.limit,
            reset_at_ms: now.saturating_add(window_ms),
        };

        if self.config.bypass {
            self.metrics
                .record_rate_limit(metric_label, LimitDecision::Bypassed);
            return unrestricted;
        }

        let key = self.window_key(&rule.name, identifier);
        // Admissions at or before now - window have left the window
        let evict_below = now.saturating_sub(window_ms) + 1;

        let outcome = match self
            .store
            .zadd_capped(
                &key,
                &generate_id(now),
                now as f64,
                evict_below as f64,
                u64::from(rule.limit),
                rule.window,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics
                    .record_rate_limit(metric_label, LimitDecision::FailOpen);
                warn!(key = %key, error = %e, "Rate limit check failed, allowing request");
                return unrestricted;
            }
        };

        let used = u32::try_from(outcome.len).unwrap_or(u32::MAX);
        let decision = RateLimitDecision {
            allowed: outcome.added,
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(used),
            reset_at_ms: outcome
                .min_score
                .map_or(unrestricted.reset_at_ms, |oldest| {
                    (oldest as i64).saturating_add(window_ms)
                }),
        };

        if decision.allowed {
            self.metrics
                .record_rate_limit(metric_label, LimitDecision::Allowed);
            debug!(key = %key, remaining = decision.remaining, "Rate limit allowed");
        } else {
            self.metrics
                .record_rate_limit(metric_label, LimitDecision::Denied);
            debug!(key = %key, reset_at_ms = decision.reset_at_ms, "Rate limit exceeded");
        }
        decision
    }

    /// Clears the window for `(kind, identifier)`, e.g. after a successful sign-in.
    pub async fn reset(&self, kind: LimitKind, identifier: &str) {
        let key = self.window_key(kind.as_str(), identifier);
        if let Err(e) = self.store.delete(&key).await {
            warn!(key = %key, error = %e, "Rate limit reset failed, ignoring");
        }
    }
}
