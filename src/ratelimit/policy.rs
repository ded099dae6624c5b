//! Rule selection and per-request limiting.
//!
//! A request is matched against the configured rules in this order, first
//! hit wins:
//!
//! 1. exact path
//! 2. path prefix (longest first)
//! 3. HTTP method
//! 4. global rule
//!
//! A matched rule with `max = 0` exempts the request from limiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::Method;

use super::{RateLimitDecision, RateLimitRule, RateLimitStrategy};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleMatcher {
    Exact(String),
    Prefix(String),
    Method(Method),
    Global,
}

impl RuleMatcher {
    /// Parse `/exact`, `/prefix*` or an HTTP method name.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Some(prefix) = s.strip_suffix('*') {
            if !prefix.starts_with('/') {
                return Err(format!("rate limit prefix '{s}' must start with '/'"));
            }
            return Ok(RuleMatcher::Prefix(prefix.to_string()));
        }
        if s.starts_with('/') {
            return Ok(RuleMatcher::Exact(s.to_string()));
        }
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid rate limit matcher '{s}'"));
        }
        Method::from_bytes(s.to_ascii_uppercase().as_bytes())
            .map(RuleMatcher::Method)
            .map_err(|e| format!("invalid HTTP method '{s}': {e}"))
    }
}

impl fmt::Display for RuleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMatcher::Exact(path) => write!(f, "path:{path}"),
            RuleMatcher::Prefix(prefix) => write!(f, "prefix:{prefix}"),
            RuleMatcher::Method(method) => write!(f, "method:{method}"),
            RuleMatcher::Global => f.write_str("global"),
        }
    }
}

/// The full set of configured rules.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicy {
    exact: HashMap<String, RateLimitRule>,
    /// Sorted longest prefix first.
    prefixes: Vec<(String, RateLimitRule)>,
    methods: HashMap<Method, RateLimitRule>,
    global: Option<RateLimitRule>,
}

impl RateLimitPolicy {
    pub fn new(global: Option<RateLimitRule>) -> Self {
        Self {
            global,
            ..Self::default()
        }
    }

    pub fn with_rule(mut self, matcher: RuleMatcher, rule: RateLimitRule) -> Self {
        match matcher {
            RuleMatcher::Exact(path) => {
                self.exact.insert(path, rule);
            }
            RuleMatcher::Prefix(prefix) => {
                self.prefixes.retain(|(p, _)| *p != prefix);
                self.prefixes.push((prefix, rule));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            RuleMatcher::Method(method) => {
                self.methods.insert(method, rule);
            }
            RuleMatcher::Global => self.global = Some(rule),
        }
        self
    }

    /// Parse `"<matcher>=<max>/<window>[/<strategy>];..."` on top of `global`.
    pub fn parse(global: Option<RateLimitRule>, spec: &str) -> Result<Self, String> {
        let mut policy = Self::new(global);
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (matcher, rule) = entry
                .split_once('=')
                .ok_or_else(|| format!("rate limit rule '{entry}' is missing '='"))?;
            policy = policy.with_rule(RuleMatcher::parse(matcher)?, RateLimitRule::parse(rule)?);
        }
        Ok(policy)
    }

    /// Pick the rule for a request.
    pub fn select(&self, method: &Method, path: &str) -> Option<(RuleMatcher, RateLimitRule)> {
        if let Some(rule) = self.exact.get(path) {
            return Some((RuleMatcher::Exact(path.to_string()), *rule));
        }
        if let Some((prefix, rule)) = self.prefixes.iter().find(|(p, _)| path.starts_with(p)) {
            return Some((RuleMatcher::Prefix(prefix.clone()), *rule));
        }
        if let Some(rule) = self.methods.get(method) {
            return Some((RuleMatcher::Method(method.clone()), *rule));
        }
        self.global.map(|rule| (RuleMatcher::Global, rule))
    }

    fn rules(&self) -> impl Iterator<Item = (RuleMatcher, RateLimitRule)> + '_ {
        self.exact
            .iter()
            .map(|(p, r)| (RuleMatcher::Exact(p.clone()), *r))
            .chain(
                self.prefixes
                    .iter()
                    .map(|(p, r)| (RuleMatcher::Prefix(p.clone()), *r)),
            )
            .chain(
                self.methods
                    .iter()
                    .map(|(m, r)| (RuleMatcher::Method(m.clone()), *r)),
            )
            .chain(self.global.map(|r| (RuleMatcher::Global, r)))
    }

    pub fn is_empty(&self) -> bool {
        self.rules().all(|(_, rule)| !rule.is_enabled())
    }
}

/// A limiting decision tagged with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOutcome {
    pub rule: RuleMatcher,
    pub decision: RateLimitDecision,
}

/// Applies a [`RateLimitPolicy`] with one strategy instance per rule.
#[derive(Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    strategies: Arc<HashMap<RuleMatcher, Arc<dyn RateLimitStrategy>>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        let strategies = policy
            .rules()
            .filter(|(_, rule)| rule.is_enabled())
            .map(|(matcher, rule)| (matcher, rule.build(store.clone(), clock.clone())))
            .collect();

        Self {
            policy,
            strategies: Arc::new(strategies),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Record a request from `client` and return the decision, or `None` if
    /// no enabled rule applies.
    ///
    /// The limiting key is `client`, the matched rule, and the path.
    pub async fn check(
        &self,
        client: &str,
        method: &Method,
        path: &str,
    ) -> Result<Option<LimitOutcome>, StoreError> {
        let Some((matcher, _)) = self.policy.select(method, path) else {
            return Ok(None);
        };
        // Disabled rules have no strategy and exempt the request
        let Some(strategy) = self.strategies.get(&matcher) else {
            return Ok(None);
        };

        let key = format!("{client}:{matcher}:{path}");
        let decision = strategy.check_and_record(&key).await?;

        Ok(Some(LimitOutcome {
            rule: matcher,
            decision,
        }))
    }
}
