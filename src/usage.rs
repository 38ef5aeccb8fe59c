//! Per-tenant usage accounting.
//!
//! The engine does not own quota values or reset cadence; it only asks
//! the [`Quota`] collaborator whether a request may proceed and reports
//! token consumption afterwards. [`TenantProfile`] is the bundled
//! implementation: explicit state-transition methods mutate the counters
//! (no save-hook side effects), and every recorded request appends an
//! entry to an internal usage log. Counter updates are last-write-wins;
//! concurrent requests from one tenant can under-count, which is accepted
//! because the quota is advisory rather than hard-atomic.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Limits handed down by the host application's subscription layer.
#[derive(Debug, Clone, Copy)]
pub struct UsageLimits {
    pub monthly_requests: u64,
    pub monthly_tokens: u64,
}

/// Current consumption counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageCounters {
    pub requests: u64,
    pub tokens: u64,
}

/// One recorded API request.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub endpoint: String,
    pub tokens: u64,
    pub at: DateTime<Utc>,
}

/// Quota collaborator interface consumed by the composer and the voice
/// orchestrator.
pub trait Quota: Send + Sync {
    fn can_make_request(&self) -> bool;
    fn token_limit_exceeded(&self) -> bool;
    fn record_usage(&self, endpoint: &str, tokens: u64);
    fn counters(&self) -> UsageCounters;
    fn limits(&self) -> UsageLimits;
}

struct ProfileState {
    counters: UsageCounters,
    log: Vec<UsageRecord>,
}

/// In-process tenant profile with advisory limits.
pub struct TenantProfile {
    limits: UsageLimits,
    state: Mutex<ProfileState>,
}

impl TenantProfile {
    pub fn new(limits: UsageLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(ProfileState {
                counters: UsageCounters::default(),
                log: Vec::new(),
            }),
        }
    }

    /// Record one API request and its token cost. This is the only way
    /// counters move; a zero token count still counts as a request so
    /// "one call = one request" holds for quota purposes.
    pub fn record_api_usage(&self, endpoint: &str, tokens: u64) {
        let mut state = self.state.lock().unwrap();
        state.counters.requests += 1;
        state.counters.tokens += tokens;
        state.log.push(UsageRecord {
            endpoint: endpoint.to_string(),
            tokens,
            at: Utc::now(),
        });
    }

    /// Snapshot of the usage log, oldest first.
    pub fn usage_log(&self) -> Vec<UsageRecord> {
        self.state.lock().unwrap().log.clone()
    }
}

impl Quota for TenantProfile {
    fn can_make_request(&self) -> bool {
        self.state.lock().unwrap().counters.requests < self.limits.monthly_requests
    }

    fn token_limit_exceeded(&self) -> bool {
        self.state.lock().unwrap().counters.tokens >= self.limits.monthly_tokens
    }

    fn record_usage(&self, endpoint: &str, tokens: u64) {
        self.record_api_usage(endpoint, tokens);
    }

    fn counters(&self) -> UsageCounters {
        self.state.lock().unwrap().counters
    }

    fn limits(&self) -> UsageLimits {
        self.limits
    }
}
