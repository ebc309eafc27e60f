//! Per-domain request policy.
//!
//! Both tables here are configuration data: the slow-origin allowlist that
//! earns a longer timeout budget, and the Referer overrides used to get past
//! hotlink protection. Lookups are pure.

use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Default manifest budget.
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Manifest budget for known-slow origins.
pub const SLOW_MANIFEST_TIMEOUT: Duration = Duration::from_secs(45);
/// Default segment budget.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);
/// Segment budget for known-slow origins.
pub const SLOW_SEGMENT_TIMEOUT: Duration = Duration::from_secs(75);

/// What is being fetched; selects the budget column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Manifest,
    Segment,
}

/// Timeout class a source may pin regardless of the target host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutClass {
    #[default]
    Default,
    Slow,
}

/// The four budgets, overridable from config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutBudgets {
    pub manifest: Duration,
    pub slow_manifest: Duration,
    pub segment: Duration,
    pub slow_segment: Duration,
}

impl Default for TimeoutBudgets {
    fn default() -> Self {
        Self {
            manifest: MANIFEST_TIMEOUT,
            slow_manifest: SLOW_MANIFEST_TIMEOUT,
            segment: SEGMENT_TIMEOUT,
            slow_segment: SLOW_SEGMENT_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TimeoutPolicy {
    slow_domains: Vec<String>,
    budgets: TimeoutBudgets,
}

impl TimeoutPolicy {
    pub fn new<I, S>(slow_domains: I, budgets: TimeoutBudgets) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            slow_domains: slow_domains
                .into_iter()
                .filter_map(|d| normalize_domain(d.as_ref()))
                .collect(),
            budgets,
        }
    }

    /// Classify a hostname against the slow-origin allowlist.
    pub fn classify(&self, host: &str) -> TimeoutClass {
        let host = host.to_ascii_lowercase();
        if self.slow_domains.iter().any(|d| host_matches(&host, d)) {
            TimeoutClass::Slow
        } else {
            TimeoutClass::Default
        }
    }

    /// Budget for one request. A source pinned to [`TimeoutClass::Slow`]
    /// gets the slow budget even for hosts outside the allowlist.
    pub fn budget(&self, host: &str, kind: RequestKind, source_class: TimeoutClass) -> Duration {
        let slow = source_class == TimeoutClass::Slow || self.classify(host) == TimeoutClass::Slow;
        match (kind, slow) {
            (RequestKind::Manifest, false) => self.budgets.manifest,
            (RequestKind::Manifest, true) => self.budgets.slow_manifest,
            (RequestKind::Segment, false) => self.budgets.segment,
            (RequestKind::Segment, true) => self.budgets.slow_segment,
        }
    }
}

/// Referer selection for outbound requests.
#[derive(Clone, Debug, Default)]
pub struct RefererPolicy {
    overrides: Vec<(String, String)>,
}

impl RefererPolicy {
    pub fn new<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            overrides: overrides
                .into_iter()
                .filter_map(|(domain, referer)| normalize_domain(&domain).map(|d| (d, referer)))
                .collect(),
        }
    }

    /// The Referer to send for `url`: the configured override for its
    /// domain, otherwise the target's own origin with a trailing slash.
    pub fn referer_for(&self, url: &Url) -> String {
        if let Some(host) = url.host_str() {
            let host = host.to_ascii_lowercase();
            if let Some((_, referer)) = self.overrides.iter().find(|(d, _)| host_matches(&host, d)) {
                return referer.clone();
            }
        }
        format!("{}/", url.origin().ascii_serialization())
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// `host` is `domain` or one of its subdomains.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
