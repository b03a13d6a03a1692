//! Parsing of the rate-limit headers upstream providers attach to their responses.
//!
//! Missing or malformed integers read as `-1`, missing strings as an empty string.

use http::HeaderMap;

const MISSING: i64 = -1;

/// One counted limit as reported by the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitWindow {
    /// Capacity of the window, `-1` when unknown.
    pub limit: i64,
    /// Remaining capacity, `-1` when unknown.
    pub remaining: i64,
    /// Reset time or duration as sent by the upstream.
    pub reset: String,
}

impl LimitWindow {
    fn read(headers: &HeaderMap, limit: &str, remaining: &str, reset: &str) -> Self {
        Self {
            limit: integer(headers, limit),
            remaining: integer(headers, remaining),
            reset: string(headers, reset),
        }
    }

    /// `remaining / limit`, when both are known.
    pub fn remaining_ratio(&self) -> Option<f64> {
        (self.limit > 0 && self.remaining >= 0).then(|| self.remaining as f64 / self.limit as f64)
    }
}

/// Utilization of a unified subscription window.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedWindow {
    /// Status string, e.g. `allowed` or `rejected`.
    pub status: String,
    /// Fraction of the window used.
    pub utilization: f64,
    /// Reset time as sent by the upstream.
    pub reset: String,
    /// Whether `utilization` was actually read. Distinguishes zero from unavailable.
    pub parsed: bool,
}

impl UnifiedWindow {
    fn read(headers: &HeaderMap, window: &str) -> Self {
        let utilization = headers
            .get(format!("anthropic-ratelimit-unified-{window}-utilization"))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite());

        Self {
            status: string(headers, &format!("anthropic-ratelimit-unified-{window}-status")),
            utilization: utilization.unwrap_or(0.0),
            reset: string(headers, &format!("anthropic-ratelimit-unified-{window}-reset")),
            parsed: utilization.is_some(),
        }
    }

    /// Fraction of the window still available, when the utilization was read.
    pub fn remaining_ratio(&self) -> Option<f64> {
        self.parsed.then(|| (1.0 - self.utilization).clamp(0.0, 1.0))
    }
}

/// The rate-limit state of one upstream credential.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRateLimits {
    /// Request limit.
    pub requests: LimitWindow,
    /// Combined token limit.
    pub tokens: LimitWindow,
    /// Input token limit.
    pub input_tokens: LimitWindow,
    /// Output token limit.
    pub output_tokens: LimitWindow,
    /// Five hour unified window.
    pub unified_5h: UnifiedWindow,
    /// Seven day unified window.
    pub unified_7d: UnifiedWindow,
}

impl UpstreamRateLimits {
    /// Parse whichever dialect the response carries. `None` when no rate-limit header is present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let names = || headers.keys().map(|name| name.as_str());

        if names().any(|name| name.starts_with("anthropic-ratelimit-")) {
            Some(Self::anthropic(headers))
        } else if names().any(|name| name.starts_with("x-ratelimit-")) {
            Some(Self::openai(headers))
        } else {
            None
        }
    }

    /// Parse the `anthropic-ratelimit-*` headers.
    pub fn anthropic(headers: &HeaderMap) -> Self {
        let window = |kind: &str| {
            LimitWindow::read(
                headers,
                &format!("anthropic-ratelimit-{kind}-limit"),
                &format!("anthropic-ratelimit-{kind}-remaining"),
                &format!("anthropic-ratelimit-{kind}-reset"),
            )
        };

        Self {
            requests: window("requests"),
            tokens: window("tokens"),
            input_tokens: window("input-tokens"),
            output_tokens: window("output-tokens"),
            unified_5h: UnifiedWindow::read(headers, "5h"),
            unified_7d: UnifiedWindow::read(headers, "7d"),
        }
    }

    /// Parse the `x-ratelimit-*` headers.
    pub fn openai(headers: &HeaderMap) -> Self {
        let window = |kind: &str| {
            LimitWindow::read(
                headers,
                &format!("x-ratelimit-limit-{kind}"),
                &format!("x-ratelimit-remaining-{kind}"),
                &format!("x-ratelimit-reset-{kind}"),
            )
        };

        Self {
            requests: window("requests"),
            tokens: window("tokens"),
            input_tokens: LimitWindow::read(headers, "", "", ""),
            output_tokens: LimitWindow::read(headers, "", "", ""),
            unified_5h: UnifiedWindow::read(headers, "5h"),
            unified_7d: UnifiedWindow::read(headers, "7d"),
        }
    }

    /// Remaining ratio of every dimension the upstream reported.
    pub fn remaining_ratios(&self) -> Vec<(&'static str, f64)> {
        [
            ("requests", self.requests.remaining_ratio()),
            ("tokens", self.tokens.remaining_ratio()),
            ("input_tokens", self.input_tokens.remaining_ratio()),
            ("output_tokens", self.output_tokens.remaining_ratio()),
            ("unified_5h", self.unified_5h.remaining_ratio()),
            ("unified_7d", self.unified_7d.remaining_ratio()),
        ]
        .into_iter()
        .filter_map(|(dimension, ratio)| ratio.map(|ratio| (dimension, ratio)))
        .collect()
    }
}

fn integer(headers: &HeaderMap, name: &str) -> i64 {
    if name.is_empty() {
        return MISSING;
    }

    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(MISSING)
}

fn string(headers: &HeaderMap, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }

    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}
