//! Decide which failed requests are worth retrying.
use std::time::Duration;

use backon::ExponentialBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::transport::RpcFailure;

// "[0x1, 0x2]" in the provider's error message.
static SUGGESTED_RANGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(0x[0-9a-fA-F]+)\s*,\s*(0x[0-9a-fA-F]+)\s*\]").unwrap());

static MAX_RANGE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:max(?:imum)?\s+(?:block\s+)?range|limited\s+to\s+a)\D{0,8}([\d,]+)")
        .unwrap()
});

/// JSON-RPC error codes that will fail again no matter how often they are sent.
const TERMINAL_RPC_CODES: &[i64] = &[
    // Parse error.
    -32700,
    // Invalid request.
    -32600,
    // Method not found.
    -32601,
    // Method not supported.
    -32004,
    // JSON-RPC version not supported.
    -32006,
];

const TERMINAL_HTTP_STATUSES: &[u16] = &[404, 405, 501, 505];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Terminal,
    /// `eth_getLogs` covered too many blocks or returned too many logs.
    RangeTooLarge { suggested: Option<(u64, u64)> },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Number of retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry. Doubles at every retry.
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 9,
            base_delay: Duration::from_millis(125),
        }
    }
}

impl RetryOptions {
    pub fn backoff(&self) -> ExponentialBuilder {
        let max_delay = self.base_delay * 2u32.saturating_pow(self.max_retries as u32);
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_retries)
    }

    /// Delay before retry number `retry`, starting at zero.
    pub fn delay(&self, retry: usize) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry as u32)
    }
}

pub fn classify(method: &str, params: &Value, failure: &RpcFailure) -> FailureClass {
    if method == "eth_getLogs" {
        if let Some(range) = block_range_param(params) {
            if let Some(suggested) = range_too_large(range, failure) {
                return FailureClass::RangeTooLarge { suggested };
            }
        }
    }

    match failure {
        RpcFailure::JsonRpc { code, .. } if TERMINAL_RPC_CODES.contains(code) => {
            FailureClass::Terminal
        }
        RpcFailure::Http { status, .. } if TERMINAL_HTTP_STATUSES.contains(status) => {
            FailureClass::Terminal
        }
        _ => FailureClass::Retryable,
    }
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Retryable)
    }
}

/// Returns `Some(suggested_range)` if the failure says the block range was too large.
fn range_too_large(range: (u64, u64), failure: &RpcFailure) -> Option<Option<(u64, u64)>> {
    let message = failure.message();

    // "... Try with this block range [0x1, 0x2]." and "... this block range should work: [0x1, 0x2]"
    if let Some(captures) = SUGGESTED_RANGE_REGEX.captures(message) {
        let start = parse_quantity(&captures[1]);
        let end = parse_quantity(&captures[2]);
        if let (Some(start), Some(end)) = (start, end) {
            if start <= end {
                return Some(Some((start, end)));
            }
        }
        return Some(None);
    }

    // "... maximum block range: 2000", "... limited to a 10,000 range", "... max range 5000"
    if let Some(captures) = MAX_RANGE_REGEX.captures(message) {
        let size = captures[1].replace(',', "").parse::<u64>().ok();
        let (from, to) = range;
        let suggested = size
            .filter(|size| *size > 0)
            .map(|size| (from, from.saturating_add(size - 1).min(to)));
        return Some(suggested);
    }

    let lowercase = message.to_ascii_lowercase();
    let too_large = [
        "query returned more than",
        "response size exceeded",
        "block range is too wide",
        "block range too large",
        "range is too large",
        "exceed maximum block range",
        "query timeout exceeded",
        "too many logs",
        "log response size",
    ];

    if too_large.iter().any(|pattern| lowercase.contains(pattern)) {
        return Some(None);
    }

    None
}

fn block_range_param(params: &Value) -> Option<(u64, u64)> {
    let filter = params.get(0)?;
    let from = parse_quantity(filter.get("fromBlock")?.as_str()?)?;
    let to = parse_quantity(filter.get("toBlock")?.as_str()?)?;
    Some((from, to))
}

fn parse_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}
