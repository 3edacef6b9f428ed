use std::time::Duration;

use crate::upload::UploadOptions;
use crate::upload::retry::RetryPolicy;

pub const DEFAULT_PROVIDER: &str = "terabox";
pub const DEFAULT_BASE_URL: &str = "https://www.terabox.com";
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub provider: String,
    /// Session cookie of the TeraBox account.
    pub ndus: Option<String>,
    pub base_url: String,
    pub concurrency: Option<usize>,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl UploadConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |name: &str| {
            text(name)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
        };

        let retry_base = number("TBUP_RETRY_BASE_MS").unwrap_or(DEFAULT_RETRY_BASE_MS);
        let retry_max = number("TBUP_RETRY_MAX_MS")
            .unwrap_or(DEFAULT_RETRY_MAX_MS)
            .max(retry_base);

        Self {
            provider: text("TBUP_PROVIDER").unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            ndus: text("TBUP_NDUS"),
            base_url: text("TBUP_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            concurrency: number("TBUP_UPLOAD_CONCURRENCY").map(|value| value as usize),
            max_attempts: number("TBUP_MAX_ATTEMPTS")
                .unwrap_or(DEFAULT_MAX_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            retry_base: Duration::from_millis(retry_base),
            retry_max: Duration::from_millis(retry_max),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_base, self.retry_max)
    }

    pub fn upload_options(&self) -> UploadOptions {
        UploadOptions {
            retry: self.retry_policy(),
            concurrency: self.concurrency,
        }
    }
}
