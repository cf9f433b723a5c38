use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::Deserialize;

/// Retry budgets applied to every new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetryLimits {
    #[serde(default = "RetryLimits::default_limit")]
    pub max_retries_within_mount: u32,
    #[serde(default = "RetryLimits::default_limit")]
    pub max_total_retries: u32,
    #[serde(default = "RetryLimits::default_limit")]
    pub max_report_retries: u32,
}

impl RetryLimits {
    fn default_limit() -> u32 {
        2
    }
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_retries_within_mount: Self::default_limit(),
            max_total_retries: Self::default_limit(),
            max_report_retries: Self::default_limit(),
        }
    }
}

/// Retry counters carried by each job of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetryCounters {
    pub retries_within_mount: u32,
    pub last_mount_with_failure: u64,
    pub total_retries: u32,
    pub total_report_retries: u32,
    pub max_retries_within_mount: u32,
    pub max_total_retries: u32,
    pub max_report_retries: u32,
    pub failure_log: Vec<String>,
    pub report_failure_log: Vec<String>,
}

/// Outcome of accounting one transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRetry {
    /// Budget left in this mount: the job can be queued again right away.
    WithinMount,
    /// Budget exhausted for this mount only: the job waits for the session to end.
    NextMount,
    /// Total budget exhausted.
    Exhausted,
}

/// Outcome of accounting one report failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportRetry {
    Retry,
    Exhausted,
}

impl RetryCounters {
    pub fn new(limits: RetryLimits) -> Self {
        Self {
            max_retries_within_mount: limits.max_retries_within_mount,
            max_total_retries: limits.max_total_retries,
            max_report_retries: limits.max_report_retries,
            ..Default::default()
        }
    }

    /// Count a failed transfer in `mount_id`. The within-mount counter restarts
    /// at one whenever the failure happens in a different mount.
    pub fn record_transfer_failure(&mut self, mount_id: u64, reason: &str) -> TransferRetry {
        if self.last_mount_with_failure == mount_id {
            self.retries_within_mount += 1;
        } else {
            self.retries_within_mount = 1;
            self.last_mount_with_failure = mount_id;
        }
        self.total_retries += 1;
        self.failure_log.push(stamp(reason));
        if self.total_retries >= self.max_total_retries {
            TransferRetry::Exhausted
        } else if self.retries_within_mount >= self.max_retries_within_mount {
            TransferRetry::NextMount
        } else {
            TransferRetry::WithinMount
        }
    }

    pub fn record_report_failure(&mut self, reason: &str) -> ReportRetry {
        self.total_report_retries += 1;
        self.report_failure_log.push(stamp(reason));
        if self.total_report_retries >= self.max_report_retries {
            ReportRetry::Exhausted
        } else {
            ReportRetry::Retry
        }
    }
}

fn stamp(reason: &str) -> String {
    format!("{} {}", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), reason)
}
