use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use time::OffsetDateTime;

use poolgate_common::GroupId;

use crate::storage::{HourlyStatDelta, RequestLogInsert, Storage};

/// One terminal record queued for persistence. Token counts ride along so the
/// hourly rollup does not need a second source.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log: RequestLogInsert,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
            retry_delay: Duration::from_millis(200),
        }
    }
}

struct SinkInner {
    queue: Mutex<VecDeque<LogEntry>>,
    notify: Notify,
    capacity: usize,
    overflow: AtomicU64,
}

/// Asynchronous request-log writer. `push` never blocks the request path:
/// when the buffer is full the oldest entry is dropped and counted.
#[derive(Clone)]
pub struct RequestLogSink {
    inner: Arc<SinkInner>,
}

impl RequestLogSink {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        config: LogSinkConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let inner = Arc::new(SinkInner {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity)),
            notify: Notify::new(),
            capacity: config.capacity,
            overflow: AtomicU64::new(0),
        });
        let sink = Self {
            inner: inner.clone(),
        };
        let handle = tokio::spawn(writer(storage, inner, config, shutdown));
        (sink, handle)
    }

    pub async fn push(&self, entry: LogEntry) {
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                let dropped = self.inner.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "request log buffer overflow, dropping oldest");
                }
            }
            queue.push_back(entry);
        }
        self.inner.notify.notify_one();
    }

    pub fn overflow_total(&self) -> u64 {
        self.inner.overflow.load(Ordering::Relaxed)
    }
}

async fn writer(
    storage: Arc<dyn Storage>,
    inner: Arc<SinkInner>,
    config: LogSinkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                // Final drain, then exit.
                let batch = drain(&inner, usize::MAX).await;
                if !batch.is_empty() {
                    flush(&storage, batch, config.retry_delay, true).await;
                }
                return;
            }
        }

        loop {
            let batch = drain(&inner, config.batch_size).await;
            if batch.is_empty() {
                break;
            }
            flush(&storage, batch, config.retry_delay, false).await;
        }
    }
}

async fn drain(inner: &SinkInner, max: usize) -> Vec<LogEntry> {
    let mut queue = inner.queue.lock().await;
    let take = queue.len().min(max);
    queue.drain(..take).collect()
}

async fn flush(
    storage: &Arc<dyn Storage>,
    batch: Vec<LogEntry>,
    retry_delay: Duration,
    best_effort: bool,
) {
    let logs: Vec<RequestLogInsert> = batch.iter().map(|entry| entry.log.clone()).collect();
    let stats = fold_hourly(&batch);

    loop {
        match storage.append_request_logs(&logs).await {
            Ok(()) => break,
            Err(err) => {
                tracing::warn!(error = %err, "request log write failed");
                if best_effort {
                    return;
                }
                tokio_time::sleep(retry_delay).await;
            }
        }
    }

    if let Err(err) = storage.add_hourly_stats(&stats).await {
        tracing::warn!(error = %err, "hourly stat write failed");
    }
}

fn fold_hourly(batch: &[LogEntry]) -> Vec<HourlyStatDelta> {
    let mut by_bucket: HashMap<(GroupId, OffsetDateTime), HourlyStatDelta> = HashMap::new();
    for entry in batch {
        // Only terminal rows count for rate aggregation.
        if entry.log.request_type != "final" {
            continue;
        }
        let Some(group_id) = entry.log.group_id else {
            continue;
        };
        let hour = truncate_to_hour(entry.log.at);
        let delta = by_bucket
            .entry((group_id, hour))
            .or_insert_with(|| HourlyStatDelta {
                group_id,
                hour,
                success_count: 0,
                failure_count: 0,
                prompt_tokens: 0,
                completion_tokens: 0,
            });
        if entry.log.success {
            delta.success_count += 1;
        } else {
            delta.failure_count += 1;
        }
        delta.prompt_tokens += entry.prompt_tokens;
        delta.completion_tokens += entry.completion_tokens;
    }
    let mut out: Vec<HourlyStatDelta> = by_bucket.into_values().collect();
    out.sort_by_key(|d| (d.group_id, d.hour));
    out
}

fn truncate_to_hour(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_minute(0)
        .and_then(|t| t.replace_second(0))
        .and_then(|t| t.replace_nanosecond(0))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at() -> OffsetDateTime {
        // 2025-06-01 10:23:45 UTC
        OffsetDateTime::from_unix_timestamp(1_748_773_425).unwrap()
    }

    fn entry(group_id: Option<i64>, request_type: &'static str, success: bool) -> LogEntry {
        LogEntry {
            log: RequestLogInsert {
                at: sample_at(),
                group_id,
                key_id: None,
                request_type,
                attempt: 1,
                success,
                status_code: Some(200),
                latency_ms: 12,
                model: None,
                upstream_url: None,
                error_class: None,
                error_message: None,
            },
            prompt_tokens: 10,
            completion_tokens: 5,
        }
    }

    #[test]
    fn hourly_fold_skips_retries_and_groups_by_hour() {
        let batch = vec![
            entry(Some(1), "final", true),
            entry(Some(1), "retry", false),
            entry(Some(1), "final", false),
            entry(None, "final", true),
        ];
        let stats = fold_hourly(&batch);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].group_id, 1);
        assert_eq!(stats[0].hour, truncate_to_hour(sample_at()));
        assert_eq!(stats[0].hour.minute(), 0);
        assert_eq!(stats[0].hour.second(), 0);
        assert_eq!(stats[0].success_count, 1);
        assert_eq!(stats[0].failure_count, 1);
        assert_eq!(stats[0].prompt_tokens, 20);
    }
}
