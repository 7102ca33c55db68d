//! Per-key usage accounting.
//!
//! [`SharedUsageLog`] keeps a bounded ring buffer of recent records plus
//! running totals per key, and appends every record to a JSONL file that is
//! replayed on startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::providers::Provider;
use crate::translate::common::TokenUsage;

const MAX_RECENT_RECORDS: usize = 10_000;

/// Name usage is booked under when the gateway runs without access keys.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub inbound: Provider,
    pub provider: Provider,
    pub model: String,
    pub stream: bool,
    pub status: u16,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageRecord {
    pub fn new(
        key: impl Into<String>,
        inbound: Provider,
        provider: Provider,
        model: impl Into<String>,
        stream: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            key: key.into(),
            inbound,
            provider,
            model: model.into(),
            stream,
            status: 200,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    pub fn set_usage(&mut self, usage: TokenUsage) {
        self.prompt_tokens = usage.input;
        self.completion_tokens = usage.output;
        self.total_tokens = usage.total();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.prompt_tokens += record.prompt_tokens;
        self.completion_tokens += record.completion_tokens;
        self.total_tokens += record.total_tokens;
    }
}

/// Sink for finished requests.
pub trait UsageRecorder: Send + Sync + 'static {
    fn record(&self, record: UsageRecord);
}

pub struct UsageLog {
    recent: VecDeque<UsageRecord>,
    totals: HashMap<String, UsageTotals>,
    writer: Option<BufWriter<File>>,
}

impl UsageLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();

        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut log = Self::in_memory();

        if file_path.exists() {
            let reader = BufReader::new(File::open(file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                match serde_json::from_str::<UsageRecord>(&line) {
                    Ok(record) => log.remember(record),
                    Err(e) => warn!(error = %e, "skipping unreadable usage record"),
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        log.writer = Some(BufWriter::new(file));
        Ok(log)
    }

    pub fn in_memory() -> Self {
        Self {
            recent: VecDeque::with_capacity(64),
            totals: HashMap::new(),
            writer: None,
        }
    }

    pub fn record(&mut self, record: UsageRecord) {
        if let Some(ref mut writer) = self.writer {
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = writeln!(writer, "{json}").and_then(|()| writer.flush()) {
                        warn!(error = %e, "failed to append usage record");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode usage record"),
            }
        }
        self.remember(record);
    }

    fn remember(&mut self, record: UsageRecord) {
        self.totals.entry(record.key.clone()).or_default().add(&record);
        if self.recent.len() >= MAX_RECENT_RECORDS {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        self.recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn totals(&self, key: &str) -> UsageTotals {
        self.totals.get(key).copied().unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct SharedUsageLog(Arc<Mutex<UsageLog>>);

impl SharedUsageLog {
    pub fn open(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self(Arc::new(Mutex::new(UsageLog::open(file_path)?))))
    }

    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(UsageLog::in_memory())))
    }

    pub fn recent(&self, limit: usize) -> Vec<UsageRecord> {
        self.0.lock().map(|l| l.recent(limit)).unwrap_or_default()
    }

    pub fn totals(&self, key: &str) -> UsageTotals {
        self.0.lock().map(|l| l.totals(key)).unwrap_or_default()
    }
}

impl UsageRecorder for SharedUsageLog {
    fn record(&self, record: UsageRecord) {
        if let Ok(mut log) = self.0.lock() {
            log.record(record);
        }
    }
}

/// One request's pending usage record.
///
/// The record is written when the ticket is dropped, so it happens exactly
/// once whether the response completed, was streamed to the end, or the
/// caller hung up halfway through a stream.
pub struct UsageTicket<U: UsageRecorder> {
    recorder: U,
    record: UsageRecord,
}

impl<U: UsageRecorder> UsageTicket<U> {
    pub fn new(recorder: U, record: UsageRecord) -> Self {
        Self { recorder, record }
    }

    pub fn observe(&mut self, usage: TokenUsage) {
        self.record.set_usage(usage);
    }

    pub fn set_status(&mut self, status: u16) {
        self.record.status = status;
    }
}

impl<U: UsageRecorder> Drop for UsageTicket<U> {
    fn drop(&mut self) {
        let record = self.record.clone();
        tracing::info!(
            key = %record.key,
            provider = %record.provider,
            model = %record.model,
            status = record.status,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            "request completed"
        );
        self.recorder.record(record);
    }
}
