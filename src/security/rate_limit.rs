use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Numeric caps from §6 / §4.3, mirroring `SECURITY_LIMITS` in
/// `security/middleware.py`.
pub mod limits {
    pub const MAX_CONNECTIONS_PER_IP: usize = 50;
    pub const MAX_MESSAGES_PER_MINUTE: usize = 500;
    pub const MAX_DOCS_PER_IP: u64 = 20;
    pub const MAX_DOCS_PER_HOUR: usize = 10;
    pub const MAX_FRAME_BYTES: usize = 2_000_000;
    pub const MAX_FIELD_VALUE_BYTES: usize = 10_000;
    pub const MAX_DOCUMENT_BYTES: usize = 10_485_760;
    pub const MAX_FIELDS_PER_DOCUMENT: usize = 1_000;

    pub const MESSAGE_WINDOW_MS: i64 = 60_000;
    pub const DOC_HOURLY_WINDOW_MS: i64 = 3_600_000;

    pub const CONNECTION_SWEEP: std::time::Duration = std::time::Duration::from_secs(5 * 60);
    pub const MESSAGE_SWEEP: std::time::Duration = std::time::Duration::from_secs(60);
    pub const DOCUMENT_SWEEP: std::time::Duration = std::time::Duration::from_secs(60 * 60);
}

/// Per-IP connection admission counter (§4.3, first bullet).
#[derive(Default)]
pub struct ConnectionLimiter {
    counts: Arc<Mutex<HashMap<String, usize>>>,
    sweep: Option<JoinHandle<()>>,
}

impl ConnectionLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_admit(&self, ip: &str) -> bool {
        let mut counts = self.counts.lock().await;
        let current = counts.entry(ip.to_string()).or_insert(0);
        if *current >= limits::MAX_CONNECTIONS_PER_IP {
            return false;
        }
        *current += 1;
        true
    }

    pub async fn release(&self, ip: &str) {
        let mut counts = self.counts.lock().await;
        if let Some(current) = counts.get_mut(ip) {
            *current = current.saturating_sub(1);
            if *current == 0 {
                counts.remove(ip);
            }
        }
    }

    pub fn start(&mut self) {
        let counts = self.counts.clone();
        self.sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(limits::CONNECTION_SWEEP);
            loop {
                interval.tick().await;
                let mut guard = counts.lock().await;
                guard.retain(|_, count| *count > 0);
            }
        }));
    }

    pub fn dispose(&mut self) {
        if let Some(handle) = self.sweep.take() {
            handle.abort();
        }
    }
}

/// Sliding-window message-rate limiter, shared shape for both the
/// per-IP and per-connection variants (§4.3).
#[derive(Default)]
pub struct MessageRateLimiter {
    windows: Arc<Mutex<HashMap<String, Vec<i64>>>>,
    sweep: Option<JoinHandle<()>>,
}

impl MessageRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_admit(&self, key: &str, now_ms: i64) -> bool {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_default();
        retain_within_window(entry, now_ms);
        if entry.len() >= limits::MAX_MESSAGES_PER_MINUTE {
            return false;
        }
        entry.push(now_ms);
        true
    }

    pub fn start(&mut self) {
        let windows = self.windows.clone();
        self.sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(limits::MESSAGE_SWEEP);
            loop {
                interval.tick().await;
                sweep_windows(&windows).await;
            }
        }));
    }

    pub fn dispose(&mut self) {
        if let Some(handle) = self.sweep.take() {
            handle.abort();
        }
    }
}

fn retain_within_window(entry: &mut Vec<i64>, now_ms: i64) {
    entry.retain(|&ts| now_ms - ts < limits::MESSAGE_WINDOW_MS);
}

async fn sweep_windows(windows: &Arc<Mutex<HashMap<String, Vec<i64>>>>) {
    let now_ms = current_millis();
    let mut guard = windows.lock().await;
    for entry in guard.values_mut() {
        retain_within_window(entry, now_ms);
    }
    guard.retain(|_, entry| !entry.is_empty());
}

fn current_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-IP document-creation limiter: lifetime total plus an hourly
/// sliding window (§4.3, fourth bullet).
#[derive(Default)]
pub struct DocumentLimiter {
    state: Arc<Mutex<HashMap<String, (u64, Vec<i64>)>>>,
    sweep: Option<JoinHandle<()>>,
}

impl DocumentLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_admit(&self, ip: &str, now_ms: i64) -> Result<(), &'static str> {
        let mut state = self.state.lock().await;
        let (total, hourly) = state.entry(ip.to_string()).or_default();
        hourly.retain(|&ts| now_ms - ts < limits::DOC_HOURLY_WINDOW_MS);

        if *total >= limits::MAX_DOCS_PER_IP {
            return Err("lifetime document-creation limit for this IP has been reached");
        }
        if hourly.len() >= limits::MAX_DOCS_PER_HOUR {
            return Err("hourly document-creation limit for this IP has been reached");
        }

        *total += 1;
        hourly.push(now_ms);
        Ok(())
    }

    pub fn start(&mut self) {
        let state = self.state.clone();
        self.sweep = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(limits::DOCUMENT_SWEEP);
            loop {
                interval.tick().await;
                let now_ms = current_millis();
                let mut guard = state.lock().await;
                for (_, hourly) in guard.values_mut() {
                    hourly.retain(|&ts| now_ms - ts < limits::DOC_HOURLY_WINDOW_MS);
                }
            }
        }));
    }

    pub fn dispose(&mut self) {
        if let Some(handle) = self.sweep.take() {
            handle.abort();
        }
    }
}

/// Coordinates all four limiters, mirroring the Python `SecurityManager`.
pub struct SecurityManager {
    pub connections: ConnectionLimiter,
    pub messages_by_ip: MessageRateLimiter,
    pub messages_by_connection: MessageRateLimiter,
    pub documents: DocumentLimiter,
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: ConnectionLimiter::new(),
            messages_by_ip: MessageRateLimiter::new(),
            messages_by_connection: MessageRateLimiter::new(),
            documents: DocumentLimiter::new(),
        }
    }

    pub fn start(&mut self) {
        self.connections.start();
        self.messages_by_ip.start();
        self.messages_by_connection.start();
        self.documents.start();
    }

    pub fn dispose(&mut self) {
        self.connections.dispose();
        self.messages_by_ip.dispose();
        self.messages_by_connection.dispose();
        self.documents.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifty_first_connection_from_same_ip_is_denied() {
        let limiter = ConnectionLimiter::new();
        for _ in 0..limits::MAX_CONNECTIONS_PER_IP {
            assert!(limiter.try_admit("1.2.3.4").await);
        }
        assert!(!limiter.try_admit("1.2.3.4").await);
    }

    #[tokio::test]
    async fn releasing_a_connection_frees_a_slot() {
        let limiter = ConnectionLimiter::new();
        for _ in 0..limits::MAX_CONNECTIONS_PER_IP {
            assert!(limiter.try_admit("1.2.3.4").await);
        }
        limiter.release("1.2.3.4").await;
        assert!(limiter.try_admit("1.2.3.4").await);
    }

    #[tokio::test]
    async fn distinct_ips_have_independent_connection_counters() {
        let limiter = ConnectionLimiter::new();
        for _ in 0..limits::MAX_CONNECTIONS_PER_IP {
            assert!(limiter.try_admit("1.1.1.1").await);
        }
        assert!(limiter.try_admit("2.2.2.2").await);
    }

    #[tokio::test]
    async fn five_hundred_and_first_message_in_a_minute_is_denied() {
        let limiter = MessageRateLimiter::new();
        for i in 0..limits::MAX_MESSAGES_PER_MINUTE {
            assert!(limiter.try_admit("conn-1", i as i64).await);
        }
        assert!(!limiter.try_admit("conn-1", 999).await);
    }

    #[tokio::test]
    async fn message_admitted_again_sixty_seconds_after_last_admission() {
        let limiter = MessageRateLimiter::new();
        for i in 0..limits::MAX_MESSAGES_PER_MINUTE {
            assert!(limiter.try_admit("conn-1", i as i64).await);
        }
        let last = (limits::MAX_MESSAGES_PER_MINUTE - 1) as i64;
        assert!(!limiter.try_admit("conn-1", last + 1).await);
        assert!(
            limiter
                .try_admit("conn-1", last + limits::MESSAGE_WINDOW_MS)
                .await
        );
    }

    #[tokio::test]
    async fn document_limiter_enforces_lifetime_and_hourly_caps() {
        let limiter = DocumentLimiter::new();
        for i in 0..limits::MAX_DOCS_PER_HOUR {
            assert!(limiter.try_admit("1.2.3.4", i as i64).await.is_ok());
        }
        // hourly cap reached, even though lifetime cap (20) is not
        assert!(limiter.try_admit("1.2.3.4", 999).await.is_err());
    }

    #[tokio::test]
    async fn document_limiter_lifetime_cap_outlasts_the_hourly_window() {
        let limiter = DocumentLimiter::new();
        let hour = limits::DOC_HOURLY_WINDOW_MS;
        let mut now = 0i64;
        let mut admitted = 0u64;
        while admitted < limits::MAX_DOCS_PER_IP {
            if limiter.try_admit("1.2.3.4", now).await.is_ok() {
                admitted += 1;
            }
            now += hour; // always outside the hourly window, only lifetime cap binds
        }
        assert!(limiter.try_admit("1.2.3.4", now).await.is_err());
    }
}
