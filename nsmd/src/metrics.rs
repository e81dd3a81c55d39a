use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the management daemon.
///
/// Updated from the request and event hot paths, so every field is
/// atomic. A periodic task logs a roll-up.
pub struct Metrics {
    pub start_time: SystemTime,
    requests_total: AtomicU64,
    responses_total: AtomicU64,
    timeouts_total: AtomicU64,
    decode_errors_total: AtomicU64,
    refusals_total: AtomicU64,
    events_total: AtomicU64,
    unhandled_events_total: AtomicU64,
    event_acks_total: AtomicU64,
    long_running_completions: AtomicU64,
    long_running_timeouts: AtomicU64,
    offline_transitions: AtomicU64,
    online_transitions: AtomicU64,
    endpoints_online: AtomicUsize,
    // Per-second tracking
    polls_this_sec: AtomicU64,
    polls_per_sec: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            decode_errors_total: AtomicU64::new(0),
            refusals_total: AtomicU64::new(0),
            events_total: AtomicU64::new(0),
            unhandled_events_total: AtomicU64::new(0),
            event_acks_total: AtomicU64::new(0),
            long_running_completions: AtomicU64::new(0),
            long_running_timeouts: AtomicU64::new(0),
            offline_transitions: AtomicU64::new(0),
            online_transitions: AtomicU64::new(0),
            endpoints_online: AtomicUsize::new(0),
            polls_this_sec: AtomicU64::new(0),
            polls_per_sec: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.polls_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refusal(&self) {
        self.refusals_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhandled_event(&self) {
        self.unhandled_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_ack(&self) {
        self.event_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_long_running_completion(&self) {
        self.long_running_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_long_running_timeout(&self) {
        self.long_running_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline(&self) {
        self.offline_transitions.fetch_add(1, Ordering::Relaxed);
        let current = self.endpoints_online.load(Ordering::Relaxed);
        if current > 0 {
            self.endpoints_online.store(current - 1, Ordering::Relaxed);
        }
    }

    pub fn record_online(&self) {
        self.online_transitions.fetch_add(1, Ordering::Relaxed);
        self.endpoints_online.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once a second to refresh the polls-per-second gauge.
    pub fn rollup(&self) {
        let per_sec = self.polls_this_sec.swap(0, Ordering::Relaxed);
        self.polls_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn polls_per_sec(&self) -> u64 {
        self.polls_per_sec.load(Ordering::Relaxed)
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn timeouts_total(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    pub fn decode_errors_total(&self) -> u64 {
        self.decode_errors_total.load(Ordering::Relaxed)
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn unhandled_events_total(&self) -> u64 {
        self.unhandled_events_total.load(Ordering::Relaxed)
    }

    pub fn offline_transitions(&self) -> u64 {
        self.offline_transitions.load(Ordering::Relaxed)
    }

    pub fn endpoints_online(&self) -> usize {
        self.endpoints_online.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "polls/s={} requests={} timeouts={} decode_errors={} events={} unhandled={} online={}",
            self.polls_per_sec(),
            self.requests_total(),
            self.timeouts_total(),
            self.decode_errors_total(),
            self.events_total(),
            self.unhandled_events_total(),
            self.endpoints_online(),
        )
    }
}
