use crate::config::RetrySettings;
use crate::models::Campaign;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One in-flight delivery attempt awaiting (re)delivery.
///
/// A task is either being attempted by exactly one worker or sitting in the
/// pending queue, never both. `retry_count` only ever grows.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub id: u64,
    pub campaign: Campaign,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub retry_count: u32,
}

/// Outcome of asking the scheduler to queue another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// Re-enqueued; the attempt will run after this delay.
    Scheduled(Duration),
    /// The task was cancelled by an operator while the attempt was in
    /// flight. Not an error; the caller records the terminal outcome.
    Cancelled,
    /// Admission control: the queue is at capacity.
    QueueFull,
    /// `now - started_at + delay` would pass the maximum retry window.
    HorizonExceeded,
    /// `retry_count` reached the maximum.
    Exhausted,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AgeBucket {
    pub label: &'static str,
    pub count: usize,
}

/// Point-in-time queue snapshot for the operational surface.
#[derive(Debug, Serialize)]
pub struct RetryStats {
    pub total_pending: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub newest_pending_at: Option<DateTime<Utc>>,
    pub age_histogram: Vec<AgeBucket>,
}

const AGE_BUCKETS: &[(&str, u64)] = &[
    ("under_1m", 60),
    ("1m_to_5m", 300),
    ("5m_to_15m", 900),
    ("over_15m", u64::MAX),
];

struct Inner {
    /// Pending tasks ordered by due time; the id disambiguates equal instants.
    pending: BTreeMap<(Instant, u64), RetryTask>,
    /// Tasks currently being attempted; the flag marks operator cancellation.
    in_flight: HashMap<u64, bool>,
    next_id: u64,
}

/// Time-ordered queue of pending redelivery attempts with bounded capacity
/// and a bounded total retry horizon. All mutations happen under one lock;
/// the lock is never held across a network call.
pub struct RetryQueue {
    cfg: RetrySettings,
    inner: Mutex<Inner>,
}

impl RetryQueue {
    pub fn new(cfg: RetrySettings) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                in_flight: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.cfg
    }

    /// Creates the task for a first attempt and marks it in flight.
    pub fn register(&self, campaign: Campaign) -> RetryTask {
        let mut inner = self.inner.lock().expect("retry queue lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.in_flight.insert(id, false);
        RetryTask {
            id,
            campaign,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            retry_count: 0,
        }
    }

    /// Marks a task terminal (success or abort) and forgets it.
    pub fn complete(&self, id: u64) {
        let mut inner = self.inner.lock().expect("retry queue lock poisoned");
        inner.in_flight.remove(&id);
    }

    /// Queues the next attempt for a task whose send just failed transiently.
    ///
    /// The delay is `min(min_delay * 2^retry_count, max_delay)`, raised to any
    /// classifier hint, then jittered within ±`jitter_range` and floored at
    /// the minimum delay. Terminal variants mean the task was dropped and the
    /// caller must record a final failure.
    pub fn reschedule(&self, task: RetryTask, hint: Option<Duration>) -> ScheduleResult {
        let mut inner = self.inner.lock().expect("retry queue lock poisoned");

        if inner.in_flight.remove(&task.id) == Some(true) {
            debug!(task_id = task.id, "Task cancelled while in flight; not rescheduling");
            return ScheduleResult::Cancelled;
        }

        let now = Instant::now();
        let base = self.backoff_delay(task.retry_count);
        let base = hint.map_or(base, |h| h.max(base));
        let delay = self.apply_jitter(base);

        if now.duration_since(task.started_at) + delay > self.cfg.max_retry_window() {
            info!(
                task_id = task.id,
                campaign_guid = %task.campaign.campaign_guid,
                "Maximum retry window exceeded; dropping task"
            );
            return ScheduleResult::HorizonExceeded;
        }

        if task.retry_count >= self.cfg.max_retries {
            info!(
                task_id = task.id,
                campaign_guid = %task.campaign.campaign_guid,
                retries = task.retry_count,
                "Retries exhausted; dropping task"
            );
            return ScheduleResult::Exhausted;
        }

        if inner.pending.len() >= self.cfg.queue_capacity {
            return ScheduleResult::QueueFull;
        }

        let mut task = task;
        task.retry_count += 1;
        inner.pending.insert((now + delay, task.id), task);
        ScheduleResult::Scheduled(delay)
    }

    /// Removes every due task and marks it in flight. Called only by the
    /// sweeper, which never overlaps itself.
    pub fn take_due(&self) -> Vec<RetryTask> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("retry queue lock poisoned");

        let due_keys: Vec<(Instant, u64)> = inner
            .pending
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(task) = inner.pending.remove(&key) {
                inner.in_flight.insert(task.id, false);
                due.push(task);
            }
        }
        due
    }

    /// Cancels pending retries: the `count` oldest (by first-attempt time) or
    /// all when `count` is `None`. Cancelling everything also flags in-flight
    /// tasks so their reschedule becomes a no-op; the sends themselves are
    /// never interrupted. Returns the number of queued tasks removed.
    pub fn cancel(&self, count: Option<usize>) -> usize {
        let mut inner = self.inner.lock().expect("retry queue lock poisoned");

        let mut keys: Vec<((Instant, u64), Instant)> = inner
            .pending
            .iter()
            .map(|(key, task)| (*key, task.started_at))
            .collect();
        keys.sort_by_key(|(_, started_at)| *started_at);

        let n = count.unwrap_or(keys.len()).min(keys.len());
        for (key, _) in keys.into_iter().take(n) {
            inner.pending.remove(&key);
        }

        if count.is_none() {
            for cancelled in inner.in_flight.values_mut() {
                *cancelled = true;
            }
        }

        info!(cancelled = n, "Cancelled pending retries");
        n
    }

    pub fn stats(&self) -> RetryStats {
        let inner = self.inner.lock().expect("retry queue lock poisoned");
        let now = Utc::now();

        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;
        let mut counts = [0usize; AGE_BUCKETS.len()];

        for task in inner.pending.values() {
            let started = task.started_wall;
            oldest = Some(oldest.map_or(started, |o| o.min(started)));
            newest = Some(newest.map_or(started, |n| n.max(started)));

            let age_secs = (now - started).num_seconds().max(0) as u64;
            let bucket = AGE_BUCKETS
                .iter()
                .position(|(_, limit)| age_secs < *limit)
                .unwrap_or(AGE_BUCKETS.len() - 1);
            counts[bucket] += 1;
        }

        RetryStats {
            total_pending: inner.pending.len(),
            oldest_pending_at: oldest,
            newest_pending_at: newest,
            age_histogram: AGE_BUCKETS
                .iter()
                .zip(counts)
                .map(|((label, _), count)| AgeBucket { label, count })
                .collect(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("retry queue lock poisoned").pending.len()
    }

    /// Exponential backoff before jitter: `min_delay * 2^retry_count`,
    /// capped at `max_delay`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let delay = self
            .cfg
            .min_delay()
            .saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.cfg.max_delay())
    }

    /// `delay ± uniform(delay * jitter_range)`, floored at the minimum delay.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        let secs = delay.as_secs_f64();
        let unit = rand::thread_rng().gen::<f64>(); // [0, 1)
        let jitter = secs * self.cfg.jitter_range * (2.0 * unit - 1.0);
        Duration::from_secs_f64((secs + jitter).max(self.cfg.min_delay().as_secs_f64()))
    }
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CampaignType, DeviceType};
    use serde_json::json;

    fn settings() -> RetrySettings {
        RetrySettings {
            min_delay_secs: 10,
            max_delay_secs: 60,
            max_retries: 5,
            max_retry_window_secs: 3600,
            jitter_range: 0.5,
            queue_capacity: 3,
            sweep_interval_secs: 1,
            rate_limit_delay_secs: 60,
        }
    }

    fn campaign(guid: &str) -> Campaign {
        Campaign {
            campaign_guid: guid.to_string(),
            token: "tok".to_string(),
            device_type: DeviceType::Android,
            campaign_type: CampaignType::Push,
            credentials: Default::default(),
            payload: json!({}),
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn backoff_is_non_decreasing_until_capped() {
        let queue = RetryQueue::new(settings());
        let mut last = Duration::ZERO;
        for count in 0..10 {
            let delay = queue.backoff_delay(count);
            assert!(delay >= last, "delay shrank at retry {}", count);
            assert!(delay <= Duration::from_secs(60));
            last = delay;
        }
        assert_eq!(queue.backoff_delay(0), Duration::from_secs(10));
        assert_eq!(queue.backoff_delay(1), Duration::from_secs(20));
        assert_eq!(queue.backoff_delay(2), Duration::from_secs(40));
        assert_eq!(queue.backoff_delay(3), Duration::from_secs(60));
        assert_eq!(queue.backoff_delay(9), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_delay_stays_within_bounds() {
        let queue = RetryQueue::new(settings());
        for _ in 0..100 {
            let task = queue.register(campaign("g"));
            match queue.reschedule(task, None) {
                ScheduleResult::Scheduled(delay) => {
                    // 10s base ±50%, floored at the minimum delay.
                    assert!(delay >= Duration::from_secs(10), "delay below floor: {:?}", delay);
                    assert!(delay <= Duration::from_secs(15), "delay above cap: {:?}", delay);
                }
                other => panic!("unexpected schedule result: {:?}", other),
            }
            queue.cancel(None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_hint_raises_the_delay() {
        let mut cfg = settings();
        cfg.jitter_range = 0.0;
        let queue = RetryQueue::new(cfg);

        let task = queue.register(campaign("g"));
        let result = queue.reschedule(task, Some(Duration::from_secs(45)));
        assert_eq!(result, ScheduleResult::Scheduled(Duration::from_secs(45)));

        // A hint below the curve is ignored in favor of the backoff delay.
        let task = queue.register(campaign("g2"));
        let result = queue.reschedule(task, Some(Duration::from_secs(2)));
        assert_eq!(result, ScheduleResult::Scheduled(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn insertion_fails_deterministically_at_capacity() {
        let queue = RetryQueue::new(settings());
        for _ in 0..3 {
            let task = queue.register(campaign("g"));
            assert!(matches!(
                queue.reschedule(task, None),
                ScheduleResult::Scheduled(_)
            ));
        }
        assert_eq!(queue.pending_len(), 3);

        let task = queue.register(campaign("overflow"));
        assert_eq!(queue.reschedule(task, None), ScheduleResult::QueueFull);
        assert_eq!(queue.pending_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn horizon_breach_drops_the_task() {
        let queue = RetryQueue::new(settings());
        let task = queue.register(campaign("g"));
        tokio::time::advance(Duration::from_secs(3595)).await;
        // Any proposed delay now lands past the 3600s window.
        assert_eq!(queue.reschedule(task, None), ScheduleResult::HorizonExceeded);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_stops_rescheduling() {
        let queue = RetryQueue::new(settings());
        let mut task = queue.register(campaign("g"));
        task.retry_count = 5;
        assert_eq!(queue.reschedule(task, None), ScheduleResult::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn due_tasks_are_removed_exactly_once() {
        let mut cfg = settings();
        cfg.jitter_range = 0.0;
        let queue = RetryQueue::new(cfg);

        let task = queue.register(campaign("g"));
        let id = task.id;
        queue.reschedule(task, None);

        assert!(queue.take_due().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let due = queue.take_due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].retry_count, 1);

        // Not in the queue while the attempt is outstanding.
        assert!(queue.take_due().is_empty());
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_oldest_first_and_reports_the_count() {
        let mut cfg = settings();
        cfg.jitter_range = 0.0;
        cfg.queue_capacity = 10;
        let queue = RetryQueue::new(cfg);

        let first = queue.register(campaign("oldest"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = queue.register(campaign("middle"));
        tokio::time::advance(Duration::from_secs(1)).await;
        let third = queue.register(campaign("newest"));

        // Reschedule out of age order to prove cancellation uses age, not
        // due time.
        queue.reschedule(third, None);
        queue.reschedule(first, Some(Duration::from_secs(50)));
        queue.reschedule(second, None);
        assert_eq!(queue.pending_len(), 3);

        assert_eq!(queue.cancel(Some(2)), 2);
        assert_eq!(queue.pending_len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        let remaining = queue.take_due();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].campaign.campaign_guid, "newest");

        // Cancelling more than exist reports only what was removed.
        assert_eq!(queue.cancel(Some(5)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_makes_inflight_reschedule_a_noop() {
        let queue = RetryQueue::new(settings());
        let task = queue.register(campaign("g"));
        assert_eq!(queue.cancel(None), 0);
        assert_eq!(queue.reschedule(task, None), ScheduleResult::Cancelled);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_queue_contents() {
        let mut cfg = settings();
        cfg.queue_capacity = 10;
        let queue = RetryQueue::new(cfg);

        let empty = queue.stats();
        assert_eq!(empty.total_pending, 0);
        assert!(empty.oldest_pending_at.is_none());

        for i in 0..4 {
            let task = queue.register(campaign(&format!("g{}", i)));
            queue.reschedule(task, None);
        }

        let stats = queue.stats();
        assert_eq!(stats.total_pending, 4);
        assert!(stats.oldest_pending_at.is_some());
        assert!(stats.oldest_pending_at <= stats.newest_pending_at);
        let total: usize = stats.age_histogram.iter().map(|b| b.count).sum();
        assert_eq!(total, 4);
    }
}
