//! PeriodicRunner - ジッター付き・非オーバーラップの周期実行
//!
//! # 動作
//! 1. 最初の tick は [0, period) の一様乱数だけ遅らせる（全 instance の同時起動を散らす）
//! 2. 以降は drift しない interval で tick（遅れた tick はまとめず Skip）
//! 3. body が返るまで次の tick は始まらない
//! 4. body のエラー / panic は記録して次の tick へ。ループは決して落ちない
//! 5. period は `watch` で差し替え可能。変わったら次の tick から新しい間隔になる

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::{Result, WardenError};
use crate::ports::Clock;

/// interval は 0 を受け付けない
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// The work executed on every tick.
#[async_trait]
pub trait PeriodicBody: Send + Sync + 'static {
    async fn run(&self, token: CancellationToken) -> Result<()>;
}

/// Health of one runner, as last observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunnerState {
    pub last_tick_time: Option<DateTime<Utc>>,
    pub tick_count: u64,
    pub is_failing: bool,
    pub last_error: Option<String>,
}

/// 固定周期で body を回すループ。周期は watch チャネル経由で実行中に変わる
pub struct PeriodicRunner {
    name: String,
    period: watch::Receiver<Duration>,
    clock: Arc<dyn Clock>,
    state: Mutex<RunnerState>,
}

impl PeriodicRunner {
    pub fn new(
        name: impl Into<String>,
        period: watch::Receiver<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            clock,
            state: Mutex::new(RunnerState::default()),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_period(&self) -> Duration {
        (*self.period.borrow()).max(MIN_PERIOD)
    }

    /// Ticks until `token` is cancelled.
    pub async fn run(&self, body: Arc<dyn PeriodicBody>, token: CancellationToken) {
        let mut period = self.current_period();
        let jitter = initial_jitter(period);
        debug!(runner = %self.name, ?period, ?jitter, "delaying first tick");

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(jitter) => {}
        }

        let mut ticker = new_ticker(Instant::now(), period);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.run_body(&body, &token).await;

            let latest = self.current_period();
            if latest != period {
                info!(runner = %self.name, old = ?period, new = ?latest, "period changed, rescheduling");
                period = latest;
                ticker = new_ticker(Instant::now() + period, period);
            }
        }
        info!(runner = %self.name, "periodic runner stopped");
    }

    /// body を別タスクで 1 回実行する（panic はここで止める）
    async fn run_body(&self, body: &Arc<dyn PeriodicBody>, token: &CancellationToken) {
        let started = self.clock.now();
        let handle = tokio::spawn({
            let body = Arc::clone(body);
            let token = token.child_token();
            async move { body.run(token).await }
        });
        let outcome = handle.await;

        let mut state = self.lock_state();
        state.tick_count += 1;
        state.last_tick_time = Some(started);
        match outcome {
            Ok(Ok(())) => {
                state.is_failing = false;
                state.last_error = None;
            }
            Ok(Err(WardenError::Cancelled)) => {}
            Ok(Err(err)) => {
                error!(runner = %self.name, error = %err, "periodic body failed");
                state.is_failing = true;
                state.last_error = Some(err.to_string());
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                error!(runner = %self.name, panic = %message, "periodic body panicked");
                state.is_failing = true;
                state.last_error = Some(format!("panic: {message}"));
            }
            Err(_) => {}
        }
    }
}

fn initial_jitter(period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..period)
}

fn new_ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
