//! Single-threaded cooperative scheduler driving the fleet.
//!
//! Each sweep visits devices in ascending id. A due device gets a new
//! reading, its payload goes to the sink, and only a successful send moves
//! its deadline. A connection failure ends the sweep and runs the reconnect
//! backoff before the next one.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::{Error, Result};
use crate::fleet::{round4, Device, SendInterval};
use crate::metrics::{MESSAGES_SENT_TOTAL, RECONNECTS_TOTAL, SEND_FAILURES_TOTAL, SWEEP_DURATION_SECONDS};
use crate::sink::Sink;
use crate::telemetry::PayloadEncoder;

pub const DEFAULT_STEP_SIGMA: f64 = 0.01;
pub const DEFAULT_PAUSE: Duration = Duration::from_millis(50);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

const PROGRESS_EVERY_SWEEPS: u64 = 1200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(5),
            max_attempts: 12,
        }
    }
}

/// Retry state of the sink link.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            delay: policy.initial_delay.min(policy.max_delay),
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.delay;
        self.attempt += 1;
        self.delay = (self.delay * self.policy.factor).min(self.policy.max_delay);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: SendInterval,
    /// Standard deviation of the per-send temperature step.
    pub step_sigma: f64,
    /// Pause after a clean sweep.
    pub pause: Duration,
    /// Pause after a sweep with at least one failed send.
    pub failure_backoff: Duration,
    pub reconnect: ReconnectPolicy,
    /// Optional `(min, max)` clamp for the random walk.
    pub temperature_bounds: Option<(f64, f64)>,
}

impl SchedulerConfig {
    pub fn new(interval: SendInterval) -> Self {
        Self {
            interval,
            step_sigma: DEFAULT_STEP_SIGMA,
            pause: DEFAULT_PAUSE,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            reconnect: ReconnectPolicy::default(),
            temperature_bounds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub sent: usize,
    pub failed: usize,
    /// A connection failure cut the sweep short.
    pub interrupted: bool,
    /// The sink came back after a connection failure.
    pub reconnected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sweeps: u64,
    pub sent: u64,
    pub failed: u64,
}

impl RunSummary {
    fn record(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.sent += report.sent as u64;
        self.failed += report.failed as u64;
    }
}

pub struct Scheduler<S, C = SystemClock> {
    fleet: Vec<Device>,
    sink: S,
    clock: C,
    encoder: PayloadEncoder,
    config: SchedulerConfig,
    step: Normal<f64>,
    rng: StdRng,
    backoff: Backoff,
}

impl<S: Sink, C: Clock> Scheduler<S, C> {
    pub fn new(
        fleet: Vec<Device>,
        sink: S,
        clock: C,
        encoder: PayloadEncoder,
        config: SchedulerConfig,
    ) -> Result<Self> {
        if let Some((low, high)) = config.temperature_bounds {
            if low.is_nan() || high.is_nan() || low > high {
                return Err(Error::Config(format!(
                    "invalid temperature bounds [{}, {}]",
                    low, high
                )));
            }
        }
        let step = Normal::new(0.0, config.step_sigma)?;
        Ok(Self {
            fleet,
            sink,
            clock,
            encoder,
            backoff: Backoff::new(config.reconnect),
            config,
            step,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn fleet(&self) -> &[Device] {
        &self.fleet
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn advance_temperature(&mut self, index: usize) {
        let delta = round4(self.step.sample(&mut self.rng));
        let device = &mut self.fleet[index];
        let mut temperature = round4(device.temperature + delta);
        if let Some((low, high)) = self.config.temperature_bounds {
            temperature = temperature.clamp(low, high);
        }
        device.temperature = temperature;
    }

    /// One pass over the fleet.
    pub async fn sweep(&mut self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        for index in 0..self.fleet.len() {
            if !self.fleet[index].is_due(self.clock.epoch_seconds()) {
                continue;
            }
            report.due += 1;

            self.advance_temperature(index);
            let device = &self.fleet[index];
            let payload = self.encoder.encode(device, self.clock.now());
            let (id, serial) = (device.id, device.serial_number.clone());

            match self.sink.send(&serial, &payload).await {
                Ok(()) => {
                    let next = self
                        .config
                        .interval
                        .next_deadline(self.clock.epoch_seconds(), &mut self.rng);
                    let device = &mut self.fleet[index];
                    device.next_send_at = next;
                    device.sent += 1;
                    device.consecutive_failures = 0;

                    report.sent += 1;
                    MESSAGES_SENT_TOTAL.inc();
                    info!(
                        "Sent message from device {} ({}) to {}: {}",
                        id,
                        serial,
                        self.sink.destination(&serial),
                        payload
                    );
                }
                Err(e) => {
                    self.fleet[index].consecutive_failures += 1;
                    report.failed += 1;
                    SEND_FAILURES_TOTAL.inc();
                    error!(
                        "Error when sending message from device {} ({}) to {}: {} | {}",
                        id,
                        serial,
                        self.sink.destination(&serial),
                        payload,
                        e
                    );

                    if e.is_connection() {
                        report.interrupted = true;
                        report.reconnected = self.recover().await;
                        break;
                    }
                }
            }
        }

        SWEEP_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        report
    }

    /// Reconnects the sink with exponential backoff. Never fails; exhaustion
    /// is logged and the next connection error starts over.
    async fn recover(&mut self) -> bool {
        self.backoff.reset();
        while let Some(delay) = self.backoff.next_delay() {
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                self.backoff.attempts(),
                self.config.reconnect.max_attempts
            );
            tokio::time::sleep(delay).await;
            RECONNECTS_TOTAL.inc();

            match self.sink.reconnect().await {
                Ok(()) => {
                    info!("Reconnected successfully");
                    self.backoff.reset();
                    return true;
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", self.backoff.attempts(), e),
            }
        }

        error!(
            "Reconnect failed after {} attempts, will retry on the next connection error",
            self.backoff.attempts()
        );
        false
    }

    /// Sweeps until `shutdown` resolves, then closes the sink exactly once.
    pub async fn run<F>(mut self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();
        info!(
            "Scheduling {} devices every {}-{}ms",
            self.fleet.len(),
            self.config.interval.min_ms(),
            self.config.interval.max_ms()
        );

        loop {
            let report = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                report = self.sweep() => report,
            };
            summary.record(&report);

            if summary.sweeps % PROGRESS_EVERY_SWEEPS == 0 {
                info!(
                    "Published {} messages ({} failed) over {} sweeps",
                    summary.sent, summary.failed, summary.sweeps
                );
            }

            let pause = if report.failed > 0 {
                self.config.failure_backoff
            } else {
                self.config.pause
            };
            debug!("Sweep done: {:?}, pausing {:?}", report, pause);

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Shutdown requested, closing sink");
        if let Err(e) = self.sink.close().await {
            error!("Failed to close sink cleanly: {}", e);
        }
        summary
    }
}
