use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use simulator::clock::{from_epoch_seconds, Clock};
use simulator::fleet::{build_fleet, Device, FleetSpec, SendInterval, TemperatureUnit, MAX_FLEET_SIZE};
use simulator::scheduler::{ReconnectPolicy, Scheduler, SchedulerConfig};
use simulator::sink::{Sink, SinkError, SinkResult};
use simulator::telemetry::{Field, KeyNames, Payload, PayloadEncoder, TimestampMode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const START: f64 = 1_700_000_000.0;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Send { key: String, payload: Payload },
    Reconnect,
    Close,
}

#[derive(Clone)]
struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    fn advance(&self, seconds: f64) {
        *self.now.lock().unwrap() += seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_epoch_seconds(self.epoch_seconds()).expect("manual clock within chrono range")
    }

    fn epoch_seconds(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}

type Failure = Box<dyn FnMut(usize, &str) -> Option<SinkError> + Send>;

/// Records every call; `fail` decides per send (by call index) whether to
/// return an error instead.
struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
    sends: usize,
    fail: Failure,
    reconnect_failures: usize,
    on_send: Option<(usize, oneshot::Sender<()>)>,
}

impl RecordingSink {
    fn new(events: Arc<Mutex<Vec<Event>>>) -> Self {
        Self {
            events,
            sends: 0,
            fail: Box::new(|_, _| None),
            reconnect_failures: 0,
            on_send: None,
        }
    }

    fn failing(mut self, fail: impl FnMut(usize, &str) -> Option<SinkError> + Send + 'static) -> Self {
        self.fail = Box::new(fail);
        self
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn destination(&self, key: &str) -> String {
        format!("memory/{}", key)
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        let call = self.sends;
        self.sends += 1;
        if let Some(err) = (self.fail)(call, key) {
            return Err(err);
        }
        self.events.lock().unwrap().push(Event::Send {
            key: key.to_string(),
            payload: payload.clone(),
        });

        if matches!(self.on_send, Some((at, _)) if at == call) {
            if let Some((_, tx)) = self.on_send.take() {
                let _ = tx.send(());
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        self.events.lock().unwrap().push(Event::Reconnect);
        if self.reconnect_failures > 0 {
            self.reconnect_failures -= 1;
            return Err(SinkError::Connection("still down".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.events.lock().unwrap().push(Event::Close);
        Ok(())
    }
}

fn fleet(size: usize, interval: &SendInterval) -> Vec<Device> {
    let spec = FleetSpec {
        size,
        seed: "test-seed",
        locations: None,
        unit: TemperatureUnit::Celsius,
    };
    build_fleet(&spec, interval, START, &mut StdRng::seed_from_u64(7)).unwrap()
}

fn encoder() -> PayloadEncoder {
    PayloadEncoder::new(
        KeyNames::default(),
        TimestampMode::EpochMillis,
        vec![Field::Temperature, Field::SerialNumber, Field::Location],
    )
    .unwrap()
}

fn config(interval: SendInterval) -> SchedulerConfig {
    SchedulerConfig {
        pause: Duration::from_millis(1),
        failure_backoff: Duration::from_millis(1),
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
            ..ReconnectPolicy::default()
        },
        ..SchedulerConfig::new(interval)
    }
}

fn scheduler(
    size: usize,
    sink: RecordingSink,
    clock: ManualClock,
) -> Scheduler<RecordingSink, ManualClock> {
    let interval = SendInterval::new(100, 200).unwrap();
    Scheduler::new(fleet(size, &interval), sink, clock, encoder(), config(interval))
        .unwrap()
        .with_rng(StdRng::seed_from_u64(42))
}

fn sent_keys(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Send { key, .. } => Some(key.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_steady_state_sends_every_due_device_in_id_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let mut scheduler = scheduler(3, RecordingSink::new(events.clone()), clock.clone());
    let serials: Vec<String> = scheduler
        .fleet()
        .iter()
        .map(|d| d.serial_number.clone())
        .collect();

    for _ in 0..10 {
        clock.advance(0.2);
        let before = events.lock().unwrap().len();
        let report = scheduler.sweep().await;
        assert_eq!(report.failed, 0);

        let swept = sent_keys(&events.lock().unwrap()[before..]);
        let mut expected: Vec<String> = serials
            .iter()
            .filter(|s| swept.contains(s))
            .cloned()
            .collect();
        expected.dedup();
        assert_eq!(swept, expected, "sends within a sweep follow ascending id");
    }

    for device in scheduler.fleet() {
        assert!((3..=10).contains(&device.sent), "device {} sent {}", device.id, device.sent);
        assert!(device.next_send_at > START + 2.0);
    }
}

#[tokio::test]
async fn test_temperature_walk_moves_in_small_steps() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let mut scheduler = scheduler(1, RecordingSink::new(events.clone()), clock.clone());

    for _ in 0..20 {
        clock.advance(0.2);
        scheduler.sweep().await;
    }

    let temperatures: Vec<f64> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Send { payload, .. } => payload.get(Field::Temperature).and_then(|v| v.as_f64()),
            _ => None,
        })
        .collect();
    assert_eq!(temperatures.len(), 20);
    for pair in temperatures.windows(2) {
        assert!((pair[1] - pair[0]).abs() < 0.1, "{:?}", pair);
    }
}

#[tokio::test]
async fn test_rejected_send_keeps_deadline_and_isolates_device() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let interval = SendInterval::new(100, 200).unwrap();
    let devices = fleet(3, &interval);
    let failing_serial = devices[0].serial_number.clone();

    let mut attempts = 0;
    let sink = RecordingSink::new(events.clone()).failing(move |_, key| {
        if key != failing_serial {
            return None;
        }
        attempts += 1;
        (attempts == 2).then(|| SinkError::Rejected("schema mismatch".to_string()))
    });
    let mut scheduler = Scheduler::new(devices, sink, clock.clone(), encoder(), config(interval))
        .unwrap()
        .with_rng(StdRng::seed_from_u64(1));

    clock.advance(0.2);
    let first = scheduler.sweep().await;
    assert_eq!(first.sent, 3);

    clock.advance(0.2);
    let deadline = scheduler.fleet()[0].next_send_at;
    let others_before: Vec<u64> = scheduler.fleet()[1..].iter().map(|d| d.sent).collect();
    let second = scheduler.sweep().await;

    assert_eq!(second.failed, 1);
    assert!(!second.interrupted);
    assert_eq!(scheduler.fleet()[0].next_send_at, deadline);
    assert_eq!(scheduler.fleet()[0].consecutive_failures, 1);
    assert_eq!(scheduler.fleet()[0].sent, 1);
    for (device, before) in scheduler.fleet()[1..].iter().zip(others_before) {
        assert_eq!(device.sent, before + 1);
    }

    // Still due, so the next pass retries it.
    clock.advance(0.2);
    let third = scheduler.sweep().await;
    assert_eq!(third.failed, 0);
    assert_eq!(scheduler.fleet()[0].sent, 2);
    assert_eq!(scheduler.fleet()[0].consecutive_failures, 0);
}

#[tokio::test]
async fn test_connection_error_ends_sweep_and_reconnects() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let mut sink = RecordingSink::new(events.clone())
        .failing(|call, _| (call == 0).then(|| SinkError::Connection("broker gone".to_string())));
    sink.reconnect_failures = 2;
    let mut scheduler = scheduler(3, sink, clock.clone());

    clock.advance(0.2);
    let report = scheduler.sweep().await;
    assert!(report.interrupted);
    assert!(report.reconnected);
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 1);

    let reconnects = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == Event::Reconnect)
        .count();
    assert_eq!(reconnects, 3);

    clock.advance(0.2);
    let report = scheduler.sweep().await;
    assert_eq!(report.sent, 3);
}

#[tokio::test]
async fn test_exhausted_reconnect_is_not_fatal() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let mut sink = RecordingSink::new(events.clone())
        .failing(|call, _| (call < 2).then(|| SinkError::Connection("refused".to_string())));
    sink.reconnect_failures = usize::MAX;
    let mut scheduler = scheduler(2, sink, clock.clone());

    clock.advance(0.2);
    let report = scheduler.sweep().await;
    assert!(report.interrupted);
    assert!(!report.reconnected);

    // The failing calls run out; the fleet recovers on its own.
    clock.advance(0.2);
    scheduler.sweep().await;
    clock.advance(0.2);
    let report = scheduler.sweep().await;
    assert_eq!(report.sent, 2);
}

#[tokio::test]
async fn test_interrupt_closes_sink_once_and_stops_sending() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START + 1.0);
    let (tx, rx) = oneshot::channel();
    let mut sink = RecordingSink::new(events.clone());
    sink.on_send = Some((1, tx));
    let scheduler = scheduler(3, sink, clock);

    let summary = scheduler
        .run(async {
            let _ = rx.await;
        })
        .await;
    assert_eq!(summary.sweeps, 0);

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == Event::Close).count(), 1);
    assert_eq!(events.last(), Some(&Event::Close));
    assert_eq!(sent_keys(&events).len(), 2);
}

#[tokio::test]
async fn test_run_stops_between_sweeps() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START + 1.0);
    let scheduler = scheduler(2, RecordingSink::new(events.clone()), clock);

    let summary = scheduler
        .run(tokio::time::sleep(Duration::from_millis(30)))
        .await;
    assert!(summary.sweeps >= 1);
    assert_eq!(summary.sent, 2);

    let events = events.lock().unwrap();
    assert_eq!(events.iter().filter(|e| **e == Event::Close).count(), 1);
    assert_eq!(events.last(), Some(&Event::Close));
}

#[test]
fn test_fleet_is_capped_and_deterministic() {
    let interval = SendInterval::new(100, 200).unwrap();
    let first = fleet(40, &interval);
    let second = fleet(40, &interval);
    assert_eq!(first.len(), MAX_FLEET_SIZE);

    let serials = |f: &[Device]| f.iter().map(|d| d.serial_number.clone()).collect::<Vec<_>>();
    assert_eq!(serials(&first), serials(&second));
    assert_eq!(first[0].serial_number, "e5e1988fc965");
}

#[test]
fn test_nan_temperature_bound_is_rejected_before_the_loop() {
    let interval = SendInterval::new(100, 200).unwrap();
    let sink = RecordingSink::new(Arc::new(Mutex::new(Vec::new())));
    let config = SchedulerConfig {
        temperature_bounds: Some((f64::NAN, f64::INFINITY)),
        ..config(interval)
    };
    let result = Scheduler::new(fleet(2, &interval), sink, ManualClock::new(START), encoder(), config);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_clamped_walk_stays_within_bounds() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let clock = ManualClock::new(START);
    let interval = SendInterval::new(100, 200).unwrap();
    let config = SchedulerConfig {
        temperature_bounds: Some((-5.0, -4.0)),
        ..config(interval)
    };
    let mut scheduler = Scheduler::new(
        fleet(2, &interval),
        RecordingSink::new(events.clone()),
        clock.clone(),
        encoder(),
        config,
    )
    .unwrap();

    for _ in 0..5 {
        clock.advance(0.2);
        scheduler.sweep().await;
    }
    for device in scheduler.fleet() {
        assert!((-5.0..=-4.0).contains(&device.temperature), "{}", device.temperature);
    }
}
