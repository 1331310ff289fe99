use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use triplecast::{
    CastEngine, CastEngineConfig, ConjunctivePattern, DeliveryEngineConfig, DeliveryError, Fact,
    MatchEvent, Qos, RetryPolicy, TargetDescriptor, Template, Term, TermPattern, Transport, vocab,
};

const WAIT: Duration = Duration::from_secs(5);

/// Fails the first `fail_first` attempts, then delivers into a log.
struct FlakyTransport {
    fail_first: u64,
    attempts: AtomicU64,
    delivered: Mutex<Vec<(String, u64)>>,
}

impl FlakyTransport {
    fn new(fail_first: u64) -> Self {
        Self {
            fail_first,
            attempts: AtomicU64::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    fn deliver(&self, target: &TargetDescriptor, event: &MatchEvent) -> Result<(), DeliveryError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(DeliveryError::Failed {
                target: target.to_string(),
                reason: "transient outage".to_string(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((target.to_string(), event.seq));
        Ok(())
    }
}

fn engine_with(transport: Arc<FlakyTransport>) -> CastEngine {
    let cfg = CastEngineConfig {
        delivery: DeliveryEngineConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
            },
            ..DeliveryEngineConfig::default()
        },
        ..CastEngineConfig::default()
    };
    CastEngine::new(cfg, transport)
}

fn severity_pattern() -> ConjunctivePattern {
    ConjunctivePattern::new(vec![Template::new(
        TermPattern::var("e"),
        TermPattern::value(vocab::iri(vocab::SEVERITY)),
        TermPattern::var("s"),
    )])
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn at_least_once_survives_transient_transport_outage() {
    let transport = Arc::new(FlakyTransport::new(3));
    let engine = engine_with(Arc::clone(&transport));
    engine
        .register(severity_pattern(), vec!["cb:alo".into()], Qos::at_least_once())
        .unwrap();

    engine
        .insert(vec![Fact::new(
            "data:exploit/1",
            vocab::SEVERITY,
            Term::literal("critical"),
        )])
        .unwrap();

    assert!(wait_until(WAIT, || engine.stats().delivered == 1));
    assert_eq!(transport.attempts(), 4);
    assert_eq!(engine.stats().failed_attempts, 3);
    let delivered = transport.delivered.lock().unwrap();
    assert_eq!(*delivered, vec![("cb:alo".to_string(), 1)]);
}

#[test]
fn best_effort_gives_up_after_one_attempt() {
    let transport = Arc::new(FlakyTransport::new(u64::MAX));
    let engine = engine_with(Arc::clone(&transport));
    engine
        .register(severity_pattern(), vec!["cb:be".into()], Qos::best_effort())
        .unwrap();

    engine
        .insert(vec![Fact::new(
            "data:exploit/2",
            vocab::SEVERITY,
            Term::literal("high"),
        )])
        .unwrap();

    assert!(wait_until(WAIT, || engine.stats().abandoned == 1));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(transport.attempts(), 1);
    assert_eq!(engine.stats().delivered, 0);
}

#[test]
fn unregister_cancels_inflight_retries() {
    let transport = Arc::new(FlakyTransport::new(u64::MAX));
    let engine = engine_with(Arc::clone(&transport));
    let id = engine
        .register(severity_pattern(), vec!["cb:gone".into()], Qos::at_least_once())
        .unwrap();

    engine
        .insert(vec![Fact::new(
            "data:exploit/3",
            vocab::SEVERITY,
            Term::literal("critical"),
        )])
        .unwrap();

    // Let retries start, then pull the subscription.
    assert!(wait_until(WAIT, || engine.stats().failed_attempts >= 1));
    engine.unregister(id).unwrap();

    assert!(wait_until(WAIT, || engine.stats().abandoned >= 1));
    let attempts_after_cancel = transport.attempts();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(transport.attempts(), attempts_after_cancel);
    assert_eq!(engine.stats().delivered, 0);
}

#[test]
fn each_target_of_a_subscription_gets_its_own_delivery() {
    let transport = Arc::new(FlakyTransport::new(0));
    let engine = engine_with(Arc::clone(&transport));
    engine
        .register(
            severity_pattern(),
            vec!["cb:one".into(), "cb:two".into()],
            Qos::best_effort(),
        )
        .unwrap();

    engine
        .insert(vec![Fact::new(
            "data:exploit/4",
            vocab::SEVERITY,
            Term::literal("medium"),
        )])
        .unwrap();

    assert!(wait_until(WAIT, || engine.stats().delivered == 2));
    let mut delivered = transport.delivered.lock().unwrap().clone();
    delivered.sort();
    assert_eq!(
        delivered,
        vec![("cb:one".to_string(), 1), ("cb:two".to_string(), 1)]
    );
}
