//! Integration tests for the reconciliation cycle.
//!
//! These drive the full state machine against recording in-memory
//! implementations of the vehicle gateway and price feed, verifying:
//! idempotence, add-before-remove ordering, the special-session freeze,
//! the offline wake sequence, and partial-rewrite handling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use amp_plan::{ChargeSlot, CurrentPolicy, PlanFingerprint, ScheduleCandidate};
use amp_store::StateStore;
use amp_vehicle::{
    CredentialSet, EntryTag, GatewayError, LocationTag, PlanRequest, PriceFeed, ScheduleEntry,
    SpecialSession, SessionStatus, VehicleGateway, VehicleSnapshot,
};
use amp_worker::custodian::TokenCustodian;
use amp_worker::reconciler::{
    ChargingNeed, CycleError, CycleStatus, Reconciler, ReconcilerConfig, TriggerRun,
};

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn slot(start: NaiveTime, end: NaiveTime, energy: f64, price: f64) -> ChargeSlot {
    ChargeSlot {
        start_time: start,
        end_time: end,
        energy_kwh: energy,
        price_per_kwh: price,
    }
}

/// The three-slot plan from the reference scenario.
fn scenario_slots() -> Vec<ChargeSlot> {
    vec![
        slot(t(23, 0), t(1, 0), 15.0, 0.25),
        slot(t(2, 0), t(4, 0), 20.0, 0.22),
        slot(t(5, 0), t(6, 0), 10.5, 0.35),
    ]
}

fn online_snapshot() -> VehicleSnapshot {
    VehicleSnapshot {
        online: true,
        charge_ready: true,
        location: LocationTag::Home,
        battery_percent: 40,
        vin: "5YJ3E1EA7JF000001".to_string(),
    }
}

fn offline_snapshot() -> VehicleSnapshot {
    VehicleSnapshot {
        online: false,
        ..online_snapshot()
    }
}

fn home_entry(id: &str, start: NaiveTime, end: NaiveTime, amps: u16) -> ScheduleEntry {
    ScheduleEntry {
        id: id.to_string(),
        start_time: start,
        end_time: end,
        current_amps: amps,
        tag: EntryTag::Home,
    }
}

/// One recorded gateway interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GatewayCall {
    FetchSnapshot,
    Wake,
    ListSchedules,
    Add(String),
    Remove(String),
    StartCharging,
}

/// Recording in-memory vehicle gateway.
#[derive(Default)]
struct MockGateway {
    /// Snapshots served in order; the last one repeats.
    snapshots: Mutex<VecDeque<VehicleSnapshot>>,
    entries: Mutex<Vec<ScheduleEntry>>,
    session: Mutex<Option<SpecialSession>>,
    calls: Mutex<Vec<GatewayCall>>,
    next_id: AtomicU64,
    fail_removes: AtomicBool,
    fail_verification_list: AtomicBool,
    /// Snapshot fetches reject the token while this is above zero.
    auth_failures: AtomicU64,
}

impl MockGateway {
    fn new(snapshots: Vec<VehicleSnapshot>, entries: Vec<ScheduleEntry>) -> Arc<Self> {
        let gateway = Self::default();
        *gateway.snapshots.lock().unwrap() = snapshots.into();
        *gateway.entries.lock().unwrap() = entries;
        Arc::new(gateway)
    }

    fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn entries_snapshot(&self) -> Vec<ScheduleEntry> {
        self.entries.lock().unwrap().clone()
    }

    fn mutation_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Add(_) | GatewayCall::Remove(_)))
            .count()
    }
}

#[async_trait]
impl VehicleGateway for MockGateway {
    async fn fetch_snapshot(&self, _token: &str) -> Result<VehicleSnapshot, GatewayError> {
        self.record(GatewayCall::FetchSnapshot);
        if self.auth_failures.load(Ordering::SeqCst) > 0 {
            self.auth_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::AuthExpired);
        }
        let mut queue = self.snapshots.lock().unwrap();
        if queue.len() > 1 {
            Ok(queue.pop_front().expect("non-empty"))
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| GatewayError::VehicleUnreachable("no snapshot".to_string()))
        }
    }

    async fn wake(&self, _token: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Wake);
        Ok(())
    }

    async fn list_schedules(&self, _token: &str) -> Result<Vec<ScheduleEntry>, GatewayError> {
        self.record(GatewayCall::ListSchedules);
        // The second list of a rewrite is the verification pass.
        let list_count = self
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::ListSchedules))
            .count();
        if list_count > 1 && self.fail_verification_list.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection reset".to_string()));
        }
        Ok(self.entries_snapshot())
    }

    async fn add_schedule(
        &self,
        _token: &str,
        candidate: &ScheduleCandidate,
    ) -> Result<ScheduleEntry, GatewayError> {
        let id = format!("sched_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.record(GatewayCall::Add(id.clone()));
        let entry = ScheduleEntry {
            id,
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            current_amps: candidate.current_amps,
            tag: EntryTag::Home,
        };
        self.entries.lock().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn remove_schedule(&self, _token: &str, entry_id: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Remove(entry_id.to_string()));
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 500,
                body: "remove failed".to_string(),
            });
        }
        self.entries.lock().unwrap().retain(|e| e.id != entry_id);
        Ok(())
    }

    async fn active_special_session(
        &self,
        _token: &str,
    ) -> Result<Option<SpecialSession>, GatewayError> {
        Ok(self.session.lock().unwrap().clone())
    }

    async fn start_charging(&self, _token: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::StartCharging);
        Ok(())
    }
}

/// Price feed serving a fixed slot list and counting calls.
struct MockPriceFeed {
    slots: Mutex<Vec<ChargeSlot>>,
    calls: AtomicU64,
}

impl MockPriceFeed {
    fn new(slots: Vec<ChargeSlot>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(slots),
            calls: AtomicU64::new(0),
        })
    }

    fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceFeed for MockPriceFeed {
    async fn fetch_slots(&self, _request: &PlanRequest) -> Result<Vec<ChargeSlot>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.slots.lock().unwrap().clone())
    }
}

fn seeded_store() -> Arc<StateStore> {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store
        .put_credentials(&CredentialSet {
            access_token: "at_test".to_string(),
            refresh_token: "rt_test".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(8),
        })
        .unwrap();
    store
}

fn reconciler(
    gateway: Arc<MockGateway>,
    feed: Arc<MockPriceFeed>,
    store: Arc<StateStore>,
) -> Reconciler {
    // An unroutable auth endpoint; most cycles never refresh.
    let custodian = TokenCustodian::new("http://127.0.0.1:9", Arc::clone(&store)).unwrap();
    reconciler_with_custodian(gateway, feed, store, Arc::new(custodian))
}

fn reconciler_with_custodian(
    gateway: Arc<MockGateway>,
    feed: Arc<MockPriceFeed>,
    store: Arc<StateStore>,
    custodian: Arc<TokenCustodian>,
) -> Reconciler {
    Reconciler::new(
        gateway,
        feed,
        store,
        custodian,
        CurrentPolicy::default(),
        ChargingNeed {
            battery_capacity_kwh: 75.0,
            target_percent: 80,
            deadline: t(7, 0),
        },
        // Real delays would stall the tests.
        ReconcilerConfig {
            wake_settle_delay: Duration::from_millis(1),
            mutation_gap: Duration::from_millis(1),
        },
    )
}

#[tokio::test]
async fn test_scenario_rewrite_then_noop() {
    let gateway = MockGateway::new(
        vec![online_snapshot()],
        vec![
            home_entry("old_1", t(23, 0), t(6, 0), 32),
            home_entry("old_2", t(2, 0), t(8, 0), 16),
        ],
    );
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), Arc::clone(&feed), Arc::clone(&store));

    // First cycle: stale fingerprint, full rewrite expected.
    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(outcome.fingerprint_changed);

    let calls = gateway.calls();
    let adds: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, GatewayCall::Add(_)))
        .collect();
    let removes: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            GatewayCall::Remove(id) => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(adds.len(), 3);
    assert_eq!(removes, vec!["old_1".to_string(), "old_2".to_string()]);

    // Amps follow the price tiers: 0.25 and 0.22 land in the 24A tier,
    // 0.35 in the 16A tier.
    let entries = gateway.entries_snapshot();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].current_amps, 24);
    assert_eq!(entries[1].current_amps, 24);
    assert_eq!(entries[2].current_amps, 16);

    // Fingerprint persisted to the hash of the slots.
    let record = store.load_fingerprint().unwrap().unwrap();
    assert_eq!(
        record.value,
        PlanFingerprint::from_slots(&scenario_slots()).as_str()
    );

    // Second cycle with the same plan: exactly zero gateway mutations.
    let before = gateway.mutation_count();
    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(!outcome.fingerprint_changed);
    assert_eq!(gateway.mutation_count(), before);
}

#[tokio::test]
async fn test_all_adds_precede_all_removes() {
    let gateway = MockGateway::new(
        vec![online_snapshot()],
        vec![home_entry("old_1", t(22, 0), t(6, 0), 32)],
    );
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), feed, seeded_store());

    reconciler.run_cycle(TriggerRun::scout()).await.unwrap();

    let calls = gateway.calls();
    let last_add = calls
        .iter()
        .rposition(|c| matches!(c, GatewayCall::Add(_)))
        .expect("adds recorded");
    let first_remove = calls
        .iter()
        .position(|c| matches!(c, GatewayCall::Remove(_)))
        .expect("removes recorded");
    assert!(
        last_add < first_remove,
        "every add must precede every remove: {calls:?}"
    );
}

#[tokio::test]
async fn test_other_tagged_entries_are_never_touched() {
    let mut other = home_entry("user_1", t(12, 0), t(13, 0), 16);
    other.tag = EntryTag::Other;

    let gateway = MockGateway::new(vec![online_snapshot()], vec![other.clone()]);
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), feed, seeded_store());

    reconciler.run_cycle(TriggerRun::scout()).await.unwrap();

    // The user's entry survived; no remove was issued for it.
    assert!(gateway.entries_snapshot().iter().any(|e| e.id == "user_1"));
    assert!(!gateway
        .calls()
        .iter()
        .any(|c| matches!(c, GatewayCall::Remove(id) if id == "user_1")));
}

#[tokio::test]
async fn test_active_special_session_freezes_schedules() {
    let gateway = MockGateway::new(
        vec![online_snapshot()],
        vec![home_entry("old_1", t(23, 0), t(6, 0), 32)],
    );
    *gateway.session.lock().unwrap() = Some(SpecialSession {
        id: "sess_1".to_string(),
        status: SessionStatus::Active,
    });
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), Arc::clone(&feed), seeded_store());

    // Forced run, stale fingerprint: still frozen.
    let outcome = reconciler.run_cycle(TriggerRun::failsafe()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Protected);
    assert!(!outcome.fingerprint_changed);
    assert_eq!(gateway.mutation_count(), 0);
    // The guard short-circuits before the price feed is consulted.
    assert_eq!(feed.call_count(), 0);
}

#[tokio::test]
async fn test_pending_session_does_not_freeze() {
    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    *gateway.session.lock().unwrap() = Some(SpecialSession {
        id: "sess_1".to_string(),
        status: SessionStatus::Pending,
    });
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), feed, seeded_store());

    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(outcome.fingerprint_changed);
}

#[tokio::test]
async fn test_offline_vehicle_wakes_exactly_once() {
    let gateway = MockGateway::new(vec![offline_snapshot(), online_snapshot()], vec![]);
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), feed, seeded_store());

    let outcome = reconciler.run_cycle(TriggerRun::failsafe()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);

    let calls = gateway.calls();
    let wakes = calls
        .iter()
        .filter(|c| matches!(c, GatewayCall::Wake))
        .count();
    assert_eq!(wakes, 1);

    // Exactly one snapshot before the wake and one after.
    let prefix = calls
        .iter()
        .take_while(|c| !matches!(c, GatewayCall::Wake))
        .filter(|c| matches!(c, GatewayCall::FetchSnapshot))
        .count();
    assert_eq!(prefix, 1);
    let refetches = calls
        .iter()
        .skip_while(|c| !matches!(c, GatewayCall::Wake))
        .filter(|c| matches!(c, GatewayCall::FetchSnapshot))
        .count();
    assert_eq!(refetches, 1);
}

#[tokio::test]
async fn test_vehicle_staying_offline_fails_without_mutation() {
    let gateway = MockGateway::new(vec![offline_snapshot()], vec![]);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), Arc::clone(&feed), Arc::clone(&store));

    let err = reconciler
        .run_cycle(TriggerRun::failsafe())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::VehicleUnreachable(_)));

    assert_eq!(gateway.mutation_count(), 0);
    assert_eq!(feed.call_count(), 0);
    assert!(store.load_fingerprint().unwrap().is_none());

    // The failure is visible in the run status.
    let status = store.load_run_status().unwrap();
    assert_eq!(status.last_cycle_status.as_deref(), Some("failed"));
    assert!(status.last_error.unwrap().contains("unreachable"));
}

#[tokio::test]
async fn test_not_ready_skips_on_scout_but_not_forced() {
    let away = VehicleSnapshot {
        location: LocationTag::Away,
        ..online_snapshot()
    };
    let gateway = MockGateway::new(vec![away], vec![]);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), Arc::clone(&feed), Arc::clone(&store));

    // Scout-sourced run re-verifies the condition and bails.
    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::NotReady);
    assert_eq!(feed.call_count(), 0);
    assert_eq!(gateway.mutation_count(), 0);

    // Forced runs bypass the gate and attempt the full cycle.
    let outcome = reconciler.run_cycle(TriggerRun::emergency()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);
    assert!(outcome.fingerprint_changed);
}

#[tokio::test]
async fn test_remove_failure_is_partial_rewrite() {
    let gateway = MockGateway::new(
        vec![online_snapshot()],
        vec![home_entry("old_1", t(23, 0), t(6, 0), 32)],
    );
    gateway.fail_removes.store(true, Ordering::SeqCst);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), feed, Arc::clone(&store));

    let err = reconciler
        .run_cycle(TriggerRun::scout())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::PartialRewrite { .. }));

    // Fingerprint untouched: the next cycle retries the comparison.
    assert!(store.load_fingerprint().unwrap().is_none());

    // Added entries are never reverted; old and new coexist, which is
    // strictly safer than no home schedule at all.
    let entries = gateway.entries_snapshot();
    assert!(entries.iter().any(|e| e.id == "old_1"));
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
async fn test_verification_failure_leaves_fingerprint_untouched() {
    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    gateway.fail_verification_list.store(true, Ordering::SeqCst);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), feed, Arc::clone(&store));

    let err = reconciler
        .run_cycle(TriggerRun::scout())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::PartialRewrite { .. }));
    assert!(store.load_fingerprint().unwrap().is_none());
}

#[tokio::test]
async fn test_plan_change_triggers_second_rewrite() {
    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let reconciler = reconciler(Arc::clone(&gateway), Arc::clone(&feed), Arc::clone(&store));

    reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    let v1 = store.load_fingerprint().unwrap().unwrap().version;

    // New price data arrives.
    *feed.slots.lock().unwrap() = vec![slot(t(1, 0), t(5, 0), 30.0, 0.12)];

    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert!(outcome.fingerprint_changed);

    let record = store.load_fingerprint().unwrap().unwrap();
    assert_eq!(record.version, v1 + 1);

    // The three prior cycle entries were replaced by the new single one.
    let entries = gateway.entries_snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].start_time, t(1, 0));
    assert_eq!(entries[0].current_amps, 32);
}

#[tokio::test]
async fn test_missing_credentials_fail_cleanly() {
    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let reconciler = reconciler(Arc::clone(&gateway), feed, store);

    let err = reconciler
        .run_cycle(TriggerRun::scout())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::NoCredentials));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn test_charge_ready_nudge_after_adds_before_removes() {
    let gateway = MockGateway::new(
        vec![online_snapshot()],
        vec![home_entry("old_1", t(23, 0), t(6, 0), 32)],
    );
    let feed = MockPriceFeed::new(scenario_slots());
    let reconciler = reconciler(Arc::clone(&gateway), feed, seeded_store());

    reconciler.run_cycle(TriggerRun::scout()).await.unwrap();

    let calls = gateway.calls();
    let nudge = calls
        .iter()
        .position(|c| matches!(c, GatewayCall::StartCharging))
        .expect("nudge issued for a charge-ready vehicle");
    let last_add = calls
        .iter()
        .rposition(|c| matches!(c, GatewayCall::Add(_)))
        .unwrap();
    let first_remove = calls
        .iter()
        .position(|c| matches!(c, GatewayCall::Remove(_)))
        .unwrap();
    assert!(last_add < nudge && nudge < first_remove);
}

fn refresh_server_mock() -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/token/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "at_new",
            "refresh_token": "rt_new",
            "expires_in_secs": 3600
        })))
}

#[tokio::test]
async fn test_rejected_token_refreshes_and_retries_once() {
    let server = MockServer::start().await;
    refresh_server_mock().expect(1).mount(&server).await;

    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    gateway.auth_failures.store(1, Ordering::SeqCst);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let custodian = Arc::new(
        TokenCustodian::with_limits(
            server.uri(),
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let reconciler = reconciler_with_custodian(
        Arc::clone(&gateway),
        feed,
        Arc::clone(&store),
        custodian,
    );

    let outcome = reconciler.run_cycle(TriggerRun::scout()).await.unwrap();
    assert_eq!(outcome.status, CycleStatus::Completed);

    // The retried cycle ran with the refreshed credentials.
    let creds = store.load_credentials().unwrap().unwrap();
    assert_eq!(creds.access_token, "at_new");
    let fetches = gateway
        .calls()
        .iter()
        .filter(|c| matches!(c, GatewayCall::FetchSnapshot))
        .count();
    assert_eq!(fetches, 2);
}

#[tokio::test]
async fn test_rejected_token_surfaces_after_one_refresh() {
    let server = MockServer::start().await;
    refresh_server_mock().expect(1).mount(&server).await;

    let gateway = MockGateway::new(vec![online_snapshot()], vec![]);
    // Both the original pass and the retry get rejected.
    gateway.auth_failures.store(2, Ordering::SeqCst);
    let feed = MockPriceFeed::new(scenario_slots());
    let store = seeded_store();
    let custodian = Arc::new(
        TokenCustodian::with_limits(
            server.uri(),
            Arc::clone(&store),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let reconciler = reconciler_with_custodian(
        Arc::clone(&gateway),
        feed,
        Arc::clone(&store),
        custodian,
    );

    let err = reconciler
        .run_cycle(TriggerRun::scout())
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::AuthExpired));
    assert_eq!(gateway.mutation_count(), 0);
    assert!(store.load_fingerprint().unwrap().is_none());
}
