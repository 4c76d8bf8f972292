//! Top-level control loop
//!
//! ```text
//!   ┌──────────── App::run ────────────────────────────────┐
//!   │ BusSession::create → start → drive → drain           │
//!   │        ▲                        │                    │
//!   │        └── wake ◄── deep sleep ◄┘ (DeepAsleep)       │
//!   └──────────────────────────────────────────────────────┘
//! ```
//!
//! One task owns everything. `drive` selects over the bus, the keep-alive
//! and display ticks, buttons and shutdown. All decisions live in
//! [`AppState`], which returns [`Outbound`] actions instead of touching the
//! session, so it can be exercised without a broker.

use crate::config::Settings;
use crate::control::{ButtonEvent, CommandError, CommandPath, VebusMode};
use crate::display::{DisplaySnapshot, Presenter};
use crate::mqtt::keep_alive::KeepAliveScheduler;
use crate::mqtt::message_manager::{BusEvent, BusMessage};
use crate::mqtt::mqtt_handler::{BusSession, Running, SessionStatus};
use crate::mqtt::topics::{Identifier, Identifiers, ResolutionEvent, TopicResolver};
use crate::schedule::power::{PowerBackend, WakeCause};
use crate::schedule::{DeepSleepPlan, PowerState, ScheduleError, SleepScheduler};
use crate::telemetry::store::{Reading, TelemetryStore};
use crate::telemetry::{catalogue, Channel, ChannelKey};
use chrono::{Local, NaiveTime};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A request for the bus session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: String },
    KeepAlive { installation: String },
}

/// Result of one display tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub snapshot: DisplaySnapshot,
    pub mark_stale: bool,
    pub deep_sleep: Option<DeepSleepPlan>,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Shutdown,
    DeepSleep(DeepSleepPlan),
}

#[derive(Debug)]
pub struct AppState {
    channels: Vec<Channel>,
    resolver: TopicResolver,
    store: TelemetryStore,
    keep_alive: KeepAliveScheduler,
    scheduler: SleepScheduler,
    commands: CommandPath,
    presenter: Presenter,
    settings: Settings,
}

impl AppState {
    pub fn new(settings: &Settings, now: Instant) -> Result<Self, ScheduleError> {
        let channels = catalogue(&settings.installation, &settings.display, &settings.control);
        let ids = Identifiers::from_config(
            &settings.mqtt.installation_id,
            &settings.mqtt.vebus_id,
        );
        info!(
            "Tracking {} of {} channels",
            channels.iter().filter(|c| c.enabled).count(),
            channels.len()
        );

        Ok(Self {
            resolver: TopicResolver::new(&channels, ids),
            store: TelemetryStore::new(&channels, settings.telemetry.staleness_window()),
            keep_alive: KeepAliveScheduler::new(&settings.keep_alive, now),
            scheduler: SleepScheduler::from_config(&settings.schedule, now)?,
            commands: CommandPath::new(settings.control.allow_mode_changes),
            presenter: Presenter::from_config(&settings.display),
            channels,
            settings: settings.clone(),
        })
    }

    pub fn power_state(&self) -> PowerState {
        self.scheduler.state()
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive.interval()
    }

    /// Fresh CONNACK: every filter must be requested again.
    pub fn on_connected(&mut self) -> Vec<Outbound> {
        let mut actions: Vec<Outbound> = self
            .resolver
            .subscriptions()
            .into_iter()
            .map(Outbound::Subscribe)
            .collect();
        actions.extend(self.keep_alive_request());
        actions
    }

    pub fn on_message(&mut self, message: &BusMessage, now: Instant) -> Vec<Outbound> {
        let Some(key) = self.resolver.observe(&message.topic) else {
            debug!("Ignoring unbound topic {}", message.topic);
            return Vec::new();
        };

        let mut actions = Vec::new();
        for event in self.resolver.take_events() {
            match event {
                ResolutionEvent::Identifier { id, value } => {
                    debug!("{} resolved to {}", id, value);
                    if id == Identifier::Installation {
                        actions.extend(self.keep_alive_request());
                    }
                }
                ResolutionEvent::Binding {
                    channel,
                    topic,
                    retired_filter,
                } => {
                    debug!("{} bound to {}", channel, topic);
                    if let Some(filter) = retired_filter {
                        actions.push(Outbound::Unsubscribe(filter));
                    }
                    actions.push(Outbound::Subscribe(topic));
                }
            }
        }

        if let Err(e) = self.store.update(key, &message.payload, now) {
            debug!("{} not stored: {}", message.topic, e);
        }
        actions
    }

    pub fn on_keep_alive_tick(&mut self, now: Instant, status: &SessionStatus) -> Vec<Outbound> {
        if self.scheduler.state() != PowerState::Active || !status.is_connected() {
            return Vec::new();
        }
        match self.keep_alive.on_tick(now, self.store.last_update()) {
            Some(reason) => {
                debug!("Keep-alive due ({:?})", reason);
                self.keep_alive_request().into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn keep_alive_sent(&mut self, now: Instant) {
        self.keep_alive.record_sent(now);
    }

    pub fn on_display_tick(
        &mut self,
        now: Instant,
        time_of_day: NaiveTime,
        status: &SessionStatus,
    ) -> Tick {
        let power_state = self.scheduler.evaluate(now, time_of_day);
        let since = [self.store.last_update(), status.connected_since]
            .into_iter()
            .flatten()
            .max();
        let stopped = self
            .keep_alive
            .check_watchdog(now, since, status.is_connected());
        self.store.refresh_staleness(now);

        // A stale session keeps the warning up across reconnects until
        // something is received again.
        let snapshot = self.presenter.snapshot(
            &self.store,
            power_state,
            status.is_connected(),
            stopped || status.is_stale(),
            now,
        );
        let deep_sleep = (power_state == PowerState::DeepAsleep)
            .then(|| self.scheduler.deep_sleep_plan(time_of_day));

        Tick {
            snapshot,
            mark_stale: stopped && !status.is_stale(),
            deep_sleep,
        }
    }

    /// Any press wakes a sleeping display; only an awake one acts on it.
    pub fn on_button(
        &mut self,
        button: ButtonEvent,
        now: Instant,
        connected: bool,
    ) -> Vec<Outbound> {
        let was_active = self.scheduler.state() == PowerState::Active;
        self.scheduler.manual_wake(now);
        if !was_active {
            return Vec::new();
        }

        match self.command_for(button, connected) {
            Ok(Some(action)) => vec![action],
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Ignoring {:?}: {}", button, e);
                Vec::new()
            }
        }
    }

    fn command_for(
        &self,
        button: ButtonEvent,
        connected: bool,
    ) -> Result<Option<Outbound>, CommandError> {
        let current = self
            .store
            .reading(ChannelKey::VebusMode)
            .and_then(Reading::as_state)
            .and_then(VebusMode::from_code);
        let Some(command) = CommandPath::toggle(button, current) else {
            return Ok(None);
        };
        let write = self
            .commands
            .prepare(command?, current, self.resolver.identifiers())?;
        if !connected {
            return Err(CommandError::NotConnected);
        }
        info!("Setting Multiplus mode to {}", write.mode);
        Ok(Some(Outbound::Publish {
            topic: write.topic,
            payload: write.payload,
        }))
    }

    /// Bookkeeping after deep sleep. Returns the next plan when the
    /// device woke early and should go straight back to sleep.
    pub fn wake_from_deep_sleep(
        &mut self,
        cause: WakeCause,
        plan: &DeepSleepPlan,
        slept: Duration,
        now: Instant,
        time_of_day: NaiveTime,
    ) -> Option<DeepSleepPlan> {
        if let (WakeCause::Timer, Some(timer)) = (cause, plan.timer) {
            self.scheduler.record_deep_sleep(timer, slept);
        }
        self.reboot(now);
        if cause == WakeCause::Button {
            self.scheduler.manual_wake(now);
        }

        match self.scheduler.evaluate(now, time_of_day) {
            PowerState::DeepAsleep => {
                let next = self.scheduler.deep_sleep_plan(time_of_day);
                debug!("Woke early, sleeping again for {:?}", next.wall);
                Some(next)
            }
            _ => None,
        }
    }

    /// Deep sleep loses everything volatile; the drift estimate survives.
    fn reboot(&mut self, now: Instant) {
        self.resolver.reset();
        let window = self.settings.telemetry.staleness_window();
        self.store = TelemetryStore::new(&self.channels, window);
        self.keep_alive = KeepAliveScheduler::new(&self.settings.keep_alive, now);
        self.scheduler.rebooted(now);
    }

    fn keep_alive_request(&self) -> Option<Outbound> {
        if self.scheduler.state() != PowerState::Active {
            return None;
        }
        self.resolver
            .identifier(Identifier::Installation)
            .map(|installation| Outbound::KeepAlive {
                installation: installation.to_string(),
            })
    }
}

pub struct App<P: PowerBackend> {
    state: AppState,
    settings: Settings,
    power: P,
    buttons: mpsc::Receiver<ButtonEvent>,
    snapshots: watch::Sender<DisplaySnapshot>,
    shutdown: CancellationToken,
}

impl<P: PowerBackend> App<P> {
    pub fn new(
        settings: Settings,
        power: P,
        buttons: mpsc::Receiver<ButtonEvent>,
        snapshots: watch::Sender<DisplaySnapshot>,
        shutdown: CancellationToken,
    ) -> Result<Self, ScheduleError> {
        Ok(Self {
            state: AppState::new(&settings, Instant::now())?,
            settings,
            power,
            buttons,
            snapshots,
            shutdown,
        })
    }

    pub async fn run(mut self) {
        loop {
            let mut session = BusSession::create(&self.settings.mqtt).start();
            let outcome = self.drive(&mut session).await;
            session.drain(DRAIN_TIMEOUT).await;

            match outcome {
                SessionOutcome::Shutdown => break,
                SessionOutcome::DeepSleep(plan) => {
                    if !self.deep_sleep(plan).await {
                        break;
                    }
                }
            }
        }
        info!("Shutting down");
    }

    async fn drive(&mut self, session: &mut BusSession<Running>) -> SessionOutcome {
        let mut keep_alive_tick = tokio::time::interval(self.state.keep_alive_interval());
        keep_alive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut display_tick = tokio::time::interval(self.settings.display.update_period());
        display_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let reconnect_delay = self.settings.mqtt.reconnect_delay();
        let mut retry_at: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return SessionOutcome::Shutdown,

                event = session.poll(), if retry_at.is_none() => match event {
                    Ok(BusEvent::Connected) => {
                        let actions = self.state.on_connected();
                        self.apply(session, actions);
                    }
                    Ok(BusEvent::Message(message)) => {
                        let actions = self.state.on_message(&message, Instant::now());
                        self.apply(session, actions);
                    }
                    Ok(BusEvent::Idle) => {}
                    Err(e) => {
                        warn!("MQTT: {}; retrying in {:?}", e, reconnect_delay);
                        retry_at = Some(tokio::time::Instant::now() + reconnect_delay);
                    }
                },

                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(tokio::time::Instant::now)),
                    if retry_at.is_some() => {
                    retry_at = None;
                }

                _ = keep_alive_tick.tick() => {
                    let actions = self.state.on_keep_alive_tick(Instant::now(), session.status());
                    self.apply(session, actions);
                }

                _ = display_tick.tick() => {
                    let tick = self.state.on_display_tick(
                        Instant::now(),
                        Local::now().time(),
                        session.status(),
                    );
                    if tick.mark_stale {
                        session.mark_stale();
                    }
                    self.publish_snapshot(tick.snapshot);
                    if let Some(plan) = tick.deep_sleep {
                        return SessionOutcome::DeepSleep(plan);
                    }
                }

                button = self.buttons.recv() => match button {
                    Some(button) => {
                        let actions =
                            self.state.on_button(button, Instant::now(), session.is_connected());
                        self.apply(session, actions);
                    }
                    None => {
                        info!("Button input closed");
                        return SessionOutcome::Shutdown;
                    }
                },
            }
        }
    }

    fn apply(&mut self, session: &mut BusSession<Running>, actions: Vec<Outbound>) {
        for action in actions {
            let now = Instant::now();
            let result = match &action {
                Outbound::Subscribe(filter) => session.subscribe(filter),
                Outbound::Unsubscribe(filter) => session.unsubscribe(filter),
                Outbound::Publish { topic, payload } => {
                    session.publish_command(topic, payload, now)
                }
                Outbound::KeepAlive { installation } => session
                    .publish_keep_alive(installation, now, now + self.state.keep_alive_interval())
                    .map(|()| self.state.keep_alive_sent(now)),
            };
            if let Err(e) = result {
                warn!("{:?} failed: {}", action, e);
            }
        }
    }

    fn publish_snapshot(&self, snapshot: DisplaySnapshot) {
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Returns false when shutdown interrupted the sleep.
    async fn deep_sleep(&mut self, mut plan: DeepSleepPlan) -> bool {
        loop {
            let started = Local::now();
            let cause = self
                .power
                .deep_sleep(plan.timer, &mut self.buttons, &self.shutdown)
                .await;
            if cause == WakeCause::Shutdown {
                return false;
            }
            let slept = (Local::now() - started).to_std().unwrap_or_default();
            info!("Woke from deep sleep ({:?}) after {:?}", cause, slept);

            match self.state.wake_from_deep_sleep(
                cause,
                &plan,
                slept,
                Instant::now(),
                Local::now().time(),
            ) {
                Some(next) => plan = next,
                None => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mqtt_handler::ConnectionState;

    const SERIAL: &str = "c0619ab1cafe";

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.keep_alive.periodic = false;
        settings
    }

    fn connected() -> SessionStatus {
        let mut status = SessionStatus::default();
        status.connection_state = ConnectionState::Connected;
        status
    }

    fn message(topic: &str, payload: &str) -> BusMessage {
        BusMessage::new(topic.to_string(), payload.as_bytes().to_vec())
    }

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn test_discovery_on_connect() {
        let mut state = AppState::new(&settings(), Instant::now()).unwrap();
        let actions = state.on_connected();
        assert_eq!(
            actions,
            vec![
                Outbound::Subscribe("N/+/system/0/Serial".to_string()),
                Outbound::Subscribe("N/+/vebus/+/Mode".to_string()),
            ]
        );
    }

    #[test]
    fn test_serial_resolves_installation_and_subscribes_channels() {
        let mut state = AppState::new(&settings(), Instant::now()).unwrap();
        state.on_connected();

        let topic = format!("N/{}/system/0/Serial", SERIAL);
        let payload = format!(r#"{{"value": "{}"}}"#, SERIAL);
        let actions = state.on_message(&message(&topic, &payload), Instant::now());

        assert!(actions.contains(&Outbound::KeepAlive {
            installation: SERIAL.to_string()
        }));
        assert!(actions.contains(&Outbound::Unsubscribe("N/+/system/0/Serial".to_string())));
        assert!(actions.contains(&Outbound::Subscribe(topic.clone())));
        assert!(actions.contains(&Outbound::Subscribe(format!(
            "N/{}/system/0/Dc/Battery/Soc",
            SERIAL
        ))));
        assert_eq!(
            state.store().reading(ChannelKey::SystemSerial),
            Some(&Reading::Text(SERIAL.to_string()))
        );

        let soc = format!("N/{}/system/0/Dc/Battery/Soc", SERIAL);
        let actions = state.on_message(&message(&soc, r#"{"value": 81.5}"#), Instant::now());
        assert!(actions.is_empty());
        assert_eq!(
            state.store().reading(ChannelKey::BatterySoc),
            Some(&Reading::Number(81.5))
        );
    }

    #[test]
    fn test_unknown_topics_are_ignored() {
        let mut state = AppState::new(&settings(), Instant::now()).unwrap();
        let actions = state.on_message(&message("N/x/foo/0/Bar", "{}"), Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn test_keep_alive_needs_connection_and_installation() {
        let start = Instant::now();
        let mut settings = settings();
        settings.keep_alive.periodic = true;
        let mut state = AppState::new(&settings, start).unwrap();

        assert!(state.on_keep_alive_tick(start, &connected()).is_empty());

        let topic = format!("N/{}/system/0/Serial", SERIAL);
        state.on_message(&message(&topic, r#"{"value": "x"}"#), start);
        assert!(state
            .on_keep_alive_tick(start, &SessionStatus::default())
            .is_empty());
        assert_eq!(
            state.on_keep_alive_tick(start, &connected()),
            vec![Outbound::KeepAlive {
                installation: SERIAL.to_string()
            }]
        );
    }

    #[test]
    fn test_display_tick_banner_and_watchdog() {
        let start = Instant::now();
        let mut state = AppState::new(&settings(), start).unwrap();

        let tick = state.on_display_tick(start, noon(), &SessionStatus::default());
        assert_eq!(
            tick.snapshot.banner,
            Some(crate::display::StatusBanner::AwaitingConnection)
        );
        assert!(!tick.mark_stale);

        let mut status = connected();
        status.connected_since = Some(start);
        let tick = state.on_display_tick(start + Duration::from_secs(91), noon(), &status);
        assert!(tick.mark_stale);
        assert_eq!(
            tick.snapshot.banner,
            Some(crate::display::StatusBanner::DataUpdatesStopped)
        );
        assert_eq!(tick.deep_sleep, None);
    }

    #[test]
    fn test_undecodable_payloads_do_not_count_as_telemetry() {
        let start = Instant::now();
        let mut settings = settings();
        settings.mqtt.installation_id = "abc".to_string();
        let mut state = AppState::new(&settings, start).unwrap();
        let mut status = connected();
        status.connected_since = Some(start);

        let soc = "N/abc/system/0/Dc/Battery/Soc";
        let mut keep_alives = Vec::new();
        for secs in (10..=100).step_by(10) {
            let now = start + Duration::from_secs(secs);
            status.last_receive = Some(now);
            state.on_message(&message(soc, "{garbage"), now);
            if !state.on_keep_alive_tick(now, &status).is_empty() {
                state.keep_alive_sent(now);
                keep_alives.push(secs);
            }
        }

        assert_eq!(state.store().last_update(), None);
        assert_eq!(keep_alives, vec![60]);
        let tick = state.on_display_tick(start + Duration::from_secs(100), noon(), &status);
        assert_eq!(
            tick.snapshot.banner,
            Some(crate::display::StatusBanner::DataUpdatesStopped)
        );
    }

    #[test]
    fn test_stale_session_keeps_warning_across_reconnect() {
        let start = Instant::now();
        let mut state = AppState::new(&settings(), start).unwrap();
        let mut status = connected();
        status.connected_since = Some(start);

        let late = start + Duration::from_secs(91);
        assert!(state.on_display_tick(late, noon(), &status).mark_stale);
        status.mark_stale();

        // Reconnected: the watchdog restarts, the session stays stale.
        status.connected_since = Some(late);
        let tick = state.on_display_tick(late + Duration::from_secs(1), noon(), &status);
        assert!(!tick.mark_stale);
        assert_eq!(
            tick.snapshot.banner,
            Some(crate::display::StatusBanner::DataUpdatesStopped)
        );

        let mut fresh = connected();
        fresh.connected_since = Some(late);
        let tick = state.on_display_tick(late + Duration::from_secs(2), noon(), &fresh);
        assert_eq!(tick.snapshot.banner, None);
    }

    #[test]
    fn test_reconnect_resubscribes_resolved_topics() {
        let mut state = AppState::new(&settings(), Instant::now()).unwrap();
        state.on_connected();
        let topic = format!("N/{}/system/0/Serial", SERIAL);
        let payload = format!(r#"{{"value": "{}"}}"#, SERIAL);
        state.on_message(&message(&topic, &payload), Instant::now());

        let actions = state.on_connected();
        let subscribed = |filter: String| actions.contains(&Outbound::Subscribe(filter));
        assert!(subscribed(topic.clone()));
        assert!(subscribed(format!("N/{}/system/0/Dc/Battery/Soc", SERIAL)));
        assert!(subscribed(format!("N/{}/vebus/+/Mode", SERIAL)));
        assert!(!subscribed("N/+/system/0/Serial".to_string()));
        assert!(!subscribed("N/+/vebus/+/Mode".to_string()));
        assert!(actions.contains(&Outbound::KeepAlive {
            installation: SERIAL.to_string()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_broker_retries_at_the_reconnect_delay() {
        let mut settings = settings();
        settings.mqtt.broker = "127.0.0.1".to_string();
        settings.mqtt.port = 1;
        settings.mqtt.connect_timeout_secs = 1;
        settings.mqtt.reconnect_delay_secs = 2;

        let (_buttons_tx, buttons_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = watch::channel(DisplaySnapshot::starting());
        let shutdown = CancellationToken::new();
        let mut app = App::new(
            settings.clone(),
            crate::schedule::power::SimulatedPower,
            buttons_rx,
            snapshot_tx,
            shutdown.clone(),
        )
        .unwrap();

        let run_for = Duration::from_millis(10_500);
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(run_for).await;
            token.cancel();
        });

        let mut session = BusSession::create(&settings.mqtt).start();
        let outcome = app.drive(&mut session).await;
        assert!(matches!(outcome, SessionOutcome::Shutdown));

        // Every failed attempt is followed by a 2 s pause and an attempt
        // takes at most 1 s, so 10.5 s allows between 3 and 6 failures.
        let failures = session.status().connection_failures;
        assert!(failures >= 3, "only {failures} attempts");
        assert!(failures <= 6, "{failures} attempts in {run_for:?}");
        assert!(!session.status().is_connected());
        assert_eq!(
            snapshot_rx.borrow().banner,
            Some(crate::display::StatusBanner::AwaitingConnection)
        );
    }

    #[test]
    fn test_button_only_wakes_sleeping_display() {
        let start = Instant::now();
        let mut settings = settings();
        settings.schedule.display_at_specific_times_only = true;
        settings.schedule.use_deep_sleep = false;
        settings.schedule.wake_time = "07:00".to_string();
        settings.schedule.sleep_time = "07:00".to_string();
        let mut state = AppState::new(&settings, start).unwrap();

        let later = start + Duration::from_secs(120);
        let tick = state.on_display_tick(later, noon(), &connected());
        assert_eq!(tick.snapshot.power_state, PowerState::Asleep);

        let actions = state.on_button(ButtonEvent::ToggleCharger, later, true);
        assert!(actions.is_empty());
        assert_eq!(state.power_state(), PowerState::Active);
    }

    #[test]
    fn test_toggle_publishes_mode_write() {
        let now = Instant::now();
        let mut settings = settings();
        settings.mqtt.installation_id = SERIAL.to_string();
        let mut state = AppState::new(&settings, now).unwrap();

        let mode = format!("N/{}/vebus/276/Mode", SERIAL);
        state.on_message(&message(&mode, r#"{"value": 3}"#), now);

        assert!(state.on_button(ButtonEvent::ToggleInverter, now, false).is_empty());
        assert_eq!(
            state.on_button(ButtonEvent::ToggleInverter, now, true),
            vec![Outbound::Publish {
                topic: format!("W/{}/vebus/276/Mode", SERIAL),
                payload: r#"{"value":1}"#.to_string(),
            }]
        );
    }

    #[test]
    fn test_deep_sleep_wake_keeps_drift_and_forgets_telemetry() {
        let start = Instant::now();
        let mut settings = settings();
        settings.mqtt.installation_id = SERIAL.to_string();
        settings.schedule.display_at_specific_times_only = true;
        settings.schedule.wake_time = "06:00".to_string();
        settings.schedule.sleep_time = "22:00".to_string();
        let mut state = AppState::new(&settings, start).unwrap();

        let soc = format!("N/{}/system/0/Dc/Battery/Soc", SERIAL);
        state.on_message(&message(&soc, r#"{"value": 50}"#), start);

        let night = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let tick = state.on_display_tick(start, night, &connected());
        let plan = tick.deep_sleep.unwrap();
        assert_eq!(plan.wall, Some(Duration::from_secs(7 * 3600)));

        // Timer ran fast: woke 5:50 early by the wall clock.
        let slept = Duration::from_secs(7 * 3600 - 600);
        let early = NaiveTime::from_hms_opt(5, 50, 0).unwrap();
        let again = state
            .wake_from_deep_sleep(WakeCause::Timer, &plan, slept, start, early)
            .unwrap();
        assert_eq!(again.wall, Some(Duration::from_secs(600)));
        assert!(again.timer.unwrap() > Duration::from_secs(600));
        assert_eq!(state.store().reading(ChannelKey::BatterySoc), None);

        let morning = NaiveTime::from_hms_opt(6, 0, 1).unwrap();
        let next = state.wake_from_deep_sleep(
            WakeCause::Timer,
            &again,
            Duration::from_secs(600),
            start,
            morning,
        );
        assert_eq!(next, None);
        assert_eq!(state.power_state(), PowerState::Active);
    }

    #[test]
    fn test_button_wake_from_default_off_deep_sleep() {
        let start = Instant::now();
        let mut settings = settings();
        settings.schedule.display_at_specific_times_only = true;
        settings.schedule.wake_time = "07:00".to_string();
        settings.schedule.sleep_time = "07:00".to_string();
        let mut state = AppState::new(&settings, start).unwrap();

        let later = start + Duration::from_secs(120);
        let tick = state.on_display_tick(later, noon(), &connected());
        let plan = tick.deep_sleep.unwrap();
        assert_eq!(plan.timer, None);

        let woke = later + Duration::from_secs(3600);
        let next =
            state.wake_from_deep_sleep(WakeCause::Button, &plan, Duration::ZERO, woke, noon());
        assert_eq!(next, None);
        assert_eq!(state.power_state(), PowerState::Active);
    }
}
