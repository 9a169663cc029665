// THEORY:
// The `AutomationStateMachine` sequences the whole cycle: wait for focus,
// search for the target, lock onto it, watch it for a bite, reel, cool down,
// cast again. It is an actor in the same sense as the chunk actors of a grid:
// one tokio task owns every piece of mutable state and processes one message at
// a time from an ordered queue. Callers, timers and the frame pipeline only
// ever enqueue events.
//
// Key architectural principles:
// 1.  **Single writer**: state, timers, the locked target and the motion
//     detector belong to the actor task. Transitions cannot race because
//     there is only one place they happen. Callers observe the state through
//     an atomic snapshot and the target through a short-held lock.
// 2.  **Ephemeral states are functions**: `Casting` and `Reeling` fire their
//     side effect and immediately resolve to `Searching` and `Cooldown` within
//     the same transition. Listeners see `(previous, final)` only, and are
//     still told when the final state equals the previous one (a recast from
//     `Searching`), because a side effect happened.
// 3.  **Timers are messages**: the search timeout and the cooldown expiry are
//     tasks that sleep and then enqueue a tagged event. Leaving a state aborts
//     its timer and bumps the epoch, so a timer that fired anyway is
//     recognised as stale and ignored. Timers hold a weak sender and use
//     `try_send`; a full queue drops the event, and the same condition will be
//     reported again.
// 4.  **Fire-and-forget side effects**: key presses, pointer moves and clicks
//     run on their own tasks so the actor never sleeps. A supervising task logs
//     failures and panics; the cycle proceeds regardless of whether the
//     physical action worked.
// 5.  **Invalid events are no-ops**: an event that makes no sense in the
//     current state is dropped with a trace log. No transition, no listener.

use crate::core_modules::actions::{ActionCallbacks, ActionError, KeyCode};
use crate::core_modules::frame::Frame;
use crate::core_modules::motion_detector::{MotionEventDetector, MotionTuning};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const EVENT_QUEUE_CAPACITY: usize = 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutomationState {
    Halt = 0,
    WaitingFocus = 1,
    Searching = 2,
    Monitoring = 3,
    Reeling = 4,
    Cooldown = 5,
    Casting = 6,
}

impl AutomationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AutomationState::WaitingFocus,
            2 => AutomationState::Searching,
            3 => AutomationState::Monitoring,
            4 => AutomationState::Reeling,
            5 => AutomationState::Cooldown,
            6 => AutomationState::Casting,
            _ => AutomationState::Halt,
        }
    }

    /// `Reeling` and `Casting` are never observed from outside.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, AutomationState::Reeling | AutomationState::Casting)
    }
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AutomationState::Halt => "halt",
            AutomationState::WaitingFocus => "waiting-focus",
            AutomationState::Searching => "searching",
            AutomationState::Monitoring => "monitoring",
            AutomationState::Reeling => "reeling",
            AutomationState::Cooldown => "cooldown",
            AutomationState::Casting => "casting",
        };
        f.write_str(name)
    }
}

/// Timing and input settings for the cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationSettings {
    pub search_timeout: Duration,
    pub cooldown: Duration,
    /// Added on top of `cooldown` once the reel click is scheduled.
    pub cooldown_grace: Duration,
    /// Pause between moving onto the target and clicking.
    pub reel_click_delay: Duration,
    pub cast_key: String,
    /// Monitoring gives up and recasts after this long. `None` disables it.
    pub max_cast_duration: Option<Duration>,
    pub motion: MotionTuning,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        AutomationSettings {
            search_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(1),
            cooldown_grace: Duration::from_millis(500),
            reel_click_delay: Duration::from_millis(300),
            cast_key: "F3".to_string(),
            max_cast_duration: None,
            motion: MotionTuning::default(),
        }
    }
}

/// Called once per transition with `(previous, final)`.
pub type TransitionListener = Box<dyn Fn(AutomationState, AutomationState) + Send>;

enum Event {
    AwaitFocus,
    FocusAcquired,
    TargetAcquiredAt(i32, i32),
    TargetLost,
    FishBite,
    ForceCast,
    Halt,
    MonitoringFrame(Frame, Instant),
    SearchTimeout { epoch: u64 },
    CooldownExpired { epoch: u64 },
    AddListener(TransitionListener),
    Flush(oneshot::Sender<()>),
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::AwaitFocus => "await-focus",
            Event::FocusAcquired => "focus-acquired",
            Event::TargetAcquiredAt(..) => "target-acquired",
            Event::TargetLost => "target-lost",
            Event::FishBite => "fish-bite",
            Event::ForceCast => "force-cast",
            Event::Halt => "halt",
            Event::MonitoringFrame(..) => "monitoring-frame",
            Event::SearchTimeout { .. } => "search-timeout",
            Event::CooldownExpired { .. } => "cooldown-expired",
            Event::AddListener(_) => "add-listener",
            Event::Flush(_) => "flush",
        }
    }
}

/// State readable without going through the actor.
struct Snapshot {
    state: AtomicU8,
    target: Mutex<Option<(i32, i32)>>,
}

/// Handle to the automation actor. Dropping it stops the actor.
pub struct AutomationStateMachine {
    events: mpsc::Sender<Event>,
    snapshot: Arc<Snapshot>,
}

impl AutomationStateMachine {
    /// Spawns the actor on the current tokio runtime, starting in `Halt`.
    pub fn spawn(settings: AutomationSettings, actions: Arc<dyn ActionCallbacks>) -> Self {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let snapshot = Arc::new(Snapshot {
            state: AtomicU8::new(AutomationState::Halt as u8),
            target: Mutex::new(None),
        });
        let cast_key = actions.parse_key_token(&settings.cast_key);
        let detector = MotionEventDetector::new(settings.motion.clone(), settings.max_cast_duration);
        let actor = Actor {
            state: AutomationState::Halt,
            settings,
            cast_key,
            actions,
            snapshot: Arc::clone(&snapshot),
            listeners: Vec::new(),
            detector,
            target: None,
            cooldown_until: None,
            epoch: 0,
            timer: None,
            timer_events: events.downgrade(),
        };
        tokio::spawn(actor.run(receiver));
        AutomationStateMachine { events, snapshot }
    }

    pub fn current_state(&self) -> AutomationState {
        AutomationState::from_u8(self.snapshot.state.load(Ordering::Acquire))
    }

    /// The coordinate locked when monitoring began, until the next `halt`.
    pub fn locked_coordinates(&self) -> Option<(i32, i32)> {
        *self.snapshot.target.lock()
    }

    pub async fn await_focus(&self) {
        self.send(Event::AwaitFocus).await;
    }

    pub async fn focus_acquired(&self) {
        self.send(Event::FocusAcquired).await;
    }

    pub async fn target_acquired_at(&self, x: i32, y: i32) {
        self.send(Event::TargetAcquiredAt(x, y)).await;
    }

    pub async fn target_lost(&self) {
        self.send(Event::TargetLost).await;
    }

    pub async fn fish_bite(&self) {
        self.send(Event::FishBite).await;
    }

    pub async fn force_cast(&self) {
        self.send(Event::ForceCast).await;
    }

    pub async fn halt(&self) {
        self.send(Event::Halt).await;
    }

    /// Feeds one ROI frame to the motion detector. Dropped unless monitoring.
    pub async fn process_monitoring_frame(&self, roi: Frame, timestamp: Instant) {
        if self.current_state() != AutomationState::Monitoring {
            return;
        }
        self.send(Event::MonitoringFrame(roi, timestamp)).await;
    }

    /// Registers a listener. Takes effect for every event sent after this call.
    pub async fn add_listener<F>(&self, listener: F)
    where
        F: Fn(AutomationState, AutomationState) + Send + 'static,
    {
        self.send(Event::AddListener(Box::new(listener))).await;
    }

    /// Resolves once every event sent before this call has been processed.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Flush(tx)).await;
        let _ = rx.await;
    }

    async fn send(&self, event: Event) {
        let name = event.name();
        if self.events.send(event).await.is_err() {
            debug!(event = name, "automation actor stopped, event dropped");
        }
    }
}

struct Actor {
    state: AutomationState,
    settings: AutomationSettings,
    cast_key: KeyCode,
    actions: Arc<dyn ActionCallbacks>,
    snapshot: Arc<Snapshot>,
    listeners: Vec<TransitionListener>,
    detector: MotionEventDetector,
    target: Option<(i32, i32)>,
    cooldown_until: Option<Instant>,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    timer_events: mpsc::WeakSender<Event>,
}

impl Actor {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        self.retire_timer();
        debug!("automation actor stopped");
    }

    fn handle(&mut self, event: Event) {
        use AutomationState as S;

        let previous = self.state;
        let next = match (previous, event) {
            (_, Event::AddListener(listener)) => {
                self.listeners.push(listener);
                None
            }
            (_, Event::Flush(done)) => {
                let _ = done.send(());
                None
            }
            (S::Halt, Event::AwaitFocus) => Some(S::WaitingFocus),
            (S::WaitingFocus, Event::FocusAcquired) => Some(S::Searching),
            (S::Searching, Event::TargetAcquiredAt(x, y)) => {
                self.target = Some((x, y));
                Some(S::Monitoring)
            }
            (S::Searching, Event::SearchTimeout { epoch }) if epoch == self.epoch => {
                debug!("search timed out, recasting");
                Some(S::Casting)
            }
            (S::Searching | S::Monitoring | S::Cooldown, Event::ForceCast) => Some(S::Casting),
            (S::Monitoring, Event::FishBite) => Some(S::Reeling),
            (S::Monitoring, Event::TargetLost) => Some(S::Casting),
            (S::Monitoring, Event::MonitoringFrame(roi, timestamp)) => {
                if self.detector.feed(&roi, timestamp) {
                    Some(S::Reeling)
                } else if self.detector.is_timed_out() {
                    debug!("monitoring timed out, recasting");
                    Some(S::Casting)
                } else {
                    None
                }
            }
            (S::Cooldown, Event::CooldownExpired { epoch }) if epoch == self.epoch => Some(S::Casting),
            (state, Event::Halt) if state != S::Halt => Some(S::Halt),
            (state, event) => {
                trace!(state = %state, event = event.name(), "event ignored");
                None
            }
        };

        if let Some(next) = next {
            self.transition(previous, next);
        }
    }

    fn transition(&mut self, previous: AutomationState, next: AutomationState) {
        self.retire_timer();

        let mut state = next;
        while state.is_ephemeral() {
            state = match state {
                AutomationState::Casting => self.cast(),
                AutomationState::Reeling => self.reel(),
                stable => stable,
            };
        }

        self.enter(state);
        self.state = state;
        self.snapshot.state.store(state as u8, Ordering::Release);
        info!(from = %previous, to = %state, "automation transition");
        for listener in &self.listeners {
            listener(previous, state);
        }
    }

    fn enter(&mut self, state: AutomationState) {
        match state {
            AutomationState::Halt => {
                self.target = None;
                self.cooldown_until = None;
                self.detector.reset();
                *self.snapshot.target.lock() = None;
            }
            AutomationState::Searching => {
                let delay = self.settings.search_timeout;
                self.arm_timer(Instant::now() + delay, |epoch| Event::SearchTimeout { epoch });
            }
            AutomationState::Monitoring => {
                *self.snapshot.target.lock() = self.target;
                self.detector.reset();
                if let Some((x, y)) = self.target {
                    let actions = Arc::clone(&self.actions);
                    self.spawn_side_effect("lock-pointer", async move { actions.move_cursor(x, y).await });
                }
            }
            AutomationState::Cooldown => {
                let deadline = self.cooldown_until.unwrap_or_else(Instant::now);
                self.arm_timer(deadline, |epoch| Event::CooldownExpired { epoch });
            }
            AutomationState::WaitingFocus | AutomationState::Reeling | AutomationState::Casting => {}
        }
    }

    fn cast(&mut self) -> AutomationState {
        let actions = Arc::clone(&self.actions);
        let key = self.cast_key;
        self.spawn_side_effect("cast", async move { actions.press_key(key).await });
        AutomationState::Searching
    }

    fn reel(&mut self) -> AutomationState {
        let actions = Arc::clone(&self.actions);
        let target = self.target;
        let delay = self.settings.reel_click_delay;
        self.spawn_side_effect("reel", async move {
            if let Some((x, y)) = target {
                actions.move_cursor(x, y).await?;
            }
            tokio::time::sleep(delay).await;
            actions.click_secondary_button().await
        });
        self.cooldown_until = Some(Instant::now() + self.settings.cooldown + self.settings.cooldown_grace);
        AutomationState::Cooldown
    }

    fn arm_timer(&mut self, deadline: Instant, make: fn(u64) -> Event) {
        self.epoch += 1;
        let epoch = self.epoch;
        let events = self.timer_events.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(events) = events.upgrade() else {
                return;
            };
            let event = make(epoch);
            let name = event.name();
            if events.try_send(event).is_err() {
                debug!(event = name, "timer event dropped, queue saturated");
            }
        }));
    }

    fn retire_timer(&mut self) {
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn spawn_side_effect<F>(&self, label: &'static str, effect: F)
    where
        F: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let task = tokio::spawn(effect);
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => trace!(action = label, "side effect complete"),
                Ok(Err(err)) => warn!(action = label, error = %err, "side effect failed"),
                Err(err) if err.is_panic() => error!(action = label, "side effect panicked"),
                Err(_) => {}
            }
        });
    }
}
