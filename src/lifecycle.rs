// src/lifecycle.rs - Reconciles device status axes into the host's single connection state
//
// Every state change goes through `commit`, under a lock private to the
// machine. Commits queue a notice; whichever thread finds the queue idle
// drains it with the lock released, so the listener hears changes one at a
// time and in commit order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::device::{DeviceSlot, SessionId};
use crate::error::{ConnectorError, Result};
use crate::listener::PrinterListener;
use crate::state::{ConnectionState, JobIntent, JobProgress};
use crate::status::{DeviceStatusSnapshot, IdlePhase, JobPhase};

/// Session-level events that drive the channel part of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Milestone {
    ConnectRequested,
    /// First update of the given session. Ignored unless that session is
    /// still the one the device slot owns.
    SessionEstablished(SessionId),
    SessionFailed(String),
    SessionClosed,
}

/// Listener event fired alongside a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    JobStarted,
    JobResumed,
    JobPaused,
    JobDone,
    JobCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub event: Option<LifecycleEvent>,
}

/// Transient job states wait while the device still reports itself busy.
pub fn is_gated(state: ConnectionState, idle: IdlePhase) -> bool {
    state.is_job_transient() && idle == IdlePhase::Printing
}

/// Job transition table, without gating.
pub fn next_state(state: ConnectionState, job: JobPhase) -> Option<(ConnectionState, LifecycleEvent)> {
    use ConnectionState as S;
    match (state, job) {
        (S::Starting, JobPhase::Printing) => Some((S::Printing, LifecycleEvent::JobStarted)),
        (S::Resuming, JobPhase::Printing) => Some((S::Printing, LifecycleEvent::JobResumed)),
        (S::Finishing, JobPhase::Complete | JobPhase::Standby) => {
            Some((S::Operational, LifecycleEvent::JobDone))
        }
        (S::Cancelling, JobPhase::Cancelled | JobPhase::Error | JobPhase::Standby) => {
            Some((S::Operational, LifecycleEvent::JobCancelled))
        }
        (S::Pausing, JobPhase::Paused) => Some((S::Paused, LifecycleEvent::JobPaused)),
        _ => None,
    }
}

fn has_active_job(state: ConnectionState) -> bool {
    use ConnectionState as S;
    matches!(
        state,
        S::Printing | S::Pausing | S::Paused | S::Resuming | S::Finishing | S::Cancelling
    )
}

struct Inner {
    state: ConnectionState,
    progress: Option<JobProgress>,
    pending: VecDeque<Notice>,
    /// Set while some thread is draining `pending`.
    dispatching: bool,
}

struct Notice {
    transition: Transition,
    error: Option<String>,
}

pub struct LifecycleStateMachine {
    inner: Mutex<Inner>,
    device: Arc<DeviceSlot>,
    state_tx: watch::Sender<ConnectionState>,
    progress_tx: watch::Sender<Option<JobProgress>>,
    error_tx: watch::Sender<Option<String>>,
    listener: Arc<dyn PrinterListener>,
}

impl LifecycleStateMachine {
    pub fn new(device: Arc<DeviceSlot>, listener: Arc<dyn PrinterListener>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (progress_tx, _) = watch::channel(None);
        let (error_tx, _) = watch::channel(None);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                progress: None,
                pending: VecDeque::new(),
                dispatching: false,
            }),
            device,
            state_tx,
            progress_tx,
            error_tx,
            listener,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Message of the last session failure, kept until the next connect request.
    pub fn error(&self) -> Option<String> {
        self.error_tx.borrow().clone()
    }

    pub fn progress(&self) -> Option<JobProgress> {
        self.progress_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<JobProgress>> {
        self.progress_tx.subscribe()
    }

    /// Applies a session milestone. Returns the transition it caused, if any.
    pub fn apply(&self, milestone: Milestone) -> Option<Transition> {
        let mut inner = self.lock();
        let state = inner.state;
        let transition = match milestone {
            Milestone::ConnectRequested if state.is_closed() => {
                self.error_tx.send_replace(None);
                Some(self.commit(&mut inner, ConnectionState::Connecting, None, None))
            }
            Milestone::SessionEstablished(session) if state == ConnectionState::Connecting => {
                if self.device.is_current(session) {
                    Some(self.commit(
                        &mut inner,
                        ConnectionState::Operational,
                        Some(LifecycleEvent::Connected),
                        None,
                    ))
                } else {
                    tracing::debug!("Ignoring establishment of superseded session {}", session);
                    None
                }
            }
            Milestone::SessionFailed(message) if !state.is_closed() => {
                self.set_progress(&mut inner, None);
                self.error_tx.send_replace(Some(message.clone()));
                Some(self.commit(&mut inner, ConnectionState::ClosedWithError, None, Some(message)))
            }
            Milestone::SessionClosed if state != ConnectionState::Closed => {
                self.set_progress(&mut inner, None);
                self.error_tx.send_replace(None);
                Some(self.commit(&mut inner, ConnectionState::Closed, None, None))
            }
            _ => None,
        };
        self.drain(inner);
        transition
    }

    /// Reconciles the current state against a fresh snapshot from `session`.
    /// Calling it again with the same snapshot changes nothing.
    pub fn evaluate(&self, session: SessionId, snapshot: &DeviceStatusSnapshot) -> Option<Transition> {
        let mut inner = self.lock();
        if !self.device.is_current(session) {
            return None;
        }
        let state = inner.state;
        let transition = if is_gated(state, snapshot.idle) {
            tracing::trace!("{} waits: device still busy (job {:?})", state, snapshot.job);
            self.track_progress(&mut inner, snapshot);
            None
        } else if let Some((next, event)) = next_state(state, snapshot.job) {
            match event {
                LifecycleEvent::JobStarted => {
                    self.set_progress(&mut inner, Some(JobProgress::new(snapshot.telemetry.file.clone())));
                }
                LifecycleEvent::JobCancelled => self.set_progress(&mut inner, None),
                _ => {}
            }
            let transition = self.commit(&mut inner, next, Some(event), None);
            if event == LifecycleEvent::JobDone {
                if let Some(mut progress) = inner.progress.clone() {
                    progress.progress = 1.0;
                    self.set_progress(&mut inner, Some(progress));
                }
            } else {
                self.track_progress(&mut inner, snapshot);
            }
            Some(transition)
        } else {
            self.track_progress(&mut inner, snapshot);
            None
        };
        self.drain(inner);
        transition
    }

    /// Enters the transient state for a job action. The state only settles once
    /// telemetry confirms the action.
    pub fn begin(&self, intent: JobIntent) -> Result<Transition> {
        let mut inner = self.lock();
        let state = inner.state;
        if !intent.allowed_from(state) {
            return Err(ConnectorError::InvalidTransition { state, intent });
        }
        if intent == JobIntent::Start {
            self.set_progress(&mut inner, None);
        }
        let transition = self.commit(&mut inner, intent.target_state(), None, None);
        self.drain(inner);
        Ok(transition)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(
        &self,
        inner: &mut Inner,
        to: ConnectionState,
        event: Option<LifecycleEvent>,
        error: Option<String>,
    ) -> Transition {
        let from = inner.state;
        inner.state = to;
        self.state_tx.send_replace(to);
        let transition = Transition { from, to, event };
        inner.pending.push_back(Notice { transition, error });
        transition
    }

    fn set_progress(&self, inner: &mut Inner, progress: Option<JobProgress>) {
        if inner.progress != progress {
            inner.progress = progress.clone();
            self.progress_tx.send_replace(progress);
        }
    }

    fn track_progress(&self, inner: &mut Inner, snapshot: &DeviceStatusSnapshot) {
        if !has_active_job(inner.state) {
            return;
        }
        let Some(mut progress) = inner.progress.clone() else {
            return;
        };
        let telemetry = &snapshot.telemetry;
        if let Some(value) = telemetry.progress {
            progress.progress = value;
        }
        if telemetry.file.is_some() {
            progress.file = telemetry.file.clone();
        }
        if telemetry.current_layer.is_some() {
            progress.current_layer = telemetry.current_layer;
        }
        if telemetry.total_layer.is_some() {
            progress.total_layer = telemetry.total_layer;
        }
        self.set_progress(inner, Some(progress));
    }

    /// Delivers queued notices with the lock released. A thread that finds
    /// another one already draining leaves its notices to that thread, which
    /// also covers listeners calling back into the machine.
    fn drain<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) {
        if inner.dispatching {
            return;
        }
        inner.dispatching = true;
        while let Some(notice) = inner.pending.pop_front() {
            drop(inner);
            self.dispatch(notice);
            inner = self.lock();
        }
        inner.dispatching = false;
    }

    fn dispatch(&self, notice: Notice) {
        let Notice { transition, error } = notice;
        let message = format!("State changed from {} to {}", transition.from, transition.to);
        tracing::info!("{}", message);
        self.listener
            .on_state_changed(transition.from, transition.to, error.as_deref());
        self.listener.on_log(&message);
        match transition.event {
            Some(LifecycleEvent::Connected) => {
                self.listener.on_connected();
                self.listener.on_files_available(true);
            }
            Some(LifecycleEvent::JobStarted) => self.listener.on_job_started(),
            Some(LifecycleEvent::JobResumed) => self.listener.on_job_resumed(),
            Some(LifecycleEvent::JobPaused) => self.listener.on_job_paused(),
            Some(LifecycleEvent::JobDone) => self.listener.on_job_done(),
            Some(LifecycleEvent::JobCancelled) => self.listener.on_job_cancelled(),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FirmwarePhase;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: &str) {
            self.events.lock().unwrap().push(event.to_string());
        }
    }

    impl PrinterListener for Recorder {
        fn on_connected(&self) {
            self.push("connected");
        }
        fn on_job_started(&self) {
            self.push("started");
        }
        fn on_job_resumed(&self) {
            self.push("resumed");
        }
        fn on_job_paused(&self) {
            self.push("paused");
        }
        fn on_job_done(&self) {
            self.push("done");
        }
        fn on_job_cancelled(&self) {
            self.push("cancelled");
        }
        fn on_files_available(&self, available: bool) {
            self.push(&format!("files:{}", available));
        }
    }

    fn machine() -> (LifecycleStateMachine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let device = Arc::new(DeviceSlot::new());
        device.claim(SessionId::new());
        (LifecycleStateMachine::new(device, recorder.clone()), recorder)
    }

    fn current(machine: &LifecycleStateMachine) -> SessionId {
        machine.device.session().unwrap()
    }

    fn established(machine: &LifecycleStateMachine) -> Milestone {
        Milestone::SessionEstablished(current(machine))
    }

    fn eval(machine: &LifecycleStateMachine, snapshot: &DeviceStatusSnapshot) -> Option<Transition> {
        machine.evaluate(current(machine), snapshot)
    }

    fn operational() -> (LifecycleStateMachine, Arc<Recorder>) {
        let (machine, recorder) = machine();
        machine.apply(Milestone::ConnectRequested);
        machine.apply(established(&machine));
        recorder.take();
        (machine, recorder)
    }

    fn snapshot(job: JobPhase, idle: IdlePhase) -> DeviceStatusSnapshot {
        DeviceStatusSnapshot::new(job, idle, FirmwarePhase::Ready)
    }

    /// Puts the machine into `state` through legal intents.
    fn drive_to(machine: &LifecycleStateMachine, state: ConnectionState) {
        use ConnectionState as S;
        let printing = snapshot(JobPhase::Printing, IdlePhase::Ready);
        match state {
            S::Starting => {
                machine.begin(JobIntent::Start).unwrap();
            }
            S::Printing => {
                drive_to(machine, S::Starting);
                eval(&machine, &printing);
            }
            S::Pausing | S::Finishing | S::Cancelling => {
                drive_to(machine, S::Printing);
                let intent = match state {
                    S::Pausing => JobIntent::Pause,
                    S::Finishing => JobIntent::Finish,
                    _ => JobIntent::Cancel,
                };
                machine.begin(intent).unwrap();
            }
            S::Paused => {
                drive_to(machine, S::Pausing);
                eval(&machine, &snapshot(JobPhase::Paused, IdlePhase::Ready));
            }
            S::Resuming => {
                drive_to(machine, S::Paused);
                machine.begin(JobIntent::Resume).unwrap();
            }
            _ => {}
        }
        assert_eq!(machine.state(), state);
    }

    #[test]
    fn test_channel_milestones() {
        let (machine, recorder) = machine();
        assert_eq!(machine.state(), ConnectionState::Closed);

        let t = machine.apply(Milestone::ConnectRequested).unwrap();
        assert_eq!(t.to, ConnectionState::Connecting);
        assert!(machine.apply(Milestone::ConnectRequested).is_none());

        let t = machine.apply(established(&machine)).unwrap();
        assert_eq!(t.event, Some(LifecycleEvent::Connected));
        assert!(machine.apply(established(&machine)).is_none());
        assert_eq!(recorder.take(), vec!["connected", "files:true"]);

        machine.apply(Milestone::SessionClosed).unwrap();
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert!(machine.apply(Milestone::SessionClosed).is_none());
    }

    #[test]
    fn test_session_failure_keeps_message_until_next_connect() {
        let (machine, _) = machine();
        machine.apply(Milestone::ConnectRequested);
        machine.apply(Milestone::SessionFailed("refused".to_string()));
        assert_eq!(machine.state(), ConnectionState::ClosedWithError);
        assert_eq!(machine.error().as_deref(), Some("refused"));

        machine.apply(Milestone::ConnectRequested);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert!(machine.error().is_none());
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState as S;
        let cases = [
            (S::Starting, JobPhase::Printing, S::Printing, "started"),
            (S::Resuming, JobPhase::Printing, S::Printing, "resumed"),
            (S::Finishing, JobPhase::Complete, S::Operational, "done"),
            (S::Finishing, JobPhase::Standby, S::Operational, "done"),
            (S::Cancelling, JobPhase::Cancelled, S::Operational, "cancelled"),
            (S::Cancelling, JobPhase::Error, S::Operational, "cancelled"),
            (S::Cancelling, JobPhase::Standby, S::Operational, "cancelled"),
            (S::Pausing, JobPhase::Paused, S::Paused, "paused"),
        ];
        for (from, job, to, event) in cases {
            let (machine, recorder) = operational();
            drive_to(&machine, from);
            recorder.take();

            let t = eval(&machine, &snapshot(job, IdlePhase::Ready)).unwrap();
            assert_eq!((t.from, t.to), (from, to), "{from} on {job:?}");
            assert_eq!(recorder.take(), vec![event]);
        }
    }

    #[test]
    fn test_unlisted_pairs_do_not_transition() {
        use ConnectionState as S;
        for state in [S::Operational, S::Printing, S::Paused, S::Starting, S::Pausing] {
            let (machine, _) = operational();
            drive_to(&machine, state);
            assert!(eval(&machine, &snapshot(JobPhase::Unknown, IdlePhase::Ready)).is_none());
            assert!(eval(&machine, &snapshot(JobPhase::Running, IdlePhase::Idle)).is_none());
            assert_eq!(machine.state(), state);
        }
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let (machine, recorder) = operational();
        drive_to(&machine, ConnectionState::Starting);
        recorder.take();

        let printing = snapshot(JobPhase::Printing, IdlePhase::Ready);
        assert!(eval(&machine, &printing).is_some());
        assert!(eval(&machine, &printing).is_none());
        assert_eq!(recorder.take(), vec!["started"]);
    }

    #[test]
    fn test_transient_states_wait_while_device_is_busy() {
        use ConnectionState as S;
        let jobs = [
            JobPhase::Printing,
            JobPhase::Paused,
            JobPhase::Complete,
            JobPhase::Cancelled,
            JobPhase::Error,
            JobPhase::Standby,
        ];
        for state in [S::Starting, S::Resuming, S::Finishing, S::Cancelling, S::Pausing] {
            let (machine, recorder) = operational();
            drive_to(&machine, state);
            recorder.take();
            for job in jobs {
                assert!(eval(&machine, &snapshot(job, IdlePhase::Printing)).is_none());
            }
            assert_eq!(machine.state(), state);
            assert!(recorder.take().is_empty());
        }
    }

    #[test]
    fn test_illegal_intent_rejected() {
        let (machine, _) = operational();
        let err = machine.begin(JobIntent::Pause).unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::InvalidTransition {
                state: ConnectionState::Operational,
                intent: JobIntent::Pause
            }
        ));
        assert_eq!(machine.state(), ConnectionState::Operational);
    }

    #[test]
    fn test_progress_lifecycle() {
        let (machine, _) = operational();
        drive_to(&machine, ConnectionState::Starting);
        assert!(machine.progress().is_none());

        let mut update = snapshot(JobPhase::Printing, IdlePhase::Ready);
        update.telemetry.file = Some("benchy.gcode".to_string());
        update.telemetry.progress = Some(0.25);
        update.telemetry.current_layer = Some(12);
        eval(&machine, &update);
        let progress = machine.progress().unwrap();
        assert_eq!(progress.file.as_deref(), Some("benchy.gcode"));
        assert_eq!(progress.progress, 0.25);
        assert_eq!(progress.current_layer, Some(12));

        machine.begin(JobIntent::Finish).unwrap();
        eval(&machine, &snapshot(JobPhase::Complete, IdlePhase::Ready));
        assert_eq!(machine.progress().unwrap().progress, 1.0);

        machine.apply(Milestone::SessionClosed);
        assert!(machine.progress().is_none());
    }

    #[test]
    fn test_cancel_discards_progress() {
        let (machine, _) = operational();
        drive_to(&machine, ConnectionState::Cancelling);
        assert!(machine.progress().is_some());
        eval(&machine, &snapshot(JobPhase::Cancelled, IdlePhase::Idle));
        assert!(machine.progress().is_none());
    }

    #[test]
    fn test_superseded_session_cannot_establish() {
        let (machine, recorder) = machine();
        let old = current(&machine);
        machine.apply(Milestone::ConnectRequested);
        machine.device.release();
        recorder.take();

        assert!(machine.apply(Milestone::SessionEstablished(old)).is_none());
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let fresh = SessionId::new();
        machine.device.claim(fresh);
        assert!(machine.apply(Milestone::SessionEstablished(old)).is_none());
        assert!(machine.evaluate(old, &snapshot(JobPhase::Printing, IdlePhase::Ready)).is_none());
        assert!(recorder.take().is_empty());

        assert!(machine.apply(Milestone::SessionEstablished(fresh)).is_some());
        assert_eq!(recorder.take(), vec!["connected", "files:true"]);
    }

    #[test]
    fn test_stale_snapshot_leaves_job_state() {
        let (machine, recorder) = operational();
        drive_to(&machine, ConnectionState::Starting);
        let old = current(&machine);
        machine.device.claim(SessionId::new());
        recorder.take();

        assert!(machine.evaluate(old, &snapshot(JobPhase::Printing, IdlePhase::Ready)).is_none());
        assert_eq!(machine.state(), ConnectionState::Starting);
        assert!(recorder.take().is_empty());
    }

    /// Records transitions and, on the first one, drives the machine again
    /// from inside the callback.
    struct Reentrant {
        machine: Mutex<Option<Arc<LifecycleStateMachine>>>,
        events: Mutex<Vec<String>>,
    }

    impl PrinterListener for Reentrant {
        fn on_state_changed(&self, from: ConnectionState, to: ConnectionState, _error: Option<&str>) {
            self.events.lock().unwrap().push(format!("{}->{}", from, to));
            let machine = self.machine.lock().unwrap().take();
            if let Some(machine) = machine {
                assert!(machine.apply(Milestone::SessionClosed).is_some());
                self.events.lock().unwrap().push("returned".to_string());
            }
        }

        fn on_connected(&self) {
            self.events.lock().unwrap().push("connected".to_string());
        }
    }

    #[test]
    fn test_listener_reentry_is_delivered_in_order() {
        let listener = Arc::new(Reentrant {
            machine: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        });
        let device = Arc::new(DeviceSlot::new());
        let session = SessionId::new();
        device.claim(session);
        let machine = Arc::new(LifecycleStateMachine::new(device, listener.clone()));
        machine.apply(Milestone::ConnectRequested);
        *listener.machine.lock().unwrap() = Some(Arc::clone(&machine));

        machine.apply(Milestone::SessionEstablished(session));
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![
                "CLOSED->CONNECTING",
                "CONNECTING->OPERATIONAL",
                "returned",
                "connected",
                "OPERATIONAL->CLOSED"
            ]
        );
    }
}
