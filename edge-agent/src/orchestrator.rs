//! The recording orchestrator, §4.7 of the spec.
//!
//! `reduce` is a pure function: `(State, Event) -> (State, Vec<Command>)`.
//! It performs no I/O and owns no timers; an adapter task interprets the
//! returned commands (arm/cancel timers, start/stop the publisher, open/
//! close sessions against the store) and feeds timer-fired and
//! store-response events back in. Keeping the state machine pure makes it
//! straightforward to drive with table-driven tests.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpsMode {
    Idle,
    Active,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Detection { relevant: bool },
    Keepalive,
    DwellTimerFired,
    SilenceTimerFired,
    PostrollTimerFired,
    /// Fed back once the store has assigned a session_id for an `OpenSession` command.
    SessionOpened { session_id: String },
    /// Fed back once the store has confirmed a `CloseSession` command.
    SessionClosed { session_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ArmDwellTimer(Duration),
    ArmSilenceTimer(Duration),
    ArmPostrollTimer(Duration),
    CancelPostrollTimer,
    StartStream,
    OpenSession,
    SetAiFpsMode(FpsMode),
    StopStream,
    CloseSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTag {
    Idle,
    Dwell,
    Active,
    Closing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub tag: StateTag,
    pub session_id: Option<String>,
}

impl State {
    pub fn idle() -> Self {
        Self {
            tag: StateTag::Idle,
            session_id: None,
        }
    }

    /// Invariant I1: session_id is non-empty iff state in {ACTIVE, CLOSING}.
    pub fn invariant_holds(&self) -> bool {
        let should_have_session = matches!(self.tag, StateTag::Active | StateTag::Closing);
        self.session_id.is_some() == should_have_session
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub dwell: Duration,
    pub silence: Duration,
    pub postroll: Duration,
}

impl From<&pipeline_config::FsmConfig> for Timers {
    fn from(cfg: &pipeline_config::FsmConfig) -> Self {
        Self {
            dwell: Duration::from_millis(cfg.dwell_ms),
            silence: Duration::from_millis(cfg.silence_ms),
            postroll: Duration::from_millis(cfg.postroll_ms),
        }
    }
}

/// Advances the orchestrator by one event, per the transition table in
/// §4.7.2. Events that are not legal in the current state are ignored
/// (returned unchanged, no commands) rather than treated as an error —
/// the adapter may deliver a stray keepalive or late timer fire after a
/// state has already moved on.
pub fn reduce(state: State, event: Event, timers: Timers) -> (State, Vec<Command>) {
    use StateTag::*;

    match (state.tag, &event) {
        (Idle, Event::Detection { relevant: true }) => (
            State {
                tag: Dwell,
                session_id: None,
            },
            vec![Command::ArmDwellTimer(timers.dwell)],
        ),

        (Dwell, Event::Detection { relevant: true }) => (state, vec![]),
        (Dwell, Event::Keepalive) => (state, vec![]),

        (Dwell, Event::DwellTimerFired) => (
            State {
                tag: Active,
                session_id: None,
            },
            vec![
                Command::StartStream,
                Command::OpenSession,
                Command::SetAiFpsMode(FpsMode::Active),
                Command::ArmSilenceTimer(timers.silence),
            ],
        ),

        (Active, Event::SessionOpened { session_id }) => (
            State {
                tag: Active,
                session_id: Some(session_id.clone()),
            },
            vec![],
        ),

        (Active, Event::Detection { relevant: true }) => (
            state,
            vec![Command::ArmSilenceTimer(timers.silence)],
        ),

        (Active, Event::Keepalive) => (state, vec![]),

        (Active, Event::SilenceTimerFired) => (
            State {
                tag: Closing,
                session_id: state.session_id,
            },
            vec![
                Command::SetAiFpsMode(FpsMode::Idle),
                Command::ArmPostrollTimer(timers.postroll),
            ],
        ),

        (Closing, Event::Detection { relevant: true }) => (
            State {
                tag: Active,
                session_id: state.session_id,
            },
            vec![
                Command::CancelPostrollTimer,
                Command::ArmSilenceTimer(timers.silence),
            ],
        ),

        (Closing, Event::PostrollTimerFired) => {
            let session_id = state.session_id.clone().unwrap_or_default();
            (
                State {
                    tag: Idle,
                    session_id: None,
                },
                vec![Command::StopStream, Command::CloseSession(session_id)],
            )
        }

        (Closing, Event::SessionClosed { .. }) => (
            State {
                tag: Idle,
                session_id: None,
            },
            vec![],
        ),

        // Everything else (irrelevant detections, stray timer fires after a
        // transition already moved on) leaves the state unchanged.
        _ => (state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers() -> Timers {
        Timers {
            dwell: Duration::from_millis(500),
            silence: Duration::from_millis(3000),
            postroll: Duration::from_millis(2000),
        }
    }

    #[test]
    fn happy_path_session_open_and_close() {
        let t = timers();
        let (s, cmds) = reduce(State::idle(), Event::Detection { relevant: true }, t);
        assert_eq!(s.tag, StateTag::Dwell);
        assert_eq!(cmds, vec![Command::ArmDwellTimer(t.dwell)]);

        let (s, cmds) = reduce(s, Event::DwellTimerFired, t);
        assert_eq!(s.tag, StateTag::Active);
        assert_eq!(
            cmds,
            vec![
                Command::StartStream,
                Command::OpenSession,
                Command::SetAiFpsMode(FpsMode::Active),
                Command::ArmSilenceTimer(t.silence),
            ]
        );
        assert!(s.session_id.is_none());

        let (s, cmds) = reduce(
            s,
            Event::SessionOpened {
                session_id: "sess-1".into(),
            },
            t,
        );
        assert!(cmds.is_empty());
        assert_eq!(s.session_id.as_deref(), Some("sess-1"));
        assert!(s.invariant_holds());

        let (s, cmds) = reduce(s, Event::SilenceTimerFired, t);
        assert_eq!(s.tag, StateTag::Closing);
        assert_eq!(
            cmds,
            vec![
                Command::SetAiFpsMode(FpsMode::Idle),
                Command::ArmPostrollTimer(t.postroll),
            ]
        );
        assert!(s.invariant_holds());

        let (s, cmds) = reduce(s, Event::PostrollTimerFired, t);
        assert_eq!(s.tag, StateTag::Idle);
        assert_eq!(
            cmds,
            vec![
                Command::StopStream,
                Command::CloseSession("sess-1".into()),
            ]
        );
        assert!(s.invariant_holds());
    }

    #[test]
    fn reactivation_within_postroll_keeps_same_session() {
        let t = timers();
        let state = State {
            tag: StateTag::Closing,
            session_id: Some("sess-9".into()),
        };
        let (s, cmds) = reduce(state, Event::Detection { relevant: true }, t);
        assert_eq!(s.tag, StateTag::Active);
        assert_eq!(s.session_id.as_deref(), Some("sess-9"));
        assert_eq!(
            cmds,
            vec![
                Command::CancelPostrollTimer,
                Command::ArmSilenceTimer(t.silence),
            ]
        );
    }

    #[test]
    fn dwell_detections_do_not_reset_the_timer() {
        let t = timers();
        let state = State {
            tag: StateTag::Dwell,
            session_id: None,
        };
        let (s, cmds) = reduce(state.clone(), Event::Detection { relevant: true }, t);
        assert_eq!(s, state);
        assert!(cmds.is_empty());
    }

    #[test]
    fn keepalive_in_active_does_not_reset_silence() {
        let t = timers();
        let state = State {
            tag: StateTag::Active,
            session_id: Some("s".into()),
        };
        let (s, cmds) = reduce(state.clone(), Event::Keepalive, t);
        assert_eq!(s, state);
        assert!(cmds.is_empty());
    }

    #[test]
    fn irrelevant_detection_never_starts_a_session() {
        let t = timers();
        let (s, cmds) = reduce(State::idle(), Event::Detection { relevant: false }, t);
        assert_eq!(s.tag, StateTag::Idle);
        assert!(cmds.is_empty());
    }
}
