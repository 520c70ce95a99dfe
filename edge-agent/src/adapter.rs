//! Imperative shell around the pure [`crate::orchestrator`] reducer.
//!
//! Owns the current [`orchestrator::State`], receives events, calls
//! `reduce`, and executes whatever commands come back: arming/cancelling
//! the hysteresis timers, starting/stopping the publisher, opening/closing
//! sessions against the store, and telling the feeder which session_id to
//! stamp on outgoing frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::child_process::{publisher_spec, Supervisor};
use crate::feeder::Feeder;
use crate::orchestrator::{reduce, Command, Event, State, Timers};
use crate::store_client::StoreClient;
use pipeline_config::PublisherConfig;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct AdapterConfig {
    pub device_id: String,
    pub configured_classes: Option<Vec<String>>,
    pub publisher: PublisherConfig,
    pub socket_path: String,
}

/// Drives the orchestrator off an event channel until the channel closes.
/// On shutdown, if a session was still open, it is closed and its End is
/// sent before returning.
pub async fn run(
    mut events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    timers: Timers,
    config: AdapterConfig,
    store: StoreClient,
    feeder: Arc<Mutex<Feeder>>,
) {
    let mut state = State::idle();
    let mut publisher: Option<Supervisor> = None;
    // Per invariant I2, at most one of the cancelable timers (silence,
    // post-roll) is armed per state; bumping this generation on every
    // Arm/Cancel makes an in-flight sleep for a superseded timer a no-op
    // when it wakes, rather than needing an explicit cancel handle.
    let timer_generation = Arc::new(AtomicU64::new(0));

    while let Some(event) = events.recv().await {
        let (new_state, commands) = reduce(state, event, timers);
        state = new_state;
        for command in commands {
            execute(
                command,
                &mut state,
                &mut publisher,
                &config,
                &store,
                &feeder,
                &events_tx,
                &timer_generation,
            )
            .await;
        }
    }

    if state.session_id.is_some() {
        close_active_session(&mut state, &mut publisher, &config, &store, &feeder).await;
    }
}

fn arm_timer(
    duration: Duration,
    fire: Event,
    events_tx: mpsc::UnboundedSender<Event>,
    generation: Arc<AtomicU64>,
) {
    let my_gen = generation.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        if generation.load(Ordering::SeqCst) == my_gen {
            let _ = events_tx.send(fire);
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    command: Command,
    state: &mut State,
    publisher: &mut Option<Supervisor>,
    config: &AdapterConfig,
    store: &StoreClient,
    feeder: &Arc<Mutex<Feeder>>,
    events_tx: &mpsc::UnboundedSender<Event>,
    timer_generation: &Arc<AtomicU64>,
) {
    match command {
        Command::ArmDwellTimer(d) => arm_timer(
            d,
            Event::DwellTimerFired,
            events_tx.clone(),
            timer_generation.clone(),
        ),
        Command::ArmSilenceTimer(d) => arm_timer(
            d,
            Event::SilenceTimerFired,
            events_tx.clone(),
            timer_generation.clone(),
        ),
        Command::ArmPostrollTimer(d) => arm_timer(
            d,
            Event::PostrollTimerFired,
            events_tx.clone(),
            timer_generation.clone(),
        ),
        Command::CancelPostrollTimer => {
            timer_generation.fetch_add(1, Ordering::SeqCst);
        }
        Command::StartStream => {
            let spec = publisher_spec(
                &config.socket_path,
                &config.publisher.host,
                config.publisher.port,
                &config.publisher.path,
            );
            *publisher = Some(Supervisor::spawn(spec));
        }
        Command::StopStream => {
            if let Some(mut sup) = publisher.take() {
                sup.stop(Duration::from_millis(1_500)).await;
            }
        }
        Command::OpenSession => {
            let start_ts = now_rfc3339();
            match store
                .open_session(
                    &config.device_id,
                    &start_ts,
                    config.configured_classes.as_deref(),
                )
                .await
            {
                Ok(session_id) => {
                    info!(session_id, "session opened");
                    state.session_id = Some(session_id.clone());
                    feeder.lock().await.set_session_id(session_id);
                }
                Err(err) => {
                    warn!(%err, "failed to open session with store");
                }
            }
        }
        Command::CloseSession(session_id) => {
            let end_ts = now_rfc3339();
            if let Err(err) = store.close_session(&session_id, &end_ts, None).await {
                warn!(%err, session_id, "failed to close session with store");
            }
            feeder.lock().await.send_end();
        }
        Command::SetAiFpsMode(mode) => {
            info!(?mode, "ai fps mode changed");
        }
    }
}

async fn close_active_session(
    state: &mut State,
    publisher: &mut Option<Supervisor>,
    config: &AdapterConfig,
    store: &StoreClient,
    feeder: &Arc<Mutex<Feeder>>,
) {
    if let Some(session_id) = state.session_id.take() {
        let (dummy_tx, _dummy_rx) = mpsc::unbounded_channel();
        let dummy_gen = Arc::new(AtomicU64::new(0));
        execute(
            Command::StopStream,
            state,
            publisher,
            config,
            store,
            feeder,
            &dummy_tx,
            &dummy_gen,
        )
        .await;
        execute(
            Command::CloseSession(session_id),
            state,
            publisher,
            config,
            store,
            feeder,
            &dummy_tx,
            &dummy_gen,
        )
        .await;
    }
}
