//! Subscriber loop: subscribe to every configured channel, then dispatch
//! inbound messages to the handler until stopped or the connection fails.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use resp_proto::Frame;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::connection::Connection;
use crate::types::{Error, ErrorHandler, MessageHandler, SubscriberState, TimingConfig};

// ---------------------------------------------------------------------------
// State shared between the client and the loop
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    running: AtomicBool,
    state: AtomicU8,
    last_error: Mutex<Option<Error>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(SubscriberState::Idle as u8),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SubscriberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Record a fatal loop error: error slot filled, not running, `Stopped`,
    /// then the error callback.
    ///
    /// The slot is written first so a caller that observes `Stopped` always
    /// finds the error.
    fn fail(&self, err: Error, on_error: Option<&ErrorHandler>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
        self.set_running(false);
        self.set_state(SubscriberState::Stopped);
        if let Some(callback) = on_error {
            callback(&err);
        }
    }
}

/// Immutable configuration snapshot taken by `start()`.
pub(crate) struct SubscriberSetup {
    pub channels: Arc<[String]>,
    pub handler: MessageHandler,
    pub on_error: Option<ErrorHandler>,
    pub timing: TimingConfig,
}

/// Handle to a running loop.
pub(crate) struct SubscriberTask {
    pub shutdown: CancellationToken,
    /// Yields the receive-path connection back when it is still usable.
    pub handle: JoinHandle<Option<Connection>>,
}

pub(crate) fn spawn(
    conn: Connection,
    setup: SubscriberSetup,
    shared: Arc<Shared>,
) -> SubscriberTask {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_subscriber_loop(conn, setup, shared, shutdown.clone()));
    SubscriberTask { shutdown, handle }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

enum LoopAction {
    Continue,
    Stop,
}

pub(crate) async fn run_subscriber_loop(
    mut conn: Connection,
    setup: SubscriberSetup,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Option<Connection> {
    tracing::info!(channels = ?setup.channels, "Subscriber loop started");
    shared.set_state(SubscriberState::Subscribing);

    let outcome = match subscribe_all(&mut conn, &setup, &shutdown).await {
        Ok(LoopAction::Continue) => {
            shared.set_state(SubscriberState::Listening);
            listen(&mut conn, &setup, &shutdown).await
        }
        Ok(LoopAction::Stop) => Ok(()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            let reusable = unsubscribe(&mut conn, setup.timing.shutdown_timeout).await;
            shared.set_state(SubscriberState::Stopped);
            tracing::info!("Subscriber loop stopped");
            reusable.then_some(conn)
        }
        Err(e) => {
            tracing::error!("Subscriber loop failed: {e}");
            shared.fail(e, setup.on_error.as_ref());
            None
        }
    }
}

async fn subscribe_all(
    conn: &mut Connection,
    setup: &SubscriberSetup,
    shutdown: &CancellationToken,
) -> Result<LoopAction, Error> {
    let timeout = setup.timing.command_timeout;
    for channel in setup.channels.iter() {
        // Never cancelled mid-write: a stop only lands while waiting for the
        // acknowledgement, so the connection stays reusable.
        send_subscribe(conn, channel, timeout).await?;

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Stop requested while subscribing");
                return Ok(LoopAction::Stop);
            }

            ack = await_ack(conn, channel, timeout) => ack?,
        }
    }
    Ok(LoopAction::Continue)
}

enum Ack {
    Confirmed,
    Rejected(String),
    Unrelated,
}

fn classify_ack(frame: Frame, channel: &str) -> Ack {
    if let Frame::Error(message) = frame {
        return Ack::Rejected(message);
    }
    let Some(items) = frame.into_elements() else {
        return Ack::Unrelated;
    };
    match items.as_slice() {
        [kind, name, count]
            if kind.as_str() == Some("subscribe")
                && name.as_str() == Some(channel)
                && count.as_integer().is_some() =>
        {
            Ack::Confirmed
        }
        _ => Ack::Unrelated,
    }
}

fn subscribe_error(channel: &str, reason: String) -> Error {
    Error::Subscribe {
        channel: channel.to_string(),
        reason,
    }
}

/// Write `SUBSCRIBE <channel>` in full, bounded by `timeout`.
async fn send_subscribe(
    conn: &mut Connection,
    channel: &str,
    timeout: Duration,
) -> Result<(), Error> {
    time::timeout(timeout, conn.send(&["SUBSCRIBE", channel]))
        .await
        .map_err(|_| {
            let reason = format!("send timed out after {}ms", timeout.as_millis());
            subscribe_error(channel, reason)
        })?
        .map_err(|e| subscribe_error(channel, e.to_string()))
}

/// Wait for the acknowledgement of a `SUBSCRIBE <channel>` already sent.
///
/// Frames left over from a previous cycle (late messages, unsubscribe
/// acknowledgements) are skipped while waiting. Cancel safe.
async fn await_ack(
    conn: &mut Connection,
    channel: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let fail = |reason: String| subscribe_error(channel, reason);

    let deadline = Instant::now() + timeout;
    loop {
        let frame = time::timeout_at(deadline, conn.read_frame())
            .await
            .map_err(|_| fail(format!("no acknowledgement within {}ms", timeout.as_millis())))?
            .map_err(|e| fail(e.to_string()))?;
        match classify_ack(frame, channel) {
            Ack::Confirmed => {
                tracing::debug!(channel, "Subscribed");
                return Ok(());
            }
            Ack::Rejected(message) => return Err(fail(message)),
            Ack::Unrelated => {
                tracing::debug!(channel, "Skipping frame while awaiting subscribe acknowledgement");
            }
        }
    }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Steady state: one frame at a time, in arrival order.
async fn listen(
    conn: &mut Connection,
    setup: &SubscriberSetup,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Stop requested");
                return Ok(());
            }

            frame = conn.read_frame() => {
                let frame = frame.map_err(|e| Error::Receive(e.to_string()))?;
                dispatch(frame, &setup.handler);
            }

            _ = idle(setup.timing.idle_timeout) => {
                tracing::debug!("Receive path idle, probing with PING");
                // Runs to completion once started; bounded so stop stays prompt.
                time::timeout(setup.timing.command_timeout, conn.send(&["PING"]))
                    .await
                    .map_err(|_| Error::Receive("idle probe timed out".to_string()))?
                    .map_err(|e| Error::Receive(format!("idle probe failed: {e}")))?;
            }
        }
    }
}

/// Channel and payload of a `["message", channel, payload]` notification.
fn message_envelope(frame: Frame) -> Option<(String, String)> {
    let items = frame.into_elements()?;
    match items.as_slice() {
        [kind, channel, payload] if kind.as_str() == Some("message") => {
            let channel = codec::lossy_text(channel.as_bytes()?, "channel name");
            let payload = codec::lossy_text(payload.as_bytes()?, "message payload");
            Some((channel, payload))
        }
        _ => None,
    }
}

fn dispatch(frame: Frame, handler: &MessageHandler) {
    let Some((channel, payload)) = message_envelope(frame) else {
        tracing::debug!("Skipping non-message frame");
        return;
    };
    tracing::trace!(%channel, "Dispatching message");

    let tokens = codec::decode(&payload);
    if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(|| handler(tokens))) {
        let reason = cause
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| cause.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(%channel, "Message handler panicked, message dropped: {reason}");
    }
}

/// Leave subscribed mode so the connection can be reused by a later start.
async fn unsubscribe(conn: &mut Connection, timeout: Duration) -> bool {
    match time::timeout(timeout, conn.send(&["UNSUBSCRIBE"])).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!("UNSUBSCRIBE failed, dropping receive-path connection: {e}");
            false
        }
        Err(_) => {
            tracing::warn!("UNSUBSCRIBE timed out, dropping receive-path connection");
            false
        }
    }
}
