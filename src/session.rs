//! One logical connection to one desk.
//!
//! [`DeskSession`] owns the transport link, the cached [`DeskState`], the
//! pending height query, and the observer slots. Inbound notifications are
//! funnelled through an unbounded channel into a dispatcher task owned by the
//! session, so decoding and observer callbacks never run on the transport's
//! delivery context.
//!
//! The protocol has no request ids. A height query is answered by whatever
//! height report arrives next, and overlapping [`DeskSession::get_height`]
//! calls alias: the most recent query owns the reply and earlier callers fall
//! back to the cached height.

use std::ops::RangeInclusive;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::framing::FramingError;
use crate::protocol::{
    DecodeOptions, DeskCommand, DeskOperation, command_sequence, decode_notification, hex,
};
use crate::transport::{Connection, Transport, TransportError, WriteMode};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_HEIGHT_TOLERANCE_MM: u16 = 5;
pub const DEFAULT_EVENT_CAPACITY: usize = 32;
pub const MIN_HEIGHT_MM: u16 = 634;
pub const MAX_HEIGHT_MM: u16 = 1289;

#[derive(Debug, Clone)]
pub struct DeskConfig {
    pub connect_attempts: u32,
    /// Sleep after the Nth failed attempt is `retry_backoff * N`.
    pub retry_backoff: Duration,
    /// Upper bound for a single connect, subscribe and handshake attempt.
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    /// Pause between a set-height write and the follow-up height query.
    pub settle_delay: Duration,
    pub height_tolerance_mm: u16,
    pub height_range: RangeInclusive<u16>,
    pub verify_checksum: bool,
    pub event_capacity: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            height_tolerance_mm: DEFAULT_HEIGHT_TOLERANCE_MM,
            height_range: MIN_HEIGHT_MM..=MAX_HEIGHT_MM,
            verify_checksum: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("desk {address} is not reachable")]
    DeviceUnavailable { address: String },
    #[error("failed to connect to desk after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("failed to write to desk: {0}")]
    TransportWriteFailed(#[source] TransportError),
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
    #[error(transparent)]
    InvalidPayload(#[from] FramingError),
    #[error("target height {target_mm} mm is outside {min_mm}..={max_mm} mm")]
    HeightOutOfRange {
        target_mm: u16,
        min_mm: u16,
        max_mm: u16,
    },
}

/// Last known desk telemetry. Fields stay `None` until the desk reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeskState {
    pub height_mm: Option<u32>,
    pub locked: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeskEvent {
    HeightChanged(u32),
    LockChanged(bool),
}

type HeightCallback = Arc<dyn Fn(u32) + Send + Sync>;
type LockCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Inner {
    state: DeskState,
    pending_height: Option<oneshot::Sender<u32>>,
    on_height: Option<HeightCallback>,
    on_lock: Option<LockCallback>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<DeskEvent>,
    decode: DecodeOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_notification(&self, raw: &[u8]) {
        let decoded = decode_notification(raw, self.decode);
        if decoded.is_unrecognized() {
            debug!(frame = %hex(raw), "unhandled notification");
            return;
        }

        if let Some(height_mm) = decoded.height_mm {
            let callback = {
                let mut inner = self.lock();
                inner.state.height_mm = Some(height_mm);
                if let Some(waiter) = inner.pending_height.take() {
                    let _ = waiter.send(height_mm);
                }
                inner.on_height.clone()
            };
            trace!(height_mm, "height report");
            let _ = self.events.send(DeskEvent::HeightChanged(height_mm));
            if let Some(callback) = callback {
                run_observer("height", || callback(height_mm));
            }
        }

        if let Some(locked) = decoded.locked {
            let changed = {
                let mut inner = self.lock();
                if inner.state.locked == Some(locked) {
                    None
                } else {
                    inner.state.locked = Some(locked);
                    Some(inner.on_lock.clone())
                }
            };
            if let Some(callback) = changed {
                debug!(locked, "lock state changed");
                let _ = self.events.send(DeskEvent::LockChanged(locked));
                if let Some(callback) = callback {
                    run_observer("lock", || callback(locked));
                }
            }
        }
    }
}

/// A panicking observer must not take the dispatcher task down with it.
fn run_observer(kind: &'static str, observer: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(observer)).is_err() {
        error!(kind, "desk observer panicked");
    }
}

struct ActiveLink<C> {
    connection: C,
    dispatcher: JoinHandle<()>,
}

impl<C> Drop for ActiveLink<C> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_notifications(mut notifications: UnboundedReceiver<Vec<u8>>, shared: Arc<Shared>) {
    while let Some(raw) = notifications.recv().await {
        shared.handle_notification(&raw);
    }
    trace!("notification channel closed");
}

pub struct DeskSession<T: Transport> {
    transport: T,
    address: String,
    config: DeskConfig,
    link: tokio::sync::Mutex<Option<ActiveLink<T::Connection>>>,
    shared: Arc<Shared>,
}

impl<T: Transport> DeskSession<T> {
    pub fn new(transport: T, address: impl Into<String>) -> Self {
        Self::with_config(transport, address, DeskConfig::default())
    }

    pub fn with_config(transport: T, address: impl Into<String>, config: DeskConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Shared {
            inner: Mutex::new(Inner::default()),
            events,
            decode: DecodeOptions {
                verify_checksum: config.verify_checksum,
            },
        };

        Self {
            transport,
            address: address.into(),
            config,
            link: tokio::sync::Mutex::new(None),
            shared: Arc::new(shared),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &DeskConfig {
        &self.config
    }

    pub fn height_mm(&self) -> Option<u32> {
        self.shared.lock().state.height_mm
    }

    pub fn is_locked(&self) -> Option<bool> {
        self.shared.lock().state.locked
    }

    pub fn state(&self) -> DeskState {
        self.shared.lock().state
    }

    /// Registers the height observer, replacing any previous one.
    pub fn on_height_changed(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.shared.lock().on_height = Some(Arc::new(callback));
    }

    /// Registers the lock observer, replacing any previous one. It only fires
    /// when the reported state differs from the cached one.
    pub fn on_lock_changed(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.shared.lock().on_lock = Some(Arc::new(callback));
    }

    /// Multi-observer alternative to the single-slot callbacks.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DeskEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        match self.link.lock().await.as_ref() {
            Some(active) => active.connection.is_connected().await,
            None => false,
        }
    }

    /// Connects unless a live link already exists.
    ///
    /// The device is resolved once up front; an unreachable desk fails with
    /// [`DeskError::DeviceUnavailable`] without using an attempt. Each attempt
    /// subscribes to notifications before writing the handshake frame so the
    /// desk's immediate reply is not lost.
    pub async fn connect(&self) -> Result<(), DeskError> {
        let mut link = self.link.lock().await;
        self.connect_locked(&mut link).await
    }

    /// [`Self::connect`], logging failures before handing them back.
    pub async fn ensure_connected(&self) -> Result<(), DeskError> {
        let mut link = self.link.lock().await;
        self.connected_link(&mut link).await.map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), DeskError> {
        let mut link = self.link.lock().await;
        let Some(active) = link.take() else {
            return Ok(());
        };

        if active.connection.is_connected().await {
            active
                .connection
                .disconnect()
                .await
                .map_err(DeskError::Transport)?;
            info!(address = %self.address, "disconnected from desk");
        }
        Ok(())
    }

    pub async fn move_up(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::MoveUp).await
    }

    pub async fn move_down(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::MoveDown).await
    }

    pub async fn stop(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::Stop).await
    }

    pub async fn move_to_sit_preset(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::MoveToSitPreset).await
    }

    pub async fn move_to_stand_preset(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::MoveToStandPreset).await
    }

    /// Sends the lock toggle. The desk flips its state, so callers should
    /// consult [`Self::is_locked`] first.
    pub async fn lock(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::ToggleLock).await
    }

    /// Same frame as [`Self::lock`].
    pub async fn unlock(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::ToggleLock).await
    }

    /// Stores the current height in the sit memory slot.
    pub async fn save_sit_preset(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::SaveSitPreset).await
    }

    /// Stores the current height in the stand memory slot.
    pub async fn save_stand_preset(&self) -> Result<(), DeskError> {
        self.send(DeskOperation::SaveStandPreset).await
    }

    pub async fn set_height(&self, target_mm: u16) -> Result<(), DeskError> {
        self.set_height_with_tolerance(target_mm, self.config.height_tolerance_mm)
            .await
    }

    /// Starts a move to `target_mm` and refreshes the cached height once the
    /// desk has begun moving. Convergence is observed through height events.
    ///
    /// `tolerance_mm` is accepted for callers that track convergence but is
    /// not enforced here.
    pub async fn set_height_with_tolerance(
        &self,
        target_mm: u16,
        tolerance_mm: u16,
    ) -> Result<(), DeskError> {
        let range = &self.config.height_range;
        if !range.contains(&target_mm) {
            return Err(DeskError::HeightOutOfRange {
                target_mm,
                min_mm: *range.start(),
                max_mm: *range.end(),
            });
        }

        debug!(address = %self.address, target_mm, tolerance_mm, "setting desk height");
        self.send(DeskOperation::SetHeight(target_mm)).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        self.get_height().await?;
        Ok(())
    }

    pub async fn get_height(&self) -> Result<Option<u32>, DeskError> {
        self.get_height_with_timeout(self.config.query_timeout)
            .await
    }

    /// Queries the desk and waits for the next height report.
    ///
    /// A timeout is not an error: the last cached height is returned instead,
    /// which is `None` if the desk never reported one.
    pub async fn get_height_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<u32>, DeskError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.lock().pending_height = Some(reply_tx);

        self.send(DeskOperation::QueryHeight).await?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(height_mm)) => Ok(Some(height_mm)),
            Ok(Err(_)) => {
                debug!("height query superseded by a newer one");
                Ok(self.height_mm())
            }
            Err(_) => {
                debug!(?timeout, "timed out waiting for height report");
                Ok(self.height_mm())
            }
        }
    }

    /// Queries the height and returns the refreshed state.
    pub async fn refresh(&self) -> Result<DeskState, DeskError> {
        self.get_height().await?;
        Ok(self.state())
    }

    async fn send(&self, operation: DeskOperation) -> Result<(), DeskError> {
        let commands = operation.commands();
        let frames = command_sequence(operation)?;

        let mut link = self.link.lock().await;
        let connection = self.connected_link(&mut link).await?;
        debug!(operation = operation.name(), "sending desk command");
        for (command, frame) in commands.iter().zip(&frames) {
            trace!(
                command = command.name(),
                opcode = %command.opcode(),
                frame = %hex(frame),
                "writing frame"
            );
            connection
                .write(frame, WriteMode::WithoutResponse)
                .await
                .map_err(DeskError::TransportWriteFailed)?;
        }
        Ok(())
    }

    async fn connected_link<'a>(
        &self,
        link: &'a mut Option<ActiveLink<T::Connection>>,
    ) -> Result<&'a T::Connection, DeskError> {
        if let Err(err) = self.connect_locked(link).await {
            error!(address = %self.address, %err, "desk connection failed");
            return Err(err);
        }

        match link {
            Some(active) => Ok(&active.connection),
            None => Err(DeskError::DeviceUnavailable {
                address: self.address.clone(),
            }),
        }
    }

    async fn connect_locked(
        &self,
        link: &mut Option<ActiveLink<T::Connection>>,
    ) -> Result<(), DeskError> {
        if let Some(active) = link.as_ref() {
            if active.connection.is_connected().await {
                return Ok(());
            }
            debug!(address = %self.address, "desk link lost");
            *link = None;
        }

        let device = self
            .transport
            .resolve(&self.address)
            .await
            .map_err(DeskError::Transport)?
            .ok_or_else(|| DeskError::DeviceUnavailable {
                address: self.address.clone(),
            })?;
        let handshake = DeskCommand::Handshake.encode()?;

        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            debug!(address = %self.address, attempt, attempts, "connecting to desk");
            match self.open_link(&device, &handshake).await {
                Ok(active) => {
                    info!(address = %self.address, attempt, "connected to desk");
                    *link = Some(active);
                    return Ok(());
                }
                Err(err) => {
                    warn!(address = %self.address, attempt, %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
            tokio::time::sleep(self.config.retry_backoff * attempt).await;
        }

        Err(DeskError::ConnectionFailed {
            attempts,
            source: last_error.unwrap_or(TransportError::NotConnected),
        })
    }

    /// One connect attempt, bounded by `connect_timeout`. A link that was
    /// opened but could not be subscribed or handshaken is closed again.
    async fn open_link(
        &self,
        device: &T::Device,
        handshake: &[u8],
    ) -> Result<ActiveLink<T::Connection>, TransportError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let connection = tokio::time::timeout_at(deadline, self.transport.connect(device))
            .await
            .unwrap_or(Err(TransportError::Timeout))?;

        // Replies that arrive before the dispatcher starts wait in the channel.
        let (sink, notifications) = mpsc::unbounded_channel();
        let ready = tokio::time::timeout_at(deadline, async {
            connection.subscribe(sink).await?;
            connection.write(handshake, WriteMode::WithoutResponse).await
        })
        .await
        .unwrap_or(Err(TransportError::Timeout));
        if let Err(err) = ready {
            close_quietly(&connection).await;
            return Err(err);
        }

        let dispatcher = tokio::spawn(dispatch_notifications(
            notifications,
            Arc::clone(&self.shared),
        ));
        Ok(ActiveLink {
            connection,
            dispatcher,
        })
    }
}

async fn close_quietly<C: Connection>(connection: &C) {
    if let Err(err) = connection.disconnect().await {
        debug!(%err, "failed to close half-open link");
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
