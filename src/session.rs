// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! The session state machine.
//!
//! A [`SpekeSession`] drives one [`Speke`] engine over a connected,
//! reliable, ordered byte stream: it sends our init data, validates every
//! inbound message, answers the peer's init with key confirmation, and
//! delivers HMAC-verified application payloads to a replaceable handler.
//! Messages that fail verification draw down a small misbehavior budget;
//! protocol violations and transport failures each pin the session into a
//! specific terminal state, observable through [`SpekeSession::state`].
//!
//! Inbound messages are handled strictly sequentially: the next read is
//! issued only after the current message is fully applied, so the engine
//! never sees concurrent mutation.

use crate::errors::SpekeError;
use crate::messages::{read_message, write_message, SpekeMessage};
use crate::speke::Speke;
use crate::{CipherSuite, DefaultCipherSuite, Result, BAD_BEHAVIOR_LIMIT};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The handler invoked with each authenticated application payload and a
/// handle to the session it arrived on.
pub type MessageHandler<CS = DefaultCipherSuite> =
    Arc<dyn Fn(Vec<u8>, SessionHandle<CS>) + Send + Sync>;

/// The lifecycle of a session. Every `Stopped*` state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed but not started.
    Idle,
    /// Handshake or authenticated exchange in progress.
    Running,
    /// Closed locally.
    Stopped,
    /// Closed after a transport or framing failure.
    StoppedError,
    /// The peer closed the connection.
    StoppedPeerDisconnected,
    /// The peer presented an invalid public key or id.
    StoppedPeerPublicKeyOrIdInvalid,
    /// The peer's key confirmation did not match ours.
    StoppedKeyConfirmationFailed,
    /// The peer exhausted the misbehavior budget.
    StoppedPeerBadBehavior,
}

impl SessionState {
    /// Whether the session can never leave this state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Running)
    }
}

struct SessionInner<CS: CipherSuite> {
    state: Mutex<SessionState>,
    engine: Mutex<Option<Speke<CS>>>,
    pending_reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    handler: Mutex<Option<MessageHandler<CS>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    misbehavior: AtomicU32,
    peer_confirmed: AtomicBool,
}

/// A SPEKE session over a reliable byte stream.
///
/// Owns the engine and the transport. Dropping the session closes it; the
/// async [`SpekeSession::close`] additionally shuts the stream down
/// gracefully. Handlers receive a [`SessionHandle`] so they can reply
/// without owning the session.
pub struct SpekeSession<CS: CipherSuite = DefaultCipherSuite> {
    inner: Arc<SessionInner<CS>>,
}

/// A cheap, cloneable capability for interacting with a running session
/// from a message handler.
pub struct SessionHandle<CS: CipherSuite = DefaultCipherSuite> {
    inner: Arc<SessionInner<CS>>,
}

impl<CS: CipherSuite> Clone for SessionHandle<CS> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<CS: CipherSuite + 'static> SpekeSession<CS> {
    /// Wraps a connected stream and an engine into an idle session.
    pub fn new<S>(stream: S, engine: Speke<CS>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::Idle),
                engine: Mutex::new(Some(engine)),
                pending_reader: Mutex::new(Some(Box::new(reader))),
                writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
                handler: Mutex::new(None),
                reader_task: Mutex::new(None),
                misbehavior: AtomicU32::new(0),
                peer_confirmed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the exchange: sends our init data and arms the reader.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::IllegalState`] unless the session is idle, and
    /// the write error if the init message cannot be sent (the session is
    /// then already in a terminal state).
    pub async fn start(&self, handler: MessageHandler<CS>) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != SessionState::Idle {
                return Err(SpekeError::IllegalState(*state));
            }
            *state = SessionState::Running;
        }
        *lock(&self.inner.handler) = Some(handler);

        let init = {
            let engine = lock(&self.inner.engine);
            let engine = engine
                .as_ref()
                .ok_or_else(|| SpekeError::IllegalState(self.inner.current_state()))?;
            SpekeMessage::InitData {
                id: engine.id().to_owned(),
                public_key: engine.public_key(),
            }
        };
        self.inner.send(init).await?;

        if let Some(reader) = lock(&self.inner.pending_reader).take() {
            let inner = Arc::clone(&self.inner);
            let task = tokio::spawn(inner.read_loop(reader));
            *lock(&self.inner.reader_task) = Some(task);
        }
        Ok(())
    }

    /// Signs `message` with the derived key and sends it to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::IllegalState`] unless the session is running,
    /// [`SpekeError::NotInitialized`] while the peer's key has not arrived
    /// yet (nothing is queued), and the write error on transport failure.
    pub async fn send_message(&self, message: &[u8]) -> Result<()> {
        self.inner.send_signed(message).await
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Whether the peer has confirmed the derived key.
    pub fn peer_confirmed(&self) -> bool {
        self.inner.peer_confirmed.load(Ordering::SeqCst)
    }

    /// Replaces the message handler for subsequent payloads.
    pub fn set_message_handler(&self, handler: MessageHandler<CS>) {
        *lock(&self.inner.handler) = Some(handler);
    }

    /// A handle for use outside the owning scope.
    pub fn handle(&self) -> SessionHandle<CS> {
        SessionHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Closes the session: stops the reader, shuts the transport down in
    /// both directions, and releases the engine. Idempotent.
    pub async fn close(&self) {
        self.inner.close(SessionState::Stopped, true).await;
    }
}

impl<CS: CipherSuite> Drop for SpekeSession<CS> {
    fn drop(&mut self) {
        self.inner.close_sync(SessionState::Stopped);
    }
}

impl<CS: CipherSuite + 'static> SessionHandle<CS> {
    /// Signs `message` with the derived key and sends it to the peer.
    ///
    /// # Errors
    ///
    /// Same as [`SpekeSession::send_message`].
    pub async fn send_message(&self, message: &[u8]) -> Result<()> {
        self.inner.send_signed(message).await
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Whether the peer has confirmed the derived key.
    pub fn peer_confirmed(&self) -> bool {
        self.inner.peer_confirmed.load(Ordering::SeqCst)
    }

    /// Replaces the message handler for subsequent payloads.
    pub fn set_message_handler(&self, handler: MessageHandler<CS>) {
        *lock(&self.inner.handler) = Some(handler);
    }
}

impl<CS: CipherSuite + 'static> SessionInner<CS> {
    fn current_state(&self) -> SessionState {
        *lock(&self.state)
    }

    async fn send_signed(&self, message: &[u8]) -> Result<()> {
        let state = self.current_state();
        if state != SessionState::Running {
            return Err(SpekeError::IllegalState(state));
        }
        let signed = {
            let mut engine = lock(&self.engine);
            let engine = engine.as_mut().ok_or(SpekeError::IllegalState(state))?;
            let hmac_signature = engine.hmac_sign(message)?;
            SpekeMessage::SignedData {
                hmac_signature,
                data: message.to_vec(),
            }
        };
        self.send(signed).await
    }

    /// Writes one message, closing the session on transport failure.
    async fn send(&self, message: SpekeMessage) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = match writer_guard.as_mut() {
            Some(writer) => writer,
            None => return Err(SpekeError::IllegalState(self.current_state())),
        };
        let result = write_message(writer, &message).await;
        drop(writer_guard);
        if let Err(ref err) = result {
            self.close(terminal_state_for(err), false).await;
        }
        result
    }

    async fn read_loop(self: Arc<Self>, mut reader: BoxedReader) {
        loop {
            if self.current_state().is_terminal() {
                break;
            }
            let message = match read_message(&mut reader).await {
                Ok(message) => message,
                Err(err) => {
                    self.close(terminal_state_for(&err), false).await;
                    break;
                }
            };
            if !handle_message(&self, message).await {
                break;
            }
        }
    }

    /// Draws down the misbehavior budget. Returns whether reading may
    /// continue.
    async fn register_misbehavior(&self) -> bool {
        let count = self.misbehavior.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(count, limit = BAD_BEHAVIOR_LIMIT, "unverifiable message from peer");
        if count >= BAD_BEHAVIOR_LIMIT {
            self.close(SessionState::StoppedPeerBadBehavior, false).await;
            false
        } else {
            true
        }
    }

    /// First close wins; later calls are no-ops.
    async fn close(&self, terminal: SessionState, abort_reader: bool) {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return;
            }
            *state = terminal;
        }
        debug!(state = ?terminal, "session closed");
        if abort_reader {
            if let Some(task) = lock(&self.reader_task).take() {
                task.abort();
            }
        }
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut writer) = writer.take() {
                let _ = writer.shutdown().await;
            }
        }
        *lock(&self.engine) = None;
        *lock(&self.handler) = None;
    }
}

impl<CS: CipherSuite> SessionInner<CS> {
    /// Synchronous close for drop paths; skips the graceful stream
    /// shutdown.
    fn close_sync(&self, terminal: SessionState) {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return;
            }
            *state = terminal;
        }
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
        *lock(&self.engine) = None;
        *lock(&self.handler) = None;
    }
}

/// Applies one inbound message. Returns whether reading may continue.
async fn handle_message<CS: CipherSuite + 'static>(
    inner: &Arc<SessionInner<CS>>,
    message: SpekeMessage,
) -> bool {
    match message {
        SpekeMessage::InitData { id, public_key } => {
            let provided = {
                let mut engine = lock(&inner.engine);
                match engine.as_mut() {
                    Some(engine) => engine.provide_remote(&public_key, &id),
                    None => return false,
                }
            };
            match provided {
                Ok(()) => {
                    let kcd = {
                        let mut engine = lock(&inner.engine);
                        match engine.as_mut() {
                            Some(engine) => engine.key_confirmation_data(),
                            None => return false,
                        }
                    };
                    match kcd {
                        Ok(data) => inner
                            .send(SpekeMessage::KeyConfirmation { data })
                            .await
                            .is_ok(),
                        Err(_) => {
                            inner.close(SessionState::StoppedError, false).await;
                            false
                        }
                    }
                }
                Err(SpekeError::AlreadyProvided) => {
                    debug!("ignoring repeated init data");
                    true
                }
                Err(SpekeError::InvalidPeerKey) | Err(SpekeError::InvalidPeerId) => {
                    warn!("peer sent an invalid public key or id");
                    inner
                        .close(SessionState::StoppedPeerPublicKeyOrIdInvalid, false)
                        .await;
                    false
                }
                Err(_) => {
                    inner.close(SessionState::StoppedError, false).await;
                    false
                }
            }
        }
        SpekeMessage::KeyConfirmation { data } => {
            let confirmed = {
                let mut engine = lock(&inner.engine);
                match engine.as_mut() {
                    Some(engine) => engine.confirm_key(&data),
                    None => return false,
                }
            };
            match confirmed {
                Ok(true) => {
                    inner.peer_confirmed.store(true, Ordering::SeqCst);
                    debug!("peer confirmed the derived key");
                    true
                }
                Ok(false) => {
                    warn!("peer key confirmation failed");
                    inner
                        .close(SessionState::StoppedKeyConfirmationFailed, false)
                        .await;
                    false
                }
                // confirmation before init data cannot be checked
                Err(SpekeError::NotInitialized) => inner.register_misbehavior().await,
                Err(_) => {
                    inner.close(SessionState::StoppedError, false).await;
                    false
                }
            }
        }
        SpekeMessage::SignedData {
            hmac_signature,
            data,
        } => {
            let verified = {
                let mut engine = lock(&inner.engine);
                match engine.as_mut() {
                    Some(engine) => engine.confirm_hmac_signature(&hmac_signature, &data),
                    None => return false,
                }
            };
            match verified {
                Ok(true) => {
                    dispatch(inner, data);
                    true
                }
                Ok(false) | Err(SpekeError::NotInitialized) => {
                    inner.register_misbehavior().await
                }
                Err(_) => {
                    inner.close(SessionState::StoppedError, false).await;
                    false
                }
            }
        }
    }
}

/// Hands an authenticated payload to the current handler.
fn dispatch<CS: CipherSuite + 'static>(inner: &Arc<SessionInner<CS>>, payload: Vec<u8>) {
    let handler = lock(&inner.handler).clone();
    if let Some(handler) = handler {
        (handler.as_ref())(
            payload,
            SessionHandle {
                inner: Arc::clone(inner),
            },
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn terminal_state_for(err: &SpekeError) -> SessionState {
    match err {
        SpekeError::Io(io_err) => match io_err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => SessionState::StoppedPeerDisconnected,
            _ => SessionState::StoppedError,
        },
        _ => SessionState::StoppedError,
    }
}
