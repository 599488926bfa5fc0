//! One authenticated physical connection and its session multiplexer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::FRAME_OVERHEAD;
use crate::event::ConnectionInfo;
use crate::frame::{read_framed, write_framed, Frame};
use crate::handshake::{Established, OpeningKey, SealingKey};
use crate::session::{Session, SessionState};
use crate::transport::BoxedStream;
use crate::{lock, TunnelError};

/// Outbound frame queue depth per connection.
const FRAME_QUEUE: usize = 256;

struct SessionSlot {
    tx: mpsc::Sender<Bytes>,
    state: Arc<Mutex<SessionState>>,
}

/// Static facts about a connection, fixed at handshake time.
pub(crate) struct ConnectionMeta {
    pub id: u64,
    pub local_addr: String,
    pub remote_addr: String,
    /// Address we dialled, for outbound connections.
    pub dial_address: Option<String>,
    pub max_message_size: usize,
    pub session_buffer: usize,
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) remote_node: String,
    pub(crate) local_addr: String,
    pub(crate) remote_addr: String,
    pub(crate) dial_address: Option<String>,
    established_at: Instant,
    max_message_size: usize,
    session_buffer: usize,
    frames: mpsc::Sender<Frame>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    closed: CancellationToken,
}

impl Connection {
    /// Start the read and write tasks for an established stream.
    ///
    /// Sessions the peer opens are pushed to `accept_tx`.
    pub(crate) fn spawn(
        stream: BoxedStream,
        established: Established,
        meta: ConnectionMeta,
        accept_tx: mpsc::Sender<Session>,
        tasks: &TaskTracker,
    ) -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let conn = Arc::new(Self {
            id: meta.id,
            remote_node: established.remote_id,
            local_addr: meta.local_addr,
            remote_addr: meta.remote_addr,
            dial_address: meta.dial_address,
            established_at: Instant::now(),
            max_message_size: meta.max_message_size,
            session_buffer: meta.session_buffer,
            frames: frames_tx,
            sessions: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(stream);
        tasks.spawn(write_loop(
            writer,
            established.sealing,
            frames_rx,
            conn.closed.clone(),
        ));
        tasks.spawn(read_loop(
            Arc::clone(&conn),
            reader,
            established.opening,
            accept_tx,
        ));
        conn
    }

    pub(crate) fn is_outbound(&self) -> bool {
        self.dial_address.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the connection is gone.
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            node_id: self.remote_node.clone(),
            local_address: self.local_addr.clone(),
            remote_address: self.remote_addr.clone(),
            outbound: self.is_outbound(),
            sessions: lock(&self.sessions).len(),
            established_at: self.established_at,
        }
    }

    /// Open a new logical session on `channel`.
    pub(crate) async fn open_session(
        self: &Arc<Self>,
        channel: &str,
    ) -> Result<Session, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let session = self.register(id.clone(), channel.to_string());
        if self
            .frames
            .send(Frame::Open {
                session: id,
                channel: channel.to_string(),
            })
            .await
            .is_err()
        {
            return Err(TunnelError::ConnectionClosed);
        }
        Ok(session)
    }

    fn register(self: &Arc<Self>, id: String, channel: String) -> Session {
        let (tx, rx) = mpsc::channel(self.session_buffer);
        let state = Arc::new(Mutex::new(SessionState::Open));
        lock(&self.sessions).insert(
            id.clone(),
            SessionSlot {
                tx,
                state: Arc::clone(&state),
            },
        );
        Session::new(id, channel, state, rx, Arc::clone(self))
    }

    pub(crate) async fn send_data(&self, session: &str, payload: Vec<u8>) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.frames
            .send(Frame::Data {
                session: session.to_string(),
                payload,
            })
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    pub(crate) async fn send_close(&self, session: &str) {
        let _ = self
            .frames
            .send(Frame::Close {
                session: session.to_string(),
            })
            .await;
    }

    /// Forget a session locally, optionally telling the peer without waiting.
    pub(crate) fn release(&self, session: &str, notify_peer: bool) {
        lock(&self.sessions).remove(session);
        if notify_peer && !self.is_closed() {
            let _ = self.frames.try_send(Frame::Close {
                session: session.to_string(),
            });
        }
    }

    /// Close every session, flush their close frames and drop the stream.
    pub(crate) fn shutdown(&self) {
        let slots: Vec<(String, SessionSlot)> = lock(&self.sessions).drain().collect();
        for (id, slot) in slots {
            *lock(&slot.state) = SessionState::Closed;
            let _ = self.frames.try_send(Frame::Close { session: id });
        }
        self.closed.cancel();
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<Session>) {
        match frame {
            Frame::Open { session, channel } => {
                let incoming = self.register(session.clone(), channel.clone());
                if let Err(e) = accept_tx.try_send(incoming) {
                    // Dropping the session answers the peer with a close.
                    tracing::warn!(
                        "Refusing session {session} on channel {channel} from {}: {e}",
                        self.remote_node
                    );
                }
            }
            Frame::Data { session, payload } => {
                let tx = lock(&self.sessions).get(&session).map(|slot| slot.tx.clone());
                match tx {
                    // A reader that falls behind loses its session; waiting
                    // here would stall every other session on the connection.
                    Some(tx) => match tx.try_send(Bytes::from(payload)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(
                                "Session {session} from {} is not being read, closing it",
                                self.remote_node
                            );
                            self.overflow(&session);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            self.release(&session, true);
                        }
                    },
                    None => {
                        tracing::trace!("Data for unknown session {session} from {}", self.remote_node);
                    }
                }
            }
            Frame::Close { session } => {
                if let Some(slot) = lock(&self.sessions).remove(&session) {
                    *lock(&slot.state) = SessionState::Closed;
                }
            }
        }
    }

    /// Drop a session whose buffer is full. Messages already buffered can
    /// still be read; sends fail from here on.
    fn overflow(&self, session: &str) {
        if let Some(slot) = lock(&self.sessions).remove(session) {
            *lock(&slot.state) = SessionState::Closed;
        }
        if !self.is_closed() {
            let _ = self.frames.try_send(Frame::Close {
                session: session.to_string(),
            });
        }
    }

    fn teardown(&self) {
        let slots: Vec<SessionSlot> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for slot in slots {
            *lock(&slot.state) = SessionState::Closed;
        }
        self.closed.cancel();
    }
}

async fn write_sealed(
    writer: &mut WriteHalf<BoxedStream>,
    sealing: &mut SealingKey,
    frame: &Frame,
) -> Result<(), TunnelError> {
    let sealed = sealing.seal(&frame.to_bytes()?)?;
    write_framed(writer, &sealed).await
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut sealing: SealingKey,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => break,
        };
        if let Err(e) = write_sealed(&mut writer, &mut sealing, &frame).await {
            tracing::debug!("Connection write failed: {e}");
            break;
        }
    }

    // Flush whatever was queued before the close (session close frames).
    while let Ok(frame) = frames.try_recv() {
        if write_sealed(&mut writer, &mut sealing, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
    closed.cancel();
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: ReadHalf<BoxedStream>,
    mut opening: OpeningKey,
    accept_tx: mpsc::Sender<Session>,
) {
    let max_record = conn.max_message_size + FRAME_OVERHEAD;
    loop {
        let record = tokio::select! {
            record = read_framed(&mut reader, max_record) => record,
            _ = conn.closed.cancelled() => break,
        };
        let frame = record
            .and_then(|sealed| opening.open(&sealed))
            .and_then(|plain| Frame::from_bytes(&plain));
        match frame {
            Ok(frame) => {
                tracing::trace!("Frame for session {} from {}", frame.session(), conn.remote_node);
                conn.dispatch(frame, &accept_tx).await
            }
            Err(e) => {
                tracing::debug!("Connection to {} ended: {e}", conn.remote_node);
                break;
            }
        }
    }
    conn.teardown();
}
