use crate::metrics::Metrics;
use oscard_proto::{Channel, Flap, Snac};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    Io,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "session write failure"),
        }
    }
}

impl Error for SessionError {}

struct SessionWriter {
    half: OwnedWriteHalf,
    sequence: u16,
}

/// One live connection's write side.
///
/// The writer mutex serializes whole frames, and the sequence counter
/// lives under the same lock, so concurrent emitters (the connection's
/// own handler, the presence loop, the delivery loop) produce intact
/// frames with strictly increasing sequence numbers mod 2^16. Reads are
/// driven by the handler, never by the session.
pub struct Session {
    remote_addr: SocketAddr,
    writer: Mutex<SessionWriter>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    greeted: AtomicBool,
    screen_name: RwLock<String>,
    metrics: Arc<Metrics>,
}

impl Session {
    pub fn new(half: OwnedWriteHalf, remote_addr: SocketAddr, metrics: Arc<Metrics>) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Session {
            remote_addr,
            writer: Mutex::new(SessionWriter { half, sequence: 0 }),
            closed: AtomicBool::new(false),
            closed_tx,
            greeted: AtomicBool::new(false),
            screen_name: RwLock::new(String::new()),
            metrics,
        })
    }

    /// Subscribed by the handler right after accept, so a disconnect
    /// from anywhere (displaced login, shutdown) unblocks its read.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn screen_name(&self) -> String {
        self.screen_name.read().expect("screen name lock").clone()
    }

    /// Set once the connection authenticates.
    pub fn set_screen_name(&self, screen_name: &str) {
        *self.screen_name.write().expect("screen name lock") = screen_name.to_string();
    }

    /// Records the greeting; returns whether the client had already
    /// greeted on this connection.
    pub fn mark_greeted(&self) -> bool {
        self.greeted.swap(true, Ordering::SeqCst)
    }

    pub fn is_greeted(&self) -> bool {
        self.greeted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stamps the next sequence number and writes one frame. A send on a
    /// disconnected session is a no-op; a write failure closes the
    /// session and surfaces to the caller.
    pub async fn send(&self, mut flap: Flap) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        // Checked under the lock: disconnect holds it too, so after
        // disconnect() returns no later send can reach the socket.
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        flap.sequence = writer.sequence;
        writer.sequence = writer.sequence.wrapping_add(1);
        let encoded = flap.encode();
        if writer.half.write_all(&encoded).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.closed_tx.send(true);
            let _ = writer.half.shutdown().await;
            return Err(SessionError::Io);
        }
        self.metrics.mark_flap_out(flap.channel);
        Ok(())
    }

    /// Wraps a command in a channel-2 frame and sends it.
    pub async fn send_snac(&self, snac: &Snac) -> Result<(), SessionError> {
        self.send(Flap::new(Channel::Data, snac.encode())).await
    }

    /// Idempotent; the closed signal unblocks the handler's read.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.closed_tx.send(true);
        let mut writer = self.writer.lock().await;
        let _ = writer.half.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) async fn force_sequence(&self, sequence: u16) {
        self.writer.lock().await.sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscard_proto::FLAP_HEADER_LEN;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (Arc<Session>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, peer) = listener.accept().await.unwrap();
        let (_read, write) = server_stream.into_split();
        let session = Session::new(write, peer, Arc::new(Metrics::new()));
        (session, client)
    }

    async fn read_frame(client: &mut TcpStream) -> (u8, u16, Vec<u8>) {
        let mut header = [0u8; FLAP_HEADER_LEN];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x2a);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut payload = vec![0u8; length];
        client.read_exact(&mut payload).await.unwrap();
        (header[1], u16::from_be_bytes([header[2], header[3]]), payload)
    }

    #[tokio::test]
    async fn sequences_assigned_in_order() {
        let (session, mut client) = connected_pair().await;
        session
            .send(Flap::new(Channel::SignOn, vec![0, 0, 0, 1]))
            .await
            .unwrap();
        session
            .send(Flap::new(Channel::Data, vec![0xaa]))
            .await
            .unwrap();
        let (channel, sequence, payload) = read_frame(&mut client).await;
        assert_eq!((channel, sequence), (1, 0));
        assert_eq!(payload, vec![0, 0, 0, 1]);
        let (channel, sequence, _) = read_frame(&mut client).await;
        assert_eq!((channel, sequence), (2, 1));
    }

    #[tokio::test]
    async fn sequence_wraps_mod_u16() {
        let (session, mut client) = connected_pair().await;
        session.force_sequence(0xffff).await;
        session.send(Flap::new(Channel::Data, Vec::new())).await.unwrap();
        session.send(Flap::new(Channel::Data, Vec::new())).await.unwrap();
        let (_, sequence, _) = read_frame(&mut client).await;
        assert_eq!(sequence, 0xffff);
        let (_, sequence, _) = read_frame(&mut client).await;
        assert_eq!(sequence, 0x0000);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_silences_sends() {
        let (session, mut client) = connected_pair().await;
        session.disconnect().await;
        session.disconnect().await;
        assert!(session.is_closed());
        session
            .send(Flap::new(Channel::Data, vec![1, 2, 3]))
            .await
            .unwrap();
        // The peer observes EOF, not a frame.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn greeted_flag_latches() {
        let (session, _client) = connected_pair().await;
        assert!(!session.is_greeted());
        assert!(!session.mark_greeted());
        assert!(session.mark_greeted());
        assert!(session.is_greeted());
    }
}
