//! # Connection Sessions
//!
//! Per-connection plumbing shared by both handshake directions:
//!
//! - [`read_introduction`] waits for the peer's `introduce` frame
//! - [`establish`] splits the socket and prepares the writer task, which
//!   the node starts once the handle is registered
//!
//! Every established connection owns exactly one writer task fed by a
//! bounded channel. All outbound frames for that peer go through it, so a
//! direct send racing a broadcast cannot interleave bytes on the wire.
//!
//! ```text
//!  send_chat_message ─┐
//!  broadcast_presence ─┼─► mpsc<Vec<u8>> ─► writer task ─► OwnedWriteHalf
//!  shutdown ───────────┘
//! ```

use log::{debug, error};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::common::config::NetworkConfig;
use crate::common::connection::{read_frame, FrameBuffer};
use crate::common::messages::{decode, Message};

use super::registry::{Direction, PeerHandle};

/// A freshly established connection, not yet registered.
pub struct Session {
    /// Handle to register
    pub handle: PeerHandle,
    /// Writing side; frames queued on `handle` wait until it is started
    pub writer: Writer,
    pub reader: OwnedReadHalf,
    /// Holds any bytes received after the handshake frame
    pub frames: FrameBuffer,
    /// Fires when the connection should be torn down
    pub close: Arc<Notify>,
}

/// A connection's writer task, ready to spawn.
pub struct Writer {
    name: String,
    writer: OwnedWriteHalf,
    rx: mpsc::Receiver<Vec<u8>>,
    close: Arc<Notify>,
    write_timeout: Duration,
}

impl Writer {
    pub fn spawn(self) {
        tokio::spawn(run_writer(
            self.name,
            self.writer,
            self.rx,
            self.close,
            self.write_timeout,
        ));
    }
}

/// Read the first frame from `stream` and require it to be `introduce`.
///
/// Returns the peer's display name, or a human-readable reason on failure.
/// Bytes following the frame are left in `frames`.
pub async fn read_introduction(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
) -> Result<String, String> {
    let frame = match read_frame(stream, frames).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Err("connection closed before introduction".to_string()),
        Err(e) => return Err(e.to_string()),
    };

    match decode(&frame) {
        Ok(Message::Introduce { username }) if !username.is_empty() => Ok(username),
        Ok(Message::Introduce { .. }) => Err("introduction carried an empty username".to_string()),
        Ok(other) => Err(format!("expected introduce, got `{}`", other.kind())),
        Err(e) => Err(format!("invalid introduction: {}", e)),
    }
}

/// Split `stream` and build its handle and (unstarted) writer.
pub fn establish(
    name: String,
    connection_id: u64,
    addr: SocketAddr,
    direction: Direction,
    stream: TcpStream,
    frames: FrameBuffer,
    network: &NetworkConfig,
) -> Session {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Vec<u8>>(network.outbound_queue.max(1));
    let close = Arc::new(Notify::new());

    Session {
        handle: PeerHandle::new(name.clone(), connection_id, addr, direction, tx, close.clone()),
        writer: Writer {
            name,
            writer,
            rx,
            close: close.clone(),
            write_timeout: network.write_timeout(),
        },
        reader,
        frames,
        close,
    }
}

/// Write queued frames in order until every sender is gone or a write fails.
async fn run_writer(
    name: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    close: Arc<Notify>,
    write_timeout: Duration,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("❌ Error sending to {}: {}", name, e);
                break;
            }
            Err(_) => {
                error!("❌ Timed out sending to {} after {:?}", name, write_timeout);
                break;
            }
        }
    }

    // Reader may still be waiting on the socket; tell it we're done.
    close.notify_one();
    let _ = writer.shutdown().await;
    debug!("🔌 Writer for {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::connection::encode_frame;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_read_introduction_accepts_introduce() {
        let (mut client, mut server) = socket_pair().await;
        let mut wire = encode_frame(&Message::introduce("alice")).unwrap();
        wire.extend(encode_frame(&Message::chat("alice", "bob", "early")).unwrap());
        client.write_all(&wire).await.unwrap();

        let mut frames = FrameBuffer::new(1024);
        let name = read_introduction(&mut server, &mut frames).await.unwrap();

        assert_eq!(name, "alice");
        // The chat that arrived alongside is kept for the read loop.
        let leftover = frames.next_frame().unwrap().unwrap();
        assert_eq!(decode(&leftover).unwrap(), Message::chat("alice", "bob", "early"));
    }

    #[tokio::test]
    async fn test_read_introduction_rejects_other_kinds() {
        let (mut client, mut server) = socket_pair().await;
        client
            .write_all(&encode_frame(&Message::presence("alice", "online")).unwrap())
            .await
            .unwrap();

        let mut frames = FrameBuffer::new(1024);
        let reason = read_introduction(&mut server, &mut frames).await.unwrap_err();
        assert!(reason.contains("presence"), "{}", reason);
    }

    #[tokio::test]
    async fn test_read_introduction_reports_early_close() {
        let (client, mut server) = socket_pair().await;
        drop(client);

        let mut frames = FrameBuffer::new(1024);
        let reason = read_introduction(&mut server, &mut frames).await.unwrap_err();
        assert!(reason.contains("closed"), "{}", reason);
    }

    #[tokio::test]
    async fn test_frames_queued_before_start_are_written_first() {
        let (mut client, server) = socket_pair().await;
        let addr = server.peer_addr().unwrap();
        let intro = encode_frame(&Message::introduce("bob")).unwrap();
        let chat = encode_frame(&Message::chat("bob", "alice", "hello")).unwrap();

        let session = establish(
            "alice".into(),
            1,
            addr,
            Direction::Inbound,
            server,
            FrameBuffer::new(1024),
            &NetworkConfig::default(),
        );
        let wait = Duration::from_secs(1);
        session.handle.send_frame(intro.clone(), wait).await.unwrap();

        // Nothing reaches the wire until the writer is started.
        let mut byte = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(100), client.read(&mut byte)).await;
        assert!(early.is_err(), "writer ran before it was started");

        let Session { handle, writer, .. } = session;
        writer.spawn();
        handle.send_frame(chat.clone(), wait).await.unwrap();
        drop(handle);

        // Dropping the last handle lets the writer drain and close.
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, [intro, chat].concat());
    }
}
