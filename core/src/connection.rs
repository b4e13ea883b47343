//! Connection I/O: stream abstraction and reader/writer tasks
//!
//! Each accepted socket is split into a reader task and a writer task.
//! The reader accumulates bytes in a capped `RecvQueue`, extracts
//! complete lines and forwards parsed messages to the main loop; the
//! writer drains a capped `SendQueue` fed from the connection's mpsc
//! channel. Either side exceeding its cap closes the connection. TLS is
//! a transport hook behind `ConnectionStream`: the handshake completes
//! inside `accept` before any protocol data is exchanged.

use crate::buffer::{RecvQueue, SendQueue};
use crate::{Message, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

/// Events surfaced from connection tasks to the main loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A complete parsed line arrived.
    Line(Uuid, Message),
    /// The connection died; the id must be culled exactly once.
    Closed(Uuid, String),
}

/// Trait for connection streams (TCP or TLS)
pub trait ConnectionStream: Send {
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReadHalf>, Box<dyn ConnectionWriteHalf>);
}

/// Trait for connection read half
pub trait ConnectionReadHalf: Send + tokio::io::AsyncRead + Unpin {}

/// Trait for connection write half
pub trait ConnectionWriteHalf: Send + tokio::io::AsyncWrite + Unpin {}

impl ConnectionStream for TcpStream {
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReadHalf>, Box<dyn ConnectionWriteHalf>) {
        let (read, write) = tokio::io::split(*self);
        (Box::new(read), Box::new(write))
    }
}

impl ConnectionReadHalf for tokio::io::ReadHalf<TcpStream> {}
impl ConnectionWriteHalf for tokio::io::WriteHalf<TcpStream> {}

impl ConnectionStream for tokio_rustls::server::TlsStream<TcpStream> {
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReadHalf>, Box<dyn ConnectionWriteHalf>) {
        let (read, write) = tokio::io::split(*self);
        (Box::new(read), Box::new(write))
    }
}

impl ConnectionReadHalf for tokio::io::ReadHalf<tokio_rustls::server::TlsStream<TcpStream>> {}
impl ConnectionWriteHalf for tokio::io::WriteHalf<tokio_rustls::server::TlsStream<TcpStream>> {}

impl ConnectionStream for tokio_rustls::client::TlsStream<TcpStream> {
    fn split(self: Box<Self>) -> (Box<dyn ConnectionReadHalf>, Box<dyn ConnectionWriteHalf>) {
        let (read, write) = tokio::io::split(*self);
        (Box::new(read), Box::new(write))
    }
}

impl ConnectionReadHalf for tokio::io::ReadHalf<tokio_rustls::client::TlsStream<TcpStream>> {}
impl ConnectionWriteHalf for tokio::io::WriteHalf<tokio_rustls::client::TlsStream<TcpStream>> {}

/// Wrap a freshly accepted TCP stream, running the TLS handshake when an
/// acceptor is attached for this listener.
pub async fn accept_stream(
    stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<Box<dyn ConnectionStream>> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| crate::Error::Transport(format!("TLS handshake failed: {}", e)))?;
            Ok(Box::new(tls))
        }
        None => Ok(Box::new(stream)),
    }
}

/// Spawn the reader and writer tasks for a connection.
///
/// `outbound` feeds the writer; everything the connection produces goes
/// to `events`. Both tasks exit when the socket dies, reporting a single
/// `Closed` event from the reader side.
pub fn spawn_io_tasks(
    id: Uuid,
    stream: Box<dyn ConnectionStream>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    recvq_bytes: usize,
    sendq_bytes: usize,
) {
    let (mut read_half, mut write_half) = stream.split();

    // Writer: serialize messages through the capped sendq.
    let writer_events = events.clone();
    tokio::spawn(async move {
        let mut sendq = SendQueue::new(sendq_bytes);
        while let Some(message) = outbound.recv().await {
            if !sendq.push(message.to_wire()) {
                let _ = writer_events.send(ConnectionEvent::Closed(
                    id,
                    "SendQ exceeded".to_string(),
                ));
                return;
            }
            // Burst in whatever else is already queued, then flush in
            // one batch so a slow peer sees fewer, larger writes.
            while let Ok(next) = outbound.try_recv() {
                if !sendq.push(next.to_wire()) {
                    let _ = writer_events.send(ConnectionEvent::Closed(
                        id,
                        "SendQ exceeded".to_string(),
                    ));
                    return;
                }
            }
            let batch = sendq.drain_all().concat();
            if let Err(e) = write_half.write_all(batch.as_bytes()).await {
                tracing::debug!(connection = %id, error = %e, "write failed");
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader: accumulate, frame, parse, forward.
    tokio::spawn(async move {
        let mut recvq = RecvQueue::new(recvq_bytes);
        let mut chunk = [0u8; 4096];
        let reason = loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break "Connection closed".to_string(),
                Ok(n) => {
                    let data = String::from_utf8_lossy(&chunk[..n]).into_owned();
                    if !recvq.append(&data) {
                        break "RecvQ exceeded".to_string();
                    }
                    for line in recvq.extract_lines() {
                        match Message::parse(&line) {
                            Ok(message) => {
                                if events.send(ConnectionEvent::Line(id, message)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(connection = %id, error = %e, "unparsable line");
                            }
                        }
                    }
                }
                Err(e) => break format!("Read error: {}", e),
            }
        };
        let _ = events.send(ConnectionEvent::Closed(id, reason));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_reader_frames_and_parses() {
        let (mut client, server) = socket_pair().await;
        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        spawn_io_tasks(id, Box::new(server), out_rx, ev_tx, 8192, 8192);
        drop(out_tx);

        client.write_all(b"NICK alice\r\nUSER a 0 * :A\r\n").await.unwrap();

        match ev_rx.recv().await.unwrap() {
            ConnectionEvent::Line(got_id, msg) => {
                assert_eq!(got_id, id);
                assert_eq!(msg.command, "NICK");
            }
            other => panic!("unexpected event {:?}", other),
        }
        match ev_rx.recv().await.unwrap() {
            ConnectionEvent::Line(_, msg) => assert_eq!(msg.command, "USER"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_reports_close_once() {
        let (client, server) = socket_pair().await;
        let id = Uuid::new_v4();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        spawn_io_tasks(id, Box::new(server), out_rx, ev_tx, 8192, 8192);

        drop(client);
        match ev_rx.recv().await.unwrap() {
            ConnectionEvent::Closed(got_id, _) => assert_eq!(got_id, id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writer_sends_messages() {
        let (mut client, server) = socket_pair().await;
        let id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        spawn_io_tasks(id, Box::new(server), out_rx, ev_tx, 8192, 8192);

        out_tx
            .send(Message::new("PING", vec!["token".to_string()]))
            .unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"PING token\r\n");
    }

    #[tokio::test]
    async fn test_recvq_overflow_closes() {
        let (mut client, server) = socket_pair().await;
        let id = Uuid::new_v4();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        spawn_io_tasks(id, Box::new(server), out_rx, ev_tx, 16, 8192);

        client
            .write_all(b"this unterminated line is far longer than sixteen bytes")
            .await
            .unwrap();
        match ev_rx.recv().await.unwrap() {
            ConnectionEvent::Closed(_, reason) => {
                assert_eq!(reason, "RecvQ exceeded");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
