use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};

use crate::rtun::tunnel::transport::{BoxedStream, TransportSession};

const INCOMING_BACKLOG: usize = 64;

/// A yamux session over any byte stream.
///
/// A background task drives the session and forwards server-initiated streams
/// into a channel. It keeps reading frames while the channel is full; `close`
/// aborts it, which drops the sender and wakes up a pending `accept_stream`.
pub struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    closed: AtomicBool,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub fn tcp_client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let local = c.local_addr().ok();
        Self::client(c, remote, local)
    }

    pub fn client<T>(io: T, remote: Option<SocketAddr>, local: Option<SocketAddr>) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_client(io, tokio_yamux::Config::default());
        Self::from_session(session, remote, local)
    }

    /// Server side of a session; the client only needs it to stand in for a
    /// tunnel server in tests.
    #[cfg(test)]
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = tokio_yamux::Session::new_server(io, tokio_yamux::Config::default());
        Self::from_session(session, None, None)
    }

    fn from_session<T>(
        mut session: tokio_yamux::Session<T>,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(INCOMING_BACKLOG);
        let task = tokio::spawn(async move {
            // Streams the consumer has not taken yet wait here, so a slow
            // consumer never stops the session from reading frames.
            let mut parked: VecDeque<tokio_yamux::StreamHandle> = VecDeque::new();
            loop {
                tokio::select! {
                    next = session.next() => match next {
                        Some(Ok(st)) => parked.push_back(st),
                        Some(Err(err)) => {
                            tracing::debug!(err=%err, "tunnel: yamux session ended");
                            break;
                        }
                        None => break,
                    },
                    permit = tx.reserve(), if !parked.is_empty() => {
                        let Ok(permit) = permit else { break };
                        if let Some(st) = parked.pop_front() {
                            permit.send(st);
                        }
                    }
                }
            }
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            remote,
            local,
            closed: AtomicBool::new(false),
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("tunnel: session closed");
        }
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn pair() -> (YamuxSession, YamuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (YamuxSession::client(a, None, None), YamuxSession::server(b))
    }

    #[tokio::test]
    async fn server_opened_stream_reaches_client() {
        let (client, server) = pair();

        let mut out = server.open_stream().await.unwrap();
        out.write_all(b"hello").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = tokio::time::timeout(Duration::from_secs(2), client.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unaccepted_inbound_streams_do_not_stall_the_session() {
        let (client, server) = pair();

        // Far more inbound streams than the handoff channel holds, none accepted.
        let mut inbound = Vec::new();
        for _ in 0..(INCOMING_BACKLOG * 3) {
            let mut st = server.open_stream().await.unwrap();
            st.write_all(b"x").await.unwrap();
            st.flush().await.unwrap();
            inbound.push(st);
        }

        // Traffic the other way still flows.
        let mut out = tokio::time::timeout(Duration::from_secs(2), client.open_stream())
            .await
            .unwrap()
            .unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let mut st = server.accept_stream().await.unwrap();
                let mut buf = [0u8; 4];
                st.read_exact(&mut buf).await.unwrap();
                if &buf == b"ping" {
                    return buf;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&got, b"ping");

        // And every parked stream is still delivered, in order of arrival.
        for _ in 0..inbound.len() {
            let mut st = tokio::time::timeout(Duration::from_secs(2), client.accept_stream())
                .await
                .unwrap()
                .unwrap();
            let mut buf = [0u8; 1];
            st.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"x");
        }
    }

    #[tokio::test]
    async fn close_unblocks_accept_and_is_idempotent() {
        let (client, _server) = pair();
        let client = std::sync::Arc::new(client);

        let waiter = tokio::spawn({
            let client = client.clone();
            async move { client.accept_stream().await.is_err() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;
        client.close().await;

        let failed = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(failed);
        assert!(client.open_stream().await.is_err());
    }
}
