//! In-memory transport session for exercising the client without a network.

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::{mpsc, watch},
};

use crate::rtun::tunnel::{
    protocol::{self, Message, WorkerHeader},
    transport::{BoxedStream, TransportSession},
};

const PIPE_BYTES: usize = 64 * 1024;

/// Duplex end that keeps a count of live client-side streams.
pub struct TrackedStream {
    inner: DuplexStream,
    live: Arc<AtomicUsize>,
}

impl TrackedStream {
    fn new(inner: DuplexStream, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self { inner, live }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct MockSession {
    control: tokio::sync::Mutex<Option<DuplexStream>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,
    closed: watch::Sender<bool>,
    closes: AtomicUsize,
}

/// The tunnel server's side of a [`MockSession`].
pub struct MockServer {
    /// Server end of the control stream.
    pub control: DuplexStream,
    inbound: mpsc::Sender<BoxedStream>,
    live: Arc<AtomicUsize>,
}

pub fn pair() -> (Arc<MockSession>, MockServer) {
    let (client_ctl, server_ctl) = tokio::io::duplex(PIPE_BYTES);
    let (tx, rx) = mpsc::channel(64);
    let (closed, _) = watch::channel(false);

    let sess = Arc::new(MockSession {
        control: tokio::sync::Mutex::new(Some(client_ctl)),
        incoming: tokio::sync::Mutex::new(rx),
        closed,
        closes: AtomicUsize::new(0),
    });
    let server = MockServer {
        control: server_ctl,
        inbound: tx,
        live: Arc::new(AtomicUsize::new(0)),
    };
    (sess, server)
}

impl MockSession {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl MockServer {
    /// Opens a worker stream toward the client whose first frame names `proxy`.
    pub async fn open_worker(&self, proxy: &str) -> DuplexStream {
        let (client_end, mut server_end) = self.raw_stream();
        protocol::write_message(
            &mut server_end,
            &Message::Worker(WorkerHeader {
                name: proxy.to_string(),
            }),
        )
        .await
        .expect("write worker header");
        self.inbound
            .send(client_end)
            .await
            .expect("client session gone");
        server_end
    }

    /// Opens a worker stream without writing anything on it.
    pub async fn open_raw(&self) -> DuplexStream {
        let (client_end, server_end) = self.raw_stream();
        self.inbound
            .send(client_end)
            .await
            .expect("client session gone");
        server_end
    }

    /// Client-side stream ends handed out and not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Simulates the physical connection dropping.
    pub fn disconnect(self) -> DuplexStream {
        self.control
    }

    fn raw_stream(&self) -> (BoxedStream, DuplexStream) {
        let (a, b) = tokio::io::duplex(PIPE_BYTES);
        (Box::new(TrackedStream::new(a, self.live.clone())), b)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let st = self
            .control
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("mock: only one stream can be opened"))?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            anyhow::bail!("mock: session closed");
        }
        let mut rx = self.incoming.lock().await;
        tokio::select! {
            st = rx.recv() => st.ok_or_else(|| anyhow::anyhow!("mock: server gone")),
            _ = closed.wait_for(|c| *c) => anyhow::bail!("mock: session closed"),
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
