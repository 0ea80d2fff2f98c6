use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::rtun::{
    telemetry,
    tunnel::{
        inject::{InjectListener, Rejected},
        protocol::{self, Message, ProtocolError, ProxyRequest},
        service::{self, Service, ServiceError, ServiceOptions},
        transport::{BoxedStream, TransportSession, yamux::YamuxSession},
    },
    version::{self, CompatError},
};

/// Accepted streams waiting for the dispatcher. A slow dispatcher throttles
/// the accept task once this fills up.
pub const ACCEPT_QUEUE_CAPACITY: usize = 16;

// One slot per producer (accept task, serve task).
const ERROR_SLOTS: usize = 2;

const TEARDOWN_GRACE: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on the TCP connect to the tunnel server. Zero disables it.
    pub dial_timeout: Duration,
    /// Bound on reading the `WorkerHeader` of an inbound stream. Zero disables it.
    pub header_timeout: Duration,
    pub forward: ServiceOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            header_timeout: Duration::from_secs(10),
            forward: ServiceOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("tunnel: connect {addr}: {err}")]
    Connect { addr: String, err: std::io::Error },
    #[error("tunnel: connect {addr}: timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("tunnel: open control stream: {0:#}")]
    OpenControl(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Incompatible(#[from] CompatError),
    /// Server-supplied reason, verbatim.
    #[error("{0}")]
    Rejected(String),
    #[error("unexpected response")]
    UnexpectedMessage,
    #[error("control stream: {0}")]
    Codec(#[from] ProtocolError),
    #[error("control stream closed")]
    ControlClosed,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Why [`Client::run`] stopped.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("dialer closed")]
    DialerClosed,
    #[error("service: {0}")]
    Service(#[from] ServiceError),
    #[error("run cancelled")]
    Cancelled,
}

pub struct Client {
    opts: ClientOptions,
    session: Arc<dyn TransportSession>,
    control: tokio::sync::Mutex<Option<BoxedStream>>,
    listeners: DashMap<String, Arc<InjectListener>>,
    service: Arc<Service>,
    hostname: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("remote", &self.session.remote_addr())
            .field("proxies", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects to a tunnel server over TCP and opens the control stream.
    pub async fn dial(addr: &str, opts: ClientOptions) -> Result<Self, DialError> {
        let connect = TcpStream::connect(addr);
        let res = if opts.dial_timeout > Duration::ZERO {
            tokio::time::timeout(opts.dial_timeout, connect)
                .await
                .map_err(|_| DialError::Timeout {
                    addr: addr.to_string(),
                    timeout: opts.dial_timeout,
                })?
        } else {
            connect.await
        };
        let conn = res.map_err(|err| DialError::Connect {
            addr: addr.to_string(),
            err,
        })?;
        let _ = conn.set_nodelay(true);

        let sess: Arc<dyn TransportSession> = Arc::new(YamuxSession::tcp_client(conn));
        Self::connect(sess, opts).await
    }

    /// Opens the control stream on an established session. The session is
    /// closed if that fails.
    pub async fn connect(
        session: Arc<dyn TransportSession>,
        opts: ClientOptions,
    ) -> Result<Self, DialError> {
        let control = match session.open_stream().await {
            Ok(st) => st,
            Err(err) => {
                session.close().await;
                return Err(DialError::OpenControl(err));
            }
        };

        tracing::info!(
            server=?session.remote_addr(),
            local=?session.local_addr(),
            "tunnel: connected"
        );

        Ok(Self {
            service: Arc::new(Service::new(opts.forward.clone())),
            opts,
            session,
            control: tokio::sync::Mutex::new(Some(control)),
            listeners: DashMap::new(),
            hostname: local_hostname(),
            closed: AtomicBool::new(false),
        })
    }

    /// Names currently routable, sorted.
    pub fn proxies(&self) -> Vec<String> {
        let mut out: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    pub fn forwards(&self) -> telemetry::SharedForwards {
        self.service.forwards()
    }

    /// Registers `name` with the server and routes its traffic to `addr`.
    ///
    /// The registry is only touched once the server accepted the name and the
    /// forwarding service took the proxy.
    pub async fn proxy(&self, name: &str, token: &str, addr: &str) -> Result<(), ProxyError> {
        if let Err(err) = self.auth_proxy(name, token).await {
            metrics::counter!(telemetry::REGISTRATIONS, "result" => "rejected").increment(1);
            tracing::warn!(proxy=%name, err=%err, "tunnel: proxy registration failed");
            return Err(err.into());
        }

        let l = Arc::new(InjectListener::new());
        let replaced = self
            .service
            .register(service::Proxy::new(name, l.clone(), addr))?;
        self.listeners.insert(name.to_string(), l);
        // The router already sees the new listener, so a stream still waiting
        // on the old one is rerouted when this close rejects it.
        if let Some(old) = replaced {
            old.close();
        }

        metrics::counter!(telemetry::REGISTRATIONS, "result" => "ok").increment(1);
        tracing::info!(proxy=%name, local=%addr, "tunnel: proxy registered");
        Ok(())
    }

    async fn auth_proxy(&self, name: &str, token: &str) -> Result<(), HandshakeError> {
        let req = Message::Proxy(ProxyRequest {
            name: name.to_string(),
            token: token.to_string(),
            version: version::VERSION.to_string(),
            hostname: self.hostname.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        });

        // Held across the write+read pair so concurrent registrations cannot
        // consume each other's responses.
        let mut guard = self.control.lock().await;
        if self.closed.load(Ordering::Acquire) {
            guard.take();
            return Err(HandshakeError::ControlClosed);
        }
        let cmd = guard.as_mut().ok_or(HandshakeError::ControlClosed)?;

        let res = async {
            protocol::write_message(cmd, &req).await?;
            protocol::read_message(cmd).await
        }
        .await;
        if res.is_err() && self.closed.load(Ordering::Acquire) {
            guard.take();
        }
        drop(guard);

        match res? {
            Message::Version(v) => {
                version::compat_server(&v.version)?;
                tracing::debug!(proxy=%name, server_version=%v.version, "tunnel: handshake ok");
                Ok(())
            }
            Message::Error(e) => Err(HandshakeError::Rejected(e.message)),
            other => {
                tracing::debug!(proxy=%name, got=other.kind(), "tunnel: unexpected handshake response");
                Err(HandshakeError::UnexpectedMessage)
            }
        }
    }

    /// Accepts and routes worker streams until the session fails, the
    /// forwarding service fails, or `shutdown` turns true (or its sender is
    /// dropped).
    ///
    /// Control stream and session are closed before this returns, whatever
    /// the reason.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunError {
        let (conn_tx, mut connc) = mpsc::channel::<BoxedStream>(ACCEPT_QUEUE_CAPACITY);
        let (err_tx, mut errc) = mpsc::channel::<RunError>(ERROR_SLOTS);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let accept = tokio::spawn(accept_loop(
            self.session.clone(),
            cancel_rx.clone(),
            conn_tx,
            err_tx.clone(),
        ));
        let serve = tokio::spawn({
            let service = self.service.clone();
            async move {
                if let Err(err) = service.serve(cancel_rx).await {
                    let _ = err_tx.try_send(RunError::Service(err));
                }
            }
        });

        let err = self.dispatch(&mut connc, &mut errc, &mut shutdown).await;
        tracing::info!(reason=%err, "tunnel: run stopping");

        cancel_tx.send_replace(true);
        self.close_control().await;
        self.session.close().await;

        connc.close();
        let mut drained = 0usize;
        while let Ok(st) = connc.try_recv() {
            drop(st);
            drained += 1;
        }
        if drained > 0 {
            telemetry::stream_dropped("shutdown");
            tracing::debug!(drained, "tunnel: dropped queued streams");
        }

        join_with_grace(accept, "accept").await;
        join_with_grace(serve, "serve").await;
        err
    }

    async fn dispatch(
        &self,
        connc: &mut mpsc::Receiver<BoxedStream>,
        errc: &mut mpsc::Receiver<RunError>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RunError {
        loop {
            if *shutdown.borrow_and_update() {
                return RunError::Cancelled;
            }

            tokio::select! {
                Some(st) = connc.recv() => self.handle_conn(st).await,
                Some(err) = errc.recv() => return err,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return RunError::Cancelled;
                    }
                }
                else => return RunError::DialerClosed,
            }
        }
    }

    /// Routes one worker stream by its header. Every failure drops the stream
    /// without answering the server.
    async fn handle_conn(&self, mut st: BoxedStream) {
        let header = if self.opts.header_timeout > Duration::ZERO {
            match tokio::time::timeout(self.opts.header_timeout, protocol::read_worker_header(&mut st))
                .await
            {
                Ok(res) => res,
                Err(_) => {
                    tracing::debug!("tunnel: worker header timed out");
                    telemetry::stream_dropped("header_timeout");
                    close_stream(st).await;
                    return;
                }
            }
        } else {
            protocol::read_worker_header(&mut st).await
        };

        let header = match header {
            Ok(h) => h,
            Err(err) => {
                tracing::debug!(err=%err, "tunnel: bad worker header");
                telemetry::stream_dropped("bad_header");
                close_stream(st).await;
                return;
            }
        };

        // Clone out of the map so no shard lock is held across the await.
        let listener = self.listeners.get(&header.name).map(|e| e.value().clone());
        let Some(mut listener) = listener else {
            tracing::debug!(proxy=%header.name, "tunnel: unknown proxy");
            telemetry::stream_dropped("unknown_proxy");
            close_stream(st).await;
            return;
        };

        loop {
            let Err(Rejected(back)) = listener.put(st).await else {
                metrics::counter!(telemetry::STREAMS_ROUTED, "proxy" => header.name).increment(1);
                return;
            };
            let current = self.listeners.get(&header.name).map(|e| e.value().clone());
            match current {
                Some(next) if !Arc::ptr_eq(&next, &listener) => {
                    tracing::debug!(proxy=%header.name, "tunnel: proxy replaced; rerouting stream");
                    listener = next;
                    st = back;
                }
                _ => {
                    tracing::debug!(proxy=%header.name, "tunnel: inject failed");
                    telemetry::stream_dropped("inject_failed");
                    close_stream(back).await;
                    return;
                }
            }
        }
    }

    async fn close_control(&self) {
        self.closed.store(true, Ordering::Release);
        // A registration in flight holds the lock; closing the session fails
        // its read and it drops the stream itself.
        let Ok(mut guard) = self.control.try_lock() else {
            return;
        };
        if let Some(mut cmd) = guard.take() {
            let _ = tokio::time::timeout(CLOSE_GRACE, cmd.shutdown()).await;
        }
    }
}

async fn accept_loop(
    session: Arc<dyn TransportSession>,
    cancel: watch::Receiver<bool>,
    connc: mpsc::Sender<BoxedStream>,
    errc: mpsc::Sender<RunError>,
) {
    loop {
        let st = match session.accept_stream().await {
            Ok(st) => st,
            Err(err) => {
                tracing::debug!(err=%err, "tunnel: accept failed");
                let _ = errc.try_send(RunError::DialerClosed);
                return;
            }
        };
        metrics::counter!(telemetry::STREAMS_ACCEPTED).increment(1);

        if *cancel.borrow() {
            return;
        }
        if connc.send(st).await.is_err() {
            return;
        }
    }
}

async fn close_stream(mut st: BoxedStream) {
    let _ = tokio::time::timeout(CLOSE_GRACE, st.shutdown()).await;
}

async fn join_with_grace(mut task: JoinHandle<()>, name: &'static str) {
    if tokio::time::timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
        tracing::warn!(task = name, "tunnel: task did not stop in time; aborting");
        task.abort();
        let _ = task.await;
    }
}

/// Kernel hostname; empty when it cannot be read.
#[cfg(unix)]
fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(h) => h.to_string_lossy().into_owned(),
        Err(err) => {
            tracing::debug!(err=%err, "tunnel: gethostname failed");
            String::new()
        }
    }
}

#[cfg(not(unix))]
fn local_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_default()
}
