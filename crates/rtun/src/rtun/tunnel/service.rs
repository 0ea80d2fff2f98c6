//! Forwarding service: drains every proxy's injection point toward its local
//! address.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Notify, mpsc},
    task::JoinSet,
    time,
};

use crate::rtun::{
    telemetry,
    tunnel::{inject::InjectListener, transport::BoxedStream},
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("proxy name is empty")]
    EmptyName,
    #[error("service closed")]
    Closed,
    #[error("service already serving")]
    AlreadyServing,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub dial_timeout: Duration,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::ZERO,
        }
    }
}

/// A named injection point bound to the local address it forwards to.
#[derive(Debug, Clone)]
pub struct Proxy {
    name: String,
    local_addr: String,
    listener: Arc<InjectListener>,
}

impl Proxy {
    pub fn new(name: &str, listener: Arc<InjectListener>, local_addr: &str) -> Self {
        Self {
            name: name.to_string(),
            local_addr: local_addr.trim().to_string(),
            listener,
        }
    }
}

pub struct Service {
    opts: ServiceOptions,
    proxies: DashMap<String, Arc<Proxy>>,
    pending: mpsc::UnboundedSender<Arc<Proxy>>,
    pending_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Arc<Proxy>>>>,
    forwards: telemetry::SharedForwards,
    closed: AtomicBool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("proxies", &self.proxies.len())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub fn new(opts: ServiceOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            opts,
            proxies: DashMap::new(),
            pending: tx,
            pending_rx: std::sync::Mutex::new(Some(rx)),
            forwards: Arc::new(telemetry::ForwardRegistry::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn forwards(&self) -> telemetry::SharedForwards {
        self.forwards.clone()
    }

    /// Adds a proxy. A proxy already registered under the same name is
    /// replaced and its listener handed back still open; the caller closes
    /// it once nothing routes to it anymore.
    pub fn register(&self, proxy: Proxy) -> Result<Option<Arc<InjectListener>>, ServiceError> {
        if proxy.name.trim().is_empty() {
            return Err(ServiceError::EmptyName);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ServiceError::Closed);
        }

        let proxy = Arc::new(proxy);
        let replaced = self
            .proxies
            .insert(proxy.name.clone(), proxy.clone())
            .map(|old| {
                tracing::info!(proxy=%old.name, local=%old.local_addr, "tunnel: proxy replaced");
                old.listener.clone()
            });
        self.pending
            .send(proxy)
            .map_err(|_| ServiceError::Closed)?;
        Ok(replaced)
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.proxies.iter().map(|p| p.key().clone()).collect();
        out.sort();
        out
    }

    /// Runs one accept loop per proxy until `shutdown` turns true or its
    /// sender goes away. Proxies registered while serving are picked up too.
    ///
    /// On return every listener is closed and the service rejects further
    /// registrations.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ServiceError> {
        let pending = self
            .pending_rx
            .lock()
            .map_err(|_| ServiceError::Closed)?
            .take();
        let Some(mut pending) = pending else {
            return Err(ServiceError::AlreadyServing);
        };

        let mut tasks = JoinSet::new();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = pending.recv() => {
                    let Some(proxy) = next else { break; };
                    let opts = self.opts.clone();
                    let forwards = self.forwards.clone();
                    tasks.spawn(accept_loop(proxy, opts, forwards));
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.closed.store(true, Ordering::Release);
        for p in self.proxies.iter() {
            p.listener.close();
        }
        tasks.shutdown().await;
        Ok(())
    }
}

async fn accept_loop(
    proxy: Arc<Proxy>,
    opts: ServiceOptions,
    forwards: telemetry::SharedForwards,
) {
    tracing::debug!(proxy=%proxy.name, local=%proxy.local_addr, "tunnel: proxy serving");

    let mut conns = JoinSet::new();
    while let Ok(st) = proxy.listener.accept().await {
        let proxy = proxy.clone();
        let opts = opts.clone();
        let forwards = forwards.clone();
        conns.spawn(async move {
            forward(&proxy, st, &opts, &forwards).await;
        });
        while conns.try_join_next().is_some() {}
    }

    tracing::debug!(proxy=%proxy.name, "tunnel: proxy stopped");
    conns.shutdown().await;
}

async fn forward(
    proxy: &Proxy,
    mut st: BoxedStream,
    opts: &ServiceOptions,
    forwards: &telemetry::SharedForwards,
) {
    let _active = telemetry::ActiveForwardGuard::new(&proxy.name);
    let id = telemetry::new_forward_id();

    let mut up = match dial_local(&proxy.local_addr, opts.dial_timeout).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(id=%id, proxy=%proxy.name, local=%proxy.local_addr, err=%format!("{err:#}"), "tunnel: local dial failed");
            let _ = st.shutdown().await;
            return;
        }
    };

    forwards.add(telemetry::ForwardInfo {
        id: id.clone(),
        proxy: proxy.name.clone(),
        local_addr: proxy.local_addr.clone(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });

    let res = copy_bidirectional(&mut st, &mut up, opts.idle_timeout).await;

    forwards.remove(&id);

    match res {
        Ok((ingress, egress)) => {
            metrics::counter!(telemetry::BYTES_INGRESS).increment(ingress);
            metrics::counter!(telemetry::BYTES_EGRESS).increment(egress);
            tracing::debug!(id=%id, proxy=%proxy.name, ingress, egress, "tunnel: forward done");
        }
        Err(err) => {
            tracing::debug!(id=%id, proxy=%proxy.name, err=%format!("{err:#}"), "tunnel: forward ended with error");
        }
    }
}

async fn dial_local(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let dial = TcpStream::connect(addr);
    let c = if timeout > Duration::ZERO {
        time::timeout(timeout, dial)
            .await
            .context("dial timeout")??
    } else {
        dial.await?
    };
    let _ = c.set_nodelay(true);
    Ok(c)
}

const COPY_BUF: usize = 16 * 1024;

/// Copies both ways until each side has sent EOF. With a non-zero
/// `idle_timeout`, the copy fails once neither direction moved a byte for
/// that long.
async fn copy_bidirectional(
    st: &mut BoxedStream,
    up: &mut TcpStream,
    idle_timeout: Duration,
) -> anyhow::Result<(u64, u64)> {
    let activity = Notify::new();
    let (mut sr, mut sw) = tokio::io::split(&mut *st);
    let (mut ur, mut uw) = up.split();

    let copy = async {
        tokio::try_join!(
            copy_half(&mut sr, &mut uw, &activity),
            copy_half(&mut ur, &mut sw, &activity),
        )
    };
    let watchdog = async {
        if idle_timeout.is_zero() {
            return std::future::pending::<()>().await;
        }
        while time::timeout(idle_timeout, activity.notified()).await.is_ok() {}
    };

    tokio::select! {
        res = copy => Ok(res?),
        _ = watchdog => anyhow::bail!("idle timeout after {}", humantime::format_duration(idle_timeout)),
    }
}

async fn copy_half<R, W>(r: &mut R, w: &mut W, activity: &Notify) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            let _ = w.shutdown().await;
            return Ok(total);
        }
        w.write_all(&buf[..n]).await?;
        total += n as u64;
        activity.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::watch,
    };

    use super::*;

    async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = ln.accept().await else { return };
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn forwards_injected_stream_to_local_address() {
        let (addr, echo) = echo_server().await;

        let svc = Arc::new(Service::new(ServiceOptions::default()));
        let l = Arc::new(InjectListener::new());
        svc.register(Proxy::new("web", l.clone(), &addr)).unwrap();

        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn({
            let svc = svc.clone();
            async move { svc.serve(rx).await }
        });

        let (a, mut b) = tokio::io::duplex(1024);
        l.put(Box::new(a)).await.unwrap();

        b.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        time::timeout(Duration::from_secs(2), b.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");

        tx.send(true).unwrap();
        let res = time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
        assert!(l.is_closed());
        assert!(matches!(
            svc.register(Proxy::new("late", Arc::new(InjectListener::new()), &addr)),
            Err(ServiceError::Closed)
        ));

        echo.abort();
    }

    #[tokio::test]
    async fn serves_proxies_registered_after_start() {
        let (addr, echo) = echo_server().await;

        let svc = Arc::new(Service::new(ServiceOptions::default()));
        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn({
            let svc = svc.clone();
            async move { svc.serve(rx).await }
        });

        let l = Arc::new(InjectListener::new());
        svc.register(Proxy::new("late", l.clone(), &addr)).unwrap();

        let (a, mut b) = tokio::io::duplex(1024);
        l.put(Box::new(a)).await.unwrap();
        b.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        time::timeout(Duration::from_secs(2), b.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"x");

        drop(tx);
        assert!(time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
        echo.abort();
    }

    #[tokio::test]
    async fn duplicate_name_hands_back_previous_listener_open() {
        let svc = Service::new(ServiceOptions::default());
        let first = Arc::new(InjectListener::new());
        let second = Arc::new(InjectListener::new());

        assert!(svc.register(Proxy::new("web", first.clone(), "127.0.0.1:1")).unwrap().is_none());
        let replaced = svc
            .register(Proxy::new("web", second.clone(), "127.0.0.1:2"))
            .unwrap()
            .unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(!first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(svc.names(), vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn idle_timeout_spares_a_steadily_active_forward() {
        let (addr, echo) = echo_server().await;

        let svc = Arc::new(Service::new(ServiceOptions {
            idle_timeout: Duration::from_millis(300),
            ..ServiceOptions::default()
        }));
        let l = Arc::new(InjectListener::new());
        svc.register(Proxy::new("web", l.clone(), &addr)).unwrap();

        let (_tx, rx) = watch::channel(false);
        let serving = tokio::spawn({
            let svc = svc.clone();
            async move { svc.serve(rx).await }
        });

        let (a, mut b) = tokio::io::duplex(1024);
        l.put(Box::new(a)).await.unwrap();

        // Ten round trips spaced 100ms apart outlast the 300ms bound in total.
        for i in 0..10u8 {
            b.write_all(&[i]).await.unwrap();
            let mut buf = [0u8; 1];
            time::timeout(Duration::from_secs(2), b.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf[0], i);
            time::sleep(Duration::from_millis(100)).await;
        }

        serving.abort();
        echo.abort();
    }

    #[tokio::test]
    async fn idle_timeout_closes_a_silent_forward() {
        let (addr, echo) = echo_server().await;

        let svc = Arc::new(Service::new(ServiceOptions {
            idle_timeout: Duration::from_millis(200),
            ..ServiceOptions::default()
        }));
        let l = Arc::new(InjectListener::new());
        svc.register(Proxy::new("web", l.clone(), &addr)).unwrap();

        let (_tx, rx) = watch::channel(false);
        let serving = tokio::spawn({
            let svc = svc.clone();
            async move { svc.serve(rx).await }
        });

        let (a, mut b) = tokio::io::duplex(1024);
        l.put(Box::new(a)).await.unwrap();

        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        serving.abort();
        echo.abort();
    }

    #[tokio::test]
    async fn rejects_empty_name() {
        let svc = Service::new(ServiceOptions::default());
        let err = svc
            .register(Proxy::new("  ", Arc::new(InjectListener::new()), "127.0.0.1:1"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmptyName));
        assert!(svc.names().is_empty());
    }

    #[tokio::test]
    async fn serve_runs_only_once() {
        let svc = Arc::new(Service::new(ServiceOptions::default()));
        let (_tx, rx) = watch::channel(false);
        let first = tokio::spawn({
            let svc = svc.clone();
            let rx = rx.clone();
            async move { svc.serve(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = svc.serve(rx).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyServing));
        first.abort();
    }

    #[tokio::test]
    async fn unreachable_local_address_closes_stream() {
        // Bind then drop to get a port nobody listens on.
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        drop(ln);

        let svc = Arc::new(Service::new(ServiceOptions::default()));
        let l = Arc::new(InjectListener::new());
        svc.register(Proxy::new("dead", l.clone(), &addr)).unwrap();

        let (tx, rx) = watch::channel(false);
        let serving = tokio::spawn({
            let svc = svc.clone();
            async move { svc.serve(rx).await }
        });

        let (a, mut b) = tokio::io::duplex(64);
        l.put(Box::new(a)).await.unwrap();

        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(svc.forwards().len(), 0);

        tx.send(true).unwrap();
        let _ = serving.await;
    }
}
