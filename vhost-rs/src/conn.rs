//! Per-connection serving with listener-level deadlines
//!
//! Both listeners serve connections through [`serve_connection`], which applies
//! the same three limits everywhere: a header read timeout, a timeout on
//! writes the client stops draining, and an idle timeout between requests.

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tower::ServiceExt;
use tracing::debug;

use crate::config::ServerConfig;

/// Deadlines applied to every accepted connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ConnectionLimits {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Last I/O time and in-flight request count of one connection
#[derive(Debug)]
pub struct Activity {
    opened: Instant,
    last_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl Activity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: Instant::now(),
            last_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        })
    }

    fn touch(&self) {
        let ms = self.opened.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last read or write
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }

    fn request_started(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(self.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<Activity>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

/// I/O wrapper recording activity and failing writes that stall too long
pub struct DeadlineIo<T> {
    inner: T,
    write_timeout: Duration,
    write_deadline: Option<Pin<Box<Sleep>>>,
    activity: Arc<Activity>,
}

impl<T> DeadlineIo<T> {
    pub fn new(inner: T, write_timeout: Duration, activity: Arc<Activity>) -> Self {
        Self {
            inner,
            write_timeout,
            write_deadline: None,
            activity,
        }
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let timeout = self.write_timeout;
        let deadline = self
            .write_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.write_deadline = None;
                Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for DeadlineIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if result.is_ready() {
            self.activity.touch();
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeadlineIo<T> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Ready(result) => {
                self.write_deadline = None;
                self.activity.touch();
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_deadline(cx).map(|r| r.map(|()| 0)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                self.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_deadline(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Resolves once the connection has been idle for `limit` with nothing in flight
pub async fn idle_watchdog(activity: Arc<Activity>, limit: Duration) {
    loop {
        let idle = activity.idle_for();
        if idle >= limit && activity.in_flight() == 0 {
            return;
        }
        let wait = limit.saturating_sub(idle).max(Duration::from_millis(100));
        tokio::time::sleep(wait).await;
    }
}

/// Serve HTTP/1.1 and HTTP/2 on `io` until it closes or goes idle
pub async fn serve_connection<IO>(io: IO, peer: SocketAddr, app: Router, limits: ConnectionLimits)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let activity = Activity::new();
    let io = DeadlineIo::new(io, limits.write_timeout, activity.clone());

    let tracker = activity.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        let app = app.clone();
        let guard = tracker.request_started();
        async move {
            let response = app.oneshot(req).await;
            drop(guard);
            response
        }
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(limits.read_timeout);

    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Error serving connection from {}: {}", peer, e);
            }
        }
        _ = idle_watchdog(activity, limits.idle_timeout) => {
            debug!("Closing idle connection from {}", peer);
        }
    }
}
