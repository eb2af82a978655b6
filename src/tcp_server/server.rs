use std::{
    any::Any,
    io,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::conn::{Connection, TimedStream};
use crate::{config::models::TcpProxyConfig, utils::ConnectionTracker};

/// Upper bound for a logged panic payload.
const MAX_PANIC_LOG: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("tcp server closed")]
    ServerClosed,

    #[error("tcp server has no listen address")]
    MissingAddress,

    #[error("failed to listen on {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Serves one accepted connection. The connection is closed when the
/// handler returns or panics.
#[async_trait]
pub trait TcpHandler: Send + Sync + 'static {
    async fn serve_tcp(&self, conn: Connection);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Listening = 1,
    ShuttingDown = 2,
    Closed = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Listening,
            2 => ServerState::ShuttingDown,
            _ => ServerState::Closed,
        }
    }
}

/// Per-connection socket settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub keepalive: Option<Duration>,
}

impl From<&TcpProxyConfig> for ServerOptions {
    fn from(config: &TcpProxyConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            keepalive: config.keepalive(),
        }
    }
}

pub struct TcpServer {
    addr: String,
    handler: Arc<dyn TcpHandler>,
    options: ServerOptions,
    state: AtomicU8,
    done: CancellationToken,
    base: CancellationToken,
    tracker: ConnectionTracker,
    local_addr: OnceLock<SocketAddr>,
}

impl TcpServer {
    pub fn new(addr: impl Into<String>, handler: Arc<dyn TcpHandler>, options: ServerOptions) -> Self {
        Self {
            addr: addr.into(),
            handler,
            options,
            state: AtomicU8::new(ServerState::Idle as u8),
            done: CancellationToken::new(),
            base: CancellationToken::new(),
            tracker: ConnectionTracker::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Derive every connection token from `base` instead of a private one.
    ///
    /// Cancelling `base` reaches open connections; [`Self::close`] does not.
    pub fn with_base_token(mut self, base: CancellationToken) -> Self {
        self.base = base;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Address actually bound, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.active_connection_count()
    }

    /// Bind the address and accept connections until [`Self::close`] is called.
    ///
    /// Always ends with an error: [`ServerError::ServerClosed`] after a close,
    /// or the reason the server could not start.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind the listen address and move the server to
    /// [`ServerState::Listening`]. Nothing is accepted until [`Self::serve`].
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        if self.done.is_cancelled() {
            return Err(ServerError::ServerClosed);
        }
        if self.addr.is_empty() {
            return Err(ServerError::MissingAddress);
        }

        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| ServerError::Io {
                addr: self.addr.clone(),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            let _ = self.local_addr.set(local);
        }

        if self
            .state
            .compare_exchange(
                ServerState::Idle as u8,
                ServerState::Listening as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Closed while binding, or already serving from another task.
            return Err(ServerError::ServerClosed);
        }

        tracing::info!(addr = %self.addr, "TCP server listening");
        Ok(listener)
    }

    /// Accept on a listener from [`Self::bind`] until [`Self::close`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut backoff: Option<Duration> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => {
                    drop(listener);
                    self.state.store(ServerState::Closed as u8, Ordering::Release);
                    tracing::info!(addr = %self.addr, "TCP server stopped accepting");
                    return Err(ServerError::ServerClosed);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        backoff = None;
                        self.spawn_connection(stream, remote_addr);
                    }
                    Err(e) => {
                        let delay = backoff
                            .map(|d| (d * 2).min(Duration::from_secs(1)))
                            .unwrap_or(Duration::from_millis(5));
                        backoff = Some(delay);
                        tracing::warn!(addr = %self.addr, "Accept error: {}; retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, remote_addr: SocketAddr) {
        if let Some(period) = self.options.keepalive {
            if let Err(e) = apply_keepalive(&stream, period) {
                tracing::debug!(%remote_addr, "Failed to set TCP keep-alive: {}", e);
            }
        }

        let handler = self.handler.clone();
        let tracker = self.tracker.clone();
        let options = self.options;
        let addr = self.addr.clone();
        let cancel = self.base.child_token();

        tokio::spawn(async move {
            let info = tracker.register_connection(remote_addr).await;
            let stream = TimedStream::new(stream, options.read_timeout, options.write_timeout);
            let conn = Connection::new(info.id, remote_addr, stream, cancel.clone());

            let served = tokio::spawn(async move { handler.serve_tcp(conn).await }).await;
            if let Err(e) = served {
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    tracing::error!(
                        listen_addr = %addr,
                        %remote_addr,
                        "TCP handler panicked: {}",
                        message
                    );
                } else {
                    tracing::debug!(%remote_addr, "TCP handler cancelled");
                }
            }

            cancel.cancel();
            tracker.unregister_connection(info.id).await;
        });
    }

    /// Stop accepting connections. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            ServerState::Idle as u8,
            ServerState::Closed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            ServerState::Listening as u8,
            ServerState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.done.cancel();
    }

    /// Close the listener and wait up to `timeout` for in-flight connections.
    /// Returns `true` when every connection finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.close();
        self.tracker.wait_for_drain(timeout).await
    }
}

fn apply_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period).with_interval(period))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let mut message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };

    if message.len() > MAX_PANIC_LOG {
        let mut end = MAX_PANIC_LOG;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    struct Echo;

    #[async_trait]
    impl TcpHandler for Echo {
        async fn serve_tcp(&self, mut conn: Connection) {
            let mut buf = [0u8; 64];
            let stream = conn.stream();
            if let Ok(n) = stream.read(&mut buf).await {
                if buf[..n].starts_with(b"panic") {
                    panic!("handler asked to panic");
                }
                let _ = stream.write_all(&buf[..n]).await;
            }
        }
    }

    async fn start(server: Arc<TcpServer>) -> SocketAddr {
        let serving = server.clone();
        tokio::spawn(async move { serving.listen_and_serve().await });
        for _ in 0..100 {
            if let Some(addr) = server.local_addr() {
                if server.state() == ServerState::Listening {
                    return addr;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not start");
    }

    #[tokio::test]
    async fn test_missing_address() {
        let server = TcpServer::new("", Arc::new(Echo), ServerOptions::default());
        assert!(matches!(
            server.listen_and_serve().await,
            Err(ServerError::MissingAddress)
        ));
    }

    #[tokio::test]
    async fn test_close_before_listen() {
        let server = TcpServer::new("127.0.0.1:0", Arc::new(Echo), ServerOptions::default());
        server.close();
        server.close();
        assert_eq!(server.state(), ServerState::Closed);
        assert!(matches!(
            server.listen_and_serve().await,
            Err(ServerError::ServerClosed)
        ));
    }

    #[tokio::test]
    async fn test_echo_and_idempotent_close() {
        let server = Arc::new(TcpServer::new(
            "127.0.0.1:0",
            Arc::new(Echo),
            ServerOptions::default(),
        ));
        let addr = start(server.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        assert!(server.shutdown(Duration::from_secs(2)).await);
        server.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.state(), ServerState::Closed);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        let server = Arc::new(TcpServer::new(
            "127.0.0.1:0",
            Arc::new(Echo),
            ServerOptions::default(),
        ));
        let addr = start(server.clone()).await;

        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"panic").await.unwrap();
        let mut buf = [0u8; 8];
        // The panicking handler drops its connection.
        assert_eq!(bad.read(&mut buf).await.unwrap_or(0), 0);

        let mut good = TcpStream::connect(addr).await.unwrap();
        good.write_all(b"still").await.unwrap();
        let mut buf = [0u8; 5];
        good.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still");

        server.close();
    }

    /// Holds the connection open until its token fires.
    struct WaitForCancel;

    #[async_trait]
    impl TcpHandler for WaitForCancel {
        async fn serve_tcp(&self, mut conn: Connection) {
            let cancel = conn.cancel_token().clone();
            let stream = conn.stream();
            let _ = stream.write_all(b"ready").await;
            cancel.cancelled().await;
            let _ = stream.write_all(b"cancelled").await;
        }
    }

    #[tokio::test]
    async fn test_base_token_reaches_connections() {
        let base = CancellationToken::new();
        let server = Arc::new(
            TcpServer::new("127.0.0.1:0", Arc::new(WaitForCancel), ServerOptions::default())
                .with_base_token(base.clone()),
        );
        let addr = start(server.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ready");

        // Closing the listener leaves open connections alone.
        server.close();
        let mut byte = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), client.read(&mut byte))
                .await
                .is_err()
        );
        assert_eq!(server.active_connections(), 1);

        base.cancel();
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest, b"cancelled");
        assert!(server.shutdown(Duration::from_secs(2)).await);
    }

    /// Keeps every connection token it is handed.
    struct KeepToken(std::sync::Mutex<Vec<CancellationToken>>);

    #[async_trait]
    impl TcpHandler for KeepToken {
        async fn serve_tcp(&self, conn: Connection) {
            self.0.lock().unwrap().push(conn.cancel_token().clone());
        }
    }

    #[tokio::test]
    async fn test_connection_token_fires_when_handler_returns() {
        let handler = Arc::new(KeepToken(std::sync::Mutex::new(Vec::new())));
        let server = Arc::new(TcpServer::new(
            "127.0.0.1:0",
            handler.clone(),
            ServerOptions::default(),
        ));
        let addr = start(server.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
        assert!(server.shutdown(Duration::from_secs(2)).await);

        let tokens = handler.0.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(tokens[0].is_cancelled());
    }

    #[test]
    fn test_panic_message_is_bounded() {
        let long = "é".repeat(MAX_PANIC_LOG);
        let message = panic_message(Box::new(long));
        assert!(message.len() <= MAX_PANIC_LOG);
        assert_eq!(panic_message(Box::new("boom")), "boom");
    }
}
