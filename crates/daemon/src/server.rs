//! Unix socket listener and socket-file lifecycle.
//!
//! Lifecycle: probe an existing socket file, bind, accept until stopped,
//! then drain in-flight connections. The socket file is removed by
//! [`SocketGuard`] on every exit path once bound.

use anyhow::{Context, Result};
use backtick_ipc::{IpcCommand, IpcResponse, MAX_IPC_MESSAGE_SIZE};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixSocket, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::store::StoreHandle;

/// How long to wait for a live peer to accept the probe connection.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed accept so persistent errors don't spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Path of the guarded socket file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed socket file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket file {}: {}", self.path.display(), e),
        }
    }
}

/// Result of trying to claim the socket path.
#[derive(Debug)]
pub enum BindOutcome {
    /// This process owns the socket.
    Bound {
        listener: UnixListener,
        guard: SocketGuard,
    },
    /// Another live instance answered on the socket path.
    AlreadyRunning,
}

/// What a connect to an existing socket path says about its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerProbe {
    /// Something is listening, possibly too busy to accept right now.
    Live,
    /// Nothing is listening; the file is left over.
    Stale,
}

/// Check if another helper instance is already running by probing the socket.
///
/// Only a refused connection or a vanished path counts as stale. A full
/// backlog (`WouldBlock`) or a probe that doesn't finish in time means a
/// live but busy peer.
async fn check_already_running(path: &Path) -> Result<PeerProbe> {
    match tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(_)) => Ok(PeerProbe::Live),
        Ok(Err(e)) => match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound => Ok(PeerProbe::Stale),
            ErrorKind::WouldBlock => {
                debug!("Peer on {} has a full backlog", path.display());
                Ok(PeerProbe::Live)
            }
            _ => Err(e).with_context(|| format!("Failed to probe {}", path.display())),
        },
        Err(_) => {
            debug!("Probe of {} timed out", path.display());
            Ok(PeerProbe::Live)
        }
    }
}

/// Claim the socket path, replacing a stale socket file if needed.
///
/// An existing path is probed first: if a live peer owns it the path is
/// left untouched and [`BindOutcome::AlreadyRunning`] is returned. Only a
/// path nobody listens on is deleted before binding.
pub async fn bind_socket(path: &Path, backlog: u32) -> Result<BindOutcome> {
    if fs::symlink_metadata(path).is_ok() {
        if check_already_running(path).await? == PeerProbe::Live {
            return Ok(BindOutcome::AlreadyRunning);
        }

        info!("Removing stale socket file {}", path.display());
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove stale socket {}", path.display()))
            }
        }
    }

    let socket = UnixSocket::new_stream().context("Failed to allocate listening socket")?;
    socket
        .bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    let guard = SocketGuard::new(path);
    let listener = socket
        .listen(backlog)
        .with_context(|| format!("Failed to listen on {}", path.display()))?;

    Ok(BindOutcome::Bound { listener, guard })
}

/// Run the IPC server, accepting connections until `stop` fires.
///
/// Each connection is handled on its own task. After `stop`, the listener
/// is closed and in-flight connections get up to `io_timeout` to finish.
pub async fn run_ipc_server(
    listener: UnixListener,
    dispatcher: Dispatcher,
    store: StoreHandle,
    io_timeout: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("Client connected");
                    let dispatcher = dispatcher.clone();
                    let store = store.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_client(stream, dispatcher, store, io_timeout).await {
                            warn!("Client handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!("Client task failed: {}", e);
                }
            }
            _ = &mut stop => break,
        }
    }

    drop(listener);
    debug!("Stopped accepting; {} connection(s) in flight", connections.len());

    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(io_timeout, drain).await.is_err() {
        warn!("Aborting {} connection(s) still in flight", connections.len());
        connections.abort_all();
    }
}

/// Handle a single client connection: one request, one reply.
async fn handle_client(
    mut stream: UnixStream,
    dispatcher: Dispatcher,
    store: StoreHandle,
    io_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_IPC_MESSAGE_SIZE];

    // Read the request with timeout and size bound
    let bytes_read = match tokio::time::timeout(io_timeout, stream.read(&mut buf)).await {
        Ok(result) => result.context("Failed to read request")?,
        Err(_) => {
            // Timeout: abort without a reply
            debug!("Client sent nothing within {:?}, closing", io_timeout);
            return Ok(());
        }
    };
    if bytes_read == 0 {
        return Ok(()); // Client disconnected
    }

    let (response, is_shutdown) = match IpcCommand::parse_bytes(&buf[..bytes_read]) {
        Ok(cmd) => {
            debug!("Received command: {}", cmd.name());
            let is_shutdown = matches!(cmd, IpcCommand::Shutdown);
            (dispatcher.handle(cmd).await, is_shutdown)
        }
        Err(e) => {
            warn!("Rejected request: {}", e);
            (IpcResponse::error(e.to_string()), false)
        }
    };

    let reply = response.encode();
    let write = async {
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await
    };
    let write_result = tokio::time::timeout(io_timeout, write).await;

    // Reply is fully written (or abandoned) before the helper stops
    if is_shutdown {
        store.shutdown("shutdown command").await;
    }

    match write_result {
        Ok(result) => result.context("Failed to write reply"),
        Err(_) => {
            debug!("Client did not accept the reply within {:?}", io_timeout);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::FakeWindowSource;
    use crate::store::run_event_loop;
    use backtick_core_order::{WindowOrder, WindowSnapshot};
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    fn test_socket_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("bt-{}-{}.sock", std::process::id(), name));
        let _ = fs::remove_file(&path);
        path
    }

    struct Harness {
        path: PathBuf,
        guard: Option<SocketGuard>,
        stop: Option<oneshot::Sender<()>>,
        server: JoinHandle<()>,
        event_loop: JoinHandle<WindowOrder>,
    }

    async fn start(name: &str, source: Arc<FakeWindowSource>, io_timeout: Duration) -> Harness {
        let path = test_socket_path(name);
        let (listener, guard) = match bind_socket(&path, 64).await.unwrap() {
            BindOutcome::Bound { listener, guard } => (listener, guard),
            BindOutcome::AlreadyRunning => panic!("unexpected live peer at {}", path.display()),
        };
        let (store, rx) = StoreHandle::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatcher = Dispatcher::new(source, store.clone());
        let server = tokio::spawn(run_ipc_server(listener, dispatcher, store, io_timeout, stop_rx));
        let event_loop = tokio::spawn(run_event_loop(rx, WindowOrder::new()));
        Harness {
            path,
            guard: Some(guard),
            stop: Some(stop_tx),
            server,
            event_loop,
        }
    }

    impl Harness {
        async fn finish(mut self) -> WindowOrder {
            let order = (&mut self.event_loop).await.unwrap();
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            (&mut self.server).await.unwrap();
            drop(self.guard.take());
            assert!(!self.path.exists());
            order
        }
    }

    async fn send(path: &Path, request: &str) -> String {
        let mut stream = UnixStream::connect(path).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    fn two_windows() -> Arc<FakeWindowSource> {
        Arc::new(FakeWindowSource::with_windows(vec![
            WindowSnapshot::new(1, "A", false),
            WindowSnapshot::new(2, "B", true),
        ]))
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let path = test_socket_path("stale");
        // Leave a socket file behind with nobody listening
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        match bind_socket(&path, 4).await.unwrap() {
            BindOutcome::Bound { listener, guard } => {
                assert_eq!(guard.path(), path.as_path());
                // New socket is live
                let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
                UnixStream::connect(&path).await.unwrap();
                accept.await.unwrap().unwrap();
                drop(guard);
            }
            BindOutcome::AlreadyRunning => panic!("stale socket treated as live"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_regular_file() {
        let path = test_socket_path("stale-file");
        fs::write(&path, b"not a socket").unwrap();

        let outcome = bind_socket(&path, 4).await.unwrap();
        assert!(matches!(outcome, BindOutcome::Bound { .. }));
        drop(outcome);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_detects_live_peer() {
        let path = test_socket_path("live");
        let peer = UnixListener::bind(&path).unwrap();

        let outcome = bind_socket(&path, 4).await.unwrap();
        assert!(matches!(outcome, BindOutcome::AlreadyRunning));

        // Peer's socket file is untouched and still answers
        assert!(path.exists());
        UnixStream::connect(&path).await.unwrap();

        drop(peer);
        fs::remove_file(&path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_bind_leaves_busy_peer_alone() {
        let path = test_socket_path("busy");
        let peer_socket = UnixSocket::new_stream().unwrap();
        peer_socket.bind(&path).unwrap();
        let peer = peer_socket.listen(1).unwrap();

        // Fill the peer's backlog without ever accepting
        let mut pending = Vec::new();
        let mut saw_would_block = false;
        for _ in 0..64 {
            match UnixStream::connect(&path).await {
                Ok(stream) => pending.push(stream),
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::WouldBlock);
                    saw_would_block = true;
                    break;
                }
            }
        }
        assert!(saw_would_block, "backlog never filled");

        let outcome = bind_socket(&path, 4).await.unwrap();
        assert!(matches!(outcome, BindOutcome::AlreadyRunning));
        assert!(path.exists());

        // The original listener still owns its queued connections
        peer.accept().await.unwrap();
        drop(pending);

        fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_bind_fresh_path() {
        let path = test_socket_path("fresh");
        let outcome = bind_socket(&path, 1).await.unwrap();
        assert!(matches!(outcome, BindOutcome::Bound { .. }));
        assert!(path.exists());
        drop(outcome);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_unwritable_directory_is_fatal() {
        let path = PathBuf::from("/nonexistent-backtick-dir/helper.sock");
        assert!(bind_socket(&path, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_request_reply_over_socket() {
        let harness = start("roundtrip", two_windows(), Duration::from_secs(5)).await;

        let reply = send(&harness.path, "getStatus").await;
        assert_eq!(reply, r#"OK:{"hasAccessibilityPermission":true}"#);

        let reply = send(
            &harness.path,
            r#"getWindows:{"newWindowPosition":"top","activationMode":"automatic"}"#,
        )
        .await;
        assert_eq!(
            reply,
            r#"OK:[{"id":2,"title":"B","isCurrentlyActive":true},{"id":1,"title":"A","isCurrentlyActive":false}]"#
        );

        let reply = send(&harness.path, "requestPermission").await;
        assert_eq!(reply, "OK:");

        let reply = send(&harness.path, "shutdown").await;
        assert_eq!(reply, "OK:");

        let order = harness.finish().await;
        assert_eq!(order.ids(), &[2, 1]);
    }

    #[tokio::test]
    async fn test_bad_requests_get_error_replies() {
        let harness = start("errors", two_windows(), Duration::from_secs(5)).await;

        let reply = send(&harness.path, "bogus").await;
        assert_eq!(reply, "ERROR:Unknown command: bogus");

        let reply = send(&harness.path, "getWindows:{oops").await;
        assert!(reply.starts_with("ERROR:Malformed getWindows payload"), "{}", reply);

        let reply = send(&harness.path, r#"activateWindow:{"id":12}"#).await;
        assert_eq!(reply, "ERROR:Window not found: 12");

        // Daemon is still serving after the failures
        let reply = send(&harness.path, "getStatus\n").await;
        assert!(reply.starts_with("OK:"));

        send(&harness.path, "shutdown").await;
        // Failed requests never touched the order
        assert!(harness.finish().await.is_empty());
    }

    #[tokio::test]
    async fn test_activation_promotes_over_socket() {
        let source = Arc::new(FakeWindowSource::with_windows(vec![
            WindowSnapshot::new(1, "A", true),
            WindowSnapshot::new(2, "B", false),
            WindowSnapshot::new(3, "C", false),
        ]));
        let harness = start("activate", source.clone(), Duration::from_secs(5)).await;

        send(
            &harness.path,
            r#"getWindows:{"newWindowPosition":"bottom","activationMode":"manual"}"#,
        )
        .await;
        assert_eq!(send(&harness.path, r#"activateWindow:{"id":2}"#).await, "OK:");

        send(&harness.path, "shutdown").await;
        let order = harness.finish().await;
        // Bootstrap put 1 first, then 3, 2 descending; activation moved 2 up
        assert_eq!(order.ids(), &[2, 1, 3]);
        assert_eq!(*source.activated.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_idle_client_times_out_without_reply() {
        let harness = start("timeout", two_windows(), Duration::from_millis(200)).await;

        let mut stream = UnixStream::connect(&harness.path).await.unwrap();
        let mut reply = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
            .await
            .expect("server should close idle connection");
        read.unwrap();
        assert!(reply.is_empty());

        send(&harness.path, "shutdown").await;
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_client_disconnect_without_request() {
        let harness = start("disconnect", two_windows(), Duration::from_secs(5)).await;

        drop(UnixStream::connect(&harness.path).await.unwrap());

        assert!(send(&harness.path, "getStatus").await.starts_with("OK:"));
        send(&harness.path, "shutdown").await;
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let harness = start("concurrent", two_windows(), Duration::from_secs(5)).await;

        let mut clients = Vec::new();
        for i in 0..16 {
            let path = harness.path.clone();
            clients.push(tokio::spawn(async move {
                let mode = if i % 2 == 0 { "automatic" } else { "manual" };
                let request = format!(
                    r#"getWindows:{{"newWindowPosition":"top","activationMode":"{}"}}"#,
                    mode
                );
                send(&path, &request).await
            }));
        }
        for client in clients {
            let reply = client.await.unwrap();
            let windows: Vec<serde_json::Value> =
                serde_json::from_str(reply.strip_prefix("OK:").unwrap()).unwrap();
            assert_eq!(windows.len(), 2);
        }

        send(&harness.path, "shutdown").await;
        assert_eq!(harness.finish().await.ids(), &[2, 1]);
    }
}
