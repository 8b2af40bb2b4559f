//! SSH connection to a single server
//!
//! Wraps a blocking `ssh2` session behind a mutex. Every libssh2 call runs on
//! the blocking pool. Waiting for the session and the remote work are each
//! bounded by the caller's deadline; work that could not start in time is
//! never run.

use async_trait::async_trait;
use ssh2::{Channel, ExtendedData, Session};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::registry::ServerConfig;
use crate::remote::{CommandOutput, RemoteSession};
use crate::utils::expand_tilde;

/// Extra time granted to a blocking task beyond the libssh2 timeout
const BLOCKING_GRACE: Duration = Duration::from_secs(2);

/// Deadline for the probe used by `is_connected`
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Mode for uploaded files
const UPLOAD_MODE: i32 = 0o644;

// LIBSSH2_ERROR_EAGAIN
const EAGAIN: i32 = -37;

/// Poll interval while another caller holds the session
const LOCK_POLL: Duration = Duration::from_millis(5);

const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;
const TUNNEL_IDLE_SLEEP: Duration = Duration::from_millis(10);

type SessionSlot = Arc<Mutex<Option<Session>>>;

/// SSH connection to one server
pub struct SshConnection {
    config: ServerConfig,
    session: SessionSlot,
    connect_timeout_ms: AtomicU64,
}

impl SshConnection {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
            connect_timeout_ms: AtomicU64::new(10_000),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    /// Run `f` against the session slot on the blocking pool.
    ///
    /// The session lock must be taken within `deadline`, after which `f`
    /// gets a fresh `deadline` of its own. If the caller stops waiting
    /// first, `f` is skipped.
    async fn with_session<T, F>(&self, deadline: Duration, what: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<Session>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.session);
        let abandoned = Arc::new(AtomicBool::new(false));
        let gave_up = Arc::clone(&abandoned);
        let label = format!("{} on {}", what, self.config.name);

        let task = tokio::task::spawn_blocking(move || -> Result<T> {
            let mut guard = lock_within(&*slot, deadline, &gave_up)
                .map_err(|e| match e {
                    FleetError::Timeout(reason) => {
                        FleetError::Timeout(format!("{}: {}", label, reason))
                    }
                    other => other,
                })?;
            f(&mut guard)
        });

        let outer = deadline.saturating_mul(2).saturating_add(BLOCKING_GRACE);
        match tokio::time::timeout(outer, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(FleetError::InvalidState(format!("{} task failed: {}", what, e))),
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                Err(FleetError::Timeout(format!(
                    "{} on {} exceeded {:?}",
                    what, self.config.name, deadline
                )))
            }
        }
    }
}

/// Take `slot` within `wait`. Gives up early once `abandoned` is set, so a
/// guard is only returned to a caller that is still waiting.
fn lock_within<'a, T>(
    slot: &'a Mutex<T>,
    wait: Duration,
    abandoned: &AtomicBool,
) -> Result<MutexGuard<'a, T>> {
    let started = Instant::now();
    loop {
        if abandoned.load(Ordering::Acquire) {
            return Err(FleetError::Timeout("caller stopped waiting".to_string()));
        }
        match slot.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => {
                return Err(FleetError::InvalidState("SSH session lock poisoned".to_string()))
            }
            Err(TryLockError::WouldBlock) => {}
        }
        if started.elapsed() >= wait {
            return Err(FleetError::Timeout(format!("session busy for {:?}", wait)));
        }
        thread::sleep(LOCK_POLL);
    }
}

#[async_trait]
impl RemoteSession for SshConnection {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        self.connect_timeout_ms
            .store(deadline.as_millis() as u64, Ordering::Relaxed);
        let config = self.config.clone();

        self.with_session(deadline, "connect", move |slot| {
            if slot.is_some() {
                return Ok(());
            }
            let sess = open_session(&config, deadline)?;
            info!("Connected to {} ({}:{})", config.name, config.host, config.port);
            *slot = Some(sess);
            Ok(())
        })
        .await
    }

    async fn execute(&self, command: &str, deadline: Duration) -> Result<CommandOutput> {
        let cmd = command.to_string();
        let server = self.config.name.clone();

        let result = self
            .with_session(deadline, "execute", move |slot| {
                let sess = slot
                    .as_ref()
                    .ok_or_else(|| FleetError::NotConnected(server.clone()))?;
                exec_blocking(sess, &cmd, deadline)
            })
            .await;

        match result {
            // Either the command never started or it is left to finish on its own.
            Err(FleetError::Timeout(_)) => Ok(CommandOutput::deadline_exceeded(command, deadline)),
            other => other,
        }
    }

    async fn upload_file(&self, local: &Path, remote: &str, deadline: Duration) -> Result<u64> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let server = self.config.name.clone();

        self.with_session(deadline, "upload", move |slot| {
            let sess = slot
                .as_ref()
                .ok_or_else(|| FleetError::NotConnected(server.clone()))?;
            let bytes = upload_blocking(sess, &local, &remote, deadline)?;
            debug!("Uploaded {} -> {}:{} ({} bytes)", local.display(), server, remote, bytes);
            Ok(bytes)
        })
        .await
    }

    async fn download_file(&self, remote: &str, local: &Path, deadline: Duration) -> Result<u64> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let server = self.config.name.clone();

        self.with_session(deadline, "download", move |slot| {
            let sess = slot
                .as_ref()
                .ok_or_else(|| FleetError::NotConnected(server.clone()))?;
            let bytes = download_blocking(sess, &remote, &local, deadline)?;
            debug!("Downloaded {}:{} -> {} ({} bytes)", server, remote, local.display(), bytes);
            Ok(bytes)
        })
        .await
    }

    async fn create_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle> {
        if !self.is_connected().await {
            return Err(FleetError::NotConnected(self.config.name.clone()));
        }

        let deadline = Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed));
        let config = self.config.clone();
        let remote_host = remote_host.to_string();

        let task = tokio::task::spawn_blocking(move || -> Result<TunnelHandle> {
            // Forwarding runs in non-blocking mode, so it gets its own session.
            let sess = open_session(&config, deadline)?;
            sess.set_blocking(false);

            let listener = TcpListener::bind(("127.0.0.1", local_port))?;
            listener.set_nonblocking(true)?;
            let local_addr = listener.local_addr()?;

            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = Arc::clone(&stop);
            let target = format!("{}:{}", remote_host, remote_port);
            info!("Tunnel {} -> {} via {}", local_addr, target, config.name);

            let worker = thread::Builder::new()
                .name(format!("tunnel-{}", local_addr.port()))
                .spawn(move || run_tunnel(sess, listener, &remote_host, remote_port, &worker_stop))?;

            Ok(TunnelHandle {
                local_addr,
                target,
                stop,
                worker: Some(worker),
            })
        });

        match tokio::time::timeout(deadline + BLOCKING_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(FleetError::InvalidState(format!("tunnel setup failed: {}", e))),
            Err(_) => Err(FleetError::Timeout(format!(
                "tunnel setup on {} exceeded {:?}",
                self.config.name, deadline
            ))),
        }
    }

    async fn is_connected(&self) -> bool {
        match self.execute("echo ok", PROBE_TIMEOUT).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    async fn close(&self) {
        let server = self.config.name.clone();
        let _ = self
            .with_session(PROBE_TIMEOUT, "close", move |slot| {
                if let Some(sess) = slot.take() {
                    let _ = sess.disconnect(None, "Closing connection", None);
                    debug!("Disconnected from {}", server);
                }
                Ok(())
            })
            .await;
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().clamp(1, u32::MAX as u128) as u32
}

fn io_error(context: &str, e: io::Error) -> FleetError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            FleetError::Timeout(format!("{}: {}", context, e))
        }
        _ => FleetError::Network(format!("{}: {}", context, e)),
    }
}

/// Establish TCP, handshake and authenticate.
fn open_session(config: &ServerConfig, deadline: Duration) -> Result<Session> {
    // Key material is read first so a bad path fails before any network traffic.
    let private_key = match &config.private_key_path {
        Some(path) => {
            let path = expand_tilde(path);
            let key = fs::read_to_string(&path).map_err(|e| {
                FleetError::Authentication(format!("failed to read private key {}: {}", path, e))
            })?;
            Some(key)
        }
        None => None,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| FleetError::Network(format!("cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| FleetError::Network(format!("no address for {}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, deadline)
        .map_err(|e| io_error(&format!("cannot connect to {}", addr), e))?;

    let mut sess = Session::new()?;
    sess.set_tcp_stream(tcp);
    sess.set_timeout(millis(deadline));
    sess.handshake()
        .map_err(|e| FleetError::Network(format!("SSH handshake with {} failed: {}", addr, e)))?;

    let auth = match (&private_key, &config.password) {
        (Some(key), _) => sess.userauth_pubkey_memory(&config.username, None, key, None),
        (None, Some(password)) => sess.userauth_password(&config.username, password),
        (None, None) => {
            return Err(FleetError::Authentication(format!(
                "no credentials configured for {}",
                config.name
            )))
        }
    };
    auth.map_err(|e| FleetError::Authentication(format!("{}@{}: {}", config.username, config.host, e)))?;

    if !sess.authenticated() {
        return Err(FleetError::Authentication(format!(
            "{}@{} rejected credentials",
            config.username, config.host
        )));
    }

    sess.set_timeout(0);
    Ok(sess)
}

fn exec_blocking(sess: &Session, command: &str, deadline: Duration) -> Result<CommandOutput> {
    let start = Instant::now();
    sess.set_timeout(millis(deadline));

    let mut channel = sess.channel_session()?;
    channel.handle_extended_data(ExtendedData::Merge)?;
    channel.exec(command)?;

    let mut output = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let remaining = match deadline.checked_sub(start.elapsed()) {
            Some(r) if !r.is_zero() => r,
            _ => return Ok(terminate(sess, channel, command, deadline)),
        };
        sess.set_timeout(millis(remaining));

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Ok(terminate(sess, channel, command, deadline));
            }
            Err(e) => return Err(FleetError::CommandFailed(format!("reading output: {}", e))),
        }
    }

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;
    sess.set_timeout(0);

    Ok(CommandOutput {
        command: command.to_string(),
        exit_code,
        output: String::from_utf8_lossy(&output).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
        timestamp: chrono::Utc::now(),
        timed_out: false,
    })
}

/// Hang up on a command that overran its deadline. The remote process is
/// signalled through the channel close, not guaranteed killed.
fn terminate(sess: &Session, mut channel: Channel, command: &str, deadline: Duration) -> CommandOutput {
    sess.set_timeout(millis(BLOCKING_GRACE));
    let _ = channel.send_eof();
    let _ = channel.close();
    sess.set_timeout(0);
    warn!("Command exceeded {:?}: {}", deadline, command);
    CommandOutput::deadline_exceeded(command, deadline)
}

fn upload_blocking(sess: &Session, local: &Path, remote: &str, deadline: Duration) -> Result<u64> {
    let mut file = File::open(local)?;
    let size = file.metadata()?.len();

    sess.set_timeout(millis(deadline));
    let mut channel = sess.scp_send(Path::new(remote), UPLOAD_MODE, size, None)?;
    let written = io::copy(&mut file, &mut channel)
        .map_err(|e| io_error(&format!("uploading to {}", remote), e))?;

    channel.send_eof()?;
    channel.wait_eof()?;
    channel.close()?;
    channel.wait_close()?;
    sess.set_timeout(0);
    Ok(written)
}

fn download_blocking(sess: &Session, remote: &str, local: &Path, deadline: Duration) -> Result<u64> {
    sess.set_timeout(millis(deadline));
    let (mut channel, _stat) = sess.scp_recv(Path::new(remote))?;

    let mut file = File::create(local)?;
    let read = io::copy(&mut channel, &mut file)
        .map_err(|e| io_error(&format!("downloading {}", remote), e))?;
    file.flush()?;

    channel.send_eof()?;
    channel.wait_eof()?;
    channel.close()?;
    channel.wait_close()?;
    sess.set_timeout(0);
    Ok(read)
}

// ============== Port Forwarding ==============

/// Handle to a running local port forward.
///
/// Dropping it stops the tunnel and joins the forwarding thread, which blocks
/// the current thread for up to one pump iteration plus teardown. From async
/// code prefer [`TunnelHandle::close`].
pub struct TunnelHandle {
    local_addr: SocketAddr,
    target: String,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Signal the tunnel to stop and wait for open pipes to be torn down.
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Like [`TunnelHandle::stop`], but joins the forwarding thread on the
    /// blocking pool instead of the calling task's thread.
    pub async fn close(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let target = self.target.clone();
            if tokio::task::spawn_blocking(move || worker.join()).await.is_err() {
                warn!("Tunnel worker for {} could not be joined", target);
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("local_addr", &self.local_addr)
            .field("target", &self.target)
            .finish()
    }
}

enum PumpState {
    Idle,
    Active,
    Closed,
}

/// One accepted local connection bridged to a `direct-tcpip` channel
struct Pipe {
    local: TcpStream,
    channel: Channel,
}

impl Pipe {
    fn pump(&mut self, buf: &mut [u8]) -> io::Result<PumpState> {
        let mut state = PumpState::Idle;

        match self.local.read(buf) {
            Ok(0) => return Ok(PumpState::Closed),
            Ok(n) => {
                write_fully(&mut self.channel, &buf[..n])?;
                state = PumpState::Active;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match self.channel.read(buf) {
            Ok(0) if self.channel.eof() => return Ok(PumpState::Closed),
            Ok(0) => {}
            Ok(n) => {
                write_fully(&mut self.local, &buf[..n])?;
                state = PumpState::Active;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        Ok(state)
    }

    fn shutdown(mut self) {
        let _ = self.local.shutdown(std::net::Shutdown::Both);
        let _ = self.channel.close();
    }
}

fn write_fully<W: Write>(w: &mut W, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match w.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn open_forward(sess: &Session, host: &str, port: u16, stop: &AtomicBool) -> Result<Channel> {
    loop {
        match sess.channel_direct_tcpip(host, port, None) {
            Ok(channel) => return Ok(channel),
            Err(e) if matches!(e.code(), ssh2::ErrorCode::Session(EAGAIN)) && !stop.load(Ordering::Relaxed) => {
                thread::sleep(Duration::from_millis(1))
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn run_tunnel(sess: Session, listener: TcpListener, host: &str, port: u16, stop: &AtomicBool) {
    let mut pipes: Vec<Pipe> = Vec::new();
    let mut buf = vec![0u8; TUNNEL_BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let mut active = false;

        match listener.accept() {
            Ok((stream, peer)) => match open_forward(&sess, host, port, stop) {
                Ok(channel) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Tunnel peer {} rejected: {}", peer, e);
                    } else {
                        debug!("Tunnel accepted {}", peer);
                        pipes.push(Pipe {
                            local: stream,
                            channel,
                        });
                        active = true;
                    }
                }
                Err(e) => warn!("Tunnel forward to {}:{} failed: {}", host, port, e),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("Tunnel listener failed: {}", e);
                break;
            }
        }

        let mut open = Vec::with_capacity(pipes.len());
        for mut pipe in pipes.drain(..) {
            match pipe.pump(&mut buf) {
                Ok(PumpState::Active) => {
                    active = true;
                    open.push(pipe);
                }
                Ok(PumpState::Idle) => open.push(pipe),
                Ok(PumpState::Closed) | Err(_) => pipe.shutdown(),
            }
        }
        pipes = open;

        if !active {
            thread::sleep(TUNNEL_IDLE_SLEEP);
        }
    }

    for pipe in pipes {
        pipe.shutdown();
    }
    let _ = sess.disconnect(None, "Tunnel closed", None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> ServerConfig {
        ServerConfig {
            name: "web1".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            username: "deploy".to_string(),
            password: Some("secret".to_string()),
            private_key_path: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_execute_requires_connect() {
        let conn = SshConnection::new(config(22));
        let err = conn
            .execute("echo hi", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_transfers_require_connect() {
        let conn = SshConnection::new(config(22));
        let err = conn
            .upload_file(Path::new("/tmp/x"), "/tmp/x", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(_)));

        let err = conn
            .download_file("/tmp/x", Path::new("/tmp/x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_not_connected_check_and_idempotent_close() {
        let conn = SshConnection::new(config(22));
        assert!(!conn.is_connected().await);
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_tunnel_requires_connect() {
        let conn = SshConnection::new(config(22));
        let err = conn.create_tunnel(0, "localhost", 5432).await.unwrap_err();
        assert!(matches!(err, FleetError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_missing_private_key_is_auth_error() {
        let mut cfg = config(22);
        cfg.private_key_path = Some("/nonexistent/fleetops/id_ed25519".to_string());
        let conn = SshConnection::new(cfg);
        let err = conn.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_refused_port_is_network_error() {
        // Bind then drop to find a port nothing is listening on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let conn = SshConnection::new(config(port));
        let err = conn.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, FleetError::Network(_) | FleetError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_busy_session_times_out_without_running_work() {
        let conn = SshConnection::new(config(22));
        let ran = Arc::new(AtomicBool::new(false));

        let held = conn.session.lock().unwrap();
        let flag = Arc::clone(&ran);
        let err = conn
            .with_session(Duration::from_millis(100), "execute", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Timeout(_)));

        drop(held);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_work_deadline_starts_after_session_is_free() {
        let conn = SshConnection::new(config(22));
        let slot = Arc::clone(&conn.session);
        let holder = thread::spawn(move || {
            let _guard = slot.lock().unwrap();
            thread::sleep(Duration::from_millis(150));
        });
        thread::sleep(Duration::from_millis(20));

        // Waiting plus work exceed one deadline, but each fits on its own.
        let value = conn
            .with_session(Duration::from_millis(250), "execute", |_| {
                thread::sleep(Duration::from_millis(200));
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        holder.join().unwrap();
    }

    #[test]
    fn test_lock_within_gives_up_once_abandoned() {
        let slot = Mutex::new(());
        let abandoned = AtomicBool::new(true);
        let err = lock_within(&slot, Duration::from_secs(5), &abandoned).unwrap_err();
        assert!(matches!(err, FleetError::Timeout(_)));

        abandoned.store(false, Ordering::SeqCst);
        assert!(lock_within(&slot, Duration::from_millis(10), &abandoned).is_ok());
    }

    #[tokio::test]
    async fn test_tunnel_close_joins_worker_off_thread() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                thread::sleep(TUNNEL_IDLE_SLEEP);
            }
        });
        let handle = TunnelHandle {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            target: "localhost:5432".to_string(),
            stop: Arc::clone(&stop),
            worker: Some(worker),
        };
        assert!(handle.is_active());

        tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .unwrap();
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn test_millis_clamps() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
