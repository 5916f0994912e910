use crate::constants::network::{KEEPALIVE_INTERVAL_SECS, POLL_IDLE_SLEEP_MS, TIMEOUT_SSH_READY_MS};
use crate::errors::ToolError;
use crate::services::host::{
    validate_home, CaptureState, DirEntry, EntryStat, ExecOptions, ExecResult, Host, Truncation,
};
use crate::services::logger::Logger;
use crate::services::machine::{default_identity_files, ConnectionPlan, Endpoint, MachineResolver};
use crate::services::pool::SessionFactory;
use crate::utils::fs_atomic::temp_sibling_path;
use crate::utils::shell::wrap_sh;
use async_trait::async_trait;
use base64::Engine;
use ssh2::{Channel, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;

pub fn map_ssh_error(err: ssh2::Error) -> ToolError {
    let io_err: std::io::Error = err.into();
    match io_err.kind() {
        ErrorKind::TimedOut => ToolError::timeout("SSH operation timed out"),
        ErrorKind::WouldBlock => ToolError::retryable("SSH operation would block"),
        _ => ToolError::internal(format!("SSH error: {}", io_err)),
    }
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, ToolError> {
    let timeout = Duration::from_millis(TIMEOUT_SSH_READY_MS);
    let addr = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .map_err(|err| {
            ToolError::invalid_params(format!("Cannot resolve {}: {}", endpoint.host, err))
        })?
        .next()
        .ok_or_else(|| ToolError::invalid_params(format!("No address for {}", endpoint.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
        ToolError::retryable(format!("Failed to connect to {}: {}", endpoint.address(), err))
    })?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();
    Ok(tcp)
}

fn authenticate(session: &Session, endpoint: &Endpoint, identity: Option<&Path>) -> Result<(), ToolError> {
    if let Some(path) = identity {
        let _ = session.userauth_pubkey_file(&endpoint.user, None, path, None);
    }
    if !session.authenticated() && std::env::var_os("SSH_AUTH_SOCK").is_some() {
        let _ = session.userauth_agent(&endpoint.user);
    }
    if !session.authenticated() {
        for key in default_identity_files() {
            if session.userauth_pubkey_file(&endpoint.user, None, &key, None).is_ok()
                && session.authenticated()
            {
                break;
            }
        }
    }
    if !session.authenticated() {
        return Err(ToolError::denied(format!(
            "SSH authentication failed for {}",
            endpoint.address()
        ))
        .with_hint("Load a key into ssh-agent or set identity_file for this machine."));
    }
    Ok(())
}

fn handshake(tcp: TcpStream, endpoint: &Endpoint, identity: Option<&Path>) -> Result<Session, ToolError> {
    let mut session =
        Session::new().map_err(|_| ToolError::internal("Failed to create SSH session"))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(TIMEOUT_SSH_READY_MS as u32);
    session.handshake().map_err(map_ssh_error)?;
    authenticate(&session, endpoint, identity)?;
    session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
    session.set_timeout(0);
    Ok(session)
}

fn write_fully<W: Write>(writer: &mut W, mut data: &[u8], stop: &AtomicBool) -> std::io::Result<()> {
    while !data.is_empty() {
        if stop.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::Interrupted, "tunnel stopped"));
        }
        match writer.write(data) {
            Ok(0) => return Err(std::io::Error::new(ErrorKind::WriteZero, "peer closed")),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Pumps bytes between a loopback socket and a `direct-tcpip` channel on the
/// jump session until either side closes.
fn pump_tunnel(jump: Session, mut channel: Channel, mut socket: TcpStream, stop: Arc<AtomicBool>) {
    jump.set_blocking(false);
    if socket.set_nonblocking(true).is_err() {
        return;
    }
    let mut buf = [0u8; 16 * 1024];
    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;
        match socket.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if write_fully(&mut channel, &buf[..n], &stop).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                if write_fully(&mut socket, &buf[..n], &stop).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    let _ = channel.close();
}

struct Tunnel {
    stop: Arc<AtomicBool>,
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn open_tunnel(jump: &Endpoint, target: &Endpoint, identity: Option<&Path>) -> Result<(TcpStream, Tunnel), ToolError> {
    let jump_session = handshake(connect_tcp(jump)?, jump, identity)?;
    let channel = jump_session
        .channel_direct_tcpip(&target.host, target.port, None)
        .map_err(|err| {
            map_ssh_error(err).with_hint(
                "The jump host refused to forward the connection. Check AllowTcpForwarding on the jump host.",
            )
        })?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let local_addr = listener.local_addr()?;
    let client = TcpStream::connect(local_addr)?;
    let (server_side, _) = listener.accept()?;
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    std::thread::Builder::new()
        .name(format!("fleetssh-jump-{}", target.host))
        .spawn(move || pump_tunnel(jump_session, channel, server_side, thread_stop))?;
    Ok((client, Tunnel { stop }))
}

struct SshInner {
    session: Session,
    sftp: Option<Sftp>,
}

impl SshInner {
    fn sftp(&mut self) -> Result<&Sftp, ToolError> {
        if self.sftp.is_none() {
            self.sftp = Some(self.session.sftp().map_err(map_ssh_error)?);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| ToolError::internal("SFTP subsystem unavailable"))
    }
}

/// A pooled SSH connection. Blocking libssh2 calls are serialized per session
/// and run on the blocking thread pool.
pub struct SshHost {
    machine: String,
    inner: Arc<Mutex<SshInner>>,
    warnings: Vec<String>,
    fingerprint: Option<String>,
    home: OnceCell<String>,
    _tunnel: Option<Tunnel>,
}

fn lock_inner(inner: &Mutex<SshInner>) -> MutexGuard<'_, SshInner> {
    inner.lock().unwrap_or_else(|err| err.into_inner())
}

fn is_would_block(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

fn exec_blocking(inner: &Mutex<SshInner>, command: &str, options: ExecOptions) -> Result<ExecResult, ToolError> {
    let guard = lock_inner(inner);
    let session = &guard.session;
    let mut channel = session.channel_session().map_err(map_ssh_error)?;
    if options.pty {
        channel
            .request_pty("xterm", None, None)
            .map_err(map_ssh_error)?;
    }
    channel.exec(command).map_err(map_ssh_error)?;
    session.set_blocking(false);

    let mut stdout_state = CaptureState::new(options.limits.stdout);
    let mut stderr_state = CaptureState::new(options.limits.stderr);
    let mut stderr_stream = channel.stderr();
    let mut buf = [0u8; 8192];
    let outcome: Result<(), ToolError> = loop {
        let mut progressed = false;
        match channel.read(&mut buf) {
            Ok(n) if n > 0 => {
                stdout_state.capture(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if is_would_block(&err) => {}
            Err(err) => break Err(ToolError::internal(format!("SSH stdout read failed: {}", err))),
        }
        match stderr_stream.read(&mut buf) {
            Ok(n) if n > 0 => {
                stderr_state.capture(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(err) if is_would_block(&err) => {}
            Err(err) => break Err(ToolError::internal(format!("SSH stderr read failed: {}", err))),
        }
        if channel.eof() && !progressed {
            break Ok(());
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(POLL_IDLE_SLEEP_MS));
        }
    };
    session.set_blocking(true);
    outcome?;

    let _ = channel.wait_close();
    let exit_code = channel.exit_status().ok().map(i64::from);
    let signal = channel.exit_signal().ok().and_then(|sig| sig.exit_signal);
    let (stdout, stdout_truncated) = stdout_state.into_string();
    let (stderr, stderr_truncated) = stderr_state.into_string();
    Ok(ExecResult {
        stdout,
        stderr,
        exit_code,
        signal,
        truncated: Truncation {
            stdout: stdout_truncated,
            stderr: stderr_truncated,
        },
    })
}

fn ensure_remote_dir(sftp: &Sftp, remote_path: &str) -> Result<(), ToolError> {
    let mut current = PathBuf::new();
    for part in Path::new(remote_path).components() {
        current.push(part);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        match sftp.stat(&current) {
            Ok(stat) if stat.is_dir() => continue,
            Ok(_) => {
                return Err(ToolError::conflict(format!(
                    "Remote path exists and is not a directory: {}",
                    current.display()
                )))
            }
            Err(_) => sftp.mkdir(&current, 0o755).map_err(map_ssh_error)?,
        }
    }
    Ok(())
}

fn stat_from(stat: &ssh2::FileStat) -> EntryStat {
    EntryStat {
        is_dir: stat.is_dir(),
        size: if stat.is_dir() { 0 } else { stat.size.unwrap_or(0) },
        mtime: stat.mtime,
    }
}

impl SshHost {
    pub fn connect(plan: &ConnectionPlan, warnings: Vec<String>) -> Result<Self, ToolError> {
        let identity = plan.identity_file.as_deref();
        let (tcp, tunnel) = match plan.jump.as_ref() {
            Some(jump) => {
                let (stream, tunnel) = open_tunnel(jump, &plan.target, identity)?;
                (stream, Some(tunnel))
            }
            None => (connect_tcp(&plan.target)?, None),
        };
        let session = handshake(tcp, &plan.target, identity)?;
        let fingerprint = fingerprint_host_key_sha256(&session);
        Ok(Self {
            machine: plan.machine.clone(),
            inner: Arc::new(Mutex::new(SshInner {
                session,
                sftp: None,
            })),
            warnings,
            fingerprint,
            home: OnceCell::new(),
            _tunnel: tunnel,
        })
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    async fn with_inner<F, T>(&self, label: &'static str, op: F) -> Result<T, ToolError>
    where
        F: FnOnce(&mut SshInner) -> Result<T, ToolError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_inner(&inner);
            op(&mut guard)
        })
        .await
        .map_err(|_| ToolError::internal(format!("SSH {} task failed", label)))?
    }

    pub fn disconnect(&self) {
        let guard = lock_inner(&self.inner);
        let _ = guard.session.disconnect(None, "pool close", None);
    }
}

#[async_trait]
impl Host for SshHost {
    fn machine(&self) -> &str {
        &self.machine
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecResult, ToolError> {
        let inner = self.inner.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || exec_blocking(&inner, &command, options))
            .await
            .map_err(|_| ToolError::internal("SSH exec task failed"))?
    }

    async fn home_dir(&self) -> Result<String, ToolError> {
        self.home
            .get_or_try_init(|| async {
                let result = self
                    .exec(&wrap_sh("printf %s \"$HOME\""), ExecOptions::default())
                    .await?;
                validate_home(&result.stdout)
            })
            .await
            .cloned()
    }

    async fn stat(&self, path: &str) -> Result<Option<EntryStat>, ToolError> {
        let path = PathBuf::from(path);
        self.with_inner("stat", move |inner| {
            let sftp = inner.sftp()?;
            Ok(sftp.stat(&path).ok().map(|stat| stat_from(&stat)))
        })
        .await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ToolError> {
        let path = PathBuf::from(path);
        self.with_inner("readdir", move |inner| {
            let sftp = inner.sftp()?;
            let mut entries: Vec<DirEntry> = sftp
                .readdir(&path)
                .map_err(map_ssh_error)?
                .into_iter()
                .filter_map(|(entry_path, stat)| {
                    let name = entry_path.file_name()?.to_string_lossy().into_owned();
                    (name != "." && name != "..").then(|| DirEntry {
                        name,
                        stat: stat_from(&stat),
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        })
        .await
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), ToolError> {
        let path = path.to_string();
        self.with_inner("mkdir", move |inner| ensure_remote_dir(inner.sftp()?, &path))
            .await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, ToolError> {
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        self.with_inner("upload", move |inner| {
            let sftp = inner.sftp()?;
            let mut source = std::fs::File::open(&local).map_err(|err| {
                ToolError::invalid_params(format!("{} must be readable: {}", local.display(), err))
            })?;
            let mut target = sftp.create(&remote).map_err(map_ssh_error)?;
            let copied = std::io::copy(&mut source, &mut target)?;
            Ok(copied)
        })
        .await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, ToolError> {
        let remote = PathBuf::from(remote);
        let local = local.to_path_buf();
        self.with_inner("download", move |inner| {
            let sftp = inner.sftp()?;
            let mut source = sftp.open(&remote).map_err(map_ssh_error)?;
            let tmp = temp_sibling_path(&local);
            let copied = (|| -> Result<u64, ToolError> {
                let mut target = std::fs::File::create(&tmp)?;
                let copied = std::io::copy(&mut source, &mut target)?;
                target.sync_all()?;
                Ok(copied)
            })();
            let copied = match copied {
                Ok(copied) => copied,
                Err(err) => {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(err);
                }
            };
            std::fs::rename(&tmp, &local)?;
            if let Ok(stat) = sftp.stat(&remote) {
                if let Some(mtime) = stat.mtime {
                    let mtime = filetime::FileTime::from_unix_time(mtime as i64, 0);
                    let atime = stat
                        .atime
                        .map(|t| filetime::FileTime::from_unix_time(t as i64, 0))
                        .unwrap_or(mtime);
                    let _ = filetime::set_file_times(&local, atime, mtime);
                }
            }
            Ok(copied)
        })
        .await
    }
}

/// Connects pool entries from resolved machine plans.
pub struct SshSessionFactory {
    logger: Logger,
    resolver: MachineResolver,
}

impl SshSessionFactory {
    pub fn new(logger: Logger, resolver: MachineResolver) -> Self {
        Self {
            logger: logger.child("ssh"),
            resolver,
        }
    }
}

#[async_trait]
impl SessionFactory<SshHost> for SshSessionFactory {
    async fn create(&self, key: &str) -> Result<SshHost, ToolError> {
        let plan = self.resolver.resolve(key)?;
        let warnings = self.resolver.warnings(&plan);
        for warning in &warnings {
            self.logger
                .warn(warning, Some(&serde_json::json!({ "machine": key })));
        }
        let host = tokio::task::spawn_blocking(move || SshHost::connect(&plan, warnings))
            .await
            .map_err(|_| ToolError::internal("SSH connect task failed"))??;
        self.logger.debug(
            "connected",
            Some(&serde_json::json!({
                "machine": key,
                "host_key": host.fingerprint(),
            })),
        );
        Ok(host)
    }

    async fn close(&self, key: &str, session: Arc<SshHost>) {
        self.logger
            .debug("disconnecting", Some(&serde_json::json!({ "machine": key })));
        let _ = tokio::task::spawn_blocking(move || session.disconnect()).await;
    }
}
