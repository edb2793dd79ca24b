//! In-memory transport for unit tests
//!
//! `MockConnector` hands out `MockTransport`s that all share one `MockFs`,
//! so files written over one session are visible to the next, the same way
//! a real remote host behaves across reconnects.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::config::ConnectionProfile;
use crate::sftp::path_utils::{normalize_remote_path, parent_remote_path};
use crate::sftp::{RemoteEntry, RemoteFs, RemoteReader, RemoteStat, RemoteWriter, SftpError};
use crate::ssh::{Connector, ExecChannel, ExecEvent, Secret, SshError, Transport};

const FILE_MODE: u32 = 0o100644;
const DIR_MODE: u32 = 0o040755;
const MTIME: u64 = 1_700_000_000;

#[derive(Default)]
struct Counters {
    closed: AtomicUsize,
    sftp_opens: AtomicUsize,
    sftp_closes: AtomicUsize,
}

#[derive(Clone, Default)]
struct ExecPlan {
    events: Vec<ExecEvent>,
    hold_open: bool,
}

/// Connector with scripted failures and recorded attempts
pub struct MockConnector {
    fail_remaining: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
    attempts: Mutex<Vec<Instant>>,
    secrets: Mutex<Vec<Option<String>>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    counters: Arc<Counters>,
    fs: Arc<MockFs>,
    exec_plan: Arc<Mutex<ExecPlan>>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            fail_remaining: AtomicU32::new(0),
            connect_delay: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
            secrets: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
            fs: Arc::new(MockFs::new()),
            exec_plan: Arc::new(Mutex::new(ExecPlan::default())),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `n` attempts, `u32::MAX` fails forever
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn secrets_seen(&self) -> Vec<Option<String>> {
        self.secrets.lock().clone()
    }

    /// Drop every connection handed out so far
    pub fn kill_all(&self) {
        for transport in self.transports.lock().iter() {
            transport.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn closed_count(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn sftp_opens(&self) -> usize {
        self.counters.sftp_opens.load(Ordering::SeqCst)
    }

    pub fn sftp_closes(&self) -> usize {
        self.counters.sftp_closes.load(Ordering::SeqCst)
    }

    pub fn fs(&self) -> Arc<MockFs> {
        self.fs.clone()
    }

    /// Events every exec channel replays. With `hold_open` the channel stays
    /// open after the last event until it is closed.
    pub fn set_exec_plan(&self, events: Vec<ExecEvent>, hold_open: bool) {
        *self.exec_plan.lock() = ExecPlan { events, hold_open };
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _profile: &ConnectionProfile,
        secret: Secret,
    ) -> Result<Arc<dyn Transport>, SshError> {
        self.attempts.lock().push(Instant::now());
        self.secrets.lock().push(secret.value.clone());

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(SshError::AuthenticationFailed("mock rejection".to_string()));
        }

        let transport = Arc::new(MockTransport {
            active: AtomicBool::new(true),
            counters: self.counters.clone(),
            fs: self.fs.clone(),
            exec_plan: self.exec_plan.clone(),
            commands: self.commands.clone(),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    active: AtomicBool,
    counters: Arc<Counters>,
    fs: Arc<MockFs>,
    exec_plan: Arc<Mutex<ExecPlan>>,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for MockTransport {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        if !self.is_active() {
            return Err(SshError::Disconnected);
        }
        self.counters.sftp_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockChannel {
            fs: self.fs.clone(),
            open: AtomicBool::new(true),
            counters: self.counters.clone(),
        }))
    }

    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, SshError> {
        if !self.is_active() {
            return Err(SshError::Disconnected);
        }
        self.commands.lock().push(command.to_string());
        let plan = self.exec_plan.lock().clone();
        Ok(Box::new(MockExec {
            events: plan.events.into(),
            hold_open: plan.hold_open,
            closed: false,
        }))
    }

    async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockExec {
    events: VecDeque<ExecEvent>,
    hold_open: bool,
    closed: bool,
}

#[async_trait]
impl ExecChannel for MockExec {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if self.hold_open && !self.closed {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// Shared in-memory remote filesystem
pub struct MockFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    fail_reads_after: Mutex<Option<usize>>,
    fail_writes_after: Mutex<Option<usize>>,
    fail_rename_from: Mutex<Option<String>>,
    read_delay: Mutex<Option<Duration>>,
    healthy: AtomicBool,
}

impl MockFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            fail_reads_after: Mutex::new(None),
            fail_writes_after: Mutex::new(None),
            fail_rename_from: Mutex::new(None),
            read_delay: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    /// Create a directory and its missing parents
    pub fn add_dir(&self, path: &str) {
        let path = normalize_remote_path(path);
        let mut nodes = self.nodes.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let path = normalize_remote_path(path);
        self.add_dir(&parent_remote_path(&path));
        self.nodes.lock().insert(path, Node::File(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&normalize_remote_path(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(&normalize_remote_path(path))
    }

    /// Every reader opened afterwards fails once it delivered `n` bytes
    pub fn fail_reads_after(&self, n: Option<usize>) {
        *self.fail_reads_after.lock() = n;
    }

    /// Every writer opened afterwards fails once it accepted `n` bytes
    pub fn fail_writes_after(&self, n: Option<usize>) {
        *self.fail_writes_after.lock() = n;
    }

    /// Renames whose source is `path` fail with a protocol error
    pub fn fail_rename_from(&self, path: Option<&str>) {
        *self.fail_rename_from.lock() = path.map(normalize_remote_path);
    }

    /// Readers opened afterwards sleep this long before every chunk
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    pub fn set_healthy(&self, ok: bool) {
        self.healthy.store(ok, Ordering::SeqCst);
    }

    fn stat(node: &Node) -> RemoteStat {
        match node {
            Node::File(data) => RemoteStat {
                size: data.len() as u64,
                modified_at: MTIME,
                mode: FILE_MODE,
                is_dir: false,
            },
            Node::Dir => RemoteStat {
                size: 0,
                modified_at: MTIME,
                mode: DIR_MODE,
                is_dir: true,
            },
        }
    }

    fn append(&self, path: &str, buf: &[u8]) -> io::Result<()> {
        match self.nodes.lock().get_mut(path) {
            Some(Node::File(data)) => {
                data.extend_from_slice(buf);
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::NotFound, "file vanished")),
        }
    }
}

fn is_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Option<bool> {
    nodes.get(path).map(|node| matches!(node, Node::Dir))
}

struct MockChannel {
    fs: Arc<MockFs>,
    open: AtomicBool,
    counters: Arc<Counters>,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), SftpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SftpError::ChannelError("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl RemoteFs for MockChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        self.ensure_open()?;
        let path = normalize_remote_path(path);
        let nodes = self.fs.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(SftpError::ProtocolError(format!("{} is not a directory", path)))
            }
            None => return Err(SftpError::FileNotFound(path)),
        }

        Ok(nodes
            .iter()
            .filter(|(key, _)| key.as_str() != "/" && parent_remote_path(key) == path)
            .map(|(key, node)| RemoteEntry {
                name: key.rsplit('/').next().unwrap_or_default().to_string(),
                stat: MockFs::stat(node),
            })
            .collect())
    }

    async fn lookup(&self, path: &str) -> Result<Option<RemoteStat>, SftpError> {
        self.ensure_open()?;
        Ok(self
            .fs
            .nodes
            .lock()
            .get(&normalize_remote_path(path))
            .map(MockFs::stat))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        self.ensure_open()?;
        let data = self
            .fs
            .file(path)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::pin(MockReader {
            data: data[start..].to_vec(),
            pos: 0,
            fail_at: *self.fs.fail_reads_after.lock(),
            delay: *self.fs.read_delay.lock(),
            sleep: None,
        }))
    }

    async fn open_write(&self, path: &str, append: bool) -> Result<RemoteWriter, SftpError> {
        self.ensure_open()?;
        let path = normalize_remote_path(path);
        {
            let mut nodes = self.fs.nodes.lock();
            if !matches!(nodes.get(&parent_remote_path(&path)), Some(Node::Dir)) {
                return Err(SftpError::FileNotFound(path));
            }
            match is_dir(&nodes, &path) {
                Some(true) => {
                    return Err(SftpError::ProtocolError(format!("{} is a directory", path)))
                }
                Some(false) if append => {}
                None if append => return Err(SftpError::FileNotFound(path)),
                _ => {
                    nodes.insert(path.clone(), Node::File(Vec::new()));
                }
            }
        }
        Ok(Box::pin(MockWriter {
            fs: self.fs.clone(),
            path,
            written: 0,
            fail_at: *self.fs.fail_writes_after.lock(),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let from = normalize_remote_path(from);
        let to = normalize_remote_path(to);
        if self.fs.fail_rename_from.lock().as_deref() == Some(from.as_str()) {
            return Err(SftpError::ProtocolError("injected rename failure".to_string()));
        }
        let mut nodes = self.fs.nodes.lock();
        if !nodes.contains_key(&from) {
            return Err(SftpError::FileNotFound(from));
        }
        if nodes.contains_key(&to) {
            // SFTP v3 rename never overwrites
            return Err(SftpError::ProtocolError("Failure".to_string()));
        }

        let prefix = format!("{}/", from);
        let moved: Vec<String> = nodes
            .keys()
            .filter(|key| **key == from || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                let new_key = format!("{}{}", to, &key[from.len()..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let path = normalize_remote_path(path);
        let mut nodes = self.fs.nodes.lock();
        match is_dir(&nodes, &path) {
            Some(false) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(true) => Err(SftpError::ProtocolError("Failure".to_string())),
            None => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let path = normalize_remote_path(path);
        let mut nodes = self.fs.nodes.lock();
        match is_dir(&nodes, &path) {
            Some(true) => {
                let prefix = format!("{}/", path);
                if nodes.keys().any(|key| key.starts_with(&prefix)) {
                    return Err(SftpError::ProtocolError("Failure: directory not empty".to_string()));
                }
                nodes.remove(&path);
                Ok(())
            }
            Some(false) => Err(SftpError::ProtocolError("Failure".to_string())),
            None => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.ensure_open()?;
        let path = normalize_remote_path(path);
        let mut nodes = self.fs.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(SftpError::ProtocolError("Failure".to_string()));
        }
        if !matches!(nodes.get(&parent_remote_path(&path)), Some(Node::Dir)) {
            return Err(SftpError::FileNotFound(path));
        }
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.fs.healthy.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.counters.sftp_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockReader {
    data: Vec<u8>,
    pos: usize,
    fail_at: Option<usize>,
    delay: Option<Duration>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl AsyncRead for MockReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(delay) = self.delay {
            if self.pos < self.data.len() {
                let sleep = self
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                self.sleep = None;
            }
        }

        let mut end = self.data.len();
        if let Some(limit) = self.fail_at {
            if self.pos >= limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read failure",
                )));
            }
            end = end.min(limit);
        }

        let n = (end - self.pos).min(buf.remaining());
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

struct MockWriter {
    fs: Arc<MockFs>,
    path: String,
    written: usize,
    fail_at: Option<usize>,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut n = buf.len();
        if let Some(limit) = self.fail_at {
            if self.written >= limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected write failure",
                )));
            }
            n = n.min(limit - self.written);
        }

        self.fs.append(&self.path, &buf[..n])?;
        self.written += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
