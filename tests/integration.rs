//! Integration tests for the command server and the blocklist store.
//!
//! The server runs on a real loopback listener. System tools are replaced by
//! an in-memory fake for `networksetup` and `pfctl`; file moves, removals and
//! the DNS proxy process are real.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use firewall_helper::auth::{AuthError, OwnerIdentity, PeerAuthenticator};
use firewall_helper::blocklist::{BlockItem, BlocklistStore, Connection, SortKey};
use firewall_helper::config::Config;
use firewall_helper::process::{
    CommandRunner, PrivilegedCommand, StreamingChild, SubprocessError, SystemRunner,
};
use firewall_helper::protocol::{Request, Status, Tag};
use firewall_helper::server::CommandServer;

const CLIENT: u32 = 1000;
const SERVICES: [&str; 2] = ["Wi-Fi", "Thunderbolt Bridge"];

/// Authenticator with a switchable socket owner and a set of trusted pids.
#[derive(Clone, Default)]
struct TestAuthenticator {
    owner: Arc<Mutex<u32>>,
    trusted: Arc<Mutex<HashSet<u32>>>,
}

impl TestAuthenticator {
    fn trusting(pid: u32) -> Self {
        let auth = Self::default();
        *auth.owner.lock() = pid;
        auth.trusted.lock().insert(pid);
        auth
    }

    fn set_owner(&self, pid: u32) {
        *self.owner.lock() = pid;
    }
}

impl PeerAuthenticator for TestAuthenticator {
    async fn owner_pid(&self, _peer: SocketAddr) -> Result<u32, AuthError> {
        Ok(*self.owner.lock())
    }

    async fn verify(&self, pid: u32) -> Result<OwnerIdentity, AuthError> {
        if self.trusted.lock().contains(&pid) {
            Ok(OwnerIdentity {
                pid,
                executable: PathBuf::from("/Applications/appFirewall.app"),
            })
        } else {
            Err(AuthError::Rejected {
                pid,
                executable: PathBuf::from("/tmp/impostor"),
                reason: "not signed".to_string(),
            })
        }
    }
}

/// Runner faking `networksetup` and `pfctl`; everything else runs for real.
#[derive(Clone)]
struct FakeSystem {
    dns: Arc<Mutex<HashMap<String, String>>>,
    quic_blocked: Arc<AtomicBool>,
    proxy_pids: Arc<Mutex<Vec<u32>>>,
}

impl FakeSystem {
    fn new() -> Self {
        let dns = SERVICES
            .iter()
            .map(|service| ((*service).to_string(), "empty".to_string()))
            .collect();
        Self {
            dns: Arc::new(Mutex::new(dns)),
            quic_blocked: Arc::new(AtomicBool::new(false)),
            proxy_pids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn dns_servers(&self) -> HashSet<String> {
        self.dns.lock().values().cloned().collect()
    }

    fn networksetup(&self, args: &[String]) -> String {
        match args {
            [flag] if flag == "-listallnetworkservices" => {
                "An asterisk (*) denotes that a network service is disabled.\n\
                 Wi-Fi\n\
                 *Thunderbolt Bridge\n"
                    .to_string()
            }
            [flag, service, server] if flag == "-setdnsservers" => {
                self.dns.lock().insert(service.clone(), server.clone());
                String::new()
            }
            other => panic!("unexpected networksetup call: {other:?}"),
        }
    }

    fn pfctl(&self, command: &PrivilegedCommand, args: &[String]) -> String {
        match args.get(2).map(String::as_str) {
            Some("-f") => {
                assert!(command.input().is_some_and(|rule| rule.contains("port 443")));
                self.quic_blocked.store(true, Ordering::SeqCst);
            }
            Some("-F") => self.quic_blocked.store(false, Ordering::SeqCst),
            other => panic!("unexpected pfctl call: {other:?}"),
        }
        String::new()
    }
}

impl CommandRunner for FakeSystem {
    async fn run(
        &self,
        command: &PrivilegedCommand,
        timeout: Duration,
    ) -> Result<String, SubprocessError> {
        let args: Vec<String> = command
            .arguments()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        match command.program().file_name().and_then(|name| name.to_str()) {
            Some("networksetup") => Ok(self.networksetup(&args)),
            Some("pfctl") => Ok(self.pfctl(command, &args)),
            _ => SystemRunner.run(command, timeout).await,
        }
    }

    fn spawn_streaming(
        &self,
        command: &PrivilegedCommand,
    ) -> Result<StreamingChild, SubprocessError> {
        let child = SystemRunner.spawn_streaming(command)?;
        self.proxy_pids.lock().push(child.pid());
        Ok(child)
    }
}

struct Harness {
    addr: SocketAddr,
    auth: TestAuthenticator,
    system: FakeSystem,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(auth: TestAuthenticator) -> Self {
        let mut config = Config::default();
        config.install.mv = "mv".into();
        config.install.rm = "rm".into();
        config.dns.restart_backoff_ms = 50;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let system = FakeSystem::new();
        let mut server = CommandServer::new(config, auth.clone(), Arc::new(system.clone()));
        let task = tokio::spawn(async move { server.run(listener).await });

        Self {
            addr,
            auth,
            system,
            task,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send(stream: &mut TcpStream, request: &Request) -> Status {
    stream.write_all(&request.encode()).await.unwrap();
    let byte = tokio::time::timeout(Duration::from_secs(30), stream.read_u8())
        .await
        .expect("no response from server")
        .unwrap();
    Status::from_byte(byte).unwrap()
}

/// True once the server has closed the connection.
async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await,
        Ok(Ok(0) | Err(_))
    )
}

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn write_bundle(dir: &Path, version: &str) {
    fs::create_dir_all(dir.join("appFirewall.app")).unwrap();
    fs::write(dir.join("appFirewall.app/version"), version).unwrap();
}

fn installed_version(dir: &Path) -> String {
    fs::read_to_string(dir.join("appFirewall.app/version")).unwrap()
}

#[tokio::test]
async fn should_answer_pipelined_requests_in_order() {
    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;

    let mut frames = Vec::new();
    for request in [Request::BlockQuic, Request::UnblockQuic, Request::UnblockQuic] {
        frames.extend(request.encode());
    }
    stream.write_all(&frames).await.unwrap();

    let mut statuses = [0u8; 3];
    stream.read_exact(&mut statuses).await.unwrap();
    assert_eq!(statuses, [Status::Success.as_byte(); 3]);
    assert!(!harness.system.quic_blocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn should_toggle_quic_blocking_idempotently() {
    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;

    assert_eq!(send(&mut stream, &Request::BlockQuic).await, Status::Success);
    assert_eq!(send(&mut stream, &Request::BlockQuic).await, Status::Success);
    assert!(harness.system.quic_blocked.load(Ordering::SeqCst));

    assert_eq!(send(&mut stream, &Request::UnblockQuic).await, Status::Success);
    assert_eq!(send(&mut stream, &Request::UnblockQuic).await, Status::Success);
    assert!(!harness.system.quic_blocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn should_drop_connection_on_oversized_field_and_keep_serving() {
    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;

    let mut frame = vec![Tag::InstallUpdate as u8];
    frame.extend_from_slice(&(1u64 << 40).to_le_bytes());
    frame.extend_from_slice(b"/Applications");
    stream.write_all(&frame).await.unwrap();
    assert!(is_closed(&mut stream).await);

    let mut next = harness.connect().await;
    assert_eq!(send(&mut next, &Request::BlockQuic).await, Status::Success);
}

#[tokio::test]
async fn should_close_connection_from_untrusted_client() {
    let auth = TestAuthenticator::default();
    auth.set_owner(666);
    let harness = Harness::start(auth).await;

    let mut stream = harness.connect().await;
    assert!(is_closed(&mut stream).await);
    assert!(!harness.system.quic_blocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn should_close_session_when_socket_changes_hands() {
    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;
    assert_eq!(send(&mut stream, &Request::UnblockQuic).await, Status::Success);

    harness.auth.set_owner(666);
    stream.write_all(&Request::BlockQuic.encode()).await.unwrap();

    assert!(is_closed(&mut stream).await);
    assert!(!harness.system.quic_blocked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn should_roll_back_failed_install_and_succeed_on_retry() {
    let root = TempDir::new().unwrap();
    let staged = root.path().join("staged");
    let install = root.path().join("Applications");
    fs::create_dir_all(&staged).unwrap();
    write_bundle(&install, "1.0");

    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;
    let request = Request::InstallUpdate {
        staged_dir: staged.clone(),
        install_dir: install.clone(),
    };

    // Nothing staged: the final move fails and the old bundle is restored.
    assert_eq!(send(&mut stream, &request).await, Status::InstallFailed);
    assert_eq!(installed_version(&install), "1.0");
    assert!(!install.join("appFirewall.app.bak").exists());

    write_bundle(&staged, "2.0");
    assert_eq!(send(&mut stream, &request).await, Status::Success);
    assert_eq!(installed_version(&install), "2.0");
    assert!(!install.join("appFirewall.app.bak").exists());
    assert!(!staged.join("appFirewall.app").exists());
}

#[tokio::test]
async fn should_report_missing_install_as_backup_failure() {
    let root = TempDir::new().unwrap();
    let staged = root.path().join("staged");
    let install = root.path().join("Applications");
    write_bundle(&staged, "2.0");
    fs::create_dir_all(&install).unwrap();

    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;

    let status = send(
        &mut stream,
        &Request::InstallUpdate {
            staged_dir: staged,
            install_dir: install,
        },
    )
    .await;
    assert_eq!(status, Status::BackupFailed);
}

#[tokio::test]
async fn should_start_and_stop_dns_proxy_round_trip() {
    let proxy_dir = TempDir::new().unwrap();
    let script = proxy_dir.path().join("dnscrypt-proxy");
    fs::write(&script, "#!/bin/sh\necho \"dnscrypt-proxy $1\"\nexec sleep 60\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;
    assert_eq!(harness.system.dns_servers(), HashSet::from(["empty".to_string()]));

    let start = Request::StartDns {
        proxy_dir: proxy_dir.path().to_path_buf(),
    };
    assert_eq!(send(&mut stream, &start).await, Status::Success);
    assert_eq!(harness.system.dns_servers(), HashSet::from(["127.0.0.1".to_string()]));
    let pid = *harness.system.proxy_pids.lock().first().unwrap();
    assert!(process_alive(pid));

    // Already running: no second proxy.
    assert_eq!(send(&mut stream, &start).await, Status::Success);
    assert_eq!(harness.system.proxy_pids.lock().len(), 1);

    assert_eq!(send(&mut stream, &Request::StopDns).await, Status::Success);
    assert_eq!(harness.system.dns_servers(), HashSet::from(["empty".to_string()]));
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn should_fail_start_dns_for_missing_proxy() {
    let empty = TempDir::new().unwrap();
    let harness = Harness::start(TestAuthenticator::trusting(CLIENT)).await;
    let mut stream = harness.connect().await;

    let status = send(
        &mut stream,
        &Request::StartDns {
            proxy_dir: empty.path().to_path_buf(),
        },
    )
    .await;

    assert_eq!(status, Status::Failed);
    assert_eq!(harness.system.dns_servers(), HashSet::from(["empty".to_string()]));
}

#[test]
fn should_persist_blocked_safari_domain_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blocklist.dat");
    let item = BlockItem::for_domain("Safari", "ads.example.com");

    let store = BlocklistStore::new(&path);
    store.add(item.clone());
    assert_eq!(store.len(), 1);
    store.sort(SortKey::Name, true);
    assert_eq!(store.get(0), Some(item.clone()));
    store.save().unwrap();
    drop(store);

    let restarted = BlocklistStore::new(&path);
    restarted.load().unwrap();
    assert_eq!(restarted.len(), 1);
    assert!(restarted.lookup(&item));
}

#[test]
fn should_block_every_connection_from_app_to_domain() {
    let dir = TempDir::new().unwrap();
    let store = BlocklistStore::new(dir.path().join("blocklist.dat"));
    let observed = |port: u16| Connection {
        pid: 512,
        process_name: "Safari".to_string(),
        remote_addr: "203.0.113.9".parse().unwrap(),
        remote_port: port,
        domain: Some("ads.example.com".to_string()),
    };

    store.add(BlocklistStore::from_connection(&observed(443)));
    store.add(BlocklistStore::from_connection(&observed(51234)));

    assert_eq!(store.len(), 1);
    assert!(store.lookup(&BlocklistStore::from_connection(&observed(8080))));
    assert!(store.lookup(&BlockItem::for_domain("Safari", "ads.example.com")));
}
