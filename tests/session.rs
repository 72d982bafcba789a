//! End-to-end session tests against a channel-backed fake transport.

use async_trait::async_trait;
use bmslink::transport::{Link, LinkEndpoints, WriteTarget};
use bmslink::{
    DiscoveredDevice, Notice, Result, Session, SessionState, Snapshot, Transport, SCAN_TIMEOUT,
};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

type Chunk = Result<Vec<u8>>;

/// Fake transport advertising a single device whose notifications are fed
/// from a channel and whose writes are recorded.
struct FakeTransport {
    device: DiscoveredDevice,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Chunk>>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        Ok(stream::iter(vec![self.device.clone()])
            .chain(stream::pending())
            .boxed())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn Link>> {
        assert_eq!(device_id, self.device.id);
        let notifications = self
            .notifications
            .lock()
            .unwrap()
            .take()
            .expect("single connection per test");
        Ok(Box::new(FakeLink {
            writes: Arc::clone(&self.writes),
            notifications: Mutex::new(Some(notifications)),
        }))
    }
}

struct FakeLink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Chunk>>>,
}

#[async_trait]
impl Link for FakeLink {
    async fn endpoints(&self) -> Result<LinkEndpoints> {
        let rx = self
            .notifications
            .lock()
            .unwrap()
            .take()
            .expect("endpoints discovered once");
        Ok(LinkEndpoints {
            write: Arc::new(FakeWriteTarget(Arc::clone(&self.writes))),
            notifications: stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })
            .boxed(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeWriteTarget(Arc<Mutex<Vec<Vec<u8>>>>);

#[async_trait]
impl WriteTarget for FakeWriteTarget {
    async fn write(&self, payload: &[u8]) -> Result<()> {
        self.0.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

struct Harness {
    session: Session,
    snapshots: watch::Receiver<Snapshot>,
    notices: broadcast::Receiver<Notice>,
    device: mpsc::UnboundedSender<Chunk>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Harness {
    fn new() -> Self {
        let (device, notifications) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(FakeTransport {
            device: DiscoveredDevice {
                id: "dev-1".to_owned(),
                name: "BMS-01".to_owned(),
                rssi: -42,
            },
            writes: Arc::clone(&writes),
            notifications: Mutex::new(Some(notifications)),
        });
        let session = Session::spawn(transport);
        let snapshots = session.subscribe();
        let notices = session.notices();
        Self {
            session,
            snapshots,
            notices,
            device,
            writes,
        }
    }

    /// Scan, pick the advertised device and wait for `Ready`.
    async fn ready() -> Self {
        let mut harness = Self::new();
        harness.session.start_scan();
        let snapshot = harness.wait_for(|s| !s.discovered.is_empty()).await;
        harness.session.select_device(snapshot.discovered[0].id.clone());
        harness.wait_for(|s| s.state == SessionState::Ready).await;
        harness
    }

    async fn wait_for(&mut self, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let deadline = Duration::from_secs(600);
        tokio::time::timeout(deadline, async {
            loop {
                {
                    let snapshot = self.snapshots.borrow_and_update();
                    if pred(&snapshot) {
                        return snapshot.clone();
                    }
                }
                self.snapshots.changed().await.expect("session task gone");
            }
        })
        .await
        .expect("snapshot condition not reached")
    }

    async fn wait_for_notice(&mut self, want: Notice) {
        let deadline = Duration::from_secs(600);
        tokio::time::timeout(deadline, async {
            loop {
                let notice = self.notices.recv().await.expect("notice channel gone");
                if notice == want {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("notice {want:?} not received"));
    }

    /// Wait until `payload` has been written `count` times.
    async fn wait_for_writes(&self, payload: &[u8], count: usize) {
        for _ in 0..1000 {
            let written = self
                .writes
                .lock()
                .unwrap()
                .iter()
                .filter(|w| w.as_slice() == payload)
                .count();
            if written >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "payload {:?} not written {count} times",
            String::from_utf8_lossy(payload)
        );
    }

    fn push(&self, data: &str) {
        self.device
            .send(Ok(data.as_bytes().to_vec()))
            .expect("session dropped notification stream");
    }

    async fn verify_password(&mut self) {
        self.session.verify_password("123456");
        self.wait_for_writes(b"pswd=123456\x00\n", 1).await;
        self.push("pd1\n");
        // First success is the submission echo; the engine re-submits.
        self.wait_for_writes(b"pswd=123456\x00\n", 2).await;
        self.push("pd1\n");
        self.wait_for(|s| s.password_verified).await;
    }
}

#[tokio::test(start_paused = true)]
async fn scan_discovers_and_times_out() {
    let mut harness = Harness::new();
    harness.session.start_scan();
    let snapshot = harness.wait_for(|s| !s.discovered.is_empty()).await;
    assert!(snapshot.scanning);
    assert_eq!(snapshot.discovered[0].name, "BMS-01");

    tokio::time::sleep(SCAN_TIMEOUT + Duration::from_secs(1)).await;
    let snapshot = harness.wait_for(|s| !s.scanning).await;
    assert_eq!(snapshot.state, SessionState::Idle);
    // Results survive the scan ending.
    assert_eq!(snapshot.discovered.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_reaches_ready_and_reads_parameters() {
    let harness = Harness::ready().await;
    let snapshot = harness.session.snapshot();
    assert_eq!(snapshot.device_name, "BMS-01");
    assert_eq!(snapshot.device_id.as_deref(), Some("dev-1"));
    harness.wait_for_writes(b"read\n", 1).await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_starts_after_stabilization() {
    let harness = Harness::ready().await;
    tokio::time::sleep(Duration::from_secs(8)).await;
    harness.wait_for_writes(b"re", 1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    harness.wait_for_writes(b"re", 2).await;
}

#[tokio::test(start_paused = true)]
async fn telemetry_line_split_across_chunks_is_one_update() {
    let mut harness = Harness::ready().await;
    harness.push("zdy:25.60 dl:1.5");
    harness.push("0 gl:38.40\n");
    let snapshot = harness.wait_for(|s| s.battery.total_voltage > 0.0).await;
    assert_eq!(snapshot.battery.total_voltage, 25.60);
    assert_eq!(snapshot.battery.current, 1.50);
    assert_eq!(snapshot.battery.power, 38.40);
}

#[tokio::test(start_paused = true)]
async fn stale_partial_line_is_flushed() {
    let mut harness = Harness::ready().await;
    harness.push("zdy:25.60");
    tokio::time::sleep(Duration::from_millis(600)).await;
    let snapshot = harness.wait_for(|s| s.battery.total_voltage > 0.0).await;
    assert_eq!(snapshot.battery.total_voltage, 25.60);
}

#[tokio::test(start_paused = true)]
async fn password_echo_is_resubmitted_before_grant() {
    let mut harness = Harness::ready().await;
    harness.verify_password().await;
    harness.wait_for_notice(Notice::PasswordVerified).await;
}

#[tokio::test(start_paused = true)]
async fn privileged_command_requires_verification() {
    let mut harness = Harness::ready().await;
    harness.session.start_charging();
    harness.wait_for_notice(Notice::PleaseVerifyPassword).await;
    assert!(!harness
        .writes
        .lock()
        .unwrap()
        .iter()
        .any(|w| w.as_slice() == b"cdopen\n"));

    harness.verify_password().await;
    harness.session.start_charging();
    harness.wait_for_writes(b"cdopen\n", 1).await;
}

#[tokio::test(start_paused = true)]
async fn verification_expires_after_four_minutes() {
    let mut harness = Harness::ready().await;
    harness.verify_password().await;
    tokio::time::sleep(Duration::from_secs(241)).await;
    harness.wait_for(|s| !s.password_verified).await;
    harness.wait_for_notice(Notice::PasswordExpired).await;

    harness.session.restart_device();
    harness.wait_for_notice(Notice::PleaseVerifyPassword).await;
}

#[tokio::test(start_paused = true)]
async fn fault_token_seeds_countdown() {
    let mut harness = Harness::ready().await;
    // 0x11 sets both string-drop and under-voltage; string-drop wins.
    harness.push(&format!("cdclose{}005\n", '\u{11}'));
    let snapshot = harness.wait_for(|s| s.battery.gzys == 5).await;
    assert_eq!(snapshot.cd_close_status, Some("string_drop"));
    assert!(!snapshot.battery.charging_status);

    tokio::time::sleep(Duration::from_secs(6)).await;
    harness.wait_for(|s| s.battery.gzys == 0).await;
}

#[tokio::test(start_paused = true)]
async fn device_initiated_disconnect_tears_down() {
    let mut harness = Harness::ready().await;
    harness.verify_password().await;

    // The device dropping the link ends the notification stream.
    let (detached, _) = mpsc::unbounded_channel::<Chunk>();
    harness.device = detached;

    let snapshot = harness
        .wait_for(|s| matches!(s.state, SessionState::Disconnected { .. }))
        .await;
    assert!(!snapshot.password_verified);
    assert!(snapshot.last_error.is_some());

    // Commands are rejected until a new connection is made.
    harness.session.refresh();
    harness.wait_for_notice(Notice::NotReady).await;
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_is_clean() {
    let mut harness = Harness::ready().await;
    harness.session.disconnect();
    let snapshot = harness
        .wait_for(|s| matches!(s.state, SessionState::Disconnected { .. }))
        .await;
    assert_eq!(snapshot.state, SessionState::Disconnected { error: None });
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn restart_acknowledgement_is_noticed() {
    let mut harness = Harness::ready().await;
    harness.verify_password().await;
    harness.session.restart_device();
    harness.wait_for_writes(b"restart\n", 1).await;
    harness.push("RES\n");
    harness.wait_for_notice(Notice::Restarted).await;
}

#[tokio::test(start_paused = true)]
async fn parameter_echoes_populate_snapshot() {
    let mut harness = Harness::ready().await;
    harness.push("CS=16 gybh=3.65 ver=V2.3\n");
    let snapshot = harness.wait_for(|s| !s.parameters.is_empty()).await;
    assert_eq!(snapshot.battery.total_strings, 16);
    assert_eq!(snapshot.firmware_version.as_deref(), Some("V2.3"));
}
