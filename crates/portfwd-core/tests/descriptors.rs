//! Descriptor accounting for failed dials
//!
//! Kept in its own test binary: the open descriptor count is process-wide, so
//! no other test may be opening sockets while it is measured.

#![cfg(target_os = "linux")]

use portfwd_core::{ForwarderConfig, Reactor};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("Failed to list /proc/self/fd")
        .count()
}

async fn wait_for_descriptors(expected: usize) {
    let settled = timeout(TEST_TIMEOUT, async {
        while open_descriptors() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        settled.is_ok(),
        "descriptor leak: expected {}, found {}",
        expected,
        open_descriptors()
    );
}

/// Connect `attempts` clients one after another; each must be hung up on.
async fn dial_and_expect_hangup(addr: SocketAddr, attempts: usize) {
    for _ in 0..attempts {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let result = timeout(TEST_TIMEOUT, client.read(&mut buf))
            .await
            .expect("Client was not disconnected");
        assert!(matches!(result, Ok(0) | Err(_)));
    }
}

#[tokio::test]
async fn test_failed_dials_release_every_descriptor() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let refused: SocketAddr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let unreachable: SocketAddr = "255.255.255.255:9".parse().unwrap();

    for remote in [refused, unreachable] {
        let config = ForwarderConfig::new(0, remote.ip(), remote.port())
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_poll_interval(Duration::from_millis(20));
        let mut reactor = Reactor::bind(config).expect("Failed to bind forwarder");
        let addr = reactor.local_addr();
        let handle = reactor.handle();
        let thread = std::thread::spawn(move || reactor.run());

        let baseline = open_descriptors();
        dial_and_expect_hangup(addr, 50).await;

        timeout(TEST_TIMEOUT, async {
            while handle.active_tunnels() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Tunnels were not torn down");
        wait_for_descriptors(baseline).await;

        handle.stop();
        thread.join().unwrap().unwrap();
    }
}
