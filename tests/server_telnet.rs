//! Integration test: real TCP sessions against the server with the offline
//! stub provider.

use std::sync::Arc;
use std::time::Duration;

use mirage_term::config::Config;
use mirage_term::models::StubProvider;
use mirage_term::server::{Server, Shared};
use mirage_term::session::SessionSettings;
use mirage_term::terminal::telnet::{DO, IAC, NEGOTIATION, OPT_ECHO};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn start(yaml: &str) -> (std::net::SocketAddr, CancellationToken, JoinHandle<anyhow::Result<()>>) {
    let cfg = Config::parse(yaml).unwrap();
    let shared = Shared {
        settings: Arc::new(SessionSettings::from_config(&cfg, "test persona".into())),
        provider: Arc::new(StubProvider),
        negotiate: cfg.telnet.negotiate,
    };
    let server = Server::bind("127.0.0.1:0", shared).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    (addr, cancel, handle)
}

/// Read until `needle` shows up in what was received since the last call.
async fn read_until(stream: &mut TcpStream, seen: &mut Vec<u8>, needle: &[u8]) -> Vec<u8> {
    let start = seen.len();
    let mut buf = [0u8; 512];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if seen[start..].windows(needle.len()).any(|w| w == needle) {
                return;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before {:?}", String::from_utf8_lossy(needle));
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out waiting for {:?}; got {:?}",
            String::from_utf8_lossy(needle),
            String::from_utf8_lossy(&seen[start..])
        )
    });
    seen[start..].to_vec()
}

const STUB_CONFIG: &str = "model:\n  provider: stub\n";

#[tokio::test]
async fn greeting_turns_local_commands_and_exit() {
    let (addr, cancel, handle) = start(STUB_CONFIG).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut seen = Vec::new();

    let boot = read_until(&mut client, &mut seen, b"/ > ").await;
    assert!(boot.starts_with(&NEGOTIATION));
    assert!(String::from_utf8_lossy(&boot).contains("[stub] [operator connected]\r\n/ > "));

    // Client negotiation replies are stripped before line editing.
    client.write_all(&[IAC, DO, OPT_ECHO]).await.unwrap();
    client.write_all(b"ls\r\n").await.unwrap();
    let reply = read_until(&mut client, &mut seen, b"/ > ").await;
    assert_eq!(String::from_utf8_lossy(&reply), "ls\r\n[stub] ls\r\n/ > ");

    client.write_all(b"cd /tmp\r\n").await.unwrap();
    let reply = read_until(&mut client, &mut seen, b"/tmp > ").await;
    assert_eq!(String::from_utf8_lossy(&reply), "cd /tmp\r\n/tmp > ");

    client.write_all(b"exit\r\n").await.unwrap();
    read_until(&mut client, &mut seen, b"Connection closed.\r\n").await;
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn sessions_do_not_share_state() {
    let yaml = "model:\n  provider: stub\nsession:\n  greeting: \"\"\ntelnet:\n  negotiate: false\n";
    let (addr, cancel, handle) = start(yaml).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    let (mut seen_a, mut seen_b) = (Vec::new(), Vec::new());
    read_until(&mut a, &mut seen_a, b"/ > ").await;
    read_until(&mut b, &mut seen_b, b"/ > ").await;

    a.write_all(b"cd /srv\r\n").await.unwrap();
    read_until(&mut a, &mut seen_a, b"/srv > ").await;

    b.write_all(b"pwd\r\n").await.unwrap();
    let reply = read_until(&mut b, &mut seen_b, b"/ > ").await;
    assert_eq!(String::from_utf8_lossy(&reply), "pwd\r\n/\r\n/ > ");

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn ctrl_d_says_farewell_and_shutdown_closes_idle_sessions() {
    let yaml = "model:\n  provider: stub\nsession:\n  greeting: \"\"\ntelnet:\n  negotiate: false\n";
    let (addr, cancel, handle) = start(yaml).await;

    let mut leaving = TcpStream::connect(addr).await.unwrap();
    let mut idle = TcpStream::connect(addr).await.unwrap();
    let (mut seen_l, mut seen_i) = (Vec::new(), Vec::new());
    read_until(&mut leaving, &mut seen_l, b"/ > ").await;
    read_until(&mut idle, &mut seen_i, b"/ > ").await;

    leaving.write_all(&[0x04]).await.unwrap();
    read_until(&mut leaving, &mut seen_l, b"Connection closed.\r\n").await;

    cancel.cancel();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
