//! End-to-end tests driving a real spawned server with real `TcpStream`
//! clients, following the same process-based smoke-test style the teacher
//! repo uses for its own transports: bind on an ephemeral port, spawn the
//! server, then connect real sockets and assert on what comes back over
//! the wire.

use std::time::Duration;

use anyhow::{anyhow, Result};
use line_chat::limits::Limits;
use line_chat::server;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;
use tokio::time::{sleep, timeout};

type ClientLines = Lines<BufReader<OwnedReadHalf>>;

/// Bind an ephemeral listener, spawn the server loop onto `local`, and
/// return the address clients should connect to.
async fn spawn_server(local: &LocalSet, limits: Limits) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    local.spawn_local(async move {
        let _ = server::run_on(limits, listener).await;
    });
    // Give the accept loop a moment to actually start polling.
    sleep(Duration::from_millis(50)).await;
    Ok(addr)
}

/// Connect, negotiate `name`, and return the split write half plus a line
/// reader over the read half.
async fn connect_and_name(addr: std::net::SocketAddr, name: &str) -> Result<(tokio::net::tcp::OwnedWriteHalf, ClientLines)> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let choose = next_line(&mut lines).await?;
    assert_eq!(choose, "choose_name");

    write_half.write_all(format!("{name}\n").as_bytes()).await?;
    let reply = next_line(&mut lines).await?;
    assert_eq!(reply, format!("name_accepted {name}"));

    Ok((write_half, lines))
}

async fn next_line(lines: &mut ClientLines) -> Result<String> {
    timeout(Duration::from_secs(2), lines.next_line())
        .await
        .map_err(|_| anyhow!("timed out waiting for a line"))?
        .map_err(|e| anyhow!("read error: {e}"))?
        .ok_or_else(|| anyhow!("connection closed"))
}

/// Read lines, skipping any that start with `skip_prefix` (used to ignore
/// the unsolicited `set_statistic` pushes other joins trigger), until a
/// line matching `expect_prefix` arrives.
async fn next_line_skipping(lines: &mut ClientLines, skip_prefix: &str, expect_prefix: &str) -> Result<String> {
    loop {
        let line = next_line(lines).await?;
        if line.starts_with(skip_prefix) {
            continue;
        }
        assert!(
            line.starts_with(expect_prefix),
            "expected a line starting with `{expect_prefix}`, got `{line}`"
        );
        return Ok(line);
    }
}

#[tokio::test]
async fn name_negotiation_accepts_first_and_rejects_duplicate() -> Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let addr = spawn_server(&local, Limits::default()).await?;
            let _alice = connect_and_name(addr, "alice").await?;

            let stream = TcpStream::connect(addr).await?;
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            assert_eq!(next_line(&mut lines).await?, "choose_name");
            write_half.write_all(b"alice\n").await?;
            assert_eq!(next_line(&mut lines).await?, "name_rejected");

            Ok::<(), anyhow::Error>(())
        })
        .await
}

#[tokio::test]
async fn broadcast_message_reaches_other_channel_peer_not_sender() -> Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let addr = spawn_server(&local, Limits::default()).await?;

            let (mut alice_w, mut alice_lines) = connect_and_name(addr, "alice").await?;
            let (_bob_w, mut bob_lines) = connect_and_name(addr, "bob").await?;

            // alice's join predates bob's, so she gets a set_statistic push
            // when bob joins; drain it before continuing.
            assert_eq!(next_line(&mut alice_lines).await?.split(' ').next(), Some("set_statistic"));

            alice_w.write_all(b"message_from_client hello bob\n").await?;

            let line = next_line_skipping(&mut bob_lines, "set_statistic", "message_from_srv").await?;
            assert!(line.contains("hello bob"));

            // alice never receives her own broadcast back.
            let got = timeout(Duration::from_millis(200), alice_lines.next_line()).await;
            assert!(got.is_err(), "sender should not receive its own broadcast message");

            Ok::<(), anyhow::Error>(())
        })
        .await
}

#[tokio::test]
async fn private_message_is_not_visible_to_uninvolved_user() -> Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let addr = spawn_server(&local, Limits::default()).await?;

            let (mut alice_w, _alice_lines) = connect_and_name(addr, "alice").await?;
            let (mut bob_w, mut bob_lines) = connect_and_name(addr, "bob").await?;
            let (_carol_w, mut carol_lines) = connect_and_name(addr, "carol").await?;

            alice_w.write_all(b"change_chat private bob\n").await?;
            // bob received a set_statistic push when carol joined; drain it.
            assert_eq!(next_line(&mut bob_lines).await?.split(' ').next(), Some("set_statistic"));

            // bob must also be viewing the private thread with alice, or his
            // scope (still the default channel) can never match a private
            // destination — see destination_matches_scope.
            bob_w.write_all(b"change_chat private alice\n").await?;
            assert_eq!(next_line(&mut bob_lines).await?, "change_chat private alice");

            alice_w.write_all(b"message_from_client psst\n").await?;
            let got = next_line(&mut bob_lines).await?;
            assert!(got.starts_with("message_from_srv"));
            assert!(got.contains("psst"));

            let got = timeout(Duration::from_millis(200), carol_lines.next_line()).await;
            assert!(got.is_err(), "carol should not receive a private message addressed to bob");

            Ok::<(), anyhow::Error>(())
        })
        .await
}

#[tokio::test]
async fn ban_user_after_three_complaints_blocks_posting() -> Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let addr = spawn_server(&local, Limits::default()).await?;

            let (mut a_w, _a_lines) = connect_and_name(addr, "a").await?;
            let (mut b_w, _b_lines) = connect_and_name(addr, "b").await?;
            let (mut c_w, _c_lines) = connect_and_name(addr, "c").await?;
            let (_m_w, mut mallory_lines) = connect_and_name(addr, "mallory").await?;

            a_w.write_all(b"ban_user mallory\n").await?;
            b_w.write_all(b"ban_user mallory\n").await?;
            c_w.write_all(b"ban_user mallory\n").await?;

            let line = next_line_skipping(&mut mallory_lines, "set_statistic", "you have been banned").await?;
            assert!(line.contains("banned"));

            Ok::<(), anyhow::Error>(())
        })
        .await
}
