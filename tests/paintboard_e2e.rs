//! End-to-end scenario against a scripted in-process mock server (spec §8
//! S1/S4): a minimal HTTP responder for the auth/snapshot endpoints plus a
//! `tokio-tungstenite` WebSocket acceptor, driving the real `Supervisor`
//! through token issuance, snapshot load, composition, and the scheduler's
//! first assignment. Grounded on the teacher's own hand-rolled
//! server/client pairs talking a tight binary protocol (SPEC_FULL §B "Test
//! tooling").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use painter::config::{AttackKind, Config, DrawMode, ImageConfig, ScanMode, UserEntry};
use painter::wire::{Color, PaintFrame, Pos, OP_BOARD_UPDATE, OP_PING, OP_PONG, PAINT_FRAME_LEN};

const SNAPSHOT_BYTES: usize = 1000 * 600 * 3;
const TOKEN_JSON: &str = r#"{"token":"0123456789abcdef0123456789abcdef"}"#;

async fn read_request_path(stream: &mut BufReader<TcpStream>) -> (String, usize) {
    let mut request_line = String::new();
    stream.read_line(&mut request_line).await.unwrap();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        stream.read_line(&mut header).await.unwrap();
        if header == "\r\n" || header.is_empty() {
            break;
        }
        if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        stream.read_exact(&mut body).await.unwrap();
    }
    (path, content_length)
}

async fn write_response(stream: &mut BufReader<TcpStream>, body: &[u8]) {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

/// Serves `/api/auth/gettoken` and `/api/paintboard/getboard` forever, one
/// connection at a time, closing each (no keep-alive) so the test never
/// needs to reason about HTTP/1.1 connection reuse.
fn spawn_http_mock(listener: TcpListener) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut stream = BufReader::new(stream);
                let (path, _) = read_request_path(&mut stream).await;
                if path.starts_with("/api/paintboard/getboard") {
                    write_response(&mut stream, &vec![0u8; SNAPSHOT_BYTES]).await;
                } else if path.starts_with("/api/auth/gettoken") {
                    write_response(&mut stream, TOKEN_JSON.as_bytes()).await;
                } else {
                    write_response(&mut stream, b"{}").await;
                }
            });
        }
    });
}

#[derive(Clone, Copy)]
enum MockCommand {
    BoardUpdate(Pos, Color),
}

/// Accepts every WebSocket connection the pool opens (one read-write + the
/// configured write-only connections), decodes client-origin paint frames
/// onto `frames_tx`, answers pings, and replays operator-issued
/// `MockCommand`s (board updates) to every connected socket — the test
/// doesn't know or care which physical socket the pool picks to carry a
/// given frame (§4.5: batching may use a shared queue across connections).
fn spawn_ws_mock(
    listener: TcpListener,
    frames_tx: mpsc::UnboundedSender<PaintFrame>,
    commands: broadcast::Sender<MockCommand>,
    pongs: Arc<AtomicU32>,
) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let frames_tx = frames_tx.clone();
            let mut rx = commands.subscribe();
            let pongs = pongs.clone();

            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut stream) = ws.split();

                // S4: ping shortly after open, independent of the rest of
                // the protocol.
                let _ = sink.send(Message::Binary(vec![OP_PING])).await;

                loop {
                    tokio::select! {
                        incoming = stream.next() => {
                            let Some(Ok(msg)) = incoming else { break };
                            let bytes = match msg {
                                Message::Binary(b) => b,
                                Message::Close(_) => break,
                                _ => continue,
                            };
                            if bytes.as_slice() == [OP_PONG] {
                                pongs.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            for chunk in bytes.chunks(PAINT_FRAME_LEN) {
                                if chunk.len() == PAINT_FRAME_LEN {
                                    if let Some(frame) = PaintFrame::decode(chunk) {
                                        let _ = frames_tx.send(frame);
                                    }
                                }
                            }
                        }
                        Ok(MockCommand::BoardUpdate(pos, color)) = rx.recv() => {
                            let mut payload = vec![OP_BOARD_UPDATE];
                            payload.extend_from_slice(&pos.x.to_le_bytes());
                            payload.extend_from_slice(&pos.y.to_le_bytes());
                            payload.extend_from_slice(&[color.r, color.g, color.b]);
                            if sink.send(Message::Binary(payload)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

fn single_pixel_attack_config(port_unused: u16) -> Config {
    let _ = port_unused;
    Config {
        users: vec![UserEntry {
            uid: 42,
            access_key: "test-key".to_string(),
        }],
        paint_interval_ms: 20,
        round_interval_seconds: 30,
        user_cooldown_seconds: 2.0,
        auto_restart_minutes: 0,
        max_enabled_tokens: 0,
        token_refresh_interval_seconds: 3600,
        writeonly_connections: 1,
        thread_workers: 1,
        process_workers: 0,
        ignore_semitransparent: false,
        images: vec![ImageConfig {
            image_path: None,
            kind: Some("attack".to_string()),
            width: Some(1),
            height: Some(1),
            dot_count: Some(1),
            attack_kind: Some(AttackKind::White),
            start_x: 10,
            start_y: 20,
            draw_mode: DrawMode::Horizontal,
            scan_mode: ScanMode::Normal,
            weight: 1.0,
            enabled: true,
        }],
    }
}

/// Scenario S1 (single-pixel convergence) + S4 (ping response), driven
/// through the real `Supervisor` against the mock server above.
#[tokio::test]
async fn single_pixel_converges_and_then_stays_quiet_during_cooldown() {
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_port = http_listener.local_addr().unwrap().port();
    spawn_http_mock(http_listener);

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_port = ws_listener.local_addr().unwrap().port();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let (commands_tx, _) = broadcast::channel(16);
    let pongs = Arc::new(AtomicU32::new(0));
    spawn_ws_mock(ws_listener, frames_tx, commands_tx.clone(), pongs.clone());

    let config = single_pixel_attack_config(ws_port);
    let base_url = format!("http://127.0.0.1:{http_port}");
    let ws_url = format!("ws://127.0.0.1:{ws_port}");

    let supervisor = painter::supervisor::Supervisor::new(config, base_url, ws_url).unwrap();
    let stop_tx = supervisor.stop_handle();
    let run_handle = tokio::spawn(supervisor.run());

    // S4: every connection answers the mock's ping with a lone 0xfb.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        pongs.load(Ordering::Relaxed) >= 1,
        "expected at least one pong across the opened connections"
    );

    // S1: exactly one paint frame for (10, 20), white, uid 42.
    let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .expect("a paint frame should arrive within 5s")
        .expect("frames channel should not close");
    assert_eq!(frame.pos, Pos::new(10, 20));
    assert_eq!(frame.color, Color::new(255, 255, 255));
    assert_eq!(frame.uid, 42);

    // The mock confirms the write; the client's mirror now matches target.
    let _ = commands_tx.send(MockCommand::BoardUpdate(Pos::new(10, 20), Color::new(255, 255, 255)));

    // No further frame for this coordinate while cooldown is in effect.
    let second = tokio::time::timeout(Duration::from_millis(900), frames_rx.recv()).await;
    assert!(second.is_err(), "no frame should be resubmitted before cooldown elapses");

    stop_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), run_handle)
        .await
        .expect("supervisor should shut down promptly")
        .expect("supervisor task should not panic");
    assert!(result.is_ok(), "supervisor run should exit cleanly: {result:?}");
}
