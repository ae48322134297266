// Tribune - Peer-to-peer asynchronous RPC runtime for contest management services
// Copyright (C) 2026  Tribune Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use tribune::{Directory, HandlerError, MethodFlags, ServiceCoord, Tribune};

const WAIT: Duration = Duration::from_secs(5);

/// Binds a node on an ephemeral port, spawns its loop, and hands back the
/// handle together with the address peers should dial.
async fn listening_node(name: &str) -> (Tribune, SocketAddr) {
    let coord = ServiceCoord::new(name, 0);

    let mut directory = Directory::new();
    directory.insert(coord.clone(), "127.0.0.1:0").unwrap();

    let tribune = Tribune::new(coord, directory).await.unwrap();
    let addr = tribune.local_addr().unwrap();

    let runner = tribune.clone();
    tokio::spawn(async move {
        let _ = runner.up().await;
    });

    (tribune, addr)
}

async fn read_frame(stream: &mut TcpStream) -> Value {
    let payload = timeout(WAIT, async {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return line;
            }
        }
    })
    .await
    .unwrap();

    serde_json::from_slice(&payload).unwrap()
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn echo_round_trip_between_services() {
    let (server, addr) = listening_node("EchoServer").await;

    let server_coord = server.coord().clone();
    let mut roster = Directory::new();
    roster.insert_addr(server_coord.clone(), addr);

    let client = Tribune::new(ServiceCoord::new("Client", 0), roster)
        .await
        .unwrap();
    client.connect_to(server_coord.clone(), None).unwrap();

    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.up().await;
    });

    let reply: Arc<Mutex<Option<(Option<Value>, Option<String>)>>> = Arc::new(Mutex::new(None));
    let slot = reply.clone();

    let started = client
        .call(
            &server_coord,
            "echo",
            &json!({ "string": "hello" }),
            Some(Box::new(move |data, error| {
                *slot.lock() = Some((data, error));
            })),
        )
        .await;
    assert!(started);

    wait_until(|| reply.lock().is_some()).await;

    let (data, error) = reply.lock().take().unwrap();
    assert_eq!(data, Some(json!("hello")));
    assert_eq!(error, None);

    client.exit();
    server.exit();
}

#[tokio::test]
async fn unknown_method_is_answered_with_key_error() {
    let (server, addr) = listening_node("Bare").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"nope\",\"__data\":{},\"__id\":\"0000000000000001\"}\r\n")
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    assert_eq!(reply["__id"], json!("0000000000000001"));
    assert_eq!(reply["__data"], Value::Null);
    assert!(reply["__error"]
        .as_str()
        .unwrap()
        .starts_with("KeyError: Service has no method nope"));

    server.exit();
}

#[tokio::test]
async fn unexposed_method_is_refused_on_the_wire() {
    let (server, addr) = listening_node("Guarded").await;
    server.register("secret", MethodFlags::internal(), |_, _| Ok(Value::Null));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"secret\",\"__data\":{},\"__id\":\"0000000000000002\"}\r\n")
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    let error = reply["__error"].as_str().unwrap();
    assert!(error.starts_with("AuthorizationError: Method "));
    assert!(error.contains("not callable from RPC"));

    server.exit();
}

#[tokio::test]
async fn request_without_data_is_a_value_error() {
    let (server, addr) = listening_node("Strict").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"echo\",\"__id\":\"0000000000000003\"}\r\n")
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    assert_eq!(reply["__id"], json!("0000000000000003"));
    assert!(reply["__error"]
        .as_str()
        .unwrap()
        .starts_with("ValueError: No data present."));

    server.exit();
}

#[tokio::test]
async fn handler_faults_reach_the_caller() {
    let (server, addr) = listening_node("Flaky").await;
    server.register("flaky", MethodFlags::exposed(), |_, _| {
        Err(HandlerError::new("RuntimeError", "broken pipeline"))
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"flaky\",\"__data\":{},\"__id\":\"0000000000000007\"}\r\n")
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    assert_eq!(reply["__error"], json!("RuntimeError: broken pipeline"));
    assert_eq!(reply["__data"], Value::Null);

    server.exit();
}

#[tokio::test]
async fn frames_on_one_connection_are_answered_in_order() {
    let (server, addr) = listening_node("Sequencer").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"{\"__method\":\"echo\",\"__data\":{\"string\":\"one\"},\"__id\":\"0000000000000004\"}\r\n\
              {\"__method\":\"echo\",\"__data\":{\"string\":\"two\"},\"__id\":\"0000000000000005\"}\r\n",
        )
        .await
        .unwrap();

    let first = read_frame(&mut stream).await;
    let second = read_frame(&mut stream).await;

    assert_eq!(first["__id"], json!("0000000000000004"));
    assert_eq!(first["__data"], json!("one"));
    assert_eq!(second["__id"], json!("0000000000000005"));
    assert_eq!(second["__data"], json!("two"));

    server.exit();
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_survives() {
    let (server, addr) = listening_node("Tolerant").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"this is not json\r\n\
              {\"__method\":\"echo\",\"__data\":{\"string\":\"still here\"},\"__id\":\"0000000000000006\"}\r\n",
        )
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    assert_eq!(reply["__data"], json!("still here"));

    server.exit();
}

#[tokio::test]
async fn reply_to_fire_and_forget_has_no_id() {
    let (server, addr) = listening_node("Echoic").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"echo\",\"__data\":{\"string\":\"quiet\"}}\r\n")
        .await
        .unwrap();

    let reply = read_frame(&mut stream).await;

    assert_eq!(reply.get("__id"), None);
    assert_eq!(reply["__data"], json!("quiet"));

    server.exit();
}

#[tokio::test]
async fn quit_from_a_peer_stops_the_service() {
    let (server, addr) = listening_node("Mortal").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"__method\":\"quit\",\"__data\":{\"reason\":\"rollout\"}}\r\n")
        .await
        .unwrap();

    wait_until(|| server.exiting()).await;
}

#[tokio::test]
async fn reconnect_sweep_fires_on_connect_exactly_once() {
    let target = ServiceCoord::new("Target", 0);
    let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();

    let mut roster = Directory::new();
    roster.insert_addr(target.clone(), addr);

    let client = Tribune::new(ServiceCoord::new("Dialer", 0), roster.clone())
        .await
        .unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    client
        .connect_to(
            target.clone(),
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.up().await;
    });

    // Sweeps keep failing while nothing listens on the roster port.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    let server = Tribune::new(target.clone(), roster.clone()).await.unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.up().await;
    });

    wait_until(|| connects.load(Ordering::SeqCst) == 1).await;

    // Staying connected must not re-fire the callback.
    sleep(Duration::from_millis(600)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    client.exit();
    server.exit();
}

#[tokio::test]
async fn dropped_connection_fails_pending_requests() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A mute endpoint: accept, swallow one read, hang up.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = [0u8; 256];
        let _ = stream.read(&mut sink).await;
    });

    let target = ServiceCoord::new("Mute", 0);
    let mut roster = Directory::new();
    roster.insert_addr(target.clone(), addr);

    let client = Tribune::new(ServiceCoord::new("Caller", 0), roster)
        .await
        .unwrap();
    client.connect_to(target.clone(), None).unwrap();

    let outcome: Arc<Mutex<Option<Option<String>>>> = Arc::new(Mutex::new(None));
    let slot = outcome.clone();

    let started = client
        .call(
            &target,
            "never_answered",
            &json!({}),
            Some(Box::new(move |_, error| {
                *slot.lock() = Some(error);
            })),
        )
        .await;
    assert!(started);

    wait_until(|| outcome.lock().is_some()).await;

    assert_eq!(
        outcome.lock().take().unwrap().as_deref(),
        Some("Transfer interrupted")
    );
}

/// A payload whose serialization always fails, standing in for return
/// values the JSON encoder cannot represent.
struct Unencodable;

impl serde::Serialize for Unencodable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("not representable"))
    }
}

#[tokio::test]
async fn encode_failure_completes_the_request_locally() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept and hang up right away; the request never reaches the wire.
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let target = ServiceCoord::new("Sink", 0);
    let mut roster = Directory::new();
    roster.insert_addr(target.clone(), addr);

    let client = Tribune::new(ServiceCoord::new("Encoder", 0), roster)
        .await
        .unwrap();
    client.connect_to(target.clone(), None).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let outcome: Arc<Mutex<Option<Option<String>>>> = Arc::new(Mutex::new(None));
    let counter = calls.clone();
    let slot = outcome.clone();

    let started = client
        .call(
            &target,
            "submit",
            &Unencodable,
            Some(Box::new(move |_, error| {
                counter.fetch_add(1, Ordering::SeqCst);
                *slot.lock() = Some(error);
            })),
        )
        .await;
    assert!(started);

    // The failure is local and synchronous; the callback already fired.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        outcome.lock().take().unwrap().as_deref(),
        Some("Cannot send request of method submit because of encoding error.")
    );

    // The later hangup must not fire it a second time.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
