//! Client and an echo server wired together in-process.
//!
//! Run with:
//!   cargo run -p sockmux --example loopback --features logging -- [LEVEL] [FORMAT]
//!
//! LEVEL is one of error, warn, info (default), debug, trace. FORMAT is text
//! (default) or json.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::json;
use sockmux::frame::{decode_packet, encode_packet, Packet, DEFAULT_MAX_FRAME};
use sockmux::logging::{init_logging, LogFormat, LogLevel};
use sockmux::transport::{memory_pair, ServerEnd};
use sockmux::{Callback, Client, ClientConfig, Lifecycle};

/// Echo every request back; answer operator "fail" with an error header.
fn serve(server: ServerEnd, fail_operator: u32) {
    server.open();
    while let Some(data) = server.recv_timeout(Duration::from_secs(2)) {
        let request = match decode_packet(&data, DEFAULT_MAX_FRAME) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("server: bad frame: {e}");
                continue;
            }
        };
        let reply = if request.operator == fail_operator {
            Packet::new(
                request.operator,
                request.sequence,
                "code=404;message=not+found;",
                bytes::Bytes::new(),
            )
        } else {
            Packet::new(request.operator, request.sequence, "", request.body)
        };
        let mut buf = BytesMut::new();
        if encode_packet(&reply, &mut buf, DEFAULT_MAX_FRAME).is_ok() {
            server.send(buf.freeze());
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let level = args
        .next()
        .map(|arg| arg.parse::<LogLevel>())
        .transpose()?
        .unwrap_or(LogLevel::Info);
    let format = args
        .next()
        .map(|arg| arg.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();
    init_logging(format, level);

    let (connector, acceptor) = memory_pair();
    let (opened_tx, opened_rx) = mpsc::channel();
    let client = Client::builder(ClientConfig::new("mem://loopback"), connector)
        .lifecycle(Lifecycle::new().on_open(move || {
            let _ = opened_tx.send(());
        }))
        .connect();

    let server = acceptor
        .accept_timeout(Duration::from_secs(1))
        .ok_or("no connection attempt")?;
    let fail_operator = client.operator_code("fail");
    let server_thread = thread::spawn(move || serve(server, fail_operator));
    opened_rx.recv_timeout(Duration::from_secs(1))?;

    let (done_tx, done_rx) = mpsc::channel();
    for (operator, param) in [("echo", json!({"msg": "hi"})), ("fail", json!({}))] {
        let ok_tx = done_tx.clone();
        let err_tx = done_tx.clone();
        let callback = Callback::new()
            .on_success(move |body| {
                let _ = ok_tx.send(format!("{operator}: success {body}"));
            })
            .on_error(move |code, message| {
                let _ = err_tx.send(format!("{operator}: error {code} {message}"));
            });
        let key = client.send(operator, &param, callback)?;
        eprintln!("sent {operator} as {key}");
    }

    for _ in 0..2 {
        println!("{}", done_rx.recv_timeout(Duration::from_secs(2))?);
    }

    client.disconnect();
    let _ = server_thread.join();
    Ok(())
}
