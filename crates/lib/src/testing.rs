//! Scripted MAIP host for exercising the client over a real socket

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::client::{Client, ConnectOptions};
use crate::codec;
use crate::protocol::{Request, Response, key, status};

/// What the host does with each incoming request
pub(crate) enum Step {
    Reply(Response),
    /// Send bytes as-is
    Raw(Vec<u8>),
    /// Never answer; wait for the client to hang up
    Silent,
    /// Hang up without answering
    Close,
    /// Stop reading for a while, then hang up. The next request is left
    /// unread so a large one fills the socket buffers.
    Stall(Duration),
}

pub(crate) struct ScriptedHost {
    port: u16,
    handle: JoinHandle<Vec<Request>>,
}

impl ScriptedHost {
    /// Accept one connection and play `steps` against it, one per request
    pub(crate) fn start(steps: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, steps)
        });
        Self { port, handle }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the host thread and return every request it read.
    /// The client must be dropped first.
    pub(crate) fn finish(self) -> Vec<Request> {
        self.handle.join().unwrap()
    }
}

fn serve(stream: TcpStream, steps: Vec<Step>) -> Vec<Request> {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;
    let mut received = Vec::new();

    for step in steps {
        if let Step::Stall(pause) = step {
            thread::sleep(pause);
            return received;
        }
        match codec::read_request(&mut reader) {
            Ok(req) => received.push(req),
            Err(_) => return received,
        }
        match step {
            Step::Reply(resp) => codec::write_response(&mut writer, &resp).unwrap(),
            Step::Raw(bytes) => writer.write_all(&bytes).unwrap(),
            Step::Silent => {
                while let Ok(req) = codec::read_request(&mut reader) {
                    received.push(req);
                }
                return received;
            }
            Step::Close | Step::Stall(_) => return received,
        }
    }

    // Script done: keep reading so unexpected requests are still recorded
    while let Ok(req) = codec::read_request(&mut reader) {
        received.push(req);
    }
    received
}

pub(crate) fn options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Some(Duration::from_millis(300)),
        write_timeout: Some(Duration::from_secs(2)),
    }
}

pub(crate) fn access_granted(token: &str) -> Response {
    Response::new(status::SUCCESS).field(key::STOK, token)
}

/// Host and client that already completed the handshake with token `tok`
pub(crate) fn authenticated_client(steps: Vec<Step>) -> (ScriptedHost, Client) {
    let mut script = vec![Step::Reply(access_granted("tok"))];
    script.extend(steps);
    let host = ScriptedHost::start(script);
    let client = Client::with_options("127.0.0.1", host.port(), "admin", "secret", options());
    assert!(client.create_client().unwrap().is(status::SUCCESS));
    (host, client)
}
