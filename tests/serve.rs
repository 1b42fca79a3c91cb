// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end tests driving a live server over real sockets.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use statisk::connection::ActorMode;
use statisk::listener::{Server, ServerConfig};

const PAGE: &str = "<html><body>hi</body></html>";
const EMPTY_BODY: &str = "<html><body></body></html>";
const BODY_400: &str = "Your request has bad syntax or is inherently impossible to satisfy.\n";
const BODY_403: &str = "You do not have permission to get file from this server.\n";
const BODY_404: &str = "The requested file was not found on this server.\n";

fn serve(root: &Path, mode: ActorMode) -> SocketAddr {
    let config = ServerConfig {
        doc_root: root.to_path_buf(),
        mode,
        ..ServerConfig::default()
    };
    let mut server = Server::bind(config).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.run().unwrap());
    addr
}

fn doc_root_with_page() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.html");
    fs::write(&path, PAGE).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    dir
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

fn head(status: &str, content_length: usize, connection: &str) -> String {
    format!("HTTP/1.1 {status}\r\nContent-Length: {content_length}\r\nConnection: {connection}\r\n\r\n")
}

#[test]
fn serves_file_and_closes() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /index.html HTTP/1.1\r\nHost: x.y\r\n\r\n");
    let expected = format!("{}{}", head("200 2333", PAGE.len(), "close"), PAGE);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn serves_file_in_reactor_mode() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Reactor);

    let response = exchange(addr, b"GET /index.html HTTP/1.1\r\nHost: x.y\r\n\r\n");
    let expected = format!("{}{}", head("200 2333", PAGE.len(), "close"), PAGE);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn keep_alive_serves_repeated_requests_on_one_connection() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let expected = format!("{}{}", head("200 2333", PAGE.len(), "keep-alive"), PAGE);
    let mut stream = connect(addr);

    for _ in 0..2 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let mut response = vec![0u8; expected.len()];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(expected.as_bytes(), response.as_slice());
    }
}

#[test]
fn post_is_rejected_with_400() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"POST /x HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("400 Bad Request", BODY_400.len(), "close"), BODY_400);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn missing_file_is_404() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /missing HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("404 Not Found", BODY_404.len(), "close"), BODY_404);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn unreadable_file_is_403() {
    let root = doc_root_with_page();
    let path = root.path().join("noperm");
    fs::write(&path, "secret").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o200)).unwrap();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /noperm HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("403 Forbidden", BODY_403.len(), "close"), BODY_403);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn directory_target_is_400() {
    let root = doc_root_with_page();
    let sub = root.path().join("sub");
    fs::create_dir(&sub).unwrap();
    fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /sub HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("400 Bad Request", BODY_400.len(), "close"), BODY_400);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn traversal_target_is_400() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("400 Bad Request", BODY_400.len(), "close"), BODY_400);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

#[test]
fn zero_length_file_gets_placeholder_body() {
    let root = doc_root_with_page();
    let path = root.path().join("empty.html");
    fs::write(&path, "").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    let addr = serve(root.path(), ActorMode::Proactor);

    let response = exchange(addr, b"GET /empty.html HTTP/1.1\r\n\r\n");
    let expected = format!("{}{}", head("200 2333", EMPTY_BODY.len(), "close"), EMPTY_BODY);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

// A request split mid-token parses as NO_REQUEST first, then completes once
// the rest arrives on the re-armed connection.
#[test]
fn partial_request_completes_after_second_burst() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let mut stream = connect(addr);
    stream.write_all(b"GET /index.html HTT").unwrap();
    thread::sleep(Duration::from_millis(150));
    stream.write_all(b"P/1.1\r\n\r\n").unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    let expected = format!("{}{}", head("200 2333", PAGE.len(), "close"), PAGE);
    assert_eq!(expected.as_bytes(), response.as_slice());
}

// A connection that never sends a byte is reaped by the wheel after three
// steps; the peer observes EOF rather than a response.
#[test]
fn idle_connection_is_reaped() {
    let root = doc_root_with_page();
    let addr = serve(root.path(), ActorMode::Proactor);

    let mut stream = connect(addr);
    stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();

    let mut buf = [0u8; 16];
    let read = stream.read(&mut buf).unwrap();
    assert_eq!(0, read, "expected EOF from the reaper, got bytes");
}
