// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! A trivial single-route-per-file HTTP/1.x GET server. No persistent
//! connections, no chunked transfer, no request body parsing beyond the
//! request line — the printer firmware this serves is a simple client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Error;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct Route {
    file_path: PathBuf,
    size: u64,
    md5: String,
}

impl Route {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn md5(&self) -> &str {
        &self.md5
    }
}

#[derive(Clone, Default)]
struct RouteTable {
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl RouteTable {
    fn get(&self, path: &str) -> Option<Route> {
        self.routes.read().expect("route table lock poisoned").get(path).cloned()
    }

    fn insert(&self, url_path: String, route: Route) {
        self.routes
            .write()
            .expect("route table lock poisoned")
            .insert(url_path, route);
    }

    fn remove(&self, url_path: &str) {
        self.routes
            .write()
            .expect("route table lock poisoned")
            .remove(url_path);
    }
}

pub struct HttpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: RouteTable,
}

/// A handle used by the session orchestrator to register and unregister
/// file routes while the accept loop runs independently.
#[derive(Clone)]
pub struct RouteHandle {
    routes: RouteTable,
}

impl HttpServer {
    /// # Errors
    ///
    /// Returns error if `addr` cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            routes: RouteTable::default(),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn route_handle(&self) -> RouteHandle {
        RouteHandle {
            routes: self.routes.clone(),
        }
    }

    /// Accepts connections forever, spawning one task per request.
    ///
    /// # Errors
    ///
    /// Returns error if the listener itself fails.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let routes = self.routes.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_request(stream, &routes).await {
                    log::debug!("http connection from {peer} ended: {err}");
                }
            });
        }
    }
}

impl RouteHandle {
    /// A `RouteHandle` backed by its own empty table, for tests elsewhere in
    /// this crate that need to construct a session orchestrator without
    /// standing up a full `HttpServer`.
    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self {
            routes: RouteTable::default(),
        }
    }

    /// Registers `file_path` under `url_path`, computing size and MD5 by
    /// streaming the file in fixed-size chunks. Registering the same path
    /// twice yields identical size and MD5, since both are recomputed from
    /// the same bytes on disk each time.
    ///
    /// # Errors
    ///
    /// Returns error if `file_path` cannot be opened or read.
    pub async fn register(&self, url_path: &str, file_path: &Path) -> Result<Route, Error> {
        let mut file = File::open(file_path).await?;
        let mut hasher = Md5::new();
        let mut size = 0u64;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            size += n as u64;
        }
        let md5 = hex_lower(&hasher.finalize());
        let route = Route {
            file_path: file_path.to_path_buf(),
            size,
            md5,
        };
        self.routes.insert(url_path.to_string(), route.clone());
        Ok(route)
    }

    /// Removes the entry atomically with respect to in-progress handlers:
    /// a handler that already read the route before this call still serves
    /// the full response; new requests after this call see a 404.
    pub fn unregister(&self, url_path: &str) {
        self.routes.remove(url_path);
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

async fn handle_request(mut stream: TcpStream, routes: &RouteTable) -> Result<(), Error> {
    let mut reader = BufReader::new(&mut stream);
    let request_line = read_request_line(&mut reader).await?;
    let Some((method, path)) = parse_request_line(&request_line) else {
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Ok(());
    };

    let Some(route) = routes.get(&path) else {
        stream.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await?;
        return Ok(());
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nEtag: {}\r\nContent-Length: {}\r\n\r\n",
        route.md5, route.size
    );
    stream.write_all(header.as_bytes()).await?;

    if method.eq_ignore_ascii_case("HEAD") {
        return Ok(());
    }

    let mut file = File::open(&route.file_path).await?;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&chunk[..n]).await?;
    }
    Ok(())
}

async fn read_request_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<String, Error> {
    use tokio::io::AsyncBufReadExt;
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    // Drain the remaining header lines up to the blank CRLF line; this
    // server never inspects headers, but must consume them off the socket.
    loop {
        let mut header_line = String::new();
        let n = reader.read_line(&mut header_line).await?;
        if n == 0 || header_line == "\r\n" || header_line.is_empty() {
            break;
        }
    }
    Ok(line)
}

fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.trim_end().split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;

    fn test_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_registering_same_file_twice_is_stable() {
        let path = test_file("sdcp_engine_test_stable.bin", b"hello world");

        let server = HttpServer::bind("127.0.0.1:0").await.unwrap();
        let handle = server.route_handle();
        let route1 = handle.register("/x.ctb", &path).await.unwrap();
        let route2 = handle.register("/x.ctb", &path).await.unwrap();
        assert_eq!(route1.size(), route2.size());
        assert_eq!(route1.md5(), route2.md5());
    }

    #[tokio::test]
    async fn test_404_on_unregistered_path() {
        let server = HttpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /nope HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_get_served_file() {
        let path = test_file("sdcp_engine_test_get.bin", b"payload-bytes");

        let server = HttpServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let handle = server.route_handle();
        handle.register("/f.goo", &path).await.unwrap();
        tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /f.goo HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("payload-bytes"));
    }
}
