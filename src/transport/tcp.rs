//! Newline-delimited JSON client for the force-plate server.
//!
//! Each poll writes one request line (`{"command":["Force"]}`) and reads one
//! response line holding a [`Payload`]. The connection is opened eagerly so a
//! misconfigured address fails at startup; after any I/O or decode error it is
//! dropped and reopened on the next fetch.

use super::types::{FetchError, Payload};
use super::Transport;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

#[derive(Serialize)]
struct Request<'a> {
    command: &'a [String],
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: SocketAddr) -> std::io::Result<Self> {
        let writer = TcpStream::connect(addr)?;
        writer.set_nodelay(true)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { reader, writer })
    }
}

/// TCP transport to a force-plate acquisition server.
pub struct TcpTransport {
    addr: SocketAddr,
    connection: Option<Connection>,
    line: String,
}

impl TcpTransport {
    /// Resolve `addr` and open the first connection.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, FetchError> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            )
        })?;
        let connection = Connection::open(addr)?;
        tracing::info!(%addr, "connected to force-plate server");

        Ok(Self {
            addr,
            connection: Some(connection),
            line: String::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn exchange(&mut self, command: &[String]) -> Result<Payload, FetchError> {
        if self.connection.is_none() {
            tracing::debug!(addr = %self.addr, "reconnecting to force-plate server");
            self.connection = Some(Connection::open(self.addr)?);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(FetchError::Closed);
        };

        let mut request = serde_json::to_vec(&Request { command })?;
        request.push(b'\n');
        connection.writer.write_all(&request)?;

        self.line.clear();
        if connection.reader.read_line(&mut self.line)? == 0 {
            return Err(FetchError::Closed);
        }

        Ok(serde_json::from_str(self.line.trim_end())?)
    }
}

impl Transport for TcpTransport {
    fn fetch(&mut self, command: &[String]) -> Result<Payload, FetchError> {
        let result = self.exchange(command);
        if result.is_err() {
            self.connection = None;
        }
        result
    }
}
