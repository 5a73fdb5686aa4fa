// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The framed request/response protocol spoken on a node's client port.
//!
//! Every message is a 4-byte big-endian length followed by a JSON body. Both sides frame with
//! [`codec`]: the node agent through tokio's `Framed`, the orchestrator's blocking client
//! through [`BlockingFramed`].

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use {
    bytes::{Bytes, BytesMut},
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec},
};

use crate::{
    error::{CcmError, Result},
    node::CassandraNode,
};

/// Largest frame either side will accept.
pub const MAX_FRAME_LENGTH: usize = 1 << 20;

/// Key under which hosts that could not be asked for their version are reported.
pub const UNREACHABLE: &str = "UNREACHABLE";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    /// The schema version of the node receiving the request.
    LocalSchemaVersion,
    /// Schema versions across the cluster, as seen by the node receiving the request.
    DescribeSchemaVersions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Response {
    Pong,
    SchemaVersion(String),
    /// Schema version to the hosts reporting it.
    SchemaVersions(BTreeMap<String, Vec<String>>),
    Error(String),
}

/// The frame codec shared by the agent and the blocking client.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| CcmError::Protocol(format!("encode failed: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CcmError::Protocol(format!("decode failed: {e}")))
}

/// A blocking byte stream framed with [`codec`], the counterpart of tokio's `Framed` for
/// callers without a runtime.
#[derive(Debug)]
pub struct BlockingFramed<S> {
    inner: S,
    codec: LengthDelimitedCodec,
    /// Bytes read past the end of the last frame.
    buffer: BytesMut,
}

impl<S> BlockingFramed<S> {
    pub fn new(inner: S) -> Self {
        BlockingFramed {
            inner,
            codec: codec(),
            buffer: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: Write> BlockingFramed<S> {
    pub fn send(&mut self, body: &[u8]) -> io::Result<()> {
        let mut frame = BytesMut::with_capacity(body.len() + 4);
        self.codec.encode(Bytes::copy_from_slice(body), &mut frame)?;
        self.inner.write_all(&frame)?;
        self.inner.flush()
    }
}

impl<S: Read> BlockingFramed<S> {
    /// Block until a whole frame has arrived and return its body.
    pub fn recv(&mut self) -> io::Result<BytesMut> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }
            let read = self.inner.read(&mut chunk)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a whole frame arrived",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Resolve `host:port` to the first socket address.
pub fn socket_addr(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address for {host}:{port}"),
        )
    })
}

/// A blocking connection to one node's client port.
#[derive(Debug)]
pub struct NodeClient {
    node: CassandraNode,
    framed: BlockingFramed<TcpStream>,
}

impl NodeClient {
    pub fn connect(node: &CassandraNode, timeout: Duration) -> Result<Self> {
        let connectivity = |source: io::Error| CcmError::Connectivity {
            node: node.client_address(),
            source,
        };
        let addr = socket_addr(node.hostname(), node.thrift_port()).map_err(connectivity)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(connectivity)?;
        stream
            .set_read_timeout(Some(timeout.max(Duration::from_secs(5))))
            .map_err(connectivity)?;
        Ok(NodeClient {
            node: node.clone(),
            framed: BlockingFramed::new(stream),
        })
    }

    pub fn node(&self) -> &CassandraNode {
        &self.node
    }

    pub fn request(&mut self, request: &Request) -> Result<Response> {
        let connectivity = |source: io::Error| CcmError::Connectivity {
            node: self.node.client_address(),
            source,
        };
        self.framed.send(&encode(request)?).map_err(connectivity)?;
        let body = self.framed.recv().map_err(connectivity)?;
        match decode(&body)? {
            Response::Error(message) => Err(CcmError::Protocol(format!(
                "{} replied with an error: {message}",
                self.node
            ))),
            response => Ok(response),
        }
    }

    pub fn local_schema_version(&mut self) -> Result<String> {
        match self.request(&Request::LocalSchemaVersion)? {
            Response::SchemaVersion(version) => Ok(version),
            other => Err(unexpected(&other)),
        }
    }

    pub fn describe_schema_versions(&mut self) -> Result<BTreeMap<String, Vec<String>>> {
        match self.request(&Request::DescribeSchemaVersions)? {
            Response::SchemaVersions(versions) => Ok(versions),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> CcmError {
    CcmError::Protocol(format!("unexpected response: {response:?}"))
}
