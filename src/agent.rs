// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A lightweight node process that serves the client protocol.
//!
//! The agent stands in for a real node when exercising the cluster manager: it binds the node's
//! client port, reports a fixed schema version, and answers cluster wide schema queries by
//! asking its seeds.

use std::{
    collections::BTreeMap,
    fs, io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use {
    bytes::Bytes,
    clap::Parser,
    futures::{SinkExt, StreamExt},
    tracing::{debug, info, warn},
    tokio::net::{TcpListener, TcpStream},
    tokio_util::codec::Framed,
};

use crate::{
    commands::{Handle, HandledResult},
    protocol::{self, Request, Response, UNREACHABLE},
};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Serve the node protocol on a client port", long_about = None)]
pub struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    #[arg(long, default_value_t = 9160)]
    pub port: u16,

    #[arg(long, default_value = "ccm-schema-1")]
    pub schema_version: String,

    /// Comma separated addresses of the other nodes. They are expected to listen on the same
    /// port as this node.
    #[arg(long, default_value = "")]
    pub seeds: String,

    /// Write the agent's pid here before listening. Removed again on a clean shutdown.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// How long to wait for a seed to answer.
    #[arg(long, default_value_t = 500)]
    pub seed_timeout_ms: u64,
}

#[derive(Debug)]
struct Agent {
    address: String,
    port: u16,
    schema_version: String,
    seeds: Vec<String>,
    seed_timeout: Duration,
}

impl Agent {
    fn from_args(args: &Cli) -> Self {
        Agent {
            address: args.address.clone(),
            port: args.port,
            schema_version: args.schema_version.clone(),
            seeds: args
                .seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != args.address)
                .map(str::to_string)
                .collect(),
            seed_timeout: Duration::from_millis(args.seed_timeout_ms),
        }
    }

    async fn respond(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::LocalSchemaVersion => Response::SchemaVersion(self.schema_version.clone()),
            Request::DescribeSchemaVersions => {
                Response::SchemaVersions(self.describe_schema_versions().await)
            }
        }
    }

    async fn describe_schema_versions(&self) -> BTreeMap<String, Vec<String>> {
        let mut versions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        versions
            .entry(self.schema_version.clone())
            .or_default()
            .push(self.address.clone());

        for seed in &self.seeds {
            let version = match self.seed_schema_version(seed).await {
                Ok(version) => version,
                Err(e) => {
                    debug!("seed {seed} did not report a schema version: {e}");
                    UNREACHABLE.to_string()
                }
            };
            versions.entry(version).or_default().push(seed.clone());
        }
        versions
    }

    async fn seed_schema_version(&self, seed: &str) -> io::Result<String> {
        let addr = protocol::socket_addr(seed, self.port)?;
        let exchange = async {
            let stream = TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, protocol::codec());
            framed
                .send(Bytes::from(encode(&Request::LocalSchemaVersion)?))
                .await?;
            let frame = framed
                .next()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))??;
            match protocol::decode::<Response>(&frame).map_err(io::Error::other)? {
                Response::SchemaVersion(version) => Ok(version),
                other => Err(io::Error::other(format!("unexpected response {other:?}"))),
            }
        };
        tokio::time::timeout(self.seed_timeout, exchange)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))?
    }
}

fn encode<T: serde::Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    protocol::encode(msg).map_err(io::Error::other)
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    agent: Arc<Agent>,
) -> io::Result<()> {
    let mut framed = Framed::new(stream, protocol::codec());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match protocol::decode::<Request>(&frame) {
            Ok(request) => {
                debug!("{peer} sent {request:?}");
                agent.respond(request).await
            }
            Err(e) => Response::Error(e.to_string()),
        };
        framed.send(Bytes::from(encode(&response)?)).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => info!("received SIGTERM"),
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received SIGINT");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

async fn agent_main(args: Cli) -> io::Result<()> {
    let agent = Arc::new(Agent::from_args(&args));
    let pid_file = args.pid_file.filter(|p| !p.as_os_str().is_empty());

    // Written before binding, so the pid is on disk by the time a client can connect.
    if let Some(pid_file) = &pid_file {
        fs::write(pid_file, format!("{}\n", std::process::id()))?;
    }
    let listener = match TcpListener::bind((agent.address.as_str(), agent.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            if let Some(pid_file) = &pid_file {
                let _ = fs::remove_file(pid_file);
            }
            return Err(e);
        }
    };
    info!("listening on {}:{}", agent.address, agent.port);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, agent).await {
                        debug!("connection from {peer} closed: {e}");
                    }
                });
            }
        }
    }

    if let Some(pid_file) = &pid_file {
        let _ = fs::remove_file(pid_file);
    }
    info!("shutting down");
    Ok(())
}

/// Run the agent until it is signalled to stop.
pub fn main(args: Cli) -> HandledResult<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .handle_err(|e| eprintln!("Could not launch node runtime: {e}"))?;

    let address = format!("{}:{}", args.address, args.port);
    rt.block_on(agent_main(args))
        .handle_err(|e| eprintln!("Node agent on {address} failed: {e}"))
}
