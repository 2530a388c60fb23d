//! The UDP ingress loop.
//!
//! One task owns the socket and the endpoint. It suspends in exactly two
//! situations: waiting for the next datagram or timer tick here, and
//! waiting on the offload dispatcher inside the engine. Everything else
//! runs to completion, so per-connection processing is naturally
//! serialized and datagrams are handled in arrival order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use crate::config::{ConfigError, ProxyConfig};
use crate::connection::Transmit;
use crate::crypto::KeyProvider;
use crate::endpoint::Endpoint;
use crate::offload::OffloadDispatcher;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

pub struct Proxy {
    socket: UdpSocket,
    endpoint: Endpoint,
    sweep_interval: Duration,
    stats_interval: Duration,
}

impl Proxy {
    /// Bind the UDP socket and assemble the endpoint. Socket bind is the
    /// only failure that escapes the proxy; everything later is handled at
    /// the connection boundary.
    pub async fn bind(
        config: ProxyConfig,
        keys: Arc<dyn KeyProvider>,
        dispatcher: Arc<OffloadDispatcher>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let socket = UdpSocket::bind(config.listen).await?;
        info!(addr = %socket.local_addr()?, accelerated = dispatcher.accelerated(), "proxy listening");
        let sweep_interval = config.sweep_interval;
        let stats_interval = config.stats_interval;
        Ok(Self {
            socket,
            endpoint: Endpoint::new(config, keys, dispatcher),
            sweep_interval,
            stats_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drive the proxy until ctrl-c.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let mut buf = vec![0u8; 65536];
        let mut transmits: Vec<Transmit> = Vec::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let stats_enabled = !self.stats_interval.is_zero();
        let mut stats = tokio::time::interval(if stats_enabled {
            self.stats_interval
        } else {
            Duration::from_secs(3600)
        });

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    self.endpoint.handle_datagram(datagram, from, Instant::now()).await;
                }
                _ = sweep.tick() => {
                    self.endpoint.sweep(Instant::now()).await;
                }
                _ = stats.tick(), if stats_enabled => {
                    info!("stats\n{}", self.endpoint.stats());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    self.endpoint.close_all(Instant::now()).await;
                    self.flush(&mut transmits).await;
                    return Ok(());
                }
            }

            self.endpoint.drain_app_data(|cid, stream, data| {
                trace!(%cid, %stream, len = data.len(), "application data");
            });
            self.flush(&mut transmits).await;
        }
    }

    async fn flush(&mut self, transmits: &mut Vec<Transmit>) {
        self.endpoint.drain_transmits(transmits);
        for transmit in transmits.drain(..) {
            if let Err(error) = self
                .socket
                .send_to(&transmit.contents, transmit.dest)
                .await
            {
                warn!(dest = %transmit.dest, %error, "send failed");
            }
        }
    }
}
