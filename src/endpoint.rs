//! Connection demultiplexing.
//!
//! The [`Endpoint`] owns the connection table and nothing else owns it.
//! Incoming datagrams are routed by destination CID: first against the CIDs
//! this endpoint minted, then against the client-chosen Initial CIDs that
//! remain routable until the peer adopts ours. A datagram matching neither
//! creates a connection only if it is a well-formed Initial with the
//! supported version; everything else is dropped and counted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::config::ProxyConfig;
use crate::connection::{Connection, Transmit};
use crate::crypto::KeyProvider;
use crate::offload::OffloadDispatcher;
use crate::packet::{self, Header, ParseError};
use crate::stats::{ConnectionCounters, ProxyStats, ValidationCounters};
use crate::{ConnectionId, MIN_INITIAL_SIZE, VERSION};

pub struct Endpoint {
    config: ProxyConfig,
    keys: Arc<dyn KeyProvider>,
    dispatcher: Arc<OffloadDispatcher>,
    /// Connections keyed by the CID we minted for them.
    connections: FxHashMap<ConnectionId, Connection>,
    /// Client-chosen Initial DCID to minted CID.
    initial_routes: FxHashMap<ConnectionId, ConnectionId>,
    /// Whether new connections route transforms to the accelerator.
    accelerate: bool,
    total_connections: u64,
    /// Counters carried over from reaped connections so totals never
    /// regress.
    drained_counters: ConnectionCounters,
    drained_validation: ValidationCounters,
    /// Drop causes for datagrams that never reached a connection.
    unrouted: ValidationCounters,
}

impl Endpoint {
    pub fn new(
        config: ProxyConfig,
        keys: Arc<dyn KeyProvider>,
        dispatcher: Arc<OffloadDispatcher>,
    ) -> Self {
        let accelerate = config.accelerate;
        Self {
            config,
            keys,
            dispatcher,
            connections: FxHashMap::default(),
            initial_routes: FxHashMap::default(),
            accelerate,
            total_connections: 0,
            drained_counters: ConnectionCounters::default(),
            drained_validation: ValidationCounters::default(),
            unrouted: ValidationCounters::default(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<OffloadDispatcher> {
        &self.dispatcher
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.connections.contains_key(cid) || self.initial_routes.contains_key(cid)
    }

    pub fn connection_mut(&mut self, cid: &ConnectionId) -> Option<&mut Connection> {
        let key = match self.initial_routes.get(cid) {
            Some(local) => *local,
            None => *cid,
        };
        self.connections.get_mut(&key)
    }

    /// Route one datagram to its owning connection, creating one when a
    /// well-formed Initial arrives from a new peer.
    pub async fn handle_datagram(&mut self, datagram: Bytes, from: SocketAddr, now: Instant) {
        let Some(dcid) = packet::dst_cid_of(&datagram, self.config.local_cid_len) else {
            self.unrouted.record(ParseError::InvalidPacketSize);
            return;
        };
        let dispatcher = self.dispatcher.clone();
        if let Some(connection) = self.connection_mut(&dcid) {
            connection.on_datagram(datagram, now, &dispatcher).await;
            return;
        }

        // Unknown CID: only a valid Initial may open a connection.
        let packet = match packet::decode(&datagram, self.config.local_cid_len) {
            Ok(packet) => packet,
            Err(kind) => {
                self.unrouted.record(kind);
                debug!(peer = %from, error = %kind, "dropping unroutable datagram");
                return;
            }
        };
        let Header::Initial {
            version,
            dst_cid,
            src_cid,
            ..
        } = packet.header
        else {
            trace!(peer = %from, cid = %dcid, "no connection for datagram");
            self.unrouted.record(ParseError::ConnectionIdMismatch);
            return;
        };
        if version != VERSION {
            self.unrouted.record(ParseError::InvalidVersion);
            debug!(peer = %from, version, "unsupported version in initial");
            return;
        }
        if datagram.len() < MIN_INITIAL_SIZE {
            self.unrouted.record(ParseError::InvalidPacketSize);
            debug!(peer = %from, len = datagram.len(), "initial below minimum size");
            return;
        }

        let local_cid = ConnectionId::random(self.config.local_cid_len);
        let connection = Connection::new(
            from,
            local_cid,
            dst_cid,
            src_cid,
            self.keys.clone(),
            self.accelerate,
            self.config.echo,
            now,
        );
        info!(peer = %from, cid = %local_cid, "new connection");
        self.total_connections += 1;
        self.initial_routes.insert(dst_cid, local_cid);
        self.connections.insert(local_cid, connection);

        if let Some(connection) = self.connections.get_mut(&local_cid) {
            connection.on_datagram(datagram, now, &dispatcher).await;
        }
    }

    /// Periodic maintenance: drive every connection's timers, then reap
    /// the idle and the terminal.
    pub async fn sweep(&mut self, now: Instant) {
        let dispatcher = self.dispatcher.clone();
        for connection in self.connections.values_mut() {
            connection.tick(now, &dispatcher).await;
        }

        let idle_timeout = self.config.idle_timeout;
        let reap: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_terminal() || c.idle_for(now) > idle_timeout)
            .map(|(&cid, _)| cid)
            .collect();
        for cid in reap {
            if let Some(connection) = self.connections.remove(&cid) {
                // Any dispatcher work for this connection completed inside
                // its last on_datagram/tick call; dropping the connection
                // is the whole of the cancellation.
                self.initial_routes.remove(connection.init_cid());
                self.drained_counters.merge(connection.counters());
                self.drained_validation.merge(connection.validation());
                info!(cid = %cid, idle = ?connection.idle_for(now), "connection reaped");
            }
        }
    }

    /// Drain queued outbound datagrams from every connection.
    pub fn drain_transmits(&mut self, out: &mut Vec<Transmit>) {
        for connection in self.connections.values_mut() {
            while let Some(transmit) = connection.poll_transmit() {
                out.push(transmit);
            }
        }
    }

    /// Hand received application data to the sink callback.
    pub fn drain_app_data(&mut self, mut sink: impl FnMut(ConnectionId, crate::StreamId, Bytes)) {
        for (&cid, connection) in self.connections.iter_mut() {
            while let Some((stream, data)) = connection.poll_app_data() {
                sink(cid, stream, data);
            }
        }
    }

    /// Flip accelerator routing for the proxy and all live connections.
    pub fn set_accelerated(&mut self, accelerate: bool) {
        self.accelerate = accelerate;
        for connection in self.connections.values_mut() {
            connection.set_accelerated(accelerate);
        }
    }

    /// Close every connection; used on shutdown.
    pub async fn close_all(&mut self, now: Instant) {
        let dispatcher = self.dispatcher.clone();
        for connection in self.connections.values_mut() {
            connection.close(now, &dispatcher).await;
        }
    }

    /// Aggregate a stats snapshot by traversing the table.
    pub fn stats(&self) -> ProxyStats {
        let mut counters = self.drained_counters;
        let mut validation = self.drained_validation.clone();
        validation.merge(&self.unrouted);
        for connection in self.connections.values() {
            counters.merge(connection.counters());
            validation.merge(connection.validation());
        }
        ProxyStats {
            active_connections: self.connections.len(),
            total_connections: self.total_connections,
            counters,
            validation,
            offload: self.dispatcher.snapshot(),
        }
    }
}
