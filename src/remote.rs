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

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::Decoder;

use futures::sink::SinkExt;

use crate::codec::EnvelopeCodec;
use crate::directory::ServiceCoord;
use crate::tribune::Tribune;

/// Key of a peer in the runtime's registry.
///
/// Dialed peers are known by coordinate and are swept for reconnection;
/// accepted peers are known only by their socket address and are dropped
/// for good when they disconnect.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Coord(ServiceCoord),
    Addr(SocketAddr),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Coord(coord) => write!(f, "{}", coord),
            PeerKey::Addr(addr) => write!(f, "{}", addr),
        }
    }
}

/// Handles into a live connection task.
pub(crate) struct Channel {
    /// Frames queued here are written to the socket in order.
    tx_frames: mpsc::UnboundedSender<Bytes>,

    /// Flipping this drops the connection.
    tx_shutdown: watch::Sender<bool>,
}

/// Local image of a remote service.
///
/// At most one connection exists per peer; `connected` is equivalent to a
/// channel being installed, and flips only on a successful dial or accept
/// and on the connection task winding down.
pub(crate) struct RemoteService {
    /// Coordinate of the remote end, known when this side dialed it.
    pub coord: Option<ServiceCoord>,

    pub addr: SocketAddr,

    channel: Option<Channel>,
}

impl RemoteService {
    pub fn dialed(coord: ServiceCoord, addr: SocketAddr) -> Self {
        Self {
            coord: Some(coord),
            addr,
            channel: None,
        }
    }

    pub fn accepted(addr: SocketAddr) -> Self {
        Self {
            coord: None,
            addr,
            channel: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Queues one frame for the connection task. Failure means the task is
    /// gone and the peer is to be treated as disconnected.
    pub fn push(&self, payload: Bytes) -> bool {
        match &self.channel {
            Some(channel) => channel.tx_frames.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn install(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    pub fn clear(&mut self) {
        self.channel = None;
    }

    pub fn shutdown(&self) {
        if let Some(channel) = &self.channel {
            let _ = channel.tx_shutdown.send(true);
        }
    }
}

/// Wires a fresh socket to `key`: builds the channel pair and spawns the
/// connection task owning the framed stream.
///
/// The task is the single reader and single writer of the socket, so frames
/// go out in queue order and arrive in stream order. Whatever ends the loop
/// is reported back to the runtime as a disconnect of `key`.
pub(crate) fn spawn_connection(tribune: Tribune, key: PeerKey, stream: TcpStream) -> Channel {
    let (tx_shutdown, mut rx_shutdown) = watch::channel(false);
    let (tx_frames, mut rx_frames) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        let mut framed = EnvelopeCodec::new().framed(stream);

        loop {
            select! {
                _ = rx_shutdown.changed() => {
                    break;
                }
                Some(payload) = rx_frames.recv() => {
                    if let Err(e) = framed.send(payload).await {
                        warn!("Push not ended correctly because of {} (peer = {}).", e, key);
                        break;
                    }
                }
                frame = framed.next() => {
                    match frame {
                        Some(Ok(line)) => tribune.process_frame(&key, &line),
                        Some(Err(e)) => {
                            warn!("Closing connection to {}: {}.", key, e);
                            break;
                        }
                        None => {
                            break;
                        }
                    }
                }
            }
        }

        tribune.peer_disconnected(&key);

        // Exiting the task drops the framed stream, closing the socket.
    });

    Channel {
        tx_frames,
        tx_shutdown,
    }
}
