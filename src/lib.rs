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

//! Asynchronous RPC runtime for a mesh of contest management services.
//!
//! Every node is a TCP server and a client at the same time: it accepts
//! connections from peers and keeps dialing the roster of services it wants
//! to reach. Method calls travel as line-delimited JSON envelopes over
//! long-lived connections, correlated by a random request id. A cooperative
//! tick loop drives reconnection, periodic tasks, and SIGINT shutdown.

#[macro_use]
extern crate log;

pub mod codec;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod remote;
pub mod tribune;

pub use codec::{Request, Response};
pub use config::Config;
pub use directory::{Directory, ServiceCoord};
pub use dispatch::{HandlerError, MethodFlags};
pub use error::{TribuneError, TribuneResult};
pub use pending::ReplyCallback;
pub use tribune::{ConnectCallback, TimerFunc, Tribune};
