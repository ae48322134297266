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

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::config::DirectoryEntry;
use crate::error::{TribuneError, TribuneResult};

/// Identifier of a logical service instance.
///
/// Equality is structural, so a coordinate can key maps across the mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceCoord {
    pub name: String,
    pub shard: u32,
}

impl ServiceCoord {
    pub fn new<S: Into<String>>(name: S, shard: u32) -> Self {
        Self {
            name: name.into(),
            shard,
        }
    }
}

impl fmt::Display for ServiceCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.shard)
    }
}

/// Static roster mapping service coordinates to network addresses.
///
/// Host names are resolved while the directory is built, so the event loop
/// never performs a blocking name lookup.
#[derive(Clone, Debug)]
pub struct Directory {
    entries: HashMap<ServiceCoord, SocketAddr>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn from_entries(entries: &[DirectoryEntry]) -> TribuneResult<Self> {
        let mut directory = Self::new();

        for entry in entries {
            directory.insert(
                ServiceCoord::new(entry.name.clone(), entry.shard),
                &entry.address,
            )?;
        }

        Ok(directory)
    }

    pub fn insert(&mut self, coord: ServiceCoord, address: &str) -> TribuneResult<()> {
        let addr = address
            .to_socket_addrs()
            .map_err(|_| TribuneError::InvalidAddress(address.to_string()))?
            .next()
            .ok_or_else(|| TribuneError::InvalidAddress(address.to_string()))?;

        self.entries.insert(coord, addr);

        Ok(())
    }

    /// Registers an already resolved address.
    pub fn insert_addr(&mut self, coord: ServiceCoord, addr: SocketAddr) {
        self.entries.insert(coord, addr);
    }

    pub fn resolve(&self, coord: &ServiceCoord) -> Option<SocketAddr> {
        self.entries.get(coord).copied()
    }
}

mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn coord_display_is_name_slash_shard() {
        assert_eq!(ServiceCoord::new("Worker", 3).to_string(), "Worker/3");
    }

    #[test]
    fn resolves_known_coordinates() {
        let mut directory = Directory::new();
        directory
            .insert(ServiceCoord::new("Worker", 0), "127.0.0.1:29000")
            .unwrap();

        let addr = directory.resolve(&ServiceCoord::new("Worker", 0)).unwrap();
        assert_eq!(addr.port(), 29000);

        assert!(directory.resolve(&ServiceCoord::new("Worker", 1)).is_none());
    }

    #[test]
    fn rejects_malformed_addresses() {
        let mut directory = Directory::new();

        assert!(directory
            .insert(ServiceCoord::new("Worker", 0), "not an address")
            .is_err());
    }
}
