// Tribune - Peer-to-peer asynchronous RPC runtime for contest management services
// Copyright (C) 2026  Tribune Developers

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::TribuneResult;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "Service"))]
    pub service: Service,

    #[serde(rename(deserialize = "Directory"), default)]
    pub directory: Vec<DirectoryEntry>,
}

impl Config {
    /// Reads and parses a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> TribuneResult<Self> {
        Ok(toml::from_slice(&fs::read(path)?)?)
    }
}

#[derive(Deserialize, Debug)]
pub struct Service {
    /// Logical name of this node in the mesh.
    pub name: String,

    /// Shard index distinguishing replicas of the same service.
    #[serde(default)]
    pub shard: u32,
}

/// One roster entry of the service directory.
#[derive(Deserialize, Debug)]
pub struct DirectoryEntry {
    pub name: String,

    #[serde(default)]
    pub shard: u32,

    /// `host:port` the service listens on.
    /// Host names are resolved once when the directory is built.
    pub address: String,
}
