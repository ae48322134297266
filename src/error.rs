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

use thiserror::Error;

use crate::directory::ServiceCoord;

#[derive(Debug, Error)]
pub enum TribuneError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config error {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("No address known for service {0}")]
    UnknownService(ServiceCoord),

    #[error("Invalid net address {0}")]
    InvalidAddress(String),
}

pub type TribuneResult<T> = std::result::Result<T, TribuneError>;
