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

#[macro_use]
extern crate log;

use std::env::var;

use tribune::{Config, Directory, ServiceCoord, Tribune};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("TRIBUNE_CONFIG").unwrap_or("config.toml".into());

    let config = Config::load(config_loc)?;

    let directory = Directory::from_entries(&config.directory)?;
    let coord = ServiceCoord::new(config.service.name.clone(), config.service.shard);

    let tribune = Tribune::new(coord.clone(), directory).await?;

    // Dial every other roster entry; their calls back to us reuse the same
    // connections either way.
    for entry in &config.directory {
        let peer = ServiceCoord::new(entry.name.clone(), entry.shard);
        if peer != coord {
            tribune.connect_to(peer, None)?;
        }
    }

    if let Err(e) = tribune.up().await {
        error!("Exception not managed, quitting. {}", e);
    }

    Ok(())
}
