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

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::Value;

use crate::remote::PeerKey;

/// Correlation ids are 16 ASCII letters and digits.
const ID_LENGTH: usize = 16;

/// Invoked once with the reply: `(data, error)`. A set error means the data
/// is unusable. Context the caller needs travels in the closure's captures.
pub type ReplyCallback = Box<dyn FnOnce(Option<Value>, Option<String>) + Send>;

/// An outbound call awaiting its response, bound to the peer the request
/// went out on.
pub struct PendingRequest {
    pub peer: PeerKey,
    pub callback: Option<ReplyCallback>,
}

/// Correlation table of outstanding outbound calls.
///
/// Every terminal path removes the entry exactly once: the matching
/// response arrives, the owning peer's transport fails, or the service
/// exits and abandons the table. Entries are never overwritten; callers
/// take them out and fire the callback outside the table lock.
pub struct PendingRequests {
    requests: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }

    /// Registers a request under a freshly generated id and returns the id.
    ///
    /// A colliding id is re-rolled rather than allowed to overwrite the
    /// pending entry it collides with.
    pub fn insert(&mut self, peer: PeerKey, callback: Option<ReplyCallback>) -> String {
        let mut id = generate_id();
        while self.requests.contains_key(&id) {
            id = generate_id();
        }

        self.requests
            .insert(id.clone(), PendingRequest { peer, callback });

        id
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingRequest> {
        self.requests.remove(id)
    }

    /// Takes out every request bound to `peer`, returning their callbacks.
    pub fn take_peer(&mut self, peer: &PeerKey) -> Vec<ReplyCallback> {
        let ids: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, request)| &request.peer == peer)
            .map(|(id, _)| id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.requests.remove(id))
            .filter_map(|request| request.callback)
            .collect()
    }

    /// Drops every entry without firing a callback.
    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}
