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
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::codec::{Request, Response};
use crate::tribune::Tribune;

/// Capability markers attached to a registered method.
#[derive(Clone, Copy, Debug)]
pub struct MethodFlags {
    /// Only exposed methods are invokable remotely.
    pub exposed: bool,

    /// Legacy marker kept for wire compatibility; threaded handlers are
    /// rejected by this runtime.
    pub threaded: bool,
}

impl MethodFlags {
    pub fn exposed() -> Self {
        Self {
            exposed: true,
            threaded: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            exposed: false,
            threaded: false,
        }
    }
}

/// Fault raised by a handler, carried back to the caller as `__error`.
#[derive(Debug)]
pub struct HandlerError {
    kind: &'static str,
    message: String,
}

impl HandlerError {
    pub fn new<M: Into<String>>(kind: &'static str, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Handlers receive the runtime handle and the `__data` object of the call.
/// A handler needing to invoke further RPCs clones the handle into a
/// spawned task; the handler body itself stays synchronous.
pub type Handler =
    Arc<dyn Fn(&Tribune, &Map<String, Value>) -> Result<Value, HandlerError> + Send + Sync>;

struct MethodEntry {
    handler: Handler,
    flags: MethodFlags,
}

/// Table of locally registered methods, consulted for every inbound call.
pub struct MethodRegistry {
    methods: HashMap<String, MethodEntry>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, flags: MethodFlags, handler: F)
    where
        F: Fn(&Tribune, &Map<String, Value>) -> Result<Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                handler: Arc::new(handler),
                flags,
            },
        );
    }

    pub(crate) fn entry(&self, name: &str) -> Option<(Handler, MethodFlags)> {
        self.methods
            .get(name)
            .map(|entry| (entry.handler.clone(), entry.flags))
    }
}

/// Resolves and invokes the method named by `request`, producing the
/// response envelope. Every failure mode answers with `__error` set; the
/// connection itself is never used as the error channel.
pub(crate) fn dispatch(tribune: &Tribune, request: &Request) -> Response {
    let mut response = Response::empty(request.id.clone());

    let (handler, flags) = match tribune.method_entry(&request.method) {
        Some(entry) => entry,
        None => {
            response.error = Some(format!(
                "KeyError: Service has no method {}",
                request.method
            ));
            return response;
        }
    };

    if !flags.exposed {
        response.error = Some(format!(
            "AuthorizationError: Method {} not callable from RPC",
            request.method
        ));
        return response;
    }

    if flags.threaded {
        response.error = Some("Threaded RPC unsupported".to_string());
        return response;
    }

    let data = match &request.data {
        Some(data) => data,
        None => {
            response.error = Some("ValueError: No data present.".to_string());
            return response;
        }
    };

    let arguments = match data.as_object() {
        Some(arguments) => arguments,
        None => {
            response.error = Some(format!(
                "TypeError: arguments of {} must be a JSON object",
                request.method
            ));
            return response;
        }
    };

    match (handler)(tribune, arguments) {
        Ok(result) => response.data = result,
        Err(fault) => response.error = Some(fault.to_string()),
    }

    response
}
