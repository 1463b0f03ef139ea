use std::any::Any;
use std::collections::HashMap;

use tokio::net::unix::UCred;
use tracing::debug;

/// Per-connection caller identity and scratch state, available to every
/// handler invoked on that connection.
///
/// The peer credentials are captured once at accept time from the socket
/// and stay fixed for the connection's lifetime. The property bag lets
/// handlers stash typed state for later requests on the same connection.
pub struct SessionContext {
    creds: UCred,
    program: Option<String>,
    properties: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl SessionContext {
    pub fn new(creds: UCred) -> Self {
        Self {
            creds,
            program: None,
            properties: HashMap::new(),
        }
    }

    /// Whether the peer process runs as root.
    pub fn is_privileged(&self) -> bool {
        self.creds.uid() == 0
    }

    /// The peer's process ID, or 0 when the platform did not report one.
    pub fn process_id(&self) -> i32 {
        self.creds.pid().unwrap_or(0)
    }

    /// The peer's numeric user ID, as a string.
    pub fn caller_user_id(&self) -> String {
        self.creds.uid().to_string()
    }

    /// The peer's program name, resolved lazily from the kernel's view of
    /// the peer process. Empty when the process is already gone or the
    /// lookup fails.
    pub fn program(&mut self) -> &str {
        if self.program.is_none() {
            let name = match self.creds.pid() {
                Some(pid) => match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
                    Ok(comm) => comm.trim_end().to_string(),
                    Err(e) => {
                        debug!("Failed to resolve program name for pid {}: {}", pid, e);
                        String::new()
                    }
                },
                None => String::new(),
            };
            self.program = Some(name);
        }
        self.program.as_deref().unwrap_or("")
    }

    /// Stores a handler-defined property, replacing any previous value
    /// under the same key.
    pub fn set_property<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.properties.insert(key.into(), Box::new(value));
    }

    /// Fetches a property by key, as the requested type. Returns `None`
    /// when the key is absent or holds a different type.
    pub fn property<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.properties.get(key)?.downcast_ref::<T>()
    }
}
