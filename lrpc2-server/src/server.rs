use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use lrpc2_proto::{ProtocolError, Result, Value};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Timeouts;
use crate::conn::ServerConnection;
use crate::context::SessionContext;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Option<Vec<Value>>> + Send + 'a>>;

/// A registered command. Returning `None` means the request was an async
/// one and no reply frame is written.
pub trait CommandHandler: Send + Sync {
    fn handle<'a>(&'a self, ctx: &'a mut SessionContext, args: Vec<Value>) -> HandlerFuture<'a>;
}

impl<F> CommandHandler for F
where
    F: for<'a> Fn(&'a mut SessionContext, Vec<Value>) -> HandlerFuture<'a> + Send + Sync,
{
    fn handle<'a>(&'a self, ctx: &'a mut SessionContext, args: Vec<Value>) -> HandlerFuture<'a> {
        self(ctx, args)
    }
}

type HandlerTable = HashMap<u16, Box<dyn CommandHandler>>;

/// The LRPC2 listener: owns the unix socket endpoint, the command
/// handler table, and one task per accepted connection.
///
/// Handlers are registered before `start` and frozen once it runs.
/// Shutdown is three-phased: `stop` cancels the accept loop and tells
/// connections to wind down, `wait` blocks until every connection task
/// has finished.
pub struct SessionServer {
    endpoint: PathBuf,
    timeouts: Timeouts,
    handlers: HandlerTable,
    tracker: TaskTracker,
    cancel: CancellationToken,
    started: bool,
}

impl SessionServer {
    pub fn new(endpoint: impl AsRef<Path>, timeouts: Timeouts) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
            timeouts,
            handlers: HashMap::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            started: false,
        }
    }

    /// Registers a handler for a message ID, replacing any previous one.
    /// Registration is rejected once the server has started.
    pub fn register<H: CommandHandler + 'static>(&mut self, msg_id: u16, handler: H) -> Result<()> {
        if self.started {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "handler table is frozen after start",
            )));
        }
        self.handlers.insert(msg_id, Box::new(handler));
        Ok(())
    }

    /// Registers a batch of boxed handlers. Same freezing rule as
    /// `register`.
    pub fn register_all(
        &mut self,
        handlers: impl IntoIterator<Item = (u16, Box<dyn CommandHandler>)>,
    ) -> Result<()> {
        if self.started {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "handler table is frozen after start",
            )));
        }
        self.handlers.extend(handlers);
        Ok(())
    }

    /// Binds the endpoint and starts accepting connections. A stale
    /// socket file from a previous run is removed first; the fresh socket
    /// is world-accessible so unprivileged clients can connect.
    pub fn start(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.endpoint) {
            Ok(_) => debug!("Removed stale endpoint {}", self.endpoint.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.endpoint)?;
        std::fs::set_permissions(&self.endpoint, std::fs::Permissions::from_mode(0o777))?;

        self.started = true;
        let handlers = Arc::new(std::mem::take(&mut self.handlers));
        let timeouts = self.timeouts;
        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();

        info!("LRPC2 server listening on {}", self.endpoint.display());

        self.tracker.spawn(accept_loop(
            listener, handlers, timeouts, tracker, cancel,
        ));

        Ok(())
    }

    /// Stops accepting connections and tells every connection task to
    /// finish its current request and exit.
    pub fn stop(&self) {
        info!("LRPC2 server stopping");
        self.cancel.cancel();
    }

    /// Waits for the accept loop and all connection tasks to finish.
    /// Call after `stop`.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!("LRPC2 server stopped");
    }
}

async fn accept_loop(
    listener: UnixListener,
    handlers: Arc<HandlerTable>,
    timeouts: Timeouts,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!("Failed to accept LRPC2 connection: {}", e);
                    continue;
                }
            },
        };

        let creds = match stream.peer_cred() {
            Ok(creds) => creds,
            Err(e) => {
                error!("Failed to read peer credentials: {}", e);
                continue;
            }
        };

        debug!(
            uid = creds.uid(),
            pid = creds.pid().unwrap_or(0),
            "LRPC2 connection accepted"
        );

        let handlers = Arc::clone(&handlers);
        let cancel = cancel.clone();
        // The connection gets the tracker too: its handshake task must be
        // drained by wait() like the connection task itself.
        let conn = ServerConnection::new(stream, timeouts, &tracker);
        tracker.spawn(handle_connection(conn, creds, handlers, cancel));
    }
}

async fn handle_connection(
    mut conn: ServerConnection,
    creds: tokio::net::unix::UCred,
    handlers: Arc<HandlerTable>,
    cancel: CancellationToken,
) {
    let mut ctx = SessionContext::new(creds);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = conn.read_request() => request,
        };

        let (header, msg_id, args) = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("LRPC2 connection closed by peer");
                break;
            }
            Err(e) => {
                debug!("LRPC2 connection error: {}", e);
                break;
            }
        };

        let Some(handler) = handlers.get(&msg_id) else {
            // No recovery path for an unknown ID; the peer and the agent
            // disagree on the command set.
            warn!(
                "Closing connection: {}",
                ProtocolError::UnknownMessageId(msg_id)
            );
            break;
        };

        match handler.handle(&mut ctx, args).await {
            Some(results) => {
                if let Err(e) = conn.write_response(&header, msg_id, &results).await {
                    warn!("Failed to write LRPC2 response: {}", e);
                    break;
                }
            }
            // Async request, no reply frame.
            None => {}
        }
    }
}
