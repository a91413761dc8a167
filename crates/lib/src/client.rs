use std::io::{self, BufReader};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::context::Context;
use crate::protocol::{ProtocolError, Request, Response, command, group, key, status};
use crate::result::OperationResult;

/// Errors from a protocol exchange that are not plain local failures
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Decode(ProtocolError),
    #[error("cannot encode request: {0}")]
    Encode(ProtocolError),
}

/// Socket options applied when the client connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Longest wait for one reply. `None` blocks forever.
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(120)),
            write_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Lifecycle of a session client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unconnected,
    Connected,
    Authenticated,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

/// Half of a round trip that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Write,
    Read,
}

impl Connection {
    fn open(host: &str, port: u16, options: &ConnectOptions) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(options.read_timeout)?;
                    stream.set_write_timeout(options.write_timeout)?;
                    stream.set_nodelay(true)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    return Ok(Self {
                        reader,
                        writer: stream,
                        read_timeout: options.read_timeout,
                        write_timeout: options.write_timeout,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }

    /// Write one frame and block for exactly one reply
    fn roundtrip(&mut self, frame: &[u8]) -> Result<Response, (Phase, CodecError)> {
        codec::write_frame(&mut self.writer, frame).map_err(|e| (Phase::Write, e))?;
        codec::read_response(&mut self.reader).map_err(|e| (Phase::Read, e))
    }

    fn timeout(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Write => self.write_timeout,
            Phase::Read => self.read_timeout,
        }
        .unwrap_or_default()
    }
}

/// Connection and credentials shared by a client and its contexts
pub(crate) struct Session {
    connection: Option<Connection>,
    token: String,
}

impl Session {
    fn state(&self) -> ClientState {
        match (&self.connection, self.token.is_empty()) {
            (None, _) => ClientState::Unconnected,
            (Some(_), true) => ClientState::Connected,
            (Some(_), false) => ClientState::Authenticated,
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.state() == ClientState::Authenticated
    }

    /// Send a request and wait for its reply.
    ///
    /// `Ok(None)` is a local failure: no connection, or the socket failed.
    /// Any failure after the frame left drops the connection, since the
    /// next reply could no longer be paired with its request.
    fn exchange(&mut self, req: &Request) -> Result<Option<Response>, ClientError> {
        let Some(conn) = self.connection.as_mut() else {
            debug!(command = req.command(), "No connection, skipping request");
            return Ok(None);
        };
        let frame = req.encode().map_err(ClientError::Encode)?;

        match conn.roundtrip(frame.as_bytes()) {
            Ok(resp) => {
                debug!(
                    group = req.group(),
                    command = req.command(),
                    status = resp.status_code(),
                    "Exchange complete"
                );
                Ok(Some(resp))
            }
            Err((phase, CodecError::Io(e))) if is_timeout(&e) => {
                let timeout = conn.timeout(phase);
                warn!(command = req.command(), ?phase, ?timeout, "Timed out, dropping connection");
                self.disconnect();
                Err(ClientError::Timeout(timeout))
            }
            Err((_, CodecError::Io(e))) => {
                warn!(command = req.command(), "Connection failed: {e}");
                self.disconnect();
                Ok(None)
            }
            Err((_, CodecError::Protocol(e))) => {
                warn!(command = req.command(), "Malformed reply: {e}");
                self.disconnect();
                Err(ClientError::Decode(e))
            }
        }
    }

    fn disconnect(&mut self) {
        self.connection = None;
        self.token.clear();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

pub(crate) fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one exchange that needs a session token.
///
/// The request is built from the current token while the lock is held, so
/// a client and its contexts never interleave frames on the socket.
pub(crate) fn authenticated_call(
    session: &Mutex<Session>,
    build: impl FnOnce(&str) -> Request,
) -> Result<Option<Response>, ClientError> {
    let mut session = lock(session);
    if !session.is_authenticated() {
        debug!("No session, skipping request");
        return Ok(None);
    }
    let req = build(&session.token);
    session.exchange(&req)
}

/// Client for a MAIP inference host.
///
/// Holds one connection for its whole life. Every operation is a single
/// blocking request/reply; contexts created here share the connection
/// through a non-owning handle, and dropping the client closes it.
pub struct Client {
    host: String,
    port: u16,
    username: String,
    access_token: String,
    session: Arc<Mutex<Session>>,
}

impl Client {
    /// Connect with default socket options
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self::with_options(host, port, username, access_token, ConnectOptions::default())
    }

    /// Connect immediately. On failure the client stays unconnected and
    /// every operation returns the local-failure sentinel.
    pub fn with_options(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        access_token: impl Into<String>,
        options: ConnectOptions,
    ) -> Self {
        let host = host.into();
        let connection = if host.is_empty() {
            None
        } else {
            match Connection::open(&host, port, &options) {
                Ok(conn) => {
                    info!(%host, port, "Connected to host");
                    Some(conn)
                }
                Err(e) => {
                    warn!(%host, port, "Connection failed: {e}");
                    None
                }
            }
        };

        Self {
            host,
            port,
            username: username.into(),
            access_token: access_token.into(),
            session: Arc::new(Mutex::new(Session {
                connection,
                token: String::new(),
            })),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Current session token, empty until authenticated
    pub fn session_token(&self) -> String {
        lock(&self.session).token.clone()
    }

    pub fn state(&self) -> ClientState {
        lock(&self.session).state()
    }

    pub fn is_connection_active(&self) -> bool {
        self.state() != ClientState::Unconnected
    }

    /// Connected and authenticated
    pub fn is_operation_available(&self) -> bool {
        self.state() == ClientState::Authenticated
    }

    /// Authenticate with the configured credentials.
    ///
    /// On success the reply's `STOK` becomes the session token. Any other
    /// status, or a success reply without `STOK`, leaves the client connected
    /// without a session. Calling this again repeats the handshake.
    pub fn create_client(&self) -> Result<OperationResult<()>, ClientError> {
        let req = Request::new(group::INF, command::ACCESS_REQUEST)
            .field(key::USERNAME, &self.username)
            .field(key::ACCTOKEN, &self.access_token);

        let mut session = lock(&self.session);
        let Some(resp) = session.exchange(&req)? else {
            return Ok(OperationResult::no_result());
        };

        if resp.status_code() == status::SUCCESS {
            let token = match resp.fields().require(key::STOK) {
                Ok(token) => token,
                Err(e) => {
                    session.token.clear();
                    return Err(ClientError::Decode(e));
                }
            };
            session.token = token.to_string();
            info!(username = %self.username, "Authenticated");
        } else {
            session.token.clear();
            warn!(username = %self.username, status = resp.status_code(), "Access denied");
        }
        Ok(OperationResult::status(resp.status_code()))
    }

    /// End the session on the host. The connection stays open.
    pub fn destroy_session(&self) -> Result<OperationResult<()>, ClientError> {
        let mut session = lock(&self.session);
        if !session.is_authenticated() {
            return Ok(OperationResult::no_result());
        }
        let req = Request::new(group::INF, command::DESTROY_SESSION).field(key::STOK, &session.token);
        let Some(resp) = session.exchange(&req)? else {
            return Ok(OperationResult::no_result());
        };
        if resp.status_code() == status::SUCCESS {
            session.token.clear();
            info!(username = %self.username, "Session destroyed");
        }
        Ok(OperationResult::status(resp.status_code()))
    }

    /// Models installed on the host
    pub fn list_models(&self) -> Result<OperationResult<Vec<String>>, ClientError> {
        self.list(command::GET_PROGRAM_MODELS, key::MODEL)
    }

    /// Models this user is allowed to use
    pub fn accessible_models(&self) -> Result<OperationResult<Vec<String>>, ClientError> {
        self.list(command::GET_ACCESSIBLE_MODELS, key::MODEL)
    }

    /// Identifiers of contexts this session owns on the host
    pub fn context_ids(&self) -> Result<OperationResult<Vec<String>>, ClientError> {
        self.list(command::GET_CONTEXT_IDS, key::CTXID)
    }

    pub fn load_model(
        &self,
        model: &str,
        context_size: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::LOAD_MODEL)
                .field(key::STOK, token)
                .field(key::MODEL, model)
                .field(key::CTXSIZE, context_size)
        })?;
        Ok(status_only(resp))
    }

    pub fn unload_model(&self, model: &str) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::UNLOAD_MODEL)
                .field(key::STOK, token)
                .field(key::MODEL, model)
        })?;
        Ok(status_only(resp))
    }

    /// Create a conversation context bound to this client.
    ///
    /// Both 2000 and 2016 count as success.
    pub fn create_context(
        &self,
        model: &str,
        context_size: u32,
    ) -> Result<OperationResult<Context>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::CREATE_CONTEXT)
                .field(key::STOK, token)
                .field(key::MODEL, model)
                .field(key::CTXSIZE, context_size)
        })?;
        let Some(resp) = resp else {
            return Ok(OperationResult::no_result());
        };

        let code = resp.status_code();
        if code != status::SUCCESS && code != status::CONTEXT_CREATED {
            return Ok(OperationResult::status(code));
        }
        let id = resp.fields().require(key::CTXID).map_err(ClientError::Decode)?;
        info!(ctx = id, model, context_size, "Context created");
        let context = Context::new(id.to_string(), self.handle());
        Ok(OperationResult::new(Some(context), code))
    }

    pub(crate) fn handle(&self) -> Weak<Mutex<Session>> {
        Arc::downgrade(&self.session)
    }

    pub(crate) fn call(
        &self,
        build: impl FnOnce(&str) -> Request,
    ) -> Result<Option<Response>, ClientError> {
        authenticated_call(&self.session, build)
    }

    fn list(&self, op: &str, field: &str) -> Result<OperationResult<Vec<String>>, ClientError> {
        let resp = self.call(|token| Request::new(group::INF, op).field(key::STOK, token))?;
        Ok(match resp {
            Some(resp) if resp.status_code() == status::SUCCESS => OperationResult::new(
                Some(resp.fields().values(field).to_vec()),
                resp.status_code(),
            ),
            Some(resp) => OperationResult::status(resp.status_code()),
            None => OperationResult::no_result(),
        })
    }
}

pub(crate) fn status_only(resp: Option<Response>) -> OperationResult<()> {
    resp.map_or_else(OperationResult::no_result, |r| {
        OperationResult::status(r.status_code())
    })
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
