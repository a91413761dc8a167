//! MAIP message format
//!
//! Requests and responses share one text framing. Both directions can be
//! encoded and decoded so the same module serves a client and a peer.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! MAIP1.0 INF inf_access_request
//! USERNAME:admin
//! ACCTOKEN:secret
//! END
//! ```
//!
//! ## Response (with a body)
//! ```text
//! MAIP1.0 3006
//! SPECIAL:0
//! LENGTH:5
//! END
//! Hello
//! ```
//!
//! Keys may repeat; repeated keys keep their insertion order. Values are
//! percent-escaped: `%`, ASCII control characters and every non-ASCII byte
//! become `%XX`, so a value may carry a newline and the head stays ASCII.
//! The body is never escaped: `LENGTH` gives its size in bytes and exactly
//! that many bytes follow `END`.

use std::str::FromStr;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol name at the start of every identification line
pub const PROTOCOL_NAME: &str = "MAIP";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Framing key carrying the body size. Reserved.
pub const LENGTH_KEY: &str = "LENGTH";
/// Line terminating the head of a frame. Reserved.
pub const END_MARKER: &str = "END";

/// Largest body accepted from a peer (20 MiB)
pub const MAX_BODY_LEN: usize = 20 * 1024 * 1024;
/// Largest head (identification and field lines through `END`) accepted
/// from a peer
pub const MAX_HEAD_LEN: usize = 1024 * 1024;

const VALUE_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'%');

/// Operation groups
pub mod group {
    /// Informational and session operations
    pub const INF: &str = "INF";
    /// Per-context execution operations
    pub const EXEC: &str = "EXEC";
}

/// Command names understood by the inference host
pub mod command {
    pub const ACCESS_REQUEST: &str = "inf_access_request";
    pub const DESTROY_SESSION: &str = "inf_destroy_session";
    pub const GET_PROGRAM_MODELS: &str = "inf_get_program_models";
    pub const GET_ACCESSIBLE_MODELS: &str = "inf_get_accessible_models";
    pub const LOAD_MODEL: &str = "inf_load_model";
    pub const UNLOAD_MODEL: &str = "inf_unload_model";
    pub const CREATE_CONTEXT: &str = "inf_create_context";
    pub const GET_CONTEXT_IDS: &str = "inf_get_context_ids";
    pub const GET_CONTEXT_STATUS: &str = "inf_get_context_status";
    pub const CLEAR_CONTEXT_HISTORY: &str = "inf_clear_context_history";
    pub const DESTROY_CONTEXT: &str = "inf_destroy_context";
    pub const CREATE_NEW_USER: &str = "inf_create_new_user";
    pub const DELETE_USER: &str = "inf_delete_user";
    pub const MODIFY_USER_MODEL_ACCESS_LIMIT: &str = "inf_modify_user_model_access_limit";
    pub const MODIFY_USER_MAXIMUM_CONTEXT_LENGTH: &str = "inf_modify_user_maximum_context_length";
    pub const MODIFY_USER_BATCH_SIZE: &str = "inf_modify_user_batch_size";
    pub const MODIFY_USER_PROCESSOR_THREAD_COUNT: &str = "inf_modify_user_processor_thread_count";
    pub const MODIFY_USER_MAX_PROCESSOR_THREAD_COUNT: &str =
        "inf_modify_user_max_processor_thread_count";
    pub const MODIFY_USER_SYSTEM_PROMPT: &str = "inf_modify_user_system_prompt";
    pub const MODIFY_USER_MAKE_SUPERUSER: &str = "inf_modify_user_make_superuser";
    pub const MODIFY_USER_UNMAKE_SUPERUSER: &str = "inf_modify_user_unmake_superuser";
    pub const MODIFY_USER_ACCEPT_MODELS: &str = "inf_modify_user_accept_models";
    pub const CREATE_MODEL_DESCRIPTION: &str = "inf_create_model_description";
    pub const MODIFY_ORIGINAL_MODEL_NAME: &str = "inf_modify_original_model_name";
    pub const MODIFY_CUSTOM_MODEL_NAME: &str = "inf_modify_custom_model_name";
    pub const MODIFY_MODEL_DESCRIPTION: &str = "inf_modify_model_description";
    pub const MODIFY_MODEL_SYSTEM_PROMPT: &str = "inf_modify_model_system_prompt";
    pub const MODIFY_MODEL_MODEL_FILE: &str = "inf_modify_model_model_file";
    pub const MODIFY_MODEL_TAGS: &str = "inf_modify_model_tags";
    pub const MODIFY_MODEL_CONTEXT_LENGTH: &str = "inf_modify_model_context_length";
    pub const SET_INPUT: &str = "exec_set_input";
    pub const EXECUTE_INPUT: &str = "exec_execute_input";
    pub const NEXT: &str = "exec_next";
}

/// Field keys
pub mod key {
    pub const USERNAME: &str = "USERNAME";
    pub const ACCTOKEN: &str = "ACCTOKEN";
    /// Session token
    pub const STOK: &str = "STOK";
    pub const MODEL: &str = "MODEL";
    pub const CTXSIZE: &str = "CTXSIZE";
    pub const CTXID: &str = "CTXID";
    pub const ROLE: &str = "ROLE";
    /// Input handle, repeatable
    pub const MSGID: &str = "MSGID";
    pub const SPECIAL: &str = "SPECIAL";

    /// Access token of a managed user. The handshake spells it `ACCTOKEN`.
    pub const ACCTOK: &str = "ACCTOK";
    pub const ACCLIMIT: &str = "ACCLIMIT";
    pub const CTXLENGTH: &str = "CTXLENGTH";
    pub const BATCH_SET: &str = "BATCH_SET";
    pub const MAX_PROC_THREADS: &str = "MAX_PROC_THREADS";
    pub const PROC_THREADS: &str = "PROC_THREADS";
    /// Repeatable
    pub const AUTHFLAGS: &str = "AUTHFLAGS";
    pub const ISSUPER: &str = "ISSUPER";
    pub const ISSTATIC: &str = "ISSTATIC";
    pub const ORIGINAL: &str = "ORIGINAL";
    pub const CUSTOM: &str = "CUSTOM";
    pub const DESC: &str = "DESC";
    pub const FILE: &str = "FILE";
    /// Repeatable
    pub const TAGS: &str = "TAGS";
    pub const CATEGORY: &str = "CATEGORY";
    pub const IS_EMBEDDING: &str = "IS_EMBEDDING";
    pub const IS_FORCE_PROMPT: &str = "IS_FORCE_PROMPT";
}

/// Status codes with a fixed meaning for this client
pub mod status {
    /// Generic success, also "authenticated"
    pub const SUCCESS: u16 = 2000;
    pub const CONTEXT_ACTIVE: u16 = 2012;
    /// Alternate success reported by some hosts for context creation
    pub const CONTEXT_CREATED: u16 = 2016;
    pub const EXEC_SUCCESS: u16 = 3000;
    /// One more generated token is available
    pub const TOKEN_CONTINUE: u16 = 3006;
}

/// Errors produced while framing or parsing a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("missing END marker")]
    MissingEnd,
    #[error("invalid protocol version: {0}")]
    InvalidVersion(String),
    #[error("invalid identification line: {0}")]
    InvalidIdentification(String),
    #[error("invalid status code: {0}")]
    InvalidStatus(String),
    #[error("invalid token: {0:?}")]
    InvalidToken(String),
    #[error("invalid field key: {0:?}")]
    InvalidKey(String),
    #[error("malformed field line: {0}")]
    MalformedField(String),
    #[error("invalid body length: {0}")]
    InvalidLength(String),
    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("missing field {0}")]
    MissingField(String),
}

/// Conversational role attached to a queued input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire spelling of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// Decoded key/value fields. Each key maps to its values in arrival order;
/// keys are kept in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, Vec<String>)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping earlier values of the same key
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// All values of a key. Empty when the key is absent.
    pub fn values(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// First value of a key
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(String::as_str)
    }

    /// First value of a key, or `MissingField` when absent
    pub fn require(&self, key: &str) -> Result<&str, ProtocolError> {
        self.first(key)
            .ok_or_else(|| ProtocolError::MissingField(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// A request frame: group, command, ordered fields and an optional body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    group: String,
    command: String,
    fields: Vec<(String, String)>,
    body: Option<String>,
}

impl Request {
    pub fn new(group: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            command: command.into(),
            fields: Vec::new(),
            body: None,
        }
    }

    /// Append a field. Setting a key twice adds a second entry.
    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Attach free text sent after the head
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Values of a key in insertion order
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Encode as a single frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        validate_token(&self.group)?;
        validate_token(&self.command)?;
        let ident = format!(
            "{PROTOCOL_NAME}{VERSION_MAJOR}.{VERSION_MINOR} {} {}",
            self.group, self.command
        );
        encode_frame(
            &ident,
            self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            self.body.as_deref(),
        )
    }

    /// Decode a complete request frame
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let frame = parse_frame(raw)?;
        let mut parts = frame.ident.split_whitespace();
        let (Some(version), Some(group), Some(command), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::InvalidIdentification(frame.ident.to_string()));
        };
        parse_version(version)?;

        Ok(Request {
            group: group.to_string(),
            command: command.to_string(),
            fields: frame.fields,
            body: frame.body,
        })
    }
}

/// A response frame: status code, fields and an optional body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status_code: u16,
    fields: Fields,
    body: Option<String>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            fields: Fields::new(),
            body: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push(key, value.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Encode as a single frame. Values of a repeated key are written together.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        if !(1000..=9999).contains(&self.status_code) {
            return Err(ProtocolError::InvalidStatus(self.status_code.to_string()));
        }
        let ident = format!(
            "{PROTOCOL_NAME}{VERSION_MAJOR}.{VERSION_MINOR} {}",
            self.status_code
        );
        let fields = self
            .fields
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k, v.as_str())));
        encode_frame(&ident, fields, self.body.as_deref())
    }

    /// Decode a complete response frame
    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let frame = parse_frame(raw)?;
        let mut parts = frame.ident.split_whitespace();
        let (Some(version), Some(code), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ProtocolError::InvalidIdentification(frame.ident.to_string()));
        };
        parse_version(version)?;
        let status_code = parse_status(code)?;

        let mut fields = Fields::new();
        for (k, v) in frame.fields {
            fields.push(k, v);
        }

        Ok(Response {
            status_code,
            fields,
            body: frame.body,
        })
    }
}

/// Head and body of a frame before it is typed as request or response
struct RawFrame<'a> {
    ident: &'a str,
    fields: Vec<(String, String)>,
    body: Option<String>,
}

fn encode_frame<'a>(
    ident: &str,
    fields: impl Iterator<Item = (&'a str, &'a str)>,
    body: Option<&str>,
) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(64);
    out.push_str(ident);
    out.push('\n');
    for (k, v) in fields {
        validate_key(k)?;
        out.push_str(k);
        out.push(':');
        out.extend(utf8_percent_encode(v, VALUE_ENCODE_SET));
        out.push('\n');
    }
    if let Some(body) = body {
        out.push_str(&format!("{LENGTH_KEY}:{}\n", body.len()));
    }
    out.push_str(END_MARKER);
    out.push('\n');
    if let Some(body) = body {
        out.push_str(body);
    }
    Ok(out)
}

fn parse_frame(raw: &[u8]) -> Result<RawFrame<'_>, ProtocolError> {
    if raw.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let mut pos = 0;
    let mut lines = Vec::new();
    loop {
        let rest = &raw[pos..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            return Err(ProtocolError::MissingEnd);
        };
        let line = std::str::from_utf8(&rest[..nl]).map_err(|_| ProtocolError::InvalidUtf8)?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        pos += nl + 1;
        if line == END_MARKER {
            break;
        }
        lines.push(line);
    }

    let Some((&ident, field_lines)) = lines.split_first() else {
        return Err(ProtocolError::InvalidIdentification(String::new()));
    };

    let mut fields = Vec::with_capacity(field_lines.len());
    let mut body_len = None;
    for line in field_lines {
        let Some((k, v)) = line.split_once(':') else {
            return Err(ProtocolError::MalformedField(line.to_string()));
        };
        if k == LENGTH_KEY {
            if body_len.is_some() {
                return Err(ProtocolError::InvalidLength("duplicate LENGTH".into()));
            }
            body_len = Some(parse_length(v)?);
            continue;
        }
        validate_key(k)?;
        let value = percent_decode_str(v)
            .decode_utf8()
            .map_err(|_| ProtocolError::InvalidUtf8)?;
        fields.push((k.to_string(), value.into_owned()));
    }

    let body = match body_len {
        Some(expected) => {
            let rest = &raw[pos..];
            if rest.len() < expected {
                return Err(ProtocolError::TruncatedBody {
                    expected,
                    actual: rest.len(),
                });
            }
            let text = std::str::from_utf8(&rest[..expected])
                .map_err(|_| ProtocolError::InvalidUtf8)?;
            Some(text.to_string())
        }
        None => None,
    };

    Ok(RawFrame {
        ident,
        fields,
        body,
    })
}

/// Parse the value of a `LENGTH` line
pub(crate) fn parse_length(value: &str) -> Result<usize, ProtocolError> {
    let len: usize = value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidLength(value.to_string()))?;
    if len > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(len));
    }
    Ok(len)
}

fn parse_version(token: &str) -> Result<(u16, u16), ProtocolError> {
    let invalid = || ProtocolError::InvalidVersion(token.to_string());
    let numbers = token.strip_prefix(PROTOCOL_NAME).ok_or_else(invalid)?;
    let (major, minor) = numbers.split_once('.').ok_or_else(invalid)?;
    let parse = |s: &str| {
        if s.is_empty() || s.len() > 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        s.parse::<u16>().map_err(|_| invalid())
    };
    Ok((parse(major)?, parse(minor)?))
}

fn parse_status(token: &str) -> Result<u16, ProtocolError> {
    if token.len() != 4 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidStatus(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| ProtocolError::InvalidStatus(token.to_string()))
}

fn validate_token(token: &str) -> Result<(), ProtocolError> {
    if token.is_empty() || token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProtocolError::InvalidToken(token.to_string()));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), ProtocolError> {
    let mut bytes = key.bytes();
    let valid = bytes.next().is_some_and(|b| b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && key != LENGTH_KEY
        && key != END_MARKER;
    if !valid {
        return Err(ProtocolError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_request_roundtrip() {
        let req = Request::new(group::INF, "access_request")
            .field(key::USERNAME, "admin")
            .field(key::ACCTOKEN, "secret");
        let encoded = req.encode().unwrap();

        let decoded = Request::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.group(), "INF");
        assert_eq!(decoded.command(), "access_request");
        assert_eq!(decoded.values(key::USERNAME), vec!["admin"]);
        assert_eq!(decoded.values(key::ACCTOKEN), vec!["secret"]);
        assert_eq!(decoded, req);
    }

    #[test]
    fn request_wire_layout() {
        let encoded = Request::new(group::EXEC, command::NEXT)
            .field(key::STOK, "tok")
            .field(key::CTXID, 7)
            .encode()
            .unwrap();
        assert_eq!(encoded, "MAIP1.0 EXEC exec_next\nSTOK:tok\nCTXID:7\nEND\n");
    }

    #[test]
    fn repeated_keys_keep_order() {
        let req = Request::new(group::EXEC, command::EXECUTE_INPUT)
            .field(key::MSGID, "12")
            .field(key::CTXID, "1")
            .field(key::MSGID, "4")
            .field(key::MSGID, "12");
        let decoded = Request::decode(req.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded.values(key::MSGID), vec!["12", "4", "12"]);

        let resp = Response::new(status::SUCCESS)
            .field(key::MODEL, "b")
            .field(key::MODEL, "a")
            .field(key::MODEL, "c");
        let decoded = Response::decode(resp.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded.fields().values(key::MODEL), ["b", "a", "c"]);
    }

    #[test]
    fn values_with_delimiters_roundtrip() {
        let value = "multi\nline: 100% \r\ttext";
        let req = Request::new(group::INF, command::LOAD_MODEL).field(key::MODEL, value);
        let encoded = req.encode().unwrap();
        // Head stays one line per field
        assert_eq!(encoded.lines().count(), 3);

        let decoded = Request::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.values(key::MODEL), vec![value]);
    }

    #[test]
    fn non_ascii_values_are_escaped() {
        let req = Request::new(group::INF, command::LOAD_MODEL).field(key::MODEL, "Qwen ü");
        let encoded = req.encode().unwrap();
        assert!(encoded.is_ascii());
        assert!(encoded.contains("MODEL:Qwen %C3%BC\n"));

        let decoded = Request::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.values(key::MODEL), vec!["Qwen ü"]);
    }

    #[test]
    fn body_is_carried_verbatim() {
        let text = "first line\nEND\nMODEL:fake\n%41 stays";
        let req = Request::new(group::EXEC, command::SET_INPUT)
            .field(key::ROLE, Role::User)
            .body(text);
        let encoded = req.encode().unwrap();
        assert!(encoded.ends_with(text));

        let decoded = Request::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.body_text(), Some(text));
        assert!(decoded.values(key::MODEL).is_empty());
        assert_eq!(decoded.values(key::ROLE), vec!["User"]);
    }

    #[test]
    fn response_with_token_body() {
        let raw = "MAIP1.0 3006\nSPECIAL:0\nLENGTH:6\nEND\n world";
        let resp = Response::decode(raw.as_bytes()).unwrap();
        assert_eq!(resp.status_code(), status::TOKEN_CONTINUE);
        assert_eq!(resp.fields().first(key::SPECIAL), Some("0"));
        assert_eq!(resp.body_text(), Some(" world"));
        assert!(!resp.fields().contains(LENGTH_KEY));
    }

    #[test]
    fn multibyte_body_length_counts_bytes() {
        let resp = Response::new(status::TOKEN_CONTINUE).body("héllo ✓");
        let encoded = resp.encode().unwrap();
        assert!(encoded.contains(&format!("LENGTH:{}\n", "héllo ✓".len())));
        assert_eq!(Response::decode(encoded.as_bytes()).unwrap(), resp);
    }

    #[test]
    fn absent_key_is_checked() {
        let resp = Response::decode(b"MAIP1.0 2000\nEND\n").unwrap();
        assert!(resp.fields().values(key::STOK).is_empty());
        assert_eq!(resp.fields().first(key::STOK), None);
        assert_eq!(
            resp.fields().require(key::STOK),
            Err(ProtocolError::MissingField("STOK".into()))
        );
    }

    #[test]
    fn decode_rejects_bad_status() {
        assert!(matches!(
            Response::decode(b"MAIP1.0 OK\nEND\n"),
            Err(ProtocolError::InvalidStatus(_))
        ));
        assert!(matches!(
            Response::decode(b"MAIP1.0 200\nEND\n"),
            Err(ProtocolError::InvalidStatus(_))
        ));
        assert!(matches!(
            Response::decode(b"MAIP1.0\nEND\n"),
            Err(ProtocolError::InvalidIdentification(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_version() {
        assert!(matches!(
            Response::decode(b"HTTP/1.1 2000\nEND\n"),
            Err(ProtocolError::InvalidVersion(_))
        ));
        assert!(matches!(
            Response::decode(b"MAIP1 2000\nEND\n"),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn decode_rejects_incomplete_frames() {
        assert_eq!(Response::decode(b""), Err(ProtocolError::Empty));
        assert_eq!(
            Response::decode(b"MAIP1.0 2000\nSTOK:x\n"),
            Err(ProtocolError::MissingEnd)
        );
        assert_eq!(
            Response::decode(b"MAIP1.0 3006\nLENGTH:10\nEND\nabc"),
            Err(ProtocolError::TruncatedBody {
                expected: 10,
                actual: 3
            })
        );
        assert!(matches!(
            Response::decode(b"MAIP1.0 2000\nnot a field\nEND\n"),
            Err(ProtocolError::MalformedField(_))
        ));
        assert!(matches!(
            Response::decode(b"MAIP1.0 3006\nLENGTH:x\nEND\n"),
            Err(ProtocolError::InvalidLength(_))
        ));
    }

    #[test]
    fn oversized_body_rejected() {
        let raw = format!("MAIP1.0 3006\nLENGTH:{}\nEND\n", MAX_BODY_LEN + 1);
        assert_eq!(
            Response::decode(raw.as_bytes()),
            Err(ProtocolError::BodyTooLarge(MAX_BODY_LEN + 1))
        );
    }

    #[test]
    fn encode_rejects_reserved_and_invalid_keys() {
        for bad in [LENGTH_KEY, END_MARKER, "", "1ABC", "HAS SPACE", "A:B"] {
            let req = Request::new(group::INF, command::LOAD_MODEL).field(bad, "x");
            assert!(matches!(req.encode(), Err(ProtocolError::InvalidKey(_))), "{bad:?}");
        }
    }

    #[test]
    fn encode_rejects_bad_tokens() {
        assert!(Request::new("", command::NEXT).encode().is_err());
        assert!(Request::new(group::EXEC, "exec next").encode().is_err());
        assert!(Response::new(42).encode().is_err());
    }

    #[test]
    fn crlf_lines_accepted() {
        let resp = Response::decode(b"MAIP1.0 2000\r\nSTOK:abc\r\nEND\r\n").unwrap();
        assert_eq!(resp.fields().first(key::STOK), Some("abc"));
    }

    #[test]
    fn role_parsing() {
        assert_eq!("system".parse::<Role>(), Ok(Role::System));
        assert_eq!("User".parse::<Role>(), Ok(Role::User));
        assert_eq!(Role::Assistant.to_string(), "Assistant");
        assert!("narrator".parse::<Role>().is_err());
    }
}
