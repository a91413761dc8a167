//! Conversation contexts
//!
//! A context is created by [`Client::create_context`](crate::Client::create_context)
//! and addresses conversational state held by the host. Each round of
//! generation queues inputs, executes them, then pulls tokens one reply at a
//! time until the host reports a terminal status:
//!
//! ```text
//! Created -> InputsQueued -> Executing -> Streaming -> Idle -> InputsQueued ...
//! ```

use std::sync::{Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{ClientError, Session, authenticated_call, lock, status_only};
use crate::protocol::{Request, Response, Role, command, group, key, status};
use crate::result::{NO_RESULT_STATUS, OperationResult};

/// Where a context is in its generation round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    InputsQueued,
    Executing,
    Streaming,
    Idle,
}

/// One unit of streamed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    /// Control or marker token rather than content
    pub special: bool,
}

/// Handle to a conversation context on the host.
///
/// Holds a non-owning reference to the client's connection. Once the client
/// is dropped or loses its session, every call is a local failure.
#[derive(Debug)]
pub struct Context {
    id: String,
    owner: Weak<Mutex<Session>>,
    state: ContextState,
}

impl Context {
    pub(crate) fn new(id: String, owner: Weak<Mutex<Session>>) -> Self {
        Self {
            id,
            owner,
            state: ContextState::Created,
        }
    }

    /// Host-issued context identifier (`CTXID`)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Whether the owning client is still connected and authenticated
    pub fn is_owner_available(&self) -> bool {
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        lock(&owner).is_authenticated()
    }

    /// Queue one input. On success the data is the host's `MSGID` handle;
    /// the caller keeps the handles and passes them to [`execute_input`].
    ///
    /// [`execute_input`]: Context::execute_input
    pub fn set_input(
        &mut self,
        role: Role,
        text: &str,
    ) -> Result<OperationResult<String>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::EXEC, command::SET_INPUT)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id)
                .field(key::ROLE, role)
                .body(text)
        })?;
        let Some(resp) = resp else {
            return Ok(OperationResult::no_result());
        };

        if resp.status_code() != status::SUCCESS {
            return Ok(OperationResult::status(resp.status_code()));
        }
        let msg_id = resp.fields().require(key::MSGID).map_err(ClientError::Decode)?;
        debug!(ctx = %self.id, %role, msg_id, "Input queued");
        self.state = ContextState::InputsQueued;
        Ok(OperationResult::new(
            Some(msg_id.to_string()),
            resp.status_code(),
        ))
    }

    /// Execute queued inputs. One `MSGID` field is sent per handle, in the
    /// given order, duplicates included.
    pub fn execute_input<S: AsRef<str>>(
        &mut self,
        message_ids: &[S],
    ) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            let mut req = Request::new(group::EXEC, command::EXECUTE_INPUT)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id);
            for id in message_ids {
                let id: &str = id.as_ref();
                req = req.field(key::MSGID, id);
            }
            req
        })?;

        if let Some(resp) = &resp {
            let code = resp.status_code();
            if code == status::SUCCESS || code == status::EXEC_SUCCESS {
                info!(ctx = %self.id, inputs = message_ids.len(), "Generation started");
                self.state = ContextState::Executing;
            }
        }
        Ok(status_only(resp))
    }

    /// Pull the next unit of output.
    ///
    /// A continuation (3006) carries a [`Token`]. Any other status ends the
    /// round and carries no data.
    pub fn get_next(&mut self) -> Result<OperationResult<Token>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::EXEC, command::NEXT)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id)
        })?;
        let Some(resp) = resp else {
            return Ok(OperationResult::no_result());
        };

        if resp.status_code() == status::TOKEN_CONTINUE {
            self.state = ContextState::Streaming;
            return Ok(OperationResult::new(
                Some(token_from(&resp)),
                resp.status_code(),
            ));
        }

        debug!(ctx = %self.id, status = resp.status_code(), "Generation finished");
        self.state = ContextState::Idle;
        Ok(OperationResult::status(resp.status_code()))
    }

    /// Iterator pulling tokens until the round ends
    pub fn stream(&mut self) -> Generation<'_> {
        Generation {
            context: self,
            finish_status: None,
        }
    }

    /// Out-of-band status probe for this context
    pub fn get_context_status(&self) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::GET_CONTEXT_STATUS)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id)
        })?;
        Ok(status_only(resp))
    }

    /// Whether the host reports this context as active (2012)
    pub fn is_context_active(&self) -> Result<bool, ClientError> {
        Ok(self.get_context_status()?.is(status::CONTEXT_ACTIVE))
    }

    /// Drop the conversation history on the host, keeping the context
    pub fn clear_history(&mut self) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::CLEAR_CONTEXT_HISTORY)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id)
        })?;
        if resp
            .as_ref()
            .is_some_and(|r| r.status_code() == status::SUCCESS)
        {
            self.state = ContextState::Created;
        }
        Ok(status_only(resp))
    }

    /// Destroy the context on the host. The handle is consumed either way.
    pub fn destroy(self) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            Request::new(group::INF, command::DESTROY_CONTEXT)
                .field(key::STOK, token)
                .field(key::CTXID, &self.id)
        })?;
        if resp
            .as_ref()
            .is_some_and(|r| r.status_code() == status::SUCCESS)
        {
            info!(ctx = %self.id, "Context destroyed");
        }
        Ok(status_only(resp))
    }

    fn call(&self, build: impl FnOnce(&str) -> Request) -> Result<Option<Response>, ClientError> {
        let Some(owner) = self.owner.upgrade() else {
            debug!(ctx = %self.id, "Owning client is gone");
            return Ok(None);
        };
        authenticated_call(&owner, build)
    }
}

fn token_from(resp: &Response) -> Token {
    Token {
        token: resp.body_text().unwrap_or_default().to_string(),
        special: resp.fields().first(key::SPECIAL) == Some("1"),
    }
}

/// Text gathered from one generation round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub text: String,
    /// Terminal status, or the local-failure sentinel
    pub status_code: u16,
}

/// Pull loop over [`Context::get_next`].
///
/// Yields every continuation token in order and stops at the first
/// terminal status, which [`finish_status`](Generation::finish_status)
/// then reports. An error is yielded once and ends the iteration.
pub struct Generation<'a> {
    context: &'a mut Context,
    finish_status: Option<u16>,
}

impl Generation<'_> {
    /// Status that ended the round, once it has ended
    pub fn finish_status(&self) -> Option<u16> {
        self.finish_status
    }

    /// Drain the round, concatenating every token
    pub fn collect_text(mut self) -> Result<Completion, ClientError> {
        let mut text = String::new();
        for token in self.by_ref() {
            text.push_str(&token?.token);
        }
        Ok(Completion {
            text,
            status_code: self.finish_status.unwrap_or(NO_RESULT_STATUS),
        })
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<Token, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finish_status.is_some() {
            return None;
        }
        match self.context.get_next() {
            Ok(result) if result.is(status::TOKEN_CONTINUE) => result.data.map(Ok),
            Ok(result) => {
                self.finish_status = Some(result.status_code);
                None
            }
            Err(e) => {
                self.finish_status = Some(NO_RESULT_STATUS);
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Step, authenticated_client};

    const FINISHED: u16 = 3007;

    fn continue_with(text: &str, special: bool) -> Step {
        Step::Reply(
            Response::new(status::TOKEN_CONTINUE)
                .field(key::SPECIAL, u8::from(special))
                .body(text),
        )
    }

    fn finished() -> Step {
        Step::Reply(Response::new(FINISHED).field(key::SPECIAL, 1))
    }

    fn context_created(id: &str) -> Step {
        Step::Reply(Response::new(status::SUCCESS).field(key::CTXID, id))
    }

    #[test]
    fn set_input_returns_message_handle() {
        let (host, client) = authenticated_client(vec![
            context_created("5"),
            Step::Reply(Response::new(status::SUCCESS).field(key::MSGID, "41")),
        ]);
        let mut ctx = client.create_context("demo-model", 2048).unwrap().data.unwrap();
        assert_eq!(ctx.state(), ContextState::Created);

        let text = "You are a helpful assistant.\nAnswer briefly: 100%.";
        let result = ctx.set_input(Role::System, text).unwrap();
        assert_eq!(result.data.as_deref(), Some("41"));
        assert_eq!(ctx.state(), ContextState::InputsQueued);

        drop(client);
        let received = host.finish();
        let req = &received[2];
        assert_eq!(req.group(), group::EXEC);
        assert_eq!(req.command(), command::SET_INPUT);
        assert_eq!(req.values(key::STOK), vec!["tok"]);
        assert_eq!(req.values(key::CTXID), vec!["5"]);
        assert_eq!(req.values(key::ROLE), vec!["System"]);
        assert_eq!(req.body_text(), Some(text));
    }

    #[test]
    fn set_input_rejection_keeps_state() {
        let (host, client) =
            authenticated_client(vec![context_created("5"), Step::Reply(Response::new(2020))]);
        let mut ctx = client.create_context("m", 512).unwrap().data.unwrap();

        let result = ctx.set_input(Role::User, "hi").unwrap();
        assert!(result.is(2020));
        assert!(result.data.is_none());
        assert_eq!(ctx.state(), ContextState::Created);

        drop(client);
        host.finish();
    }

    #[test]
    fn execute_input_preserves_handle_order() {
        let (host, client) = authenticated_client(vec![
            context_created("5"),
            Step::Reply(Response::new(status::EXEC_SUCCESS)),
        ]);
        let mut ctx = client.create_context("m", 512).unwrap().data.unwrap();

        let result = ctx.execute_input(&["12", "4", "12"]).unwrap();
        assert!(result.is(status::EXEC_SUCCESS));
        assert_eq!(ctx.state(), ContextState::Executing);

        drop(client);
        let received = host.finish();
        assert_eq!(received[2].command(), command::EXECUTE_INPUT);
        assert_eq!(received[2].values(key::MSGID), vec!["12", "4", "12"]);
    }

    #[test]
    fn pull_loop_reproduces_generated_text() {
        let (host, client) = authenticated_client(vec![
            context_created("9"),
            Step::Reply(Response::new(status::SUCCESS).field(key::MSGID, "1")),
            Step::Reply(Response::new(status::SUCCESS).field(key::MSGID, "2")),
            Step::Reply(Response::new(status::SUCCESS)),
            continue_with("Hello", false),
            continue_with(",", false),
            continue_with(" world", false),
            continue_with("<|eot_id|>", true),
            finished(),
        ]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();

        let mut ids = Vec::new();
        ids.push(ctx.set_input(Role::System, "Your name is Joe.").unwrap().data.unwrap());
        ids.push(ctx.set_input(Role::User, "Say hello").unwrap().data.unwrap());
        assert!(ctx.execute_input(&ids).unwrap().is(status::SUCCESS));

        let mut text = String::new();
        let mut specials = Vec::new();
        let mut next = ctx.get_next().unwrap();
        while next.is(status::TOKEN_CONTINUE) {
            assert_eq!(ctx.state(), ContextState::Streaming);
            let token = next.data.unwrap();
            text.push_str(&token.token);
            specials.push(token.special);
            next = ctx.get_next().unwrap();
        }
        assert!(next.is(FINISHED));
        assert!(next.data.is_none());
        assert_eq!(ctx.state(), ContextState::Idle);
        assert_eq!(text, "Hello, world<|eot_id|>");
        assert_eq!(specials, vec![false, false, false, true]);

        drop(client);
        let received = host.finish();
        assert_eq!(received[4].command(), command::EXECUTE_INPUT);
        assert_eq!(received[4].values(key::MSGID), vec!["1", "2"]);
        assert_eq!(received.iter().filter(|r| r.command() == command::NEXT).count(), 5);
    }

    #[test]
    fn missing_special_flag_means_content() {
        let (host, client) = authenticated_client(vec![
            context_created("9"),
            Step::Reply(Response::new(status::TOKEN_CONTINUE).body("abc")),
        ]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();
        let token = ctx.get_next().unwrap().data.unwrap();
        assert_eq!(
            token,
            Token {
                token: "abc".into(),
                special: false
            }
        );
        drop(client);
        host.finish();
    }

    #[test]
    fn stream_collects_until_terminal() {
        let (host, client) = authenticated_client(vec![
            context_created("9"),
            continue_with("The", false),
            continue_with(" end", false),
            finished(),
        ]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();

        let completion = ctx.stream().collect_text().unwrap();
        assert_eq!(completion.text, "The end");
        assert_eq!(completion.status_code, FINISHED);
        assert_eq!(ctx.state(), ContextState::Idle);

        drop(client);
        host.finish();
    }

    #[test]
    fn stream_stops_after_terminal() {
        let (host, client) = authenticated_client(vec![context_created("9"), finished()]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();

        let mut generation = ctx.stream();
        assert!(generation.next().is_none());
        assert_eq!(generation.finish_status(), Some(FINISHED));
        assert!(generation.next().is_none());

        drop(client);
        assert_eq!(host.finish().len(), 3);
    }

    #[test]
    fn stream_surfaces_timeout_once() {
        let (host, client) = authenticated_client(vec![context_created("9"), Step::Silent]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();

        let mut generation = ctx.stream();
        assert!(matches!(generation.next(), Some(Err(ClientError::Timeout(_)))));
        assert!(generation.next().is_none());
        assert_eq!(generation.finish_status(), Some(NO_RESULT_STATUS));

        drop(client);
        host.finish();
    }

    #[test]
    fn context_active_probe() {
        let (host, client) = authenticated_client(vec![
            context_created("3"),
            Step::Reply(Response::new(status::CONTEXT_ACTIVE)),
            Step::Reply(Response::new(2013)),
        ]);
        let ctx = client.create_context("m", 2048).unwrap().data.unwrap();

        assert!(ctx.is_context_active().unwrap());
        assert!(!ctx.is_context_active().unwrap());

        drop(client);
        let received = host.finish();
        assert_eq!(received[2].command(), command::GET_CONTEXT_STATUS);
        assert_eq!(received[2].values(key::CTXID), vec!["3"]);
    }

    #[test]
    fn released_owner_fails_locally() {
        let (host, client) = authenticated_client(vec![context_created("3")]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();
        assert!(ctx.is_owner_available());

        drop(client);
        assert!(!ctx.is_owner_available());
        assert!(ctx.set_input(Role::User, "hi").unwrap().is_local_failure());
        assert!(ctx.get_next().unwrap().is_local_failure());
        assert!(!ctx.is_context_active().unwrap());
        assert_eq!(ctx.state(), ContextState::Created);

        assert_eq!(host.finish().len(), 2);
    }

    #[test]
    fn lost_session_fails_locally() {
        let (host, client) = authenticated_client(vec![
            context_created("3"),
            Step::Reply(Response::new(status::SUCCESS)),
        ]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();
        assert!(client.destroy_session().unwrap().is(status::SUCCESS));

        assert!(!ctx.is_owner_available());
        assert!(ctx.execute_input(&["1"]).unwrap().is_local_failure());

        drop(client);
        assert_eq!(host.finish().len(), 3);
    }

    #[test]
    fn clear_history_and_destroy() {
        let (host, client) = authenticated_client(vec![
            context_created("3"),
            Step::Reply(Response::new(status::SUCCESS).field(key::MSGID, "1")),
            Step::Reply(Response::new(status::SUCCESS)),
            Step::Reply(Response::new(status::SUCCESS)),
        ]);
        let mut ctx = client.create_context("m", 2048).unwrap().data.unwrap();
        ctx.set_input(Role::User, "hi").unwrap();

        assert!(ctx.clear_history().unwrap().is(status::SUCCESS));
        assert_eq!(ctx.state(), ContextState::Created);
        assert!(ctx.destroy().unwrap().is(status::SUCCESS));

        drop(client);
        let received = host.finish();
        assert_eq!(received[3].command(), command::CLEAR_CONTEXT_HISTORY);
        assert_eq!(received[4].command(), command::DESTROY_CONTEXT);
        assert_eq!(received[4].values(key::CTXID), vec!["3"]);
    }
}
