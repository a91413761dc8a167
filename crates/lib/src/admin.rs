//! Administrative operations
//!
//! User accounts and model descriptions on the host. Each call is one
//! request/reply in the `INF` group; the host checks that the session's
//! user holds the matching authority and answers with a status.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::{Client, ClientError, status_only};
use crate::protocol::{Request, command, group, key, status};
use crate::result::OperationResult;

/// Account to create with [`Client::create_user`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUser {
    pub username: String,
    /// Left empty, the host generates one
    pub access_token: String,
    pub system_prompt: Option<String>,
    pub model_access_limit: u32,
    pub max_context_length: u32,
    pub batch_size: u32,
    pub max_processor_threads: u32,
    pub processor_threads: u32,
    pub superuser: bool,
    /// Static users cannot be modified afterwards
    pub is_static: bool,
    pub authority_flags: Vec<String>,
}

/// Model metadata registered with [`Client::create_model_description`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDescription {
    pub original_name: String,
    pub custom_name: String,
    pub description: String,
    pub model_file: String,
    pub tags: Vec<String>,
    pub category: String,
    pub embedding: bool,
    /// Always prepend the system prompt, whatever the user sends
    pub force_prompt: bool,
    pub context_length: u32,
    pub system_prompt: Option<String>,
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl Client {
    /// Create a user account. On success the data is the account's access
    /// token as the host stored it.
    pub fn create_user(&self, user: &NewUser) -> Result<OperationResult<String>, ClientError> {
        let resp = self.call(|token| {
            let mut req = Request::new(group::INF, command::CREATE_NEW_USER)
                .field(key::STOK, token)
                .field(key::USERNAME, &user.username)
                .field(key::ACCTOK, &user.access_token)
                .field(key::ACCLIMIT, user.model_access_limit)
                .field(key::CTXLENGTH, user.max_context_length)
                .field(key::BATCH_SET, user.batch_size)
                .field(key::MAX_PROC_THREADS, user.max_processor_threads)
                .field(key::PROC_THREADS, user.processor_threads);
            for auth in &user.authority_flags {
                req = req.field(key::AUTHFLAGS, auth);
            }
            req = req
                .field(key::ISSUPER, flag(user.superuser))
                .field(key::ISSTATIC, flag(user.is_static));
            match &user.system_prompt {
                Some(prompt) => req.body(prompt.as_str()),
                None => req,
            }
        })?;
        let Some(resp) = resp else {
            return Ok(OperationResult::no_result());
        };

        if resp.status_code() != status::SUCCESS {
            return Ok(OperationResult::status(resp.status_code()));
        }
        info!(username = %user.username, "User created");
        let access_token = resp.fields().first(key::ACCTOK).map(str::to_string);
        Ok(OperationResult::new(access_token, resp.status_code()))
    }

    /// Delete a user. Both the name and its access token are required.
    pub fn delete_user(
        &self,
        username: &str,
        access_token: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        if username.is_empty() || access_token.is_empty() {
            return Ok(OperationResult::no_result());
        }
        let result = self.user_command(command::DELETE_USER, username, |req| {
            req.field(key::ACCTOK, access_token)
        })?;
        if result.is(status::SUCCESS) {
            info!(username, "User deleted");
        }
        Ok(result)
    }

    /// How many models the user may hold at once
    pub fn set_user_model_access_limit(
        &self,
        username: &str,
        limit: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_MODEL_ACCESS_LIMIT, username, |req| {
            req.field(key::ACCLIMIT, limit)
        })
    }

    pub fn set_user_max_context_length(
        &self,
        username: &str,
        length: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_MAXIMUM_CONTEXT_LENGTH, username, |req| {
            req.field(key::CTXLENGTH, length)
        })
    }

    pub fn set_user_batch_size(
        &self,
        username: &str,
        batch_size: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_BATCH_SIZE, username, |req| {
            req.field(key::BATCH_SET, batch_size)
        })
    }

    pub fn set_user_processor_threads(
        &self,
        username: &str,
        threads: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_PROCESSOR_THREAD_COUNT, username, |req| {
            req.field(key::PROC_THREADS, threads)
        })
    }

    pub fn set_user_max_processor_threads(
        &self,
        username: &str,
        threads: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_MAX_PROCESSOR_THREAD_COUNT, username, |req| {
            req.field(key::MAX_PROC_THREADS, threads)
        })
    }

    /// Replace the user's default system prompt
    pub fn set_user_system_prompt(
        &self,
        username: &str,
        prompt: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_SYSTEM_PROMPT, username, |req| {
            req.body(prompt)
        })
    }

    pub fn make_superuser(
        &self,
        username: &str,
        access_token: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_MAKE_SUPERUSER, username, |req| {
            req.field(key::ACCTOK, access_token)
        })
    }

    pub fn unmake_superuser(
        &self,
        username: &str,
        access_token: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.user_command(command::MODIFY_USER_UNMAKE_SUPERUSER, username, |req| {
            req.field(key::ACCTOK, access_token)
        })
    }

    /// Grant the user access to `models`.
    ///
    /// The data lists the requested models the host does not know, in the
    /// host's order. It is present whenever the host replied.
    pub fn set_user_accepted_models<S: AsRef<str>>(
        &self,
        username: &str,
        models: &[S],
    ) -> Result<OperationResult<Vec<String>>, ClientError> {
        let resp = self.call(|token| {
            let mut req = Request::new(group::INF, command::MODIFY_USER_ACCEPT_MODELS)
                .field(key::STOK, token)
                .field(key::USERNAME, username);
            for model in models {
                let model: &str = model.as_ref();
                req = req.field(key::MODEL, model);
            }
            req
        })?;
        Ok(match resp {
            Some(resp) => OperationResult::new(
                Some(resp.fields().values(key::MODEL).to_vec()),
                resp.status_code(),
            ),
            None => OperationResult::no_result(),
        })
    }

    /// Register a model file under a description
    pub fn create_model_description(
        &self,
        model: &ModelDescription,
    ) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            let mut req = Request::new(group::INF, command::CREATE_MODEL_DESCRIPTION)
                .field(key::STOK, token)
                .field(key::ORIGINAL, &model.original_name)
                .field(key::CUSTOM, &model.custom_name)
                .field(key::DESC, &model.description)
                .field(key::FILE, &model.model_file);
            for tag in &model.tags {
                req = req.field(key::TAGS, tag);
            }
            req = req
                .field(key::CATEGORY, &model.category)
                .field(key::IS_EMBEDDING, flag(model.embedding))
                .field(key::IS_FORCE_PROMPT, flag(model.force_prompt))
                .field(key::CTXLENGTH, model.context_length);
            match &model.system_prompt {
                Some(prompt) => req.body(prompt.as_str()),
                None => req,
            }
        })?;
        let result = status_only(resp);
        if result.is(status::SUCCESS) {
            info!(model = %model.custom_name, "Model description created");
        }
        Ok(result)
    }

    pub fn set_model_original_name(
        &self,
        model: &str,
        original_name: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_ORIGINAL_MODEL_NAME, model, |req| {
            req.field(key::ORIGINAL, original_name)
        })
    }

    pub fn set_model_custom_name(
        &self,
        model: &str,
        custom_name: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_CUSTOM_MODEL_NAME, model, |req| {
            req.field(key::CUSTOM, custom_name)
        })
    }

    pub fn set_model_description(
        &self,
        model: &str,
        description: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_MODEL_DESCRIPTION, model, |req| {
            req.field(key::DESC, description)
        })
    }

    pub fn set_model_system_prompt(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_MODEL_SYSTEM_PROMPT, model, |req| {
            req.body(prompt)
        })
    }

    /// Point a description at another model file
    pub fn set_model_file(
        &self,
        model: &str,
        model_file: &str,
        category: &str,
        embedding: bool,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_MODEL_MODEL_FILE, model, |req| {
            req.field(key::CATEGORY, category)
                .field(key::IS_EMBEDDING, flag(embedding))
                .field(key::FILE, model_file)
        })
    }

    /// Replace the model's tags
    pub fn set_model_tags<S: AsRef<str>>(
        &self,
        model: &str,
        tags: &[S],
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_MODEL_TAGS, model, |mut req| {
            for tag in tags {
                let tag: &str = tag.as_ref();
                req = req.field(key::TAGS, tag);
            }
            req
        })
    }

    pub fn set_model_context_length(
        &self,
        model: &str,
        length: u32,
    ) -> Result<OperationResult<()>, ClientError> {
        self.model_command(command::MODIFY_MODEL_CONTEXT_LENGTH, model, |req| {
            req.field(key::CTXLENGTH, length)
        })
    }

    fn user_command(
        &self,
        op: &str,
        username: &str,
        fill: impl FnOnce(Request) -> Request,
    ) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            fill(
                Request::new(group::INF, op)
                    .field(key::STOK, token)
                    .field(key::USERNAME, username),
            )
        })?;
        Ok(status_only(resp))
    }

    fn model_command(
        &self,
        op: &str,
        model: &str,
        fill: impl FnOnce(Request) -> Request,
    ) -> Result<OperationResult<()>, ClientError> {
        let resp = self.call(|token| {
            fill(
                Request::new(group::INF, op)
                    .field(key::STOK, token)
                    .field(key::MODEL, model),
            )
        })?;
        Ok(status_only(resp))
    }
}
