pub mod admin;
pub mod client;
pub mod codec;
pub mod context;
pub mod protocol;
pub mod registry;
pub mod result;
#[cfg(test)]
mod testing;

pub use admin::{ModelDescription, NewUser};
pub use client::{Client, ClientError, ClientState, ConnectOptions};
pub use context::{Completion, Context, ContextState, Generation, Token};
pub use protocol::{Fields, ProtocolError, Request, Response, Role};
pub use registry::{ConflictPolicy, ContextRegistry, RegistryError};
pub use result::{NO_RESULT_STATUS, OperationResult};
