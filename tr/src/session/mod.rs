//! Session data: per-task fields the server must get back without storing them
//!
//! Projects mark fields as session-only with the `#` prefix. On the way out a
//! [`SessionDataManager`] strips them from the task; on the way in it puts
//! them back into the result before normalization.
//!
//! - [`TokenSessionManager`]: encrypts the fields into a token carried by the
//!   task itself; needs nothing but the secret key to restore them
//! - [`NodeSessionManager`]: keeps the fields on the node record
//! - [`PhonySessionManager`]: refuses tasks with session fields

mod cipher;

pub use cipher::{NONCE_LEN, SessionCipher, TAG_LEN, generate_secret};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::node::Node;
use crate::task::{ResultData, SESSION_TOKEN_FIELD, Task, is_session_key};

/// Errors from storing or restoring session data
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("session token is truncated")]
    Truncated,

    #[error("session token verification failed")]
    Verification,

    #[error("session token is not a string")]
    MalformedToken,

    #[error("session data is not an object")]
    NotAnObject,

    #[error("session data serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session data encryption failed")]
    Encryption,

    #[error("result carries no session token")]
    MissingToken,

    #[error("secret key is missing or empty")]
    MissingKey,

    #[error("task \"{0}\" carries session fields but no session data manager is configured")]
    Unsupported(String),
}

/// Moves session fields out of outgoing tasks and back into incoming results
pub trait SessionDataManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove the session fields from `task`, keeping them recoverable
    fn store(&self, node: &mut Node, task: &mut Task) -> Result<(), SessionError>;

    /// Merge the session fields of the node's outstanding task into `result`
    fn restore(&self, node: &mut Node, result: &mut ResultData) -> Result<(), SessionError>;
}

/// Drop any session-looking fields a node put into its result
///
/// Session fields can only come from the server; a node must not be able to
/// supply its own.
pub fn strip_session_fields(result: &mut ResultData) -> usize {
    let keys: Vec<String> = result.keys().filter(|key| is_session_key(key)).cloned().collect();
    for key in &keys {
        result.shift_remove(key);
    }
    keys.len()
}

/// Default manager: session fields are a configuration error
#[derive(Debug, Default, Clone, Copy)]
pub struct PhonySessionManager;

impl SessionDataManager for PhonySessionManager {
    fn name(&self) -> &'static str {
        "phony"
    }

    fn store(&self, _node: &mut Node, task: &mut Task) -> Result<(), SessionError> {
        if task.has_session_fields() {
            return Err(SessionError::Unsupported(task.id.clone()));
        }
        Ok(())
    }

    fn restore(&self, _node: &mut Node, _result: &mut ResultData) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Keeps session fields on the node record, persisted through the registry
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSessionManager;

impl SessionDataManager for NodeSessionManager {
    fn name(&self) -> &'static str {
        "node"
    }

    fn store(&self, node: &mut Node, task: &mut Task) -> Result<(), SessionError> {
        // Whatever the previous task left behind belongs to that task only
        node.take_session_data();
        let session = task.take_session_fields();
        if session.is_empty() {
            return Ok(());
        }
        debug!(node_id = %node.id(), task_id = %task.id, fields = session.len(), "Storing session data on node");
        node.set_session_data(session);
        Ok(())
    }

    fn restore(&self, node: &mut Node, result: &mut ResultData) -> Result<(), SessionError> {
        if let Some(session) = node.take_session_data() {
            result.extend(session);
        }
        Ok(())
    }
}

/// Stateless manager: session fields travel inside the task as an encrypted token
#[derive(Debug, Clone)]
pub struct TokenSessionManager {
    cipher: SessionCipher,
}

impl TokenSessionManager {
    pub fn new(cipher: SessionCipher) -> Self {
        Self { cipher }
    }

    pub fn from_secret(secret: &str) -> Result<Self, SessionError> {
        Ok(Self::new(SessionCipher::from_secret(secret)?))
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }
}

impl SessionDataManager for TokenSessionManager {
    fn name(&self) -> &'static str {
        "token"
    }

    fn store(&self, node: &mut Node, task: &mut Task) -> Result<(), SessionError> {
        if !task.has_session_fields() {
            return Ok(());
        }
        let session = task.take_session_fields();
        let token = self.cipher.seal(&session, task.id.as_bytes())?;
        debug!(node_id = %node.id(), task_id = %task.id, fields = session.len(), "Sealed session data into task");
        task.fields.insert(SESSION_TOKEN_FIELD.to_string(), Value::String(token));
        Ok(())
    }

    fn restore(&self, node: &mut Node, result: &mut ResultData) -> Result<(), SessionError> {
        let Some(token) = result.shift_remove(SESSION_TOKEN_FIELD) else {
            return Ok(());
        };
        let Value::String(token) = token else {
            return Err(SessionError::MalformedToken);
        };
        let context = node.task_id().unwrap_or_default().as_bytes().to_vec();
        let session = self.cipher.open(&token, &context)?;
        result.extend(session);
        Ok(())
    }
}
