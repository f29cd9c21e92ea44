//! Authentication: credential validation, the persisted login record, and
//! the session state machine that gates every other subsystem.

pub mod credential;
pub mod manager;
pub mod store;

pub use credential::{validate, Auth, AuthMode, Credential, CredentialForm, FieldError, PortInput};
pub use manager::{SessionManager, SessionState};
pub use store::{FileStore, KeyValueStore, MemoryStore};
