//! 会话持久化：数据模型、存储、工作区

pub mod model;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;
pub mod store;
pub mod workspace;

pub use model::{Message, MessageRole, NewMessage, Session, SessionFilter, SessionId, StatusUpdate};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteSessionStore;
pub use store::{create_session_store, MemorySessionStore, SessionStore, StoreError, StoreResult};
