//! Data models shared by the server and the client.
//!
//! Persisted records map to SQLite rows via `sqlx::FromRow` and travel over
//! the wire as JSON via `serde`.

pub mod api;
pub mod file_kind;
pub mod stored_object;
pub mod uploaded_file;
