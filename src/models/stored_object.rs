//! Provider-side view of an object held by a storage gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StoredObject {
    /// Opaque provider identifier (`{folder}/{uuid}{.ext}`).
    pub public_id: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum, hex encoded.
    pub etag: Option<String>,

    /// Timestamp when the payload was last written.
    pub modified: DateTime<Utc>,
}
