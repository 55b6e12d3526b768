#![warn(missing_docs)]

//! dsrepl core: per-attribute version stamps, the shared conflict comparator,
//! per-object metadata vectors, up-to-dateness vectors and their wire blobs.

pub mod conflict;
pub mod error;
pub mod metadata;
pub mod stamp;
pub mod types;
pub mod udv;
pub mod wire;

pub use conflict::is_newer;
pub use error::CoreError;
pub use metadata::{MergeOutcome, ObjectMetadata};
pub use stamp::AttributeStamp;
pub use types::{AttributeId, ObjectGuid, ReplicaId, Timestamp, Usn};
pub use udv::{Cursor, UpToDateVector};
