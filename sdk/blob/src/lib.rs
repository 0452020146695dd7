pub mod codec;
pub mod error;
pub mod store;
pub mod types;

pub use codec::{
    decode_blob, encode_blob, load_cleartext, load_weights, open_weights, seal_weights,
    store_cleartext, store_weights,
};
pub use error::{BlobError, Result};
pub use store::{DEFAULT_CHUNK_SIZE, MemoryStore, ObjectStore, fetch};
pub use types::{BLOB_VERSION_V1, ContentAddress, SealedBlobV1, blob_hash};
