use fedledger_keys::{Sealed, SymmetricKey};
use fedledger_weights::{ModelShape, WeightCollection};
use tracing::debug;

use crate::error::{BlobError, Result};
use crate::store::{ObjectStore, fetch};
use crate::types::{BLOB_VERSION_V1, ContentAddress, SealedBlobV1};

/// Encodes and encrypts a weight collection. AAD = [version].
pub fn seal_weights(weights: &WeightCollection, key: &SymmetricKey) -> Result<SealedBlobV1> {
    let plaintext = wincode::serialize(&weights.0).map_err(|_| BlobError::SerializationFailed)?;

    let sealed = key.seal(&[BLOB_VERSION_V1], &plaintext)?;

    Ok(SealedBlobV1 {
        version: BLOB_VERSION_V1,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
        tag: sealed.tag,
    })
}

/// Decrypts a blob and validates the result against `shape`.
pub fn open_weights(
    blob: &SealedBlobV1,
    key: &SymmetricKey,
    shape: &ModelShape,
) -> Result<WeightCollection> {
    if blob.version != BLOB_VERSION_V1 {
        return Err(BlobError::UnsupportedVersion(blob.version));
    }

    let sealed = Sealed {
        nonce: blob.nonce,
        ciphertext: blob.ciphertext.clone(),
        tag: blob.tag,
    };
    let plaintext = key.open(&[blob.version], &sealed)?;

    let layers: Vec<Vec<f32>> =
        wincode::deserialize(&plaintext).map_err(|_| BlobError::DeserializationFailed)?;
    let weights = WeightCollection::new(layers);
    shape.check(&weights)?;
    Ok(weights)
}

pub fn encode_blob(blob: &SealedBlobV1) -> Result<Vec<u8>> {
    wincode::serialize(blob).map_err(|_| BlobError::SerializationFailed)
}

pub fn decode_blob(bytes: &[u8]) -> Result<SealedBlobV1> {
    wincode::deserialize(bytes).map_err(|_| BlobError::DeserializationFailed)
}

pub async fn store_weights<S: ObjectStore>(
    store: &S,
    weights: &WeightCollection,
    key: &SymmetricKey,
) -> Result<ContentAddress> {
    let bytes = encode_blob(&seal_weights(weights, key)?)?;
    let address = store.put(bytes).await?;
    debug!(%address, shape = %weights.shape(), "stored sealed weights");
    Ok(address)
}

pub async fn load_weights<S: ObjectStore>(
    store: &S,
    address: &ContentAddress,
    key: &SymmetricKey,
    shape: &ModelShape,
) -> Result<WeightCollection> {
    let bytes = fetch(store, address).await?;
    open_weights(&decode_blob(&bytes)?, key, shape)
}

/// Stores bytes as-is (the model architecture travels in the clear).
pub async fn store_cleartext<S: ObjectStore>(store: &S, bytes: Vec<u8>) -> Result<ContentAddress> {
    store.put(bytes).await
}

pub async fn load_cleartext<S: ObjectStore>(store: &S, address: &ContentAddress) -> Result<Vec<u8>> {
    fetch(store, address).await
}
