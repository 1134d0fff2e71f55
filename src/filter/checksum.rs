use sha2::{Digest, Sha256};

use super::TransferFilter;
use crate::error::FilterError;

pub const SHA256_FILTER_ID: u8 = b'h';

const DIGEST_LEN: usize = 32;

/// Appends a SHA-256 digest of the payload and verifies it on the way in.
pub struct Sha256Checksum;

impl TransferFilter for Sha256Checksum {
    fn id(&self) -> u8 {
        SHA256_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "sha256"
    }

    fn on_pack(&self, mut data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        let digest = Sha256::digest(&data);
        data.extend_from_slice(&digest);
        Ok(data)
    }

    fn on_unpack(&self, mut data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        if data.len() < DIGEST_LEN {
            return Err(FilterError::Failed {
                name: "sha256",
                reason: format!("payload of {} bytes has no digest", data.len()),
            });
        }
        let split = data.len() - DIGEST_LEN;
        let expected = Sha256::digest(&data[..split]);
        if expected.as_slice() != &data[split..] {
            return Err(FilterError::Failed {
                name: "sha256",
                reason: "checksum mismatch".into(),
            });
        }
        data.truncate(split);
        Ok(data)
    }
}
