use std::io::Read;

use super::TransferFilter;
use crate::error::FilterError;
use crate::proto::DEFAULT_MAX_MESSAGE_SIZE;

pub const ZSTD_FILTER_ID: u8 = b'z';

pub struct ZstdFilter {
    level: i32,
    /// Largest payload `on_unpack` will produce.
    max_size: u32,
}

impl ZstdFilter {
    pub fn new(level: i32, max_size: u32) -> Self {
        Self { level, max_size }
    }
}

impl Default for ZstdFilter {
    fn default() -> Self {
        Self::new(3, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn failed(reason: String) -> FilterError {
    FilterError::Failed {
        name: "zstd",
        reason,
    }
}

impl TransferFilter for ZstdFilter {
    fn id(&self) -> u8 {
        ZSTD_FILTER_ID
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn on_pack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        ::zstd::bulk::compress(&data, self.level)
            .map_err(|err| failed(format!("zstd compress failed: {err}")))
    }

    fn on_unpack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        let decoder = ::zstd::stream::read::Decoder::new(data.as_slice())
            .map_err(|err| failed(format!("zstd decompress failed: {err}")))?;
        let mut out = Vec::new();
        decoder
            .take(u64::from(self.max_size) + 1)
            .read_to_end(&mut out)
            .map_err(|err| failed(format!("zstd decompress failed: {err}")))?;
        if out.len() as u64 > u64::from(self.max_size) {
            return Err(failed(format!(
                "decompressed payload exceeds {} bytes",
                self.max_size
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_shrinks_repetitive_payload() {
        let filter = ZstdFilter::default();
        let payload = vec![7u8; 4096];
        let packed = filter.on_pack(payload.clone()).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(filter.on_unpack(packed).unwrap(), payload);
    }

    #[test]
    fn test_unpack_stops_at_size_ceiling() {
        let filter = ZstdFilter::new(3, 1024);
        let packed = filter.on_pack(vec![0u8; 1 << 20]).unwrap();
        assert!(packed.len() < 1024);
        let err = filter.on_unpack(packed).unwrap_err();
        assert!(err.to_string().contains("exceeds 1024"), "{err}");

        let exact = filter.on_pack(vec![0u8; 1024]).unwrap();
        assert_eq!(filter.on_unpack(exact).unwrap().len(), 1024);
    }
}
