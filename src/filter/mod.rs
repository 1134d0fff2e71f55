//! Transfer filters: reversible byte transforms chained around a frame payload.
//!
//! A chain `[a, b, c]` packs as `a(b(c(payload)))` and unpacks in the
//! opposite order, so the first id is always the outermost envelope.

pub mod checksum;
#[cfg(feature = "zstd")]
pub mod zstd;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FilterError, RegistryError};

pub use checksum::{Sha256Checksum, SHA256_FILTER_ID};
#[cfg(feature = "zstd")]
pub use self::zstd::{ZstdFilter, ZSTD_FILTER_ID};

/// Upper bound on the number of filter ids in one frame.
pub const MAX_CHAIN_LEN: usize = u8::MAX as usize;

pub trait TransferFilter: Send + Sync + 'static {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;
    fn on_pack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError>;
    fn on_unpack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError>;
}

#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<u8, Arc<dyn TransferFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every filter compiled into this build.
    pub fn with_defaults() -> Self {
        Self::with_limit(crate::proto::DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Like [`FilterRegistry::with_defaults`], with expanding filters capped
    /// at `max_message_size` bytes of output.
    #[cfg_attr(not(feature = "zstd"), allow(unused_variables))]
    pub fn with_limit(max_message_size: u32) -> Self {
        let mut registry = Self::new();
        let _ = registry.register(Arc::new(Sha256Checksum));
        #[cfg(feature = "zstd")]
        let _ = registry.register(Arc::new(ZstdFilter::new(3, max_message_size)));
        registry
    }

    pub fn register(&mut self, filter: Arc<dyn TransferFilter>) -> Result<(), RegistryError> {
        if self.filters.contains_key(&filter.id()) {
            return Err(RegistryError::DuplicateFilterId(filter.id()));
        }
        self.filters.insert(filter.id(), filter);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<Arc<dyn TransferFilter>, FilterError> {
        self.filters
            .get(&id)
            .cloned()
            .ok_or(FilterError::UnknownId(id))
    }

    /// Fails fast if any id in `ids` is unknown or the chain is too long.
    pub fn check(&self, ids: &[u8]) -> Result<(), FilterError> {
        if ids.len() > MAX_CHAIN_LEN {
            return Err(FilterError::ChainTooLong(ids.len()));
        }
        for id in ids {
            self.get(*id)?;
        }
        Ok(())
    }

    pub fn pack(&self, ids: &[u8], mut data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.check(ids)?;
        for id in ids.iter().rev() {
            data = self.get(*id)?.on_pack(data)?;
        }
        Ok(data)
    }

    pub fn unpack(&self, ids: &[u8], mut data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        self.check(ids)?;
        for id in ids {
            data = self.get(*id)?.on_unpack(data)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Order-sensitive filter: xors with a key and tags the tail.
    pub(crate) struct TagFilter(pub u8);

    impl TransferFilter for TagFilter {
        fn id(&self) -> u8 {
            self.0
        }

        fn name(&self) -> &'static str {
            "tag"
        }

        fn on_pack(&self, data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
            let mut out: Vec<u8> = data.into_iter().map(|b| b ^ self.0).collect();
            out.push(self.0);
            Ok(out)
        }

        fn on_unpack(&self, mut data: Vec<u8>) -> Result<Vec<u8>, FilterError> {
            match data.pop() {
                Some(tag) if tag == self.0 => Ok(data.into_iter().map(|b| b ^ self.0).collect()),
                _ => Err(FilterError::Failed {
                    name: "tag",
                    reason: format!("missing tag {}", self.0),
                }),
            }
        }
    }

    fn registry() -> FilterRegistry {
        let mut r = FilterRegistry::with_defaults();
        r.register(Arc::new(TagFilter(1))).unwrap();
        r.register(Arc::new(TagFilter(2))).unwrap();
        r
    }

    #[test]
    fn test_first_id_is_outermost() {
        let r = registry();
        let packed = r.pack(&[1, 2], b"abc".to_vec()).unwrap();
        // Outer envelope (1) is applied last, so its tag trails.
        assert_eq!(*packed.last().unwrap(), 1);
        assert_eq!(r.unpack(&[1, 2], packed.clone()).unwrap(), b"abc");
        assert!(r.unpack(&[2, 1], packed).is_err());
    }

    #[test]
    fn test_checksum_detects_tampering_through_chain() {
        let r = registry();
        let mut packed = r.pack(&[SHA256_FILTER_ID, 1], b"payload".to_vec()).unwrap();
        assert_eq!(
            r.unpack(&[SHA256_FILTER_ID, 1], packed.clone()).unwrap(),
            b"payload"
        );
        packed[0] ^= 0xff;
        assert!(r.unpack(&[SHA256_FILTER_ID, 1], packed).is_err());
    }

    #[test]
    fn test_symmetry_for_many_orders() {
        let r = registry();
        let orders: [&[u8]; 5] = [
            &[],
            &[1],
            &[2, 1, SHA256_FILTER_ID],
            &[SHA256_FILTER_ID, 2, 2, 1],
            &[1, 1, 1, 2],
        ];
        for ids in orders {
            let payload: Vec<u8> = (0..=255u8).collect();
            let packed = r.pack(ids, payload.clone()).unwrap();
            assert_eq!(r.unpack(ids, packed).unwrap(), payload, "ids {ids:?}");
        }
    }

    #[test]
    fn test_unknown_id_and_long_chain_rejected() {
        let r = registry();
        assert!(matches!(
            r.pack(&[9], vec![1]),
            Err(FilterError::UnknownId(9))
        ));
        let ids = vec![1u8; MAX_CHAIN_LEN + 1];
        assert!(matches!(
            r.check(&ids),
            Err(FilterError::ChainTooLong(256))
        ));
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn test_limit_caps_zstd_expansion() {
        let r = FilterRegistry::with_limit(512);
        let packed = r.pack(&[ZSTD_FILTER_ID], vec![1u8; 4096]).unwrap();
        assert!(r.unpack(&[ZSTD_FILTER_ID], packed.clone()).is_err());
        assert_eq!(
            FilterRegistry::with_defaults()
                .unpack(&[ZSTD_FILTER_ID], packed)
                .unwrap()
                .len(),
            4096
        );
    }
}
