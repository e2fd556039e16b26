//! Gzip-compressed JSON payloads stored with snapshots and deltas.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::Result;

pub fn compress_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decompress_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Product};
    use rust_decimal_macros::dec;

    #[test]
    fn compressed_catalog_restores_prices_exactly() {
        let catalog = Catalog {
            products: vec![Product {
                id: "p1".into(),
                name: "Flat White".into(),
                description: Some("Double shot".into()),
                price: dec!(4.35),
                category_id: None,
                modifier_ids: vec![],
                menu_group_ids: vec![],
                is_active: true,
                is_deleted: false,
            }],
            ..Default::default()
        };

        let bytes = compress_json(&catalog).unwrap();
        let restored: Catalog = decompress_json(&bytes).unwrap();
        assert_eq!(restored, catalog);
    }

    #[test]
    fn garbage_input_is_a_codec_error() {
        let result = decompress_json::<Catalog>(b"not gzip");
        assert!(result.is_err());
    }
}
