//! The tile wire format: an Arrow IPC file whose schema metadata describes the tile.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_ipc::reader::FileReader;
use arrow_ipc::writer::FileWriter;
use arrow_schema::Schema;
use arrow_select::concat::concat_batches;
use bytes::Bytes;
use deeptable_error::{DeeptableError, DeeptableResult, deeptable_err};
use itertools::Itertools;

use crate::{Rectangle, TileKey};

pub const EXTENT_KEY: &str = "extent";
pub const CHILDREN_KEY: &str = "children";
pub const SIDECARS_KEY: &str = "sidecars";
pub const TOTAL_POINTS_KEY: &str = "total_points";

/// The field metadata key holding a `[min, max]` JSON domain for a column.
pub const DOMAIN_KEY: &str = "domain";

/// Tile-level metadata carried in the schema metadata of a tile file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileMetadata {
    pub extent: Option<Rectangle>,
    /// `None` when the file does not say; callers treat that as a leaf.
    pub children: Option<Vec<TileKey>>,
    /// Column name to file suffix, for columns stored in `{key}.{suffix}.feather`.
    pub sidecars: BTreeMap<String, String>,
    pub total_points: Option<u64>,
}

fn malformed(key: &str, e: impl std::fmt::Display) -> DeeptableError {
    deeptable_err!(MalformedManifest: "invalid {} metadata: {}", key, e)
}

impl TileMetadata {
    pub fn from_schema_metadata(metadata: &HashMap<String, String>) -> DeeptableResult<Self> {
        let extent = metadata
            .get(EXTENT_KEY)
            .map(|json| serde_json::from_str::<Rectangle>(json).map_err(|e| malformed(EXTENT_KEY, e)))
            .transpose()?;
        let children = metadata
            .get(CHILDREN_KEY)
            .map(|json| {
                serde_json::from_str::<Vec<TileKey>>(json).map_err(|e| malformed(CHILDREN_KEY, e))
            })
            .transpose()?;
        let sidecars = metadata
            .get(SIDECARS_KEY)
            .map(|json| {
                serde_json::from_str::<BTreeMap<String, String>>(json)
                    .map_err(|e| malformed(SIDECARS_KEY, e))
            })
            .transpose()?
            .unwrap_or_default();
        let total_points = metadata
            .get(TOTAL_POINTS_KEY)
            .map(|value| {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| malformed(TOTAL_POINTS_KEY, e))
            })
            .transpose()?;
        Ok(Self {
            extent,
            children,
            sidecars,
            total_points,
        })
    }

    pub fn to_schema_metadata(&self) -> DeeptableResult<HashMap<String, String>> {
        let mut metadata = HashMap::new();
        if let Some(extent) = &self.extent {
            metadata.insert(EXTENT_KEY.to_string(), serde_json::to_string(extent)?);
        }
        if let Some(children) = &self.children {
            metadata.insert(CHILDREN_KEY.to_string(), serde_json::to_string(children)?);
        }
        if !self.sidecars.is_empty() {
            metadata.insert(SIDECARS_KEY.to_string(), serde_json::to_string(&self.sidecars)?);
        }
        if let Some(total_points) = self.total_points {
            metadata.insert(TOTAL_POINTS_KEY.to_string(), total_points.to_string());
        }
        Ok(metadata)
    }
}

/// A decoded tile file.
#[derive(Debug, Clone)]
pub struct DecodedTile {
    pub batch: RecordBatch,
    pub metadata: TileMetadata,
}

/// Serialize a batch as an Arrow IPC file, merging `metadata` into its schema metadata.
pub fn encode_tile(batch: &RecordBatch, metadata: &TileMetadata) -> DeeptableResult<Bytes> {
    let mut schema_metadata = batch.schema().metadata().clone();
    schema_metadata.extend(metadata.to_schema_metadata()?);
    let schema = Arc::new(Schema::new_with_metadata(
        batch.schema().fields().clone(),
        schema_metadata,
    ));
    let batch = batch.clone().with_schema(schema.clone())?;

    let mut writer = FileWriter::try_new(Vec::new(), &schema)?;
    writer.write(&batch)?;
    writer.finish()?;
    Ok(Bytes::from(writer.into_inner()?))
}

/// Parse an Arrow IPC file. Files holding several batches are concatenated into one.
pub fn decode_tile(bytes: Bytes) -> DeeptableResult<DecodedTile> {
    let reader = FileReader::try_new(Cursor::new(bytes), None)?;
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader.try_collect()?;
    let batch = concat_batches(&schema, &batches)?;
    let metadata = TileMetadata::from_schema_metadata(schema.metadata())?;
    Ok(DecodedTile { batch, metadata })
}

#[cfg(test)]
mod tests {
    use arrow_array::{Float32Array, UInt64Array};
    use arrow_schema::{DataType, Field};

    use super::*;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("ix", DataType::UInt64, false),
            Field::new("x", DataType::Float32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(UInt64Array::from(vec![0, 1, 2])),
                Arc::new(Float32Array::from(vec![0.5, 1.5, 2.5])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn metadata_survives_the_wire() {
        let metadata = TileMetadata {
            extent: Some(Rectangle::new([0.0, 1.0], [0.0, 1.0])),
            children: Some(vec![TileKey::try_new(1, 0, 0).unwrap()]),
            sidecars: BTreeMap::from([("density".to_string(), "dense".to_string())]),
            total_points: Some(1000),
        };
        let bytes = encode_tile(&batch(), &metadata).unwrap();
        let decoded = decode_tile(bytes).unwrap();
        assert_eq!(decoded.metadata, metadata);
        assert_eq!(decoded.batch.num_rows(), 3);
        assert_eq!(decoded.batch.num_columns(), 2);
    }

    #[test]
    fn absent_metadata_is_none() {
        let decoded = decode_tile(encode_tile(&batch(), &TileMetadata::default()).unwrap()).unwrap();
        assert_eq!(decoded.metadata, TileMetadata::default());
    }

    #[test]
    fn bad_json_is_malformed() {
        let metadata = HashMap::from([(CHILDREN_KEY.to_string(), "[\"1/0\"]".to_string())]);
        let err = TileMetadata::from_schema_metadata(&metadata).unwrap_err();
        assert!(err.is_malformed_manifest());
    }

    #[test]
    fn garbage_bytes_fail() {
        assert!(decode_tile(Bytes::from_static(b"not arrow")).is_err());
    }
}
