//! Tree manifests: the index ranges, extents and child lists of a whole tree, known before any
//! tile is downloaded.
//!
//! A manifest is stored as a flat table with one row per tile and the columns `key`, `nPoints`,
//! `min_ix`, `max_ix` and `extent` (a JSON rectangle). The nested tree is recovered by looking up
//! the four computed children of every key.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{Array, ArrayRef, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use deeptable_error::{DeeptableResult, deeptable_bail, deeptable_err};
use serde::{Deserialize, Serialize};

use crate::coerce::ix_values;
use crate::{Rectangle, TileKey};

pub const KEY_COLUMN: &str = "key";
pub const N_POINTS_COLUMN: &str = "nPoints";
pub const MIN_IX_COLUMN: &str = "min_ix";
pub const MAX_IX_COLUMN: &str = "max_ix";
pub const EXTENT_COLUMN: &str = "extent";

/// One row of a flat manifest table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub key: TileKey,
    #[serde(rename = "nPoints")]
    pub n_points: u64,
    pub min_ix: u64,
    pub max_ix: u64,
    pub extent: Rectangle,
}

/// The metadata of one tile and, recursively, of its subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileManifest {
    pub key: TileKey,
    pub n_points: u64,
    pub min_ix: u64,
    pub max_ix: u64,
    pub extent: Rectangle,
    /// `Some(vec![])` for a known leaf, `None` when the children are not described.
    pub children: Option<Vec<TileManifest>>,
}

impl TileManifest {
    /// Expand a flat manifest table.
    pub fn from_table(batch: &RecordBatch) -> DeeptableResult<Self> {
        Self::from_rows(manifest_rows(batch)?)
    }

    /// Assemble the tree rooted at `0/0/0` from flat rows.
    ///
    /// Rows that cannot be reached from the root are ignored.
    pub fn from_rows(rows: impl IntoIterator<Item = ManifestRow>) -> DeeptableResult<Self> {
        let mut by_key = HashMap::new();
        for row in rows {
            if by_key.insert(row.key, row).is_some() {
                deeptable_bail!(MalformedManifest: "tile {} appears twice in the manifest", row.key);
            }
        }
        let total = by_key.len();
        let Some(root) = by_key.remove(&TileKey::ROOT) else {
            deeptable_bail!(MalformedManifest: "the manifest has no root tile");
        };
        let manifest = Self::assemble(root, &mut by_key);
        if !by_key.is_empty() {
            log::warn!(
                "{} of {} manifest rows are not reachable from the root",
                by_key.len(),
                total
            );
        }
        Ok(manifest)
    }

    fn assemble(row: ManifestRow, rows: &mut HashMap<TileKey, ManifestRow>) -> Self {
        let child_rows: Vec<ManifestRow> = row
            .key
            .children()
            .into_iter()
            .filter_map(|key| rows.remove(&key))
            .collect();
        let children = child_rows
            .into_iter()
            .map(|child| Self::assemble(child, rows))
            .collect();
        Self {
            key: row.key,
            n_points: row.n_points,
            min_ix: row.min_ix,
            max_ix: row.max_ix,
            extent: row.extent,
            children: Some(children),
        }
    }

    pub fn row(&self) -> ManifestRow {
        ManifestRow {
            key: self.key,
            n_points: self.n_points,
            min_ix: self.min_ix,
            max_ix: self.max_ix,
            extent: self.extent,
        }
    }

    /// Every node of the tree, parents before their children.
    pub fn iter(&self) -> impl Iterator<Item = &TileManifest> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            if let Some(children) = &node.children {
                stack.extend(children.iter().rev());
            }
            Some(node)
        })
    }

    pub fn find(&self, key: &TileKey) -> Option<&TileManifest> {
        self.iter().find(|node| node.key == *key)
    }

    pub fn to_rows(&self) -> Vec<ManifestRow> {
        self.iter().map(TileManifest::row).collect()
    }

    /// The sum of `n_points` over the whole tree.
    pub fn total_points(&self) -> u64 {
        self.iter().map(|node| node.n_points).sum()
    }

    /// The number of tiles described.
    pub fn tile_count(&self) -> usize {
        self.iter().count()
    }

    /// Flatten the tree back into a manifest table.
    pub fn to_table(&self) -> DeeptableResult<RecordBatch> {
        let rows = self.to_rows();
        let extents = rows
            .iter()
            .map(|row| serde_json::to_string(&row.extent))
            .collect::<Result<Vec<_>, _>>()?;
        let schema = Arc::new(Schema::new(vec![
            Field::new(KEY_COLUMN, DataType::Utf8, false),
            Field::new(N_POINTS_COLUMN, DataType::UInt64, false),
            Field::new(MIN_IX_COLUMN, DataType::UInt64, false),
            Field::new(MAX_IX_COLUMN, DataType::UInt64, false),
            Field::new(EXTENT_COLUMN, DataType::Utf8, false),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|row| row.key.to_string()),
            )),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|row| row.n_points))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|row| row.min_ix))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|row| row.max_ix))),
            Arc::new(StringArray::from(extents)),
        ];
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

fn required_column<'a>(batch: &'a RecordBatch, name: &str) -> DeeptableResult<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| deeptable_err!(MalformedManifest: "the manifest has no {} column", name))
}

fn string_values(batch: &RecordBatch, name: &str) -> DeeptableResult<Vec<String>> {
    let column = required_column(batch, name)?;
    if column.null_count() > 0 {
        deeptable_bail!(MalformedManifest: "the {} column of the manifest has nulls", name);
    }
    let values = match column.data_type() {
        DataType::Utf8 => column
            .as_string::<i32>()
            .iter()
            .flatten()
            .map(str::to_string)
            .collect(),
        DataType::LargeUtf8 => column
            .as_string::<i64>()
            .iter()
            .flatten()
            .map(str::to_string)
            .collect(),
        DataType::Utf8View => column
            .as_string_view()
            .iter()
            .flatten()
            .map(str::to_string)
            .collect(),
        other => deeptable_bail!(
            MalformedManifest: "the {} column of the manifest must be a string, found {}",
            name,
            other
        ),
    };
    Ok(values)
}

fn integer_values(batch: &RecordBatch, name: &str) -> DeeptableResult<Vec<u64>> {
    ix_values(required_column(batch, name)?)
        .map_err(|e| deeptable_err!(MalformedManifest: "invalid {} column: {}", name, e))
}

/// Read the rows of a flat manifest table.
pub fn manifest_rows(batch: &RecordBatch) -> DeeptableResult<Vec<ManifestRow>> {
    let keys = string_values(batch, KEY_COLUMN)?;
    let extents = string_values(batch, EXTENT_COLUMN)?;
    let n_points = integer_values(batch, N_POINTS_COLUMN)?;
    let min_ixs = integer_values(batch, MIN_IX_COLUMN)?;
    let max_ixs = integer_values(batch, MAX_IX_COLUMN)?;

    keys.iter()
        .zip(extents.iter())
        .zip(n_points.into_iter().zip(min_ixs.into_iter().zip(max_ixs)))
        .map(|((key, extent), (n_points, (min_ix, max_ix)))| {
            let key: TileKey = key
                .parse()
                .map_err(|e| deeptable_err!(MalformedManifest: "invalid manifest key: {}", e))?;
            let extent: Rectangle = serde_json::from_str(extent).map_err(|e| {
                deeptable_err!(MalformedManifest: "invalid extent for tile {}: {}", key, e)
            })?;
            if min_ix > max_ix {
                deeptable_bail!(
                    MalformedManifest: "tile {} has min_ix {} above max_ix {}",
                    key,
                    min_ix,
                    max_ix
                );
            }
            Ok(ManifestRow {
                key,
                n_points,
                min_ix,
                max_ix,
                extent,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, min_ix: u64, max_ix: u64) -> ManifestRow {
        ManifestRow {
            key: key.parse().unwrap(),
            n_points: max_ix - min_ix + 1,
            min_ix,
            max_ix,
            extent: Rectangle::new([0.0, 1.0], [0.0, 1.0]),
        }
    }

    fn rows() -> Vec<ManifestRow> {
        vec![
            row("0/0/0", 0, 9),
            row("1/1/0", 20, 29),
            row("1/0/0", 10, 19),
            row("2/1/1", 30, 39),
        ]
    }

    #[test]
    fn nests_rows_by_computed_children() {
        let manifest = TileManifest::from_rows(rows()).unwrap();
        let children = manifest.children.as_ref().unwrap();
        assert_eq!(
            children.iter().map(|c| c.key.to_string()).collect::<Vec<_>>(),
            vec!["1/0/0", "1/1/0"]
        );
        let grandchild = manifest.find(&"2/1/1".parse().unwrap()).unwrap();
        assert_eq!(grandchild.children, Some(vec![]));
        assert_eq!(manifest.tile_count(), 4);
        assert_eq!(manifest.total_points(), 40);
    }

    #[test]
    fn iteration_is_preorder() {
        let manifest = TileManifest::from_rows(rows()).unwrap();
        let keys: Vec<String> = manifest.iter().map(|node| node.key.to_string()).collect();
        assert_eq!(keys, vec!["0/0/0", "1/0/0", "2/1/1", "1/1/0"]);
    }

    #[test]
    fn missing_root_is_malformed() {
        let err = TileManifest::from_rows(vec![row("1/0/0", 0, 9)]).unwrap_err();
        assert!(err.is_malformed_manifest());
    }

    #[test]
    fn duplicate_rows_are_malformed() {
        let err = TileManifest::from_rows(vec![row("0/0/0", 0, 9), row("0/0/0", 0, 9)]).unwrap_err();
        assert!(err.is_malformed_manifest());
    }

    #[test]
    fn unreachable_rows_are_ignored() {
        let manifest = TileManifest::from_rows(vec![row("0/0/0", 0, 9), row("2/0/0", 10, 19)]).unwrap();
        assert_eq!(manifest.tile_count(), 1);
    }

    #[test]
    fn table_round_trip() {
        let manifest = TileManifest::from_rows(rows()).unwrap();
        let table = manifest.to_table().unwrap();
        assert_eq!(table.num_rows(), 4);
        assert_eq!(TileManifest::from_table(&table).unwrap(), manifest);
    }

    #[test]
    fn inverted_ranges_are_malformed() {
        let mut bad = manifest_with(row("0/0/0", 0, 9));
        bad.max_ix = 0;
        bad.min_ix = 5;
        let err = TileManifest::from_table(&bad.to_table().unwrap()).unwrap_err();
        assert!(err.is_malformed_manifest());
    }

    fn manifest_with(root: ManifestRow) -> TileManifest {
        TileManifest::from_rows(vec![root]).unwrap()
    }
}
