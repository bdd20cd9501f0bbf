#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{ArrayRef, BooleanArray, Float32Array, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use deeptable::ipc::{DOMAIN_KEY, TileMetadata, encode_tile};
use deeptable::{Deeptable, DeeptableOptions, ManifestRow, Rectangle, TileKey, TileManifest};
use deeptable_io::InMemoryTileProxy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const BASE_URL: &str = "tiles";
pub const ROWS_PER_TILE: u64 = 10;

/// A complete quadtree of the given depth served from memory.
///
/// Index ranges are assigned depth first, so `0/0/0` holds `ix` 0..=9, `1/0/0` holds 10..=19,
/// `2/0/0` holds 20..=29 and so on. The root covers `[0, 4] x [0, 4]`. Leaves carry no
/// `children` metadata. The root lists a `density` sidecar column.
pub struct SyntheticTree {
    pub proxy: Arc<InMemoryTileProxy>,
    pub preorder: Vec<TileKey>,
    pub extent: Rectangle,
}

impl SyntheticTree {
    pub fn endpoint(key: &TileKey) -> String {
        format!("{BASE_URL}/{key}.feather")
    }

    pub fn options(&self) -> DeeptableOptions {
        DeeptableOptions::new(self.proxy.clone()).with_base_url(BASE_URL)
    }

    pub fn table(&self) -> Deeptable {
        Deeptable::try_new(self.options()).unwrap()
    }

    pub async fn table_with_manifest(&self) -> Deeptable {
        let table = self.table();
        table.load_manifest().await.unwrap();
        table
    }

    pub fn min_ix(&self, key: &TileKey) -> u64 {
        let position = self.preorder.iter().position(|k| k == key).unwrap();
        position as u64 * ROWS_PER_TILE
    }

    /// The keys of every tile file fetched so far, sorted. Manifest and sidecar fetches are
    /// left out.
    pub fn fetched_tiles(&self) -> Vec<String> {
        let mut tiles: Vec<String> = self
            .proxy
            .fetched_endpoints()
            .iter()
            .filter_map(|endpoint| {
                let file = endpoint.strip_prefix(&format!("{BASE_URL}/"))?;
                let key = file.strip_suffix(".feather")?;
                (key != "manifest" && !key.contains('.')).then(|| key.to_string())
            })
            .collect();
        tiles.sort();
        tiles
    }
}

pub fn key(key: &str) -> TileKey {
    key.parse().unwrap()
}

pub fn synthetic_tree(depth: u32) -> SyntheticTree {
    let proxy = Arc::new(InMemoryTileProxy::new());
    let extent = Rectangle::new([0.0, 4.0], [0.0, 4.0]);
    let mut preorder = Vec::new();
    collect_preorder(TileKey::ROOT, depth, &mut preorder);
    let total = preorder.len() as u64 * ROWS_PER_TILE;

    let mut rng = StdRng::seed_from_u64(42);
    let mut rows = Vec::new();
    for (position, key) in preorder.iter().enumerate() {
        let min_ix = position as u64 * ROWS_PER_TILE;
        let tile_extent = extent_of(&extent, key);
        let is_leaf = key.z() + 1 == depth;
        let metadata = TileMetadata {
            extent: Some(tile_extent),
            children: (!is_leaf).then(|| key.children()),
            sidecars: if key.is_root() {
                BTreeMap::from([("density".to_string(), "density".to_string())])
            } else {
                BTreeMap::new()
            },
            total_points: key.is_root().then_some(total),
        };
        let batch = tile_batch(min_ix, &tile_extent, &mut rng);
        proxy.insert(
            SyntheticTree::endpoint(key),
            encode_tile(&batch, &metadata).unwrap(),
        );
        rows.push(ManifestRow {
            key: *key,
            n_points: ROWS_PER_TILE,
            min_ix,
            max_ix: min_ix + ROWS_PER_TILE - 1,
            extent: tile_extent,
        });
    }

    let density = single_column("density", density_values());
    proxy.insert(
        format!("{BASE_URL}/0/0/0.density.feather"),
        encode_tile(&density, &TileMetadata::default()).unwrap(),
    );

    let manifest = TileManifest::from_rows(rows).unwrap().to_table().unwrap();
    proxy.insert(
        format!("{BASE_URL}/manifest.feather"),
        encode_tile(&manifest, &TileMetadata::default()).unwrap(),
    );

    SyntheticTree {
        proxy,
        preorder,
        extent,
    }
}

pub fn density_values() -> Vec<f32> {
    (0..ROWS_PER_TILE).map(|i| i as f32 * 0.5).collect()
}

fn collect_preorder(key: TileKey, depth: u32, out: &mut Vec<TileKey>) {
    out.push(key);
    if key.z() + 1 < depth {
        for child in key.children() {
            collect_preorder(child, depth, out);
        }
    }
}

fn extent_of(root: &Rectangle, key: &TileKey) -> Rectangle {
    let side_x = root.width() / f64::from(1u32 << key.z());
    let side_y = root.height() / f64::from(1u32 << key.z());
    let x0 = root.x[0] + f64::from(key.x()) * side_x;
    let y0 = root.y[0] + f64::from(key.y()) * side_y;
    Rectangle::new([x0, x0 + side_x], [y0, y0 + side_y])
}

#[allow(clippy::cast_possible_truncation)]
fn tile_batch(min_ix: u64, extent: &Rectangle, rng: &mut StdRng) -> RecordBatch {
    let ixs: Vec<u64> = (min_ix..min_ix + ROWS_PER_TILE).collect();
    let xs: Vec<f32> = ixs
        .iter()
        .map(|_| rng.random_range(extent.x[0] as f32..extent.x[1] as f32))
        .collect();
    let ys: Vec<f32> = ixs
        .iter()
        .map(|_| rng.random_range(extent.y[0] as f32..extent.y[1] as f32))
        .collect();
    let even: BooleanArray = ixs.iter().map(|ix| Some(ix % 2 == 0)).collect();

    let schema = Arc::new(Schema::new(vec![
        Field::new("ix", DataType::UInt64, false),
        Field::new("x", DataType::Float32, false),
        Field::new("y", DataType::Float32, false),
        Field::new("even", DataType::Boolean, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(ixs)),
        Arc::new(Float32Array::from(xs)),
        Arc::new(Float32Array::from(ys)),
        Arc::new(even),
    ];
    RecordBatch::try_new(schema, columns).unwrap()
}

fn single_column(name: &str, values: Vec<f32>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Float32, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Float32Array::from(values))]).unwrap()
}

/// A single downloaded leaf tile of 16 rows with boolean columns `a` (even rows) and `b` (rows
/// whose index has bit 1 clear).
pub async fn sixteen_rows() -> Deeptable {
    let proxy = Arc::new(InMemoryTileProxy::new());
    let ixs: Vec<u64> = (0..16).collect();
    let a: BooleanArray = ixs.iter().map(|ix| Some(ix % 2 == 0)).collect();
    let b: BooleanArray = ixs.iter().map(|ix| Some((ix / 2) % 2 == 0)).collect();
    let schema = Arc::new(Schema::new(vec![
        Field::new("ix", DataType::UInt64, false),
        Field::new("a", DataType::Boolean, false),
        Field::new("b", DataType::Boolean, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(UInt64Array::from(ixs)), Arc::new(a), Arc::new(b)],
    )
    .unwrap();
    let metadata = TileMetadata {
        extent: Some(Rectangle::new([0.0, 1.0], [0.0, 1.0])),
        ..Default::default()
    };
    proxy.insert("0/0/0.feather", encode_tile(&batch, &metadata).unwrap());
    let table = Deeptable::try_new(DeeptableOptions::new(proxy)).unwrap();
    table.root().download().await.unwrap();
    table
}

/// A single downloaded leaf tile whose `value` column (10, 20, 30, 40) declares `domain` as its
/// field metadata. `ix` carries no metadata.
pub async fn declared_domain(domain: &str) -> Deeptable {
    let proxy = Arc::new(InMemoryTileProxy::new());
    let value = Field::new("value", DataType::Float32, false)
        .with_metadata(HashMap::from([(DOMAIN_KEY.to_string(), domain.to_string())]));
    let schema = Arc::new(Schema::new(vec![
        Field::new("ix", DataType::UInt64, false),
        value,
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(UInt64Array::from(vec![0, 1, 2, 3])),
            Arc::new(Float32Array::from(vec![10.0, 20.0, 30.0, 40.0])),
        ],
    )
    .unwrap();
    let metadata = TileMetadata {
        extent: Some(Rectangle::new([0.0, 1.0], [0.0, 1.0])),
        ..Default::default()
    };
    proxy.insert("0/0/0.feather", encode_tile(&batch, &metadata).unwrap());
    let table = Deeptable::try_new(DeeptableOptions::new(proxy)).unwrap();
    table.root().download().await.unwrap();
    table
}

/// Poll `done` until it holds, yielding to the runtime in between.
pub async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(done(), "condition not reached");
}
