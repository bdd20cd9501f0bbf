use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use deeptable_error::{DeeptableError, DeeptableResult, deeptable_bail, deeptable_err};
use deeptable_io::TileProxy;
use itertools::Itertools;
use parking_lot::RwLock;

use crate::manifest::TileManifest;
use crate::metrics::DeeptableMetrics;
use crate::scheduler::DownloadQueue;
use crate::selection::DataSelection;
use crate::tile::{Tile, TileId};
use crate::transformation::{Transformation, TransformationRegistry};
use crate::{Tix, TileKey};

/// State shared between a [`Deeptable`][crate::Deeptable], its tiles and its selections.
///
/// Tiles and selections hold a weak reference back to this, so dropping the last `Deeptable`
/// handle releases the whole tree.
pub(crate) struct TableShared {
    pub(crate) proxy: Arc<dyn TileProxy>,
    base_url: String,
    extension: String,
    /// Every tile created so far, indexed by tix. Tiles are never evicted.
    pub(crate) tiles: DashMap<Tix, Arc<Tile>>,
    pub(crate) transformations: TransformationRegistry,
    pub(crate) selections: DashMap<Arc<str>, Arc<DataSelection>>,
    pub(crate) domains: DashMap<Arc<str>, [f64; 2]>,
    /// The last manifest applied, if any.
    pub(crate) manifest: RwLock<Option<Arc<TileManifest>>>,
    pub(crate) queue: Arc<DownloadQueue>,
    pub(crate) metrics: DeeptableMetrics,
    next_tile_id: AtomicU32,
}

impl TableShared {
    pub(crate) fn new(
        proxy: Arc<dyn TileProxy>,
        base_url: String,
        extension: String,
        queue: DownloadQueue,
        metrics: DeeptableMetrics,
    ) -> Self {
        Self {
            proxy,
            base_url: base_url.trim_end_matches('/').to_string(),
            extension,
            tiles: DashMap::new(),
            transformations: TransformationRegistry::default(),
            selections: DashMap::new(),
            domains: DashMap::new(),
            manifest: RwLock::new(None),
            queue: Arc::new(queue),
            metrics,
            next_tile_id: AtomicU32::new(0),
        }
    }

    /// The endpoint of a tile file, or of one of its sidecar files when `suffix` is given.
    pub(crate) fn endpoint(&self, key: &TileKey, suffix: Option<&str>) -> String {
        let file = match suffix {
            Some(suffix) => format!("{key}.{suffix}.{}", self.extension),
            None => format!("{key}.{}", self.extension),
        };
        self.resolve(&file)
    }

    pub(crate) fn manifest_endpoint(&self) -> String {
        self.resolve(&format!("manifest.{}", self.extension))
    }

    fn resolve(&self, file: &str) -> String {
        if self.base_url.is_empty() {
            file.to_string()
        } else {
            format!("{}/{file}", self.base_url)
        }
    }

    pub(crate) fn tile(&self, tix: Tix) -> Option<Arc<Tile>> {
        self.tiles.get(&tix).map(|tile| tile.value().clone())
    }

    /// Look up a tile, creating it if this is the first time its key is consulted.
    pub(crate) fn get_or_create_tile(self: &Arc<Self>, key: TileKey) -> Arc<Tile> {
        self.tiles
            .entry(key.tix())
            .or_insert_with(|| {
                let id = TileId::new(self.next_tile_id.fetch_add(1, Ordering::Relaxed));
                Arc::new(Tile::new(id, key, Arc::downgrade(self)))
            })
            .value()
            .clone()
    }

    /// Every tile whose download has completed, in tix order.
    pub(crate) fn loaded_tiles(&self) -> Vec<Arc<Tile>> {
        self.tiles
            .iter()
            .filter(|entry| entry.value().is_loaded())
            .map(|entry| entry.value().clone())
            .sorted_by_key(|tile| tile.tix())
            .collect()
    }

    pub(crate) fn transformation(&self, name: &str) -> Option<Transformation> {
        self.transformations.get(name)
    }

    /// True if `name` is a registered transformation or a column of the loaded root tile.
    pub(crate) fn column_exists(&self, name: &str) -> bool {
        self.transformations.contains(name)
            || self
                .tile(TileKey::ROOT.tix())
                .is_some_and(|root| root.has_column(name))
    }

    /// Fail if `name` is already taken by a transformation or by a column of the root tile.
    pub(crate) fn check_name_available(&self, name: &str) -> DeeptableResult<()> {
        if self.transformations.contains(name) {
            deeptable_bail!(DuplicateColumn: "a column named {} is already registered", name);
        }
        let root = self.tile(TileKey::ROOT.tix());
        if root.is_some_and(|root| root.has_column(name)) {
            deeptable_bail!(DuplicateColumn: "the dataset already has a column named {}", name);
        }
        Ok(())
    }
}

/// Upgrade a weak back-reference to the owning table.
pub(crate) fn upgrade(table: &Weak<TableShared>) -> DeeptableResult<Arc<TableShared>> {
    table
        .upgrade()
        .ok_or_else(|| deeptable_err!("the owning deeptable has been dropped"))
}

/// Wrap a transport error as a fetch failure of `endpoint`.
pub(crate) fn fetch_failure(endpoint: &str, err: DeeptableError) -> DeeptableError {
    if err.is_fetch_failure() {
        err.with_context(format!("fetching {endpoint}"))
    } else {
        deeptable_err!(FetchFailure: "fetching {}: {}", endpoint, err)
    }
}
