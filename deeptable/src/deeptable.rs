use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::RecordBatch;
use deeptable_arena::{BackingStore, BufferArenaOptions};
use deeptable_error::{DeeptableResult, deeptable_bail, deeptable_err};
use deeptable_io::ApiRequest;
use futures::{StreamExt, stream};
use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;

use crate::buffers::TileBufferManager;
use crate::coerce::{ix_values, to_f64_values};
use crate::ipc::{DOMAIN_KEY, decode_tile};
use crate::manifest::TileManifest;
use crate::metrics::DeeptableMetrics;
use crate::options::DeeptableOptions;
use crate::rect::check_overlap;
use crate::scheduler::{DownloadQueue, SchedulerHandle};
use crate::selection::{DataSelection, SelectionSource};
use crate::table::{TableShared, fetch_failure};
use crate::tile::DownloadState;
use crate::transformation::{Transformation, row_transformation, transformation};
use crate::{IX_COLUMN, Rectangle, Tile, TileKey};

/// The order in which [`Deeptable::visit`] reports a tile relative to its children.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    /// Parents before children.
    #[default]
    PreOrder,
    /// Children before parents.
    PostOrder,
}

/// A quadtree of tiles that is downloaded progressively.
///
/// The root tile exists from construction. Every other tile is created the first time its parent
/// reports it, and no tile is ever evicted. Cloning is cheap and clones share the tree.
#[derive(Clone)]
pub struct Deeptable {
    shared: Arc<TableShared>,
    flush_interval: Duration,
}

impl Deeptable {
    pub fn try_new(options: DeeptableOptions) -> DeeptableResult<Self> {
        let queue = DownloadQueue::new(options.max_concurrent_downloads());
        let shared = Arc::new(TableShared::new(
            options.proxy().clone(),
            options.base_url().to_string(),
            options.extension().to_string(),
            queue,
            options.metrics().clone(),
        ));
        let table = Self {
            shared,
            flush_interval: options.flush_interval(),
        };
        let root = table.root();
        if let Some(manifest) = options.manifest() {
            table.apply_manifest(manifest)?;
        }
        if let Some(extent) = options.extent() {
            root.set_extent(extent);
        }
        log::debug!("Opened deeptable with {} known tiles", table.tile_count());
        Ok(table)
    }

    pub fn root(&self) -> Arc<Tile> {
        self.shared.get_or_create_tile(TileKey::ROOT)
    }

    /// A tile that has already been created, by key.
    pub fn tile(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.shared.tile(key.tix())
    }

    /// The number of tiles created so far, downloaded or not.
    pub fn tile_count(&self) -> usize {
        self.shared.tiles.len()
    }

    /// Every downloaded tile, in tix order.
    pub fn loaded_tiles(&self) -> Vec<Arc<Tile>> {
        self.shared.loaded_tiles()
    }

    /// The size of the dataset: the root tile's `total_points`, else the sum over the manifest.
    pub fn total_points(&self) -> Option<u64> {
        self.root().total_points().or_else(|| {
            self.shared
                .manifest
                .read()
                .as_ref()
                .map(|manifest| manifest.total_points())
        })
    }

    /// Create every tile the manifest describes and override its metadata.
    pub fn apply_manifest(&self, manifest: &TileManifest) -> DeeptableResult<()> {
        if !manifest.key.is_root() {
            deeptable_bail!(
                MalformedManifest: "a manifest must start at the root, found {}",
                manifest.key
            );
        }
        for node in manifest.iter() {
            self.shared.get_or_create_tile(node.key).apply_manifest(node);
        }
        *self.shared.manifest.write() = Some(Arc::new(manifest.clone()));
        log::debug!("Applied manifest describing {} tiles", manifest.tile_count());
        Ok(())
    }

    /// Fetch `manifest.{ext}` next to the tiles and apply it.
    pub async fn load_manifest(&self) -> DeeptableResult<TileManifest> {
        let endpoint = self.shared.manifest_endpoint();
        let bytes = self
            .shared
            .proxy
            .api_call(ApiRequest::get(endpoint.clone()))
            .await
            .map_err(|e| fetch_failure(&endpoint, e))?;
        let decoded = decode_tile(bytes)?;
        let manifest = TileManifest::from_table(&decoded.batch)?;
        self.apply_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Walk the downloaded part of the tree. A tile failing `filter` is skipped along with its
    /// subtree. Nothing is downloaded.
    pub fn visit<F, C>(&self, order: VisitOrder, filter: F, mut callback: C)
    where
        F: Fn(&Tile) -> bool,
        C: FnMut(&Arc<Tile>),
    {
        fn walk<F, C>(tile: &Arc<Tile>, order: VisitOrder, filter: &F, callback: &mut C)
        where
            F: Fn(&Tile) -> bool,
            C: FnMut(&Arc<Tile>),
        {
            if !tile.is_loaded() || !filter(tile) {
                return;
            }
            if order == VisitOrder::PreOrder {
                callback(tile);
            }
            for child in tile.children() {
                walk(&child, order, filter, callback);
            }
            if order == VisitOrder::PostOrder {
                callback(tile);
            }
        }

        walk(&self.root(), order, &filter, &mut callback);
    }

    /// Walk the tree breadth first, downloading tiles as it descends. A tile failing `filter` is
    /// not reported and its children are never fetched. Tiles that fail to download are logged
    /// and skipped with their subtree.
    pub async fn visit_full<F, C>(&self, filter: F, mut callback: C)
    where
        F: Fn(&Tile) -> bool,
        C: FnMut(&Arc<Tile>),
    {
        let concurrency = self.shared.queue.capacity();
        let mut frontier = vec![self.root()];
        while !frontier.is_empty() {
            let downloaded: Vec<_> = stream::iter(frontier)
                .map(|tile| async move {
                    let result = tile.download().await;
                    (tile, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

            let mut next = Vec::new();
            for (tile, result) in downloaded {
                if let Err(err) = result {
                    log::warn!("Skipping tile {}: {}", tile.key(), err);
                    continue;
                }
                if !filter(&tile) {
                    continue;
                }
                callback(&tile);
                next.extend(tile.children());
            }
            frontier = next;
        }
    }

    /// Download every tile whose `min_ix` is at most `max_ix`, level by level. Returns the
    /// number of tiles downloaded successfully.
    pub async fn download_to_depth(&self, max_ix: u64) -> usize {
        let concurrency = self.shared.queue.capacity();
        let mut loaded = 0;
        let mut frontier = vec![self.root()];
        while !frontier.is_empty() {
            let eligible = frontier.into_iter().filter(|tile| tile.min_ix() <= max_ix);
            let downloaded: Vec<_> = stream::iter(eligible)
                .map(|tile| async move {
                    let result = tile.download().await;
                    (tile, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut next = Vec::new();
            for (tile, result) in downloaded {
                match result {
                    Ok(()) => {
                        loaded += 1;
                        next.extend(tile.children());
                    }
                    Err(err) => log::warn!("Download of tile {} failed: {}", tile.key(), err),
                }
            }
            frontier = next;
        }
        loaded
    }

    /// The `[min, max]` of a numeric column.
    ///
    /// Taken from the `domain` field metadata of the root tile when present, otherwise scanned
    /// from the loaded tiles that already hold the column. The result is cached until
    /// [`Self::invalidate_domain`].
    pub fn domain(&self, column: &str) -> DeeptableResult<[f64; 2]> {
        if let Some(domain) = self.shared.domains.get(column) {
            return Ok(*domain);
        }
        let domain = match self.declared_domain(column)? {
            Some(domain) => domain,
            None => self.scanned_domain(column)?,
        };
        self.shared.domains.insert(column.into(), domain);
        Ok(domain)
    }

    fn declared_domain(&self, column: &str) -> DeeptableResult<Option<[f64; 2]>> {
        let Some(batch) = self.root().batch() else {
            return Ok(None);
        };
        let schema = batch.schema();
        let Ok(field) = schema.field_with_name(column) else {
            return Ok(None);
        };
        field
            .metadata()
            .get(DOMAIN_KEY)
            .map(|json| {
                serde_json::from_str::<[f64; 2]>(json).map_err(|e| {
                    deeptable_err!(MalformedManifest: "invalid domain for {}: {}", column, e)
                })
            })
            .transpose()
    }

    fn scanned_domain(&self, column: &str) -> DeeptableResult<[f64; 2]> {
        let mut seen = false;
        let mut domain = [f64::INFINITY, f64::NEG_INFINITY];
        for tile in self.loaded_tiles() {
            let Some(array) = tile.column(column) else {
                continue;
            };
            seen = true;
            for value in to_f64_values(&array)? {
                if value.is_nan() {
                    continue;
                }
                domain[0] = domain[0].min(value);
                domain[1] = domain[1].max(value);
            }
        }
        if !seen {
            deeptable_bail!(ColumnNotFound: "no loaded tile has a column named {}", column);
        }
        if domain[0] > domain[1] {
            deeptable_bail!("column {} has no values", column);
        }
        Ok(domain)
    }

    pub fn invalidate_domain(&self, column: &str) {
        self.shared.domains.remove(column);
    }

    /// Queue the most useful downloads for a view. Returns the number of tiles queued.
    ///
    /// Walks down from the root through downloaded tiles and offers every visible tile that has
    /// not been attempted yet. With a viewport a candidate scores the fraction of its extent
    /// inside the viewport, so tiles outside it are never queued. Without one, shallower tiles
    /// score higher.
    pub fn spawn_downloads(&self, viewport: Option<&Rectangle>, max_ix: u64) -> usize {
        let queue = &self.shared.queue;
        let mut candidates = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(tile) = stack.pop() {
            if !tile.is_visible(max_ix, viewport) {
                continue;
            }
            match tile.download_state() {
                DownloadState::Complete => stack.extend(tile.children()),
                DownloadState::Unattempted if !queue.is_pending(tile.tix()) => {
                    let score = match (viewport, tile.extent()) {
                        (Some(viewport), Some(extent)) => check_overlap(&extent, viewport),
                        _ => 1.0 / f64::from(tile.key().z() + 1),
                    };
                    candidates.push((score, tile));
                }
                _ => {}
            }
        }
        queue.offer(candidates)
    }

    /// Launch every queued download on the current tokio runtime.
    pub fn flush(&self) -> DeeptableResult<usize> {
        self.shared.queue.flush()
    }

    /// Flush the download queue periodically until the returned handle, or the table, is
    /// dropped.
    pub fn start_scheduler(&self) -> DeeptableResult<SchedulerHandle> {
        let handle = Handle::try_current()
            .map_err(|e| deeptable_err!("the scheduler requires a tokio runtime: {}", e))?;
        if self.flush_interval.is_zero() {
            deeptable_bail!("the flush interval must be positive");
        }
        let table = Arc::downgrade(&self.shared);
        let period = self.flush_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    log::debug!("Deeptable dropped, stopping the download scheduler");
                    return;
                };
                if let Err(err) = table.queue.flush() {
                    log::warn!("Failed to flush downloads: {}", err);
                }
            }
        });
        Ok(SchedulerHandle::new(task))
    }

    pub fn download_queue(&self) -> &Arc<DownloadQueue> {
        &self.shared.queue
    }

    /// Register a column computed per tile on demand.
    pub fn register_transformation(
        &self,
        name: &str,
        transformation: Transformation,
    ) -> DeeptableResult<()> {
        self.shared.check_name_available(name)?;
        self.shared.transformations.insert(name, transformation)?;
        log::debug!("Registered transformation {}", name);
        Ok(())
    }

    /// Register a `Float32` column computed row by row from `prerequisites`.
    pub fn register_row_transformation<F>(
        &self,
        name: &str,
        per_row: F,
        prerequisites: Vec<String>,
    ) -> DeeptableResult<()>
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        self.register_transformation(name, row_transformation(per_row, prerequisites))
    }

    pub fn transformation_names(&self) -> Vec<Arc<str>> {
        self.shared.transformations.names()
    }

    /// Register a selection, available as a boolean column named `name`.
    ///
    /// Registering the same definition again returns the existing selection. A different
    /// definition under a taken name fails with `DuplicateColumn`.
    pub fn select_data(
        &self,
        name: &str,
        source: SelectionSource,
    ) -> DeeptableResult<Arc<DataSelection>> {
        if let Some(existing) = self.selection(name) {
            if existing.source().same_definition(&source) {
                return Ok(existing);
            }
            deeptable_bail!(
                DuplicateColumn: "selection {} is already defined differently",
                name
            );
        }
        // Every dependency must already resolve, which keeps the selection graph acyclic.
        for dep in source.dependencies() {
            if dep.as_ref() == name {
                deeptable_bail!(CompositionParse: "selection {} refers to itself", name);
            }
            if !self.shared.column_exists(&dep) {
                deeptable_bail!(
                    CompositionParse: "selection {} refers to unknown column {}",
                    name,
                    dep
                );
            }
        }
        self.shared.check_name_available(name)?;

        let selection = Arc::new(DataSelection::new(
            name.into(),
            source,
            Arc::downgrade(&self.shared),
        ));
        // Tiles evaluate selections directly so that counters commit after the column is
        // attached. The registered transformation reserves the name and computes the same mask.
        let evaluator = selection.clone();
        self.shared.transformations.insert(
            name,
            transformation(move |tile| {
                let selection = evaluator.clone();
                async move { Ok(selection.evaluate_tile(tile).await?.0) }
            }),
        )?;
        self.shared.selections.insert(name.into(), selection.clone());
        log::debug!("Registered selection {}", name);
        Ok(selection)
    }

    pub fn selection(&self, name: &str) -> Option<Arc<DataSelection>> {
        self.shared
            .selections
            .get(name)
            .map(|selection| selection.value().clone())
    }

    /// The loaded tile and row holding `ix`, if that tile is downloaded.
    pub fn find_point_raw(&self, ix: u64) -> DeeptableResult<Option<(Arc<Tile>, usize)>> {
        for tile in self.loaded_tiles() {
            let Some(max_ix) = tile.max_ix() else {
                continue;
            };
            if ix < tile.min_ix() || ix > max_ix {
                continue;
            }
            let Some(column) = tile.column(IX_COLUMN) else {
                continue;
            };
            if let Ok(row) = ix_values(&column)?.binary_search(&ix) {
                return Ok(Some((tile, row)));
            }
        }
        Ok(None)
    }

    /// The row holding `ix` as a one-row batch.
    pub fn find_point(&self, ix: u64) -> DeeptableResult<Option<RecordBatch>> {
        Ok(self
            .find_point_raw(ix)?
            .and_then(|(tile, row)| tile.batch().map(|batch| batch.slice(row, 1))))
    }

    /// Unregister a transformation and drop its column from every tile.
    ///
    /// Selections persist for the life of the table, so their names are never reassigned, and a
    /// column that a selection reads cannot be deleted either.
    pub fn delete_column(&self, name: &str) -> DeeptableResult<()> {
        if self.shared.selections.contains_key(name) {
            deeptable_bail!(InvalidArgument: "selection {} cannot be deleted", name);
        }
        if let Some(dependent) = self.shared.selections.iter().find(|selection| {
            selection
                .source()
                .dependencies()
                .iter()
                .any(|dep| dep.as_ref() == name)
        }) {
            deeptable_bail!(
                InvalidArgument: "column {} is read by selection {}",
                name,
                dependent.key()
            );
        }
        if self.shared.transformations.remove(name).is_none() {
            deeptable_bail!(ColumnNotFound: "no transformation named {}", name);
        }
        self.shared.domains.remove(name);
        let dropped = self
            .shared
            .tiles
            .iter()
            .filter(|tile| tile.value().forget_column(name))
            .count();
        log::debug!("Deleted column {} from {} tiles", name, dropped);
        Ok(())
    }

    /// Forget failed evaluations of a transformation so the next request runs it again.
    /// Returns the number of tiles reset.
    pub fn reset_failed_transformations(&self, name: &str) -> usize {
        self.shared
            .tiles
            .iter()
            .filter(|tile| tile.value().reset_failed_column(name))
            .count()
    }

    pub fn metrics(&self) -> &DeeptableMetrics {
        &self.shared.metrics
    }

    /// A buffer manager whose counters report into this table's metrics. Use one manager per
    /// table, tile identifiers are only unique within a table.
    pub fn buffer_manager<S: BackingStore>(
        &self,
        store: Arc<S>,
        options: BufferArenaOptions,
    ) -> Arc<TileBufferManager<S>> {
        Arc::new(TileBufferManager::new(
            store,
            options,
            self.shared.metrics.clone(),
        ))
    }
}

impl Debug for Deeptable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deeptable")
            .field("tiles", &self.tile_count())
            .field("transformations", &self.transformation_names())
            .field("queue", &self.shared.queue)
            .finish()
    }
}
