use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{Field, FieldRef, Schema};
use dashmap::DashMap;
use deeptable_error::{
    DeeptableError, DeeptableResult, SharedDeeptableResult, SharedResultExt, deeptable_bail,
    deeptable_err,
};
use deeptable_io::ApiRequest;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, TryFutureExt};
use parking_lot::RwLock;

use crate::coerce::ix_values;
use crate::ipc::{DecodedTile, decode_tile};
use crate::manifest::TileManifest;
use crate::metrics::{
    SIDECARS_FETCHED, TILES_COMPLETED, TILES_FAILED, TILES_REQUESTED, TRANSFORMATIONS_EVALUATED,
    TRANSFORMATIONS_FAILED,
};
use crate::table::{TableShared, fetch_failure, upgrade};
use crate::selection::DataSelection;
use crate::transformation::Transformation;
use crate::{IX_COLUMN, Rectangle, TileKey, Tix};

/// Identifies a tile within one [`Deeptable`][crate::Deeptable]. Allocated by the owning table,
/// so identifiers from different tables are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId(u32);

impl TileId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for TileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TileId({})", self.0)
    }
}

/// The lifecycle of a tile download. `Failed` is terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    #[default]
    Unattempted,
    InProgress,
    Complete,
    Failed,
}

pub(crate) type SharedColumnFuture = Shared<BoxFuture<'static, SharedDeeptableResult<ArrayRef>>>;
type SharedDownload = Shared<BoxFuture<'static, SharedDeeptableResult<()>>>;

/// Where a column that is not part of the downloaded batch comes from.
enum ColumnSource {
    Transformation(Transformation),
    Selection(Arc<DataSelection>),
    Sidecar(String),
}

#[derive(Default)]
struct TileState {
    download_state: DownloadState,
    batch: Option<RecordBatch>,
    /// Bumped whenever `batch` is replaced.
    version: u64,
    min_ix: Option<u64>,
    max_ix: Option<u64>,
    extent: Option<Rectangle>,
    children: Option<Vec<TileKey>>,
    sidecars: BTreeMap<String, String>,
    n_points: Option<u64>,
    total_points: Option<u64>,
    error: Option<Arc<DeeptableError>>,
}

/// One node of the quadtree.
///
/// A tile starts out as metadata only (a key, and possibly an index range and extent from a
/// manifest). Once downloaded it owns a single [`RecordBatch`]. Columns are added and removed
/// copy-on-write: batches handed out earlier stay valid and unchanged, and every replacement
/// bumps [`Tile::version`].
pub struct Tile {
    id: TileId,
    key: TileKey,
    table: Weak<TableShared>,
    state: RwLock<TileState>,
    download: OnceLock<SharedDownload>,
    /// Memoized evaluations of derived and sidecar columns, by column name.
    columns: DashMap<Arc<str>, SharedColumnFuture>,
    highest_known_ix: AtomicU64,
}

impl Tile {
    pub(crate) fn new(id: TileId, key: TileKey, table: Weak<TableShared>) -> Self {
        Self {
            id,
            key,
            table,
            state: Default::default(),
            download: OnceLock::new(),
            columns: DashMap::new(),
            highest_known_ix: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn tix(&self) -> Tix {
        self.key.tix()
    }

    pub fn download_state(&self) -> DownloadState {
        self.state.read().download_state
    }

    pub fn is_loaded(&self) -> bool {
        self.download_state() == DownloadState::Complete
    }

    /// The error that failed the download, if it failed.
    pub fn error(&self) -> Option<Arc<DeeptableError>> {
        self.state.read().error.clone()
    }

    /// The current batch, if downloaded. Later column changes do not affect the returned batch.
    pub fn batch(&self) -> Option<RecordBatch> {
        self.state.read().batch.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn num_rows(&self) -> Option<usize> {
        self.state.read().batch.as_ref().map(RecordBatch::num_rows)
    }

    /// A column of the current batch, without evaluating anything.
    pub fn column(&self, name: &str) -> Option<ArrayRef> {
        self.state
            .read()
            .batch
            .as_ref()
            .and_then(|batch| batch.column_by_name(name).cloned())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.state
            .read()
            .batch
            .as_ref()
            .is_some_and(|batch| batch.schema().column_with_name(name).is_some())
    }

    /// The smallest row index in the subtree.
    ///
    /// Known exactly once downloaded or described by a manifest. Otherwise it is derived from the
    /// parent: one past the parent's largest index, or the parent's own lower bound.
    pub fn min_ix(&self) -> u64 {
        if let Some(min_ix) = self.state.read().min_ix {
            return min_ix;
        }
        match self.parent() {
            Some(parent) => parent
                .max_ix()
                .map_or_else(|| parent.min_ix(), |max_ix| max_ix + 1),
            None => 0,
        }
    }

    pub fn max_ix(&self) -> Option<u64> {
        self.state.read().max_ix
    }

    /// The largest row index known anywhere in this tile's subtree.
    pub fn highest_known_ix(&self) -> u64 {
        self.highest_known_ix.load(Ordering::Acquire)
    }

    /// The bounds of the subtree.
    ///
    /// Before download this falls back to the quadrant of the parent's extent that the tile
    /// covers, so that visibility can be tested without fetching anything.
    pub fn extent(&self) -> Option<Rectangle> {
        if let Some(extent) = self.state.read().extent {
            return Some(extent);
        }
        self.parent()
            .and_then(|parent| parent.extent())
            .map(|extent| extent.quadrant_for(&self.key))
    }

    /// The keys of the children, `None` while unknown.
    pub fn child_keys(&self) -> Option<Vec<TileKey>> {
        self.state.read().children.clone()
    }

    pub fn sidecars(&self) -> BTreeMap<String, String> {
        self.state.read().sidecars.clone()
    }

    pub fn n_points(&self) -> Option<u64> {
        self.state.read().n_points
    }

    /// The dataset size recorded in this tile's metadata, usually only present on the root.
    pub fn total_points(&self) -> Option<u64> {
        self.state.read().total_points
    }

    pub fn parent(&self) -> Option<Arc<Tile>> {
        let parent = self.key.parent()?;
        self.table.upgrade()?.tile(parent.tix())
    }

    /// The child tiles, created on first consultation. Empty while the child keys are unknown.
    pub fn children(&self) -> Vec<Arc<Tile>> {
        let Some(table) = self.table.upgrade() else {
            return Vec::new();
        };
        self.child_keys()
            .unwrap_or_default()
            .into_iter()
            .map(|key| table.get_or_create_tile(key))
            .collect()
    }

    /// Whether the tile should be drawn (or fetched) for the given index cutoff and viewport.
    ///
    /// Uses only metadata, so it never forces a download.
    pub fn is_visible(&self, max_ix: u64, viewport: Option<&Rectangle>) -> bool {
        if self.min_ix() > max_ix {
            return false;
        }
        match (viewport, self.extent()) {
            (Some(viewport), Some(extent)) => extent.intersects(viewport),
            _ => true,
        }
    }

    /// Fetch and decode the tile. Idempotent: every caller shares one fetch, and a failed
    /// download keeps returning the same error.
    pub async fn download(self: &Arc<Self>) -> DeeptableResult<()> {
        self.download_future().await.unshare()
    }

    fn download_future(self: &Arc<Self>) -> SharedDownload {
        self.download
            .get_or_init(|| {
                self.state.write().download_state = DownloadState::InProgress;
                let tile = self.clone();
                async move {
                    let result = tile.clone().fetch().await.map_err(Arc::new);
                    tile.finish_download(&result);
                    result
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    async fn fetch(self: Arc<Self>) -> DeeptableResult<()> {
        let table = upgrade(&self.table)?;
        let endpoint = table.endpoint(&self.key, None);
        table.metrics.counter(TILES_REQUESTED).inc();
        log::debug!("Downloading tile {} from {}", self.key, endpoint);

        let bytes = table
            .proxy
            .api_call(ApiRequest::get(endpoint.clone()))
            .await
            .map_err(|e| fetch_failure(&endpoint, e))?;
        let decoded =
            decode_tile(bytes).map_err(|e| e.with_context(format!("decoding tile {}", self.key)))?;
        self.install(decoded)
    }

    fn finish_download(&self, result: &SharedDeeptableResult<()>) {
        let metrics = self.table.upgrade().map(|table| table.metrics.clone());
        let mut state = self.state.write();
        match result {
            Ok(()) => {
                state.download_state = DownloadState::Complete;
                if let Some(metrics) = metrics {
                    metrics.counter(TILES_COMPLETED).inc();
                }
            }
            Err(err) => {
                state.download_state = DownloadState::Failed;
                state.error = Some(err.clone());
                if let Some(metrics) = metrics {
                    metrics.counter(TILES_FAILED).inc();
                }
                log::debug!("Tile {} failed: {}", self.key, err);
            }
        }
    }

    fn install(&self, decoded: DecodedTile) -> DeeptableResult<()> {
        let DecodedTile { batch, metadata } = decoded;

        let Some(extent) = metadata.extent.or_else(|| self.extent()) else {
            deeptable_bail!(MalformedManifest: "tile {} has no extent", self.key);
        };
        if let Some(children) = &metadata.children {
            if let Some(stray) = children.iter().find(|child| !child.is_child_of(&self.key)) {
                deeptable_bail!(
                    MalformedManifest: "tile {} lists {} as a child",
                    self.key,
                    stray
                );
            }
        }
        let ix_range = match batch.column_by_name(IX_COLUMN) {
            Some(column) => {
                let ixs = ix_values(column)?;
                if !ixs.is_sorted() {
                    deeptable_bail!(
                        MalformedManifest: "the {} column of tile {} is not sorted",
                        IX_COLUMN,
                        self.key
                    );
                }
                ixs.first().copied().zip(ixs.last().copied())
            }
            None => None,
        };

        let max_ix = {
            let mut state = self.state.write();
            state.extent = Some(extent);
            // Children listed in the file win over a manifest; no information means a leaf.
            let known_children = state.children.take();
            state.children = metadata
                .children
                .or(known_children)
                .or(Some(Vec::new()));
            state.sidecars = metadata.sidecars;
            state.total_points = metadata.total_points;
            if let Some((min_ix, max_ix)) = ix_range {
                state.min_ix = Some(min_ix);
                state.max_ix = Some(max_ix);
            }
            state.n_points = Some(batch.num_rows() as u64);
            state.batch = Some(batch);
            state.version += 1;
            state.max_ix
        };
        if let Some(max_ix) = max_ix {
            self.bubble_highest_ix(max_ix);
        }
        Ok(())
    }

    /// Record `ix` as known in this tile and every ancestor.
    fn bubble_highest_ix(&self, ix: u64) {
        self.highest_known_ix.fetch_max(ix, Ordering::AcqRel);
        let mut ancestor = self.parent();
        while let Some(tile) = ancestor {
            tile.highest_known_ix.fetch_max(ix, Ordering::AcqRel);
            ancestor = tile.parent();
        }
    }

    /// Overwrite the tile's metadata with a manifest entry.
    pub(crate) fn apply_manifest(&self, manifest: &TileManifest) {
        {
            let mut state = self.state.write();
            state.min_ix = Some(manifest.min_ix);
            state.max_ix = Some(manifest.max_ix);
            state.extent = Some(manifest.extent);
            state.n_points = Some(manifest.n_points);
            if let Some(children) = &manifest.children {
                state.children = Some(children.iter().map(|child| child.key).collect());
            }
        }
        self.bubble_highest_ix(manifest.max_ix);
    }

    /// Replace the extent, for example with a caller supplied root extent.
    pub(crate) fn set_extent(&self, extent: Rectangle) {
        self.state.write().extent = Some(extent);
    }

    /// Return a column, downloading the tile and evaluating a transformation or fetching a
    /// sidecar file if needed.
    pub async fn get_column(self: &Arc<Self>, name: &str) -> DeeptableResult<ArrayRef> {
        self.download().await?;
        if let Some(column) = self.column(name) {
            return Ok(column);
        }
        self.apply_transformation(name).await
    }

    /// Evaluate the registered transformation (or sidecar) `name` on this tile.
    ///
    /// Evaluation happens at most once per tile: concurrent and later callers share the same
    /// result, including a failure.
    pub async fn apply_transformation(self: &Arc<Self>, name: &str) -> DeeptableResult<ArrayRef> {
        self.column_future(name)?.await.unshare()
    }

    fn column_future(self: &Arc<Self>, name: &str) -> DeeptableResult<SharedColumnFuture> {
        if let Some(future) = self.columns.get(name) {
            return Ok(future.value().clone());
        }

        let table = upgrade(&self.table)?;
        let selection = table
            .selections
            .get(name)
            .map(|selection| selection.value().clone());
        let source = match (selection, table.transformation(name)) {
            (Some(selection), _) => ColumnSource::Selection(selection),
            (None, Some(transformation)) => ColumnSource::Transformation(transformation),
            (None, None) => match self.state.read().sidecars.get(name) {
                Some(suffix) => ColumnSource::Sidecar(suffix.clone()),
                None => deeptable_bail!(
                    ColumnNotFound: "tile {} has no column or transformation named {}",
                    self.key,
                    name
                ),
            },
        };

        let name: Arc<str> = name.into();
        Ok(self
            .columns
            .entry(name.clone())
            .or_insert_with(|| {
                let tile = self.clone();
                async move { tile.evaluate(name, source).await }
                    .map_err(Arc::new)
                    .boxed()
                    .shared()
            })
            .value()
            .clone())
    }

    async fn evaluate(
        self: Arc<Self>,
        name: Arc<str>,
        source: ColumnSource,
    ) -> DeeptableResult<ArrayRef> {
        self.download().await?;
        let table = upgrade(&self.table)?;
        let mut pending_count = None;
        let evaluated = match source {
            ColumnSource::Transformation(transformation) => transformation(self.clone()).await,
            ColumnSource::Selection(selection) => selection
                .evaluate_tile(self.clone())
                .await
                .map(|(array, count)| {
                    pending_count = Some((selection.clone(), count));
                    array
                }),
            ColumnSource::Sidecar(suffix) => self.fetch_sidecar(&table, &name, &suffix).await,
        };
        let array = match evaluated.and_then(|array| {
            self.attach_column(&name, array.clone())?;
            Ok(array)
        }) {
            Ok(array) => array,
            Err(err) => {
                table.metrics.counter(TRANSFORMATIONS_FAILED).inc();
                log::warn!("Column {} failed on tile {}: {}", name, self.key, err);
                return Err(err.with_context(format!("evaluating {} on tile {}", name, self.key)));
            }
        };
        // Selection counters only cover tiles that hold the column.
        if let Some((selection, count)) = pending_count {
            selection.commit_tile(&self, count);
        }
        table.metrics.counter(TRANSFORMATIONS_EVALUATED).inc();
        Ok(array)
    }

    async fn fetch_sidecar(
        &self,
        table: &TableShared,
        name: &str,
        suffix: &str,
    ) -> DeeptableResult<ArrayRef> {
        let endpoint = table.endpoint(&self.key, Some(suffix));
        log::debug!("Fetching sidecar column {} from {}", name, endpoint);
        let bytes = table
            .proxy
            .api_call(ApiRequest::get(endpoint.clone()))
            .await
            .map_err(|e| fetch_failure(&endpoint, e))?;
        let decoded = decode_tile(bytes)?;
        table.metrics.counter(SIDECARS_FETCHED).inc();
        decoded
            .batch
            .column_by_name(name)
            .cloned()
            .ok_or_else(|| deeptable_err!(ColumnNotFound: "sidecar {} has no column {}", endpoint, name))
    }

    /// Add or replace a column. The previous batch is left untouched.
    pub fn attach_column(&self, name: &str, array: ArrayRef) -> DeeptableResult<()> {
        let mut state = self.state.write();
        let Some(batch) = state.batch.as_ref() else {
            deeptable_bail!("cannot attach {} to tile {} before it is downloaded", name, self.key);
        };
        if array.len() != batch.num_rows() {
            deeptable_bail!(
                "column {} has {} rows but tile {} has {}",
                name,
                array.len(),
                self.key,
                batch.num_rows()
            );
        }

        let schema = batch.schema();
        let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
        let mut columns = batch.columns().to_vec();
        let field = Arc::new(Field::new(name, array.data_type().clone(), true));
        match schema.index_of(name) {
            Ok(idx) => {
                fields[idx] = field;
                columns[idx] = array;
            }
            Err(_) => {
                fields.push(field);
                columns.push(array);
            }
        }
        let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
        state.batch = Some(RecordBatch::try_new(schema, columns)?);
        state.version += 1;
        Ok(())
    }

    /// Drop a column from the batch. Returns false if there was no such column.
    pub fn remove_column(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let Some(batch) = state.batch.as_ref() else {
            return false;
        };
        let Ok(idx) = batch.schema().index_of(name) else {
            return false;
        };
        let mut next = batch.clone();
        next.remove_column(idx);
        state.batch = Some(next);
        state.version += 1;
        true
    }

    /// Forget a derived column entirely: its memoized evaluation and its data.
    pub(crate) fn forget_column(&self, name: &str) -> bool {
        let memoized = self.columns.remove(name).is_some();
        self.remove_column(name) || memoized
    }

    /// Drop the memoized evaluation of `name` if it failed, so the next request runs it again.
    pub(crate) fn reset_failed_column(&self, name: &str) -> bool {
        self.columns
            .remove_if(name, |_, future| matches!(future.peek(), Some(Err(_))))
            .is_some()
    }
}

impl Debug for Tile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("download_state", &state.download_state)
            .field("min_ix", &state.min_ix)
            .field("max_ix", &state.max_ix)
            .field("rows", &state.batch.as_ref().map(RecordBatch::num_rows))
            .field("version", &state.version)
            .finish()
    }
}
