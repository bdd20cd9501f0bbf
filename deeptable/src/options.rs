use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use deeptable_error::{DeeptableResult, deeptable_bail};
use deeptable_io::TileProxy;

use crate::Rectangle;
use crate::manifest::TileManifest;
use crate::metrics::DeeptableMetrics;
use crate::scheduler::DEFAULT_MAX_CONCURRENT_DOWNLOADS;

pub const DEFAULT_EXTENSION: &str = "feather";
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Everything needed to open a [`Deeptable`][crate::Deeptable].
///
/// ```ignore
/// let options = DeeptableOptions::new(proxy)
///     .with_base_url("tiles")
///     .with_max_concurrent_downloads(24)?;
/// let table = Deeptable::try_new(options)?;
/// ```
#[derive(Clone)]
pub struct DeeptableOptions {
    proxy: Arc<dyn TileProxy>,
    base_url: String,
    extension: String,
    manifest: Option<TileManifest>,
    extent: Option<Rectangle>,
    max_concurrent_downloads: usize,
    flush_interval: Duration,
    metrics: DeeptableMetrics,
}

impl DeeptableOptions {
    pub fn new(proxy: Arc<dyn TileProxy>) -> Self {
        Self {
            proxy,
            base_url: String::new(),
            extension: DEFAULT_EXTENSION.to_string(),
            manifest: None,
            extent: None,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            metrics: DeeptableMetrics::default(),
        }
    }

    /// The prefix of every tile endpoint, without a trailing slash.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The file extension of tile files, `feather` by default.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Describe the tree up front, so index ranges and extents are known before download.
    pub fn with_manifest(mut self, manifest: TileManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Override the extent of the root tile.
    pub fn with_extent(mut self, extent: Rectangle) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Bound the number of downloads queued or in flight. Values between 8 and 32 work well.
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> DeeptableResult<Self> {
        if max == 0 {
            deeptable_bail!("at least one concurrent download is required");
        }
        self.max_concurrent_downloads = max;
        Ok(self)
    }

    /// How often the background scheduler launches queued downloads.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Report into an existing registry instead of a fresh one.
    pub fn with_metrics(mut self, metrics: DeeptableMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn proxy(&self) -> &Arc<dyn TileProxy> {
        &self.proxy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn manifest(&self) -> Option<&TileManifest> {
        self.manifest.as_ref()
    }

    pub fn extent(&self) -> Option<Rectangle> {
        self.extent
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn metrics(&self) -> &DeeptableMetrics {
        &self.metrics
    }
}

impl Debug for DeeptableOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeeptableOptions")
            .field("base_url", &self.base_url)
            .field("extension", &self.extension)
            .field("manifest", &self.manifest.as_ref().map(TileManifest::tile_count))
            .field("extent", &self.extent)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}
