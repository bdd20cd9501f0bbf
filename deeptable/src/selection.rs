//! Named boolean selections.
//!
//! A [`DataSelection`] is registered on a [`Deeptable`][crate::Deeptable] as a boolean
//! column of the same name. A tile commits its match count only once the selection column has
//! been attached, so the running totals only ever cover tiles that hold the column.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use arrow_array::cast::AsArray;
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use arrow_select::concat::concat_batches;
use arrow_select::filter::filter_record_batch;
use deeptable_error::{DeeptableResult, deeptable_bail, deeptable_err};
use deeptable_mask::Bitmask;
use futures::FutureExt;
use futures::channel::mpsc;
use futures::future::{BoxFuture, try_join_all};
use itertools::Itertools;
use parking_lot::Mutex;

use crate::coerce::ix_values;
use crate::composition::Composition;
use crate::table::{TableShared, upgrade};
use crate::{IX_COLUMN, Tile, Tix};

/// Computes the selection mask of one tile.
pub type TileSelector =
    Arc<dyn Fn(Arc<Tile>) -> BoxFuture<'static, DeeptableResult<Bitmask>> + Send + Sync>;

/// What a selection is defined by.
#[derive(Clone)]
pub enum SelectionSource {
    /// A boolean expression over other selections.
    Composition(Composition),
    /// An existing boolean column, which may itself be a transformation.
    BooleanColumn(String),
    /// The rows whose `ix` is listed. Sorted and deduplicated.
    Ixes(Arc<[u64]>),
    TileFunction(TileSelector),
}

impl SelectionSource {
    pub fn ixes(mut ixes: Vec<u64>) -> Self {
        ixes.sort_unstable();
        ixes.dedup();
        SelectionSource::Ixes(ixes.into())
    }

    pub fn tile_function<F>(f: F) -> Self
    where
        F: Fn(Arc<Tile>) -> BoxFuture<'static, DeeptableResult<Bitmask>> + Send + Sync + 'static,
    {
        SelectionSource::TileFunction(Arc::new(f))
    }

    /// Whether two sources define the same selection. Tile functions are only equal to
    /// themselves.
    pub fn same_definition(&self, other: &SelectionSource) -> bool {
        match (self, other) {
            (SelectionSource::Composition(a), SelectionSource::Composition(b)) => a == b,
            (SelectionSource::BooleanColumn(a), SelectionSource::BooleanColumn(b)) => a == b,
            (SelectionSource::Ixes(a), SelectionSource::Ixes(b)) => a == b,
            (SelectionSource::TileFunction(a), SelectionSource::TileFunction(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The columns this source reads, other than `ix`.
    pub fn dependencies(&self) -> Vec<Arc<str>> {
        match self {
            SelectionSource::Composition(composition) => composition.leaves(),
            SelectionSource::BooleanColumn(name) => vec![name.as_str().into()],
            SelectionSource::Ixes(_) | SelectionSource::TileFunction(_) => Vec::new(),
        }
    }

    async fn evaluate(&self, tile: Arc<Tile>) -> DeeptableResult<Bitmask> {
        match self {
            SelectionSource::Composition(composition) => composition.evaluate(tile).await,
            SelectionSource::BooleanColumn(name) => {
                let column = tile.get_column(name).await?;
                let Some(bools) = column.as_boolean_opt() else {
                    deeptable_bail!("column {} is not boolean", name);
                };
                Ok(Bitmask::from_boolean_array(bools))
            }
            SelectionSource::Ixes(ixes) => {
                let column = tile.get_column(IX_COLUMN).await?;
                let values = ix_values(&column)?;
                Ok(Bitmask::from_fn(values.len(), |idx| {
                    ixes.binary_search(&values[idx]).is_ok()
                }))
            }
            SelectionSource::TileFunction(f) => f(tile).await,
        }
    }
}

impl Debug for SelectionSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionSource::Composition(composition) => {
                f.debug_tuple("Composition").field(&composition.to_string()).finish()
            }
            SelectionSource::BooleanColumn(name) => f.debug_tuple("BooleanColumn").field(name).finish(),
            SelectionSource::Ixes(ixes) => f.debug_tuple("Ixes").field(&ixes.len()).finish(),
            SelectionSource::TileFunction(_) => f.write_str("TileFunction"),
        }
    }
}

/// The committed counters of a selection right after one tile was evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionProgress {
    pub name: Arc<str>,
    pub tix: Tix,
    pub tile_matches: usize,
    /// Matching rows over every evaluated tile.
    pub selection_size: usize,
    /// Rows over every evaluated tile.
    pub evaluation_set_size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TileCount {
    pub(crate) matches: usize,
    pub(crate) rows: usize,
}

#[derive(Default)]
struct SelectionState {
    per_tile: BTreeMap<Tix, TileCount>,
    cursor: usize,
}

impl SelectionState {
    fn selection_size(&self) -> usize {
        self.per_tile.values().map(|count| count.matches).sum()
    }

    fn evaluation_set_size(&self) -> usize {
        self.per_tile.values().map(|count| count.rows).sum()
    }
}

pub struct DataSelection {
    name: Arc<str>,
    source: SelectionSource,
    table: Weak<TableShared>,
    state: Mutex<SelectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SelectionProgress>>>,
}

impl DataSelection {
    pub(crate) fn new(name: Arc<str>, source: SelectionSource, table: Weak<TableShared>) -> Self {
        Self {
            name,
            source,
            table,
            state: Default::default(),
            subscribers: Default::default(),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn source(&self) -> &SelectionSource {
        &self.source
    }

    /// Compute the mask column for one tile. Counters are left alone until [`Self::commit_tile`].
    pub(crate) async fn evaluate_tile(
        &self,
        tile: Arc<Tile>,
    ) -> DeeptableResult<(ArrayRef, TileCount)> {
        let mask = self.source.evaluate(tile.clone()).await?;
        let rows = tile.num_rows().unwrap_or(0);
        if mask.len() != rows {
            deeptable_bail!(
                "selection {} produced {} values for tile {} with {} rows",
                self.name,
                mask.len(),
                tile.key(),
                rows
            );
        }

        let count = TileCount {
            matches: mask.true_count(),
            rows,
        };
        Ok((Arc::new(mask.to_boolean_array()), count))
    }

    /// Record the counters of a tile that now holds the selection column, and notify
    /// subscribers. Runs inside the memoized column evaluation, so each tile is counted once.
    pub(crate) fn commit_tile(&self, tile: &Tile, count: TileCount) {
        let progress = {
            let mut state = self.state.lock();
            state.per_tile.insert(tile.tix(), count);
            SelectionProgress {
                name: self.name.clone(),
                tix: tile.tix(),
                tile_matches: count.matches,
                selection_size: state.selection_size(),
                evaluation_set_size: state.evaluation_set_size(),
            }
        };
        log::trace!(
            "Selection {} matched {} of {} rows on tile {}",
            self.name,
            count.matches,
            count.rows,
            tile.key()
        );
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.unbounded_send(progress.clone()).is_ok());
    }

    /// Matching rows per evaluated tile.
    pub fn match_counts(&self) -> BTreeMap<Tix, usize> {
        self.state
            .lock()
            .per_tile
            .iter()
            .map(|(tix, count)| (*tix, count.matches))
            .collect()
    }

    pub fn selection_size(&self) -> usize {
        self.state.lock().selection_size()
    }

    pub fn evaluation_set_size(&self) -> usize {
        self.state.lock().evaluation_set_size()
    }

    /// A stream of progress snapshots, one per evaluated tile from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SelectionProgress> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Evaluate the selection on every tile downloaded so far.
    pub async fn apply_to_all_loaded_tiles(&self) -> DeeptableResult<()> {
        let table = upgrade(&self.table)?;
        let name = self.name.clone();
        try_join_all(
            table
                .loaded_tiles()
                .into_iter()
                .map(|tile| {
                    let name = name.clone();
                    async move { tile.get_column(&name).await }.boxed()
                }),
        )
        .await?;
        Ok(())
    }

    /// The loaded tiles whose selection column has been materialized, with their masks, in tix
    /// order.
    fn materialized(&self) -> DeeptableResult<Vec<(Arc<Tile>, Bitmask)>> {
        let table = upgrade(&self.table)?;
        Ok(table
            .loaded_tiles()
            .into_iter()
            .filter_map(|tile| {
                let column = tile.column(&self.name)?;
                let mask = Bitmask::from_boolean_array(column.as_boolean_opt()?);
                Some((tile, mask))
            })
            .collect())
    }

    /// The matching rows of every materialized tile, restricted to `fields`, as one batch.
    pub fn export(&self, fields: &[&str]) -> DeeptableResult<RecordBatch> {
        let batches: Vec<RecordBatch> = self
            .materialized()?
            .into_iter()
            .filter_map(|(tile, mask)| tile.batch().map(|batch| (tile, batch, mask)))
            .map(|(tile, batch, mask)| -> DeeptableResult<RecordBatch> {
                let indices = fields
                    .iter()
                    .map(|field| {
                        batch.schema().index_of(field).map_err(|_| {
                            deeptable_err!(
                                ColumnNotFound: "tile {} has no column named {}",
                                tile.key(),
                                field
                            )
                        })
                    })
                    .collect::<DeeptableResult<Vec<_>>>()?;
                let projected = batch.project(&indices)?;
                Ok(filter_record_batch(&projected, &mask.to_boolean_array())?)
            })
            .collect::<DeeptableResult<_>>()?;

        let Some(first) = batches.first() else {
            let schema = Schema::new(
                fields
                    .iter()
                    .map(|field| Field::new(*field, DataType::Null, true))
                    .collect_vec(),
            );
            return Ok(RecordBatch::new_empty(Arc::new(schema)));
        };
        let schema = first.schema();
        Ok(concat_batches(&schema, &batches)?)
    }

    /// The `n`th materialized match in tix order, as a one-row batch.
    fn nth_match(&self, mut n: usize) -> DeeptableResult<Option<RecordBatch>> {
        for (tile, mask) in self.materialized()? {
            let count = mask.true_count();
            if n < count {
                let Some(row) = mask.nth_set(n) else {
                    return Ok(None);
                };
                return Ok(tile.batch().map(|batch| batch.slice(row, 1)));
            }
            n -= count;
        }
        Ok(None)
    }

    fn materialized_matches(&self) -> DeeptableResult<usize> {
        Ok(self
            .materialized()?
            .iter()
            .map(|(_, mask)| mask.true_count())
            .sum())
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn reset_cursor(&self) {
        self.state.lock().cursor = 0;
    }

    /// The row under the cursor, `None` while nothing matches.
    pub fn current(&self) -> DeeptableResult<Option<RecordBatch>> {
        self.nth_match(self.cursor())
    }

    /// Move the cursor to the next match, wrapping around, and return it.
    pub fn advance(&self) -> DeeptableResult<Option<RecordBatch>> {
        self.step(true)
    }

    /// Move the cursor to the previous match, wrapping around, and return it.
    pub fn retreat(&self) -> DeeptableResult<Option<RecordBatch>> {
        self.step(false)
    }

    fn step(&self, forward: bool) -> DeeptableResult<Option<RecordBatch>> {
        let total = self.materialized_matches()?;
        if total == 0 {
            return Ok(None);
        }
        let cursor = {
            let mut state = self.state.lock();
            let current = state.cursor.min(total - 1);
            state.cursor = if forward {
                (current + 1) % total
            } else {
                (current + total - 1) % total
            };
            state.cursor
        };
        self.nth_match(cursor)
    }
}

impl Debug for DataSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataSelection")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("selection_size", &state.selection_size())
            .field("evaluation_set_size", &state.evaluation_set_size())
            .field("cursor", &state.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ix_sources_are_normalized() {
        let source = SelectionSource::ixes(vec![5, 1, 3, 1]);
        let SelectionSource::Ixes(ixes) = &source else {
            unreachable!()
        };
        assert_eq!(ixes.as_ref(), &[1, 3, 5]);
        assert!(source.same_definition(&SelectionSource::ixes(vec![3, 5, 1])));
    }

    #[test]
    fn definitions_compare_by_kind() {
        let composition: Composition = r#"["NOT", "a"]"#.parse().unwrap();
        let a = SelectionSource::Composition(composition.clone());
        assert!(a.same_definition(&SelectionSource::Composition(composition)));
        assert!(!a.same_definition(&SelectionSource::BooleanColumn("a".to_string())));

        let f = SelectionSource::tile_function(|tile| {
            async move { Ok(Bitmask::new_true(tile.num_rows().unwrap_or(0))) }.boxed()
        });
        let g = SelectionSource::tile_function(|tile| {
            async move { Ok(Bitmask::new_true(tile.num_rows().unwrap_or(0))) }.boxed()
        });
        assert!(f.same_definition(&f.clone()));
        assert!(!f.same_definition(&g));
    }

    #[test]
    fn dependencies_follow_the_source() {
        let composition: Composition = r#"["AND", "a", "b"]"#.parse().unwrap();
        assert_eq!(
            SelectionSource::Composition(composition).dependencies(),
            vec![Arc::<str>::from("a"), Arc::<str>::from("b")]
        );
        assert!(SelectionSource::ixes(vec![1]).dependencies().is_empty());
    }

    #[test]
    fn counters_start_empty() {
        let selection = DataSelection::new("s".into(), SelectionSource::ixes(vec![]), Weak::new());
        assert_eq!(selection.selection_size(), 0);
        assert_eq!(selection.evaluation_set_size(), 0);
        assert!(selection.match_counts().is_empty());
        assert!(selection.current().is_err());
    }
}
