//! Named, lazily evaluated column derivations.

use std::future::Future;
use std::sync::Arc;

use arrow_array::{ArrayRef, Float32Array};
use dashmap::{DashMap, Entry};
use deeptable_error::{DeeptableResult, deeptable_bail};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use itertools::Itertools;

use crate::Tile;
use crate::coerce::to_f64_values;

/// Computes one column for one tile. Registered on a [`Deeptable`][crate::Deeptable] by name
/// and evaluated at most once per tile.
pub type Transformation =
    Arc<dyn Fn(Arc<Tile>) -> BoxFuture<'static, DeeptableResult<ArrayRef>> + Send + Sync>;

/// Wrap an async function as a [`Transformation`].
pub fn transformation<F, Fut>(f: F) -> Transformation
where
    F: Fn(Arc<Tile>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeeptableResult<ArrayRef>> + Send + 'static,
{
    Arc::new(move |tile| f(tile).boxed())
}

/// Vectorize a per-row function over a tile.
///
/// The prerequisite columns are fetched (and, if they are themselves derived, evaluated) first.
/// `per_row` then receives one value per prerequisite, in order, coerced to `f64`, and the
/// results form a `Float32` column.
pub fn row_transformation<F>(per_row: F, prerequisites: Vec<String>) -> Transformation
where
    F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
{
    let per_row = Arc::new(per_row);
    let prerequisites: Arc<[String]> = prerequisites.into();
    Arc::new(move |tile: Arc<Tile>| {
        let per_row = per_row.clone();
        let prerequisites = prerequisites.clone();
        async move {
            let columns =
                try_join_all(prerequisites.iter().map(|name| tile.get_column(name))).await?;
            let values: Vec<Vec<f64>> = columns
                .iter()
                .map(|column| to_f64_values(column))
                .try_collect()?;
            let num_rows = tile.num_rows().unwrap_or(0);
            Ok(Arc::new(evaluate_rows(per_row.as_ref(), &values, num_rows)) as ArrayRef)
        }
        .boxed()
    })
}

#[allow(clippy::cast_possible_truncation)]
fn evaluate_rows(
    per_row: &(dyn Fn(&[f64]) -> f64 + Send + Sync),
    values: &[Vec<f64>],
    num_rows: usize,
) -> Float32Array {
    let mut row = vec![0.0; values.len()];
    Float32Array::from_iter_values((0..num_rows).map(|idx| {
        for (slot, column) in row.iter_mut().zip(values) {
            *slot = column[idx];
        }
        per_row(&row) as f32
    }))
}

/// The set of transformations registered on a table.
#[derive(Default)]
pub(crate) struct TransformationRegistry {
    entries: DashMap<Arc<str>, Transformation>,
}

impl TransformationRegistry {
    pub(crate) fn insert(&self, name: &str, transformation: Transformation) -> DeeptableResult<()> {
        match self.entries.entry(name.into()) {
            Entry::Occupied(_) => deeptable_bail!(
                DuplicateColumn: "a transformation named {} is already registered",
                name
            ),
            Entry::Vacant(entry) => {
                entry.insert(transformation);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Transformation> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Transformation> {
        self.entries.remove(name).map(|(_, transformation)| transformation)
    }

    pub(crate) fn names(&self) -> Vec<Arc<str>> {
        self.entries
            .iter()
            .map(|entry| entry.key().clone())
            .sorted()
            .collect()
    }
}
