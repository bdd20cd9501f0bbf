#![deny(missing_docs)]

//! Error handling for the Deeptable crates.
//!
//! Every fallible operation returns a [`DeeptableResult`]. Errors raised inside memoized, shared
//! futures are wrapped in an [`Arc`] so that every awaiter observes the same failure, see
//! [`SharedDeeptableResult`].

mod ext;

use std::backtrace::Backtrace;
// Same type as `Backtrace`; the alias keeps thiserror from treating the field as a
// nightly-only `provide` source.
use std::backtrace::Backtrace as CapturedBacktrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use std::{env, fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    #[allow(clippy::panic)]
    fn from(msg: T) -> Self {
        if env::var("DEEPTABLE_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for Deeptable.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum DeeptableError {
    /// A tile (or sidecar) could not be fetched or decoded. Terminal for that tile.
    #[error("fetch failure: {0}\nBacktrace:\n{1}")]
    FetchFailure(ErrString, CapturedBacktrace),
    /// A column is neither present in a tile nor derivable by a registered transformation.
    #[error("column not found: {0}\nBacktrace:\n{1}")]
    ColumnNotFound(ErrString, CapturedBacktrace),
    /// A column or selection name is already registered with a different definition.
    #[error("duplicate column: {0}\nBacktrace:\n{1}")]
    DuplicateColumn(ErrString, CapturedBacktrace),
    /// Tile or manifest metadata is missing required fields or cannot be parsed.
    #[error("malformed manifest: {0}\nBacktrace:\n{1}")]
    MalformedManifest(ErrString, CapturedBacktrace),
    /// A selection composition expression is invalid.
    #[error("composition parse error: {0}\nBacktrace:\n{1}")]
    CompositionParse(ErrString, CapturedBacktrace),
    /// An invalid argument was provided.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, CapturedBacktrace),
    /// A buffer arena could not satisfy an allocation.
    #[error("allocation failure: {0}\nBacktrace:\n{1}")]
    Allocation(ErrString, CapturedBacktrace),
    /// An error shared between several awaiters of a memoized future.
    #[error(transparent)]
    Shared(Arc<DeeptableError>),
    /// An error annotated with additional context.
    #[error("{0}: {1}")]
    Context(ErrString, #[source] Box<DeeptableError>),
    /// A wrapper for errors from the Arrow library.
    #[error(transparent)]
    ArrowError(#[from] arrow_schema::ArrowError),
    /// A wrapper for IO errors.
    #[error(transparent)]
    IOError(#[from] io::Error),
    /// A wrapper for JSON (de)serialization errors.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    JSONError(#[from] serde_json::Error),
    /// A wrapper for errors from the object store library.
    #[cfg(feature = "object_store")]
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
    /// A wrapper for errors from joining a spawned tokio task.
    #[cfg(feature = "tokio")]
    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

impl DeeptableError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        DeeptableError::Context(msg.into(), Box::new(self))
    }

    /// Returns the innermost error, looking through shared and context wrappers.
    pub fn root(&self) -> &DeeptableError {
        match self {
            DeeptableError::Shared(inner) => inner.root(),
            DeeptableError::Context(_, inner) => inner.root(),
            other => other,
        }
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::FetchFailure`].
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self.root(), DeeptableError::FetchFailure(..))
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::ColumnNotFound`].
    pub fn is_column_not_found(&self) -> bool {
        matches!(self.root(), DeeptableError::ColumnNotFound(..))
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::DuplicateColumn`].
    pub fn is_duplicate_column(&self) -> bool {
        matches!(self.root(), DeeptableError::DuplicateColumn(..))
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::MalformedManifest`].
    pub fn is_malformed_manifest(&self) -> bool {
        matches!(self.root(), DeeptableError::MalformedManifest(..))
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::CompositionParse`].
    pub fn is_composition_parse(&self) -> bool {
        matches!(self.root(), DeeptableError::CompositionParse(..))
    }

    /// Whether this error, or the error it wraps, is a [`DeeptableError::InvalidArgument`].
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.root(), DeeptableError::InvalidArgument(..))
    }
}

impl Debug for DeeptableError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<Arc<DeeptableError>> for DeeptableError {
    fn from(value: Arc<DeeptableError>) -> Self {
        Self::from(&value)
    }
}

impl From<&Arc<DeeptableError>> for DeeptableError {
    fn from(e: &Arc<DeeptableError>) -> Self {
        if let DeeptableError::Shared(e_inner) = e.as_ref() {
            // don't re-wrap
            DeeptableError::Shared(Arc::clone(e_inner))
        } else {
            DeeptableError::Shared(Arc::clone(e))
        }
    }
}

/// A type alias for Results that return [`DeeptableError`]s as their error type.
pub type DeeptableResult<T> = Result<T, DeeptableError>;

/// A type alias for the results of shared futures, where every awaiter holds the same error.
pub type SharedDeeptableResult<T> = Result<T, Arc<DeeptableError>>;

/// A trait for unwrapping a value, panicking with a message that includes the error.
pub trait DeeptableExpect {
    /// The type of the value being unwrapped.
    type Output;

    /// Returns the value of the result if it is successful, otherwise panics with the error.
    /// Should only be used in cases where the error is impossible.
    fn deeptable_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> DeeptableExpect for Result<T, E>
where
    E: Into<DeeptableError>,
{
    type Output = T;

    #[inline(always)]
    #[allow(clippy::panic)]
    fn deeptable_expect(self, msg: &str) -> Self::Output {
        self.map_err(|err| err.into())
            .unwrap_or_else(|e| deeptable_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> DeeptableExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    #[allow(clippy::panic)]
    fn deeptable_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err = DeeptableError::InvalidArgument(msg.to_string().into(), Backtrace::capture());
            deeptable_panic!(err)
        })
    }
}

/// Construct a [`DeeptableError`], defaulting to [`DeeptableError::InvalidArgument`].
///
/// ```
/// use deeptable_error::deeptable_err;
///
/// let err = deeptable_err!(ColumnNotFound: "no column named {}", "x");
/// assert!(err.is_column_not_found());
/// ```
#[macro_export]
macro_rules! deeptable_err {
    (Context: $msg:literal, $err:expr) => {{
        $crate::__private::must_use(
            $crate::DeeptableError::Context($msg.into(), Box::new($err))
        )
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::DeeptableError::$variant(format!($fmt, $($arg),*).into(), Backtrace::capture())
        )
    }};
    ($variant:ident: $err:expr $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::DeeptableError::$variant($err.into(), Backtrace::capture())
        )
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::deeptable_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// Return early from a function with a [`DeeptableError`].
#[macro_export]
macro_rules! deeptable_bail {
    ($($tt:tt)+) => {
        return Err($crate::deeptable_err!($($tt)+))
    };
}

/// Panic with a [`DeeptableError`], for conditions that indicate a programming error.
#[macro_export]
macro_rules! deeptable_panic {
    (Context: $msg:literal, $err:expr) => {{
        $crate::deeptable_panic!($crate::deeptable_err!(Context: $msg, $err))
    }};
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::deeptable_panic!($crate::deeptable_err!($variant: $fmt, $($arg),*))
    };
    ($err:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err: $crate::DeeptableError = $err;
        panic!("{}", err.with_context(format!($fmt, $($arg),*)))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::deeptable_panic!($crate::deeptable_err!($fmt, $($arg),*))
    };
    ($err:expr) => {{
        let err: $crate::DeeptableError = $err;
        panic!("{}", err)
    }};
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[cold]
    #[must_use]
    pub const fn must_use(error: crate::DeeptableError) -> crate::DeeptableError {
        error
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn shared_errors_are_not_rewrapped() {
        let err = Arc::new(deeptable_err!(FetchFailure: "tile {} unavailable", "0/0/0"));
        let shared = DeeptableError::from(&err);
        let again = DeeptableError::from(Arc::new(shared));
        match again {
            DeeptableError::Shared(inner) => assert!(Arc::ptr_eq(&inner, &err)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn root_looks_through_wrappers() {
        let err = deeptable_err!(MalformedManifest: "missing extent")
            .with_context("decoding tile 1/0/0");
        assert!(err.is_malformed_manifest());
        assert!(!err.is_fetch_failure());
        assert!(err.to_string().contains("decoding tile 1/0/0"));
    }

    #[test]
    fn bail_returns_invalid_argument() {
        fn fails() -> DeeptableResult<()> {
            deeptable_bail!("bad value {}", 3)
        }
        assert!(matches!(
            fails().unwrap_err(),
            DeeptableError::InvalidArgument(..)
        ));
    }
}
