use crate::{DeeptableError, DeeptableResult, SharedDeeptableResult};

/// Extension trait for nested and shared [`DeeptableResult`]s.
pub trait ResultExt<T>: private::Sealed {
    /// Flatten a nested result into a single [`DeeptableResult`].
    fn unnest(self) -> DeeptableResult<T>;
}

mod private {
    use crate::DeeptableResult;

    pub trait Sealed {}

    impl<T, E> Sealed for Result<DeeptableResult<T>, E> {}
}

impl<T, E> ResultExt<T> for Result<DeeptableResult<T>, E>
where
    E: Into<DeeptableError>,
{
    fn unnest(self) -> DeeptableResult<T> {
        match self {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extension trait for results of memoized, shared futures.
pub trait SharedResultExt<T> {
    /// Convert the shared error into an owned [`DeeptableError::Shared`].
    fn unshare(self) -> DeeptableResult<T>;
}

impl<T> SharedResultExt<T> for SharedDeeptableResult<T> {
    fn unshare(self) -> DeeptableResult<T> {
        self.map_err(DeeptableError::from)
    }
}
