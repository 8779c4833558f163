#![cfg_attr(not(test), no_std)]

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

/// Renders an error followed by its chain of sources.
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        let mut index = 0;
        while let Some(s) = source {
            if index == 0 {
                write!(f, " (caused by: ")?;
            } else {
                write!(f, "; ")?;
            }
            write!(f, "{index}: {s}")?;
            source = s.source();
            index += 1;
        }
        if index > 0 {
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }

    pub fn into_inner(self) -> E {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use snafu::{ResultExt as _, Snafu};

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("inner failure"))]
    struct InnerError {
        #[snafu(implicit)]
        location: Location,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("outer failure"))]
    struct OuterError {
        #[snafu(implicit)]
        location: Location,
        source: InnerError,
    }

    fn fail() -> Result<(), OuterError> {
        InnerSnafu.fail().context(OuterSnafu)
    }

    #[test]
    fn test_report_renders_chain() {
        let err = fail().unwrap_err();
        let rendered = Report::new(&err).to_string();
        assert_eq!(rendered, "outer failure (caused by: 0: inner failure)");
    }

    #[test]
    fn test_report_without_source() {
        let err = InnerSnafu.build();
        assert_eq!(Report::new(err).to_string(), "inner failure");
    }

    #[test]
    fn test_location_points_at_caller() {
        let err = InnerSnafu.build();
        assert!(err.location.file().ends_with("lib.rs"));
        assert!(err.location.line() > 0);
    }
}
