use std::error::Error;
use std::fmt;

use tracing_error::{SpanTrace, SpanTraceStatus};

/// Boxed error returned by external collaborators such as discovery clients.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Error wrapper used by every fallible toolgate module.
///
/// `kind` says what went wrong, `context` records the tracing spans that were
/// active when the error was created, so a failed `resolve` shows which
/// lookup tier and which discovery refresh it came from. The trace is only
/// populated when the installed subscriber carries a
/// [`tracing_error::ErrorLayer`].
#[derive(Debug)]
pub struct TGError<E> {
    pub kind: E,
    pub context: SpanTrace,
}

impl<E> TGError<E> {
    pub fn new(kind: E) -> Self {
        Self::with_context(kind, SpanTrace::capture())
    }

    pub fn with_context(kind: E, context: SpanTrace) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> &E {
        &self.kind
    }

    pub fn into_kind(self) -> E {
        self.kind
    }

    pub fn span(&self) -> &SpanTrace {
        &self.context
    }

    /// Whether any span was recorded when the error was created.
    pub fn has_context(&self) -> bool {
        self.context.status() == SpanTraceStatus::CAPTURED
    }

    /// Wraps the kind into the error kind of a calling module.
    ///
    /// The span trace of the original error is kept, so it still points at
    /// the place the failure started rather than where it was converted.
    pub fn map_kind<T>(self, wrap: impl FnOnce(E) -> T) -> TGError<T> {
        TGError::with_context(wrap(self.kind), self.context)
    }
}

impl<E: fmt::Display> fmt::Display for TGError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)?;
        if self.has_context() {
            write!(f, "\n\ncontext:\n{}\n", self.context)?;
        }
        Ok(())
    }
}

impl<E: Error + 'static> Error for TGError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.kind)
    }
}
