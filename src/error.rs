use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is `httpdebugger::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while intercepting traffic.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    context: Option<String>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                context: None,
            }),
        }
    }

    pub(crate) fn config<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Config, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn upstream<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Upstream, Some(e))
    }

    pub(crate) fn internal<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Internal, Some(e))
    }

    pub(crate) fn not_found(id: &str) -> Error {
        Error::new(Kind::NotFound, None::<Error>).with_context(format!("session {id}"))
    }

    /// Attach a short description of the operation that failed.
    pub(crate) fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.inner.context = Some(context.into());
        self
    }

    /// Returns true if the error came from CA or listener configuration.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if the error came from malformed wire data.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error came from the origin server.
    pub fn is_upstream(&self) -> bool {
        matches!(self.inner.kind, Kind::Upstream)
    }

    /// Returns true if the error is an internal failure (certificate
    /// issuance, connection takeover).
    pub fn is_internal(&self) -> bool {
        matches!(self.inner.kind, Kind::Internal)
    }

    /// Returns true if a session lookup missed.
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner.kind, Kind::NotFound)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }

            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }

            source = err.source();
        }

        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("httpdebugger::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref context) = self.inner.context {
            builder.field("context", context);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Config => f.write_str("configuration error")?,
            Kind::Protocol => f.write_str("protocol error")?,
            Kind::Upstream => f.write_str("upstream error")?,
            Kind::Internal => f.write_str("internal error")?,
            Kind::NotFound => f.write_str("not found")?,
        }

        if let Some(context) = &self.inner.context {
            write!(f, " ({context})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new(Kind::Internal, Some(e))
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Config,
    Protocol,
    Upstream,
    Internal,
    NotFound,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Upstream, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::internal(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::upstream(TimedOut);
        assert!(err.is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::upstream(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::not_found("abc");
        assert_eq!(err.to_string(), "not found (session abc)");
        assert!(err.is_not_found());
    }
}
