use std::fmt;

pub type Result<T, E = MorselError> = std::result::Result<T, E>;

/// Classification for errors that callers react to programmatically.
///
/// Most errors are fatal to the operator that raised them; the kind lets the
/// enclosing pipeline (and tests) distinguish resource exhaustion from
/// invariant violations without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An input's schema changed mid-stream.
    SchemaChanged,
    /// Configured resources are insufficient and no fallback is allowed.
    Resource,
    /// The operator's allocator refused a reservation.
    OutOfMemory,
    /// Recursive spill processing cannot subdivide the data any further.
    PartitionExhaustion,
    /// Underlying IO failure.
    Io,
    /// Invariant violation inside the engine.
    Internal,
    /// Anything else.
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SchemaChanged => "schema changed",
            Self::Resource => "resource",
            Self::OutOfMemory => "out of memory",
            Self::PartitionExhaustion => "partition exhaustion",
            Self::Io => "io",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct MorselError {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MorselError {
    pub fn new(msg: impl Into<String>) -> Self {
        MorselError {
            kind: ErrorKind::Unknown,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        MorselError {
            kind,
            msg: msg.into(),
            source: None,
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        MorselError {
            kind: ErrorKind::Unknown,
            msg: msg.into(),
            source: Some(source),
        }
    }

    pub fn io(msg: impl Into<String>, source: std::io::Error) -> Self {
        MorselError {
            kind: ErrorKind::Io,
            msg: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for MorselError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MorselError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for MorselError {
    fn from(err: std::io::Error) -> Self {
        MorselError::io("io error", err)
    }
}

pub trait ResultExt<T, E> {
    /// Wrap an error with some additional context.
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| MorselError::with_source(msg, Box::new(e)))
    }
}

pub trait OptionExt<T> {
    /// Return an internal error if the value is missing.
    fn required(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, field: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(MorselError::with_kind(
                ErrorKind::Internal,
                format!("Missing required value: {field}"),
            )),
        }
    }
}
