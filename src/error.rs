use thiserror::Error;

/// Errors surfaced by [`crate::catalog`] — configuration, upstream fetch, and
/// storage failures during pricing lookup or sync.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid override: {0}")]
    Configuration(String),

    #[error("pricing fetch failed: {0}")]
    TransientUpstream(String),

    #[error("pricing store error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Errors raised while loading a plugin artifact or resolving its symbols.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to fetch plugin artifact: {0}")]
    Fetch(String),

    #[error("required symbol missing: {0}")]
    MissingSymbol(String),

    #[error("symbol type mismatch for {0}")]
    SymbolMismatch(String),

    #[error("plugin Init failed: {0}")]
    InitFailed(String),

    #[error("failed to open plugin library: {0}")]
    Open(#[from] libloading::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LoaderResult<T> = Result<T, LoaderError>;

/// Errors surfaced by [`crate::pipeline`] dispatch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("hook error from plugin {plugin}: {message}")]
    Hook { plugin: String, message: String },

    #[error("panic recovered in plugin {plugin}: {message}")]
    Panic { plugin: String, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Umbrella error type spanning all three subsystems, for callers that want
/// a single `Result` alias across the crate boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type CoreResult<T> = Result<T, CoreError>;
