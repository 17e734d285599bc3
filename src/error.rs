use thiserror::Error;

////////////
// Errors //
////////////

/// Errors raised while building, querying or persisting a hierarchy, or while
/// optimising an embedding.
///
/// ### Variants
///
/// * `InvalidArgument` - Malformed inputs (empty data, dimensionality of zero,
///   indices out of range, mismatching lengths).
/// * `Logic` - The object was used in a state that does not allow the call
///   (e.g., adding a scale before initialisation, asking for a scale that does
///   not exist).
/// * `Degenerate` - The numerics collapsed, for example landmark selection
///   returning fewer than two landmarks.
/// * `Runtime` - A serialised hierarchy could not be read back.
/// * `Io` - Underlying reader/writer failure.
#[derive(Debug, Error)]
pub enum HsneError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("logic error: {0}")]
    Logic(String),
    #[error("degenerate hierarchy: {0}")]
    Degenerate(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, HsneError>;
