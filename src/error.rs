use thiserror::Error;

/// Errors surfaced at the builder boundary. Queries never fail; out-of-set
/// inputs yield the sentinel instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("two keys map to the same bit vector")]
    DuplicateKey,
    #[error("one key's bit vector is a prefix of another's")]
    NotPrefixFree,
    #[error("keys are not in ascending lexicographic order")]
    NotSorted,
    #[error("could not build a solvable hypergraph after reseed attempts")]
    ConstructionFailed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serde")]
    #[error("serialization error: {0}")]
    Serde(#[from] Box<bincode::ErrorKind>),
}
