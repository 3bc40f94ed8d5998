//! Error types for catalog construction.

use thiserror::Error;

/// Errors raised while turning raw query records into a snapshot.
///
/// Records that merely lack usable links are not errors; they are dropped
/// with a warning. Only structurally unusable input aborts the build.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A record is not a JSON object.
    #[error("query record {index} is not an object")]
    NotAnObject {
        /// Position of the record in the input.
        index: usize,
    },

    /// A record has no granule identifier at all.
    #[error("query record {index} has no granule identifier (umm.GranuleUR)")]
    MissingIdentifier {
        /// Position of the record in the input.
        index: usize,
    },

    /// A temporal range string could not be parsed.
    #[error("invalid temporal range '{value}': expected 'YYYY-MM-DD,YYYY-MM-DD' with start <= end")]
    InvalidTemporal {
        /// The rejected input.
        value: String,
    },
}
