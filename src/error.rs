use thiserror::Error;

/// Errors surfaced by the mutating store operations.
///
/// The store is append-only and never rolls back: a failed operation has
/// interned some subtrees, but they are ordinary content-addressed entries
/// and a retry after growing the tables would reuse them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The probe budget was exhausted while interning a pair. The table is
    /// effectively full; nothing was recorded for this key.
    #[error("table full while interning {key:#018x} (root: {root})")]
    TableFull {
        /// The 64-bit pair that could not be placed.
        key: u64,
        /// Whether the failing intern targeted the root table.
        root: bool,
    },
    /// The vector length does not fit the 24-bit length field of a handle.
    #[error("vector length {0} exceeds the 24-bit handle limit")]
    LengthLimit(u64),
}
