//! Process-wide logging setup shared by the FieldOps binaries.

/// Initialize tracing with the default filter (`info`, overridable via `RUST_LOG`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
