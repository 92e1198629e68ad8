// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust structs, enums and traits describing the corpus
// and the failure modes of the tagging core.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O or network calls
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// Documents, sentences and tokens as read from a corpus
pub mod document;

// The error taxonomy shared by every layer of the core
pub mod error;

// Core abstractions (traits) that other layers implement
pub mod traits;
