// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer programs against these seams and
// never against a concrete loader or store.
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;
use crate::domain::document::Document;

// ─── CorpusSource ─────────────────────────────────────────────────────────────
/// Any component that can produce documents for tagging.
///
/// Implementations:
///   - JsonlCorpusLoader → one JSON document per line
pub trait CorpusSource {
    /// Load every document of this source, in file order.
    /// `first_doc_id` is the id given to the first document;
    /// the following ones are numbered consecutively.
    fn load_all(&self, first_doc_id: usize) -> Result<Vec<Document>>;
}

// ─── Persistable ──────────────────────────────────────────────────────────────
/// Any component whose state can be saved and restored from disk.
///
/// Implementations:
///   - Alphabets → saves/loads every vocabulary as JSON
pub trait Persistable: Sized {
    /// Save this component's state to the given path
    fn save(&self, path: &str) -> Result<()>;

    /// Load a component's state from the given path.
    fn load(path: &str) -> Result<Self>;
}
