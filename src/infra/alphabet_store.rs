// ============================================================
// Layer 6 — Alphabet Store
// ============================================================
// Persists the vocabularies built at training time so `decode`
// maps words, characters, features and labels to exactly the
// same ids the model was trained with.
//
// Only the ordered instance lists are serialised; the reverse
// lookup tables are rebuilt after loading.

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};

use crate::data::alphabet::Alphabets;
use crate::domain::traits::Persistable;

impl Persistable for Alphabets {
    fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json).with_context(|| format!("Cannot write alphabets to '{path}'"))
    }

    fn load(path: &str) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read alphabets from '{path}'. Have you run 'train' first?"))?;
        let mut alphabets: Alphabets = serde_json::from_str(&json)
            .with_context(|| format!("Malformed alphabets in '{path}'"))?;
        alphabets.rebuild_index();
        Ok(alphabets)
    }
}

/// Location of `alphabets.json` inside a model directory
pub struct AlphabetStore {
    path: PathBuf,
}

impl AlphabetStore {
    pub fn new(dir: impl Into<String>) -> Self {
        Self { path: PathBuf::from(dir.into()).join("alphabets.json") }
    }

    pub fn save(&self, alphabets: &Alphabets) -> Result<()> {
        alphabets.save(&self.path.to_string_lossy())?;
        tracing::info!("Saved alphabets to '{}'", self.path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<Alphabets> {
        let alphabets = Alphabets::load(&self.path.to_string_lossy())?;
        tracing::info!("Loaded alphabets from '{}'", self.path.display());
        Ok(alphabets)
    }
}
