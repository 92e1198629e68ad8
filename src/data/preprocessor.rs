// ============================================================
// Layer 4 — Word Preprocessor
// ============================================================
// Normalises surface forms before they are looked up in the
// word alphabet. With number normalisation on, every ASCII
// digit becomes '0' so "1996" and "2024" share one id:
//
//   "12.5%"  → "00.0%"
//   "B-52"   → "B-00"
//
// Character ids are always taken from the normalised word.

pub struct Preprocessor {
    number_normalized: bool,
}

impl Preprocessor {
    /// Create a new Preprocessor
    pub fn new(number_normalized: bool) -> Self {
        Self { number_normalized }
    }

    /// Normalise one word. Returns an owned String.
    pub fn normalize(&self, word: &str) -> String {
        if !self.number_normalized {
            return word.to_string();
        }
        word.chars()
            .map(|c| if c.is_ascii_digit() { '0' } else { c })
            .collect()
    }
}

/// Number normalisation is on by default
impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(true)
    }
}
