// ============================================================
// Layer 5 — Document Memory Cache
// ============================================================
// Cross-batch store of what the draft stage saw for every token
// of a document, keyed by (doc_id, word_position).
//
//   put(doc, pos, representation, label_embedding)
//       overwrites the entry for that key
//   read(doc_ids, positions, mask)
//       per query token, up to `capacity` entries of the same
//       document plus a validity mask
//
// Recency is a generation counter advanced once per step, with a
// write sequence number to order writes inside one generation.
//
//   eviction:  lowest (generation, seq) goes first
//   ranking:   generation descending, then |pos - query|
//              ascending, then pos ascending
//
// The store holds plain f32 vectors so one cache serves every
// backend (training on Autodiff<Wgpu>, evaluation on Wgpu).
// It is never cleared between epochs: a document revisited in a
// later epoch reads what was written for it last time.
//
// capacity == 0 disables the cache entirely.

use std::collections::HashMap;

/// One cached token
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub representation:  Vec<f32>,
    pub label_embedding: Vec<f32>,
    generation: u64,
    seq:        u64,
}

/// Padded result of a batched read.
///
/// Layout is row-major [queries, slots, dim]; `valid` is
/// [queries, slots].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRead {
    pub queries:          usize,
    pub slots:            usize,
    pub entry_dim:        usize,
    /// Representation and label embedding concatenated per entry
    pub entries:          Vec<f32>,
    pub valid:            Vec<bool>,
}

impl MemoryRead {
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }
}

#[derive(Debug)]
pub struct DocumentMemory {
    capacity:       usize,
    repr_dim:       usize,
    label_dim:      usize,
    docs:           HashMap<usize, HashMap<usize, MemoryEntry>>,
    generation:     u64,
    next_seq:       u64,
}

impl DocumentMemory {
    /// `capacity` is the per-document limit (the `max_read_memory`
    /// option), and also the number of slots a read returns.
    pub fn new(capacity: usize, repr_dim: usize, label_dim: usize) -> Self {
        Self {
            capacity,
            repr_dim,
            label_dim,
            docs:       HashMap::new(),
            generation: 0,
            next_seq:   0,
        }
    }

    pub fn is_enabled(&self) -> bool { self.capacity > 0 }

    pub fn entry_dim(&self) -> usize { self.repr_dim + self.label_dim }

    /// Start a new write generation. Called once per step.
    pub fn advance(&mut self) {
        self.generation += 1;
    }

    /// Total number of cached entries across documents
    pub fn len(&self) -> usize {
        self.docs.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn doc_count(&self) -> usize { self.docs.len() }

    pub fn get(&self, doc_id: usize, position: usize) -> Option<&MemoryEntry> {
        self.docs.get(&doc_id)?.get(&position)
    }

    /// Insert or overwrite one entry. Never fails; when the document
    /// is over capacity its least recently written entry is evicted.
    pub fn put(
        &mut self,
        doc_id:          usize,
        position:        usize,
        representation:  &[f32],
        label_embedding: &[f32],
    ) {
        if !self.is_enabled() {
            return;
        }
        debug_assert_eq!(representation.len(), self.repr_dim);
        debug_assert_eq!(label_embedding.len(), self.label_dim);

        let entry = MemoryEntry {
            representation:  representation.to_vec(),
            label_embedding: label_embedding.to_vec(),
            generation:      self.generation,
            seq:             self.next_seq,
        };
        self.next_seq += 1;

        let doc = self.docs.entry(doc_id).or_default();
        doc.insert(position, entry);

        while doc.len() > self.capacity {
            let oldest = doc
                .iter()
                .min_by_key(|(_, e)| (e.generation, e.seq))
                .map(|(&pos, _)| pos);
            match oldest {
                Some(pos) => { doc.remove(&pos); }
                None      => break,
            }
        }
    }

    /// Positions of one document in read order for a query position
    fn ranked(&self, doc_id: usize, query: usize) -> Vec<(usize, &MemoryEntry)> {
        let Some(doc) = self.docs.get(&doc_id) else {
            return Vec::new();
        };
        let mut ranked: Vec<(usize, &MemoryEntry)> = doc.iter().map(|(&p, e)| (p, e)).collect();
        ranked.sort_by_key(|&(pos, e)| (std::cmp::Reverse(e.generation), pos.abs_diff(query), pos));
        ranked.truncate(self.capacity);
        ranked
    }

    /// Batched read. Queries whose `mask` is false, and documents with
    /// no entries, produce all-invalid slots.
    pub fn read(&self, doc_ids: &[usize], positions: &[usize], mask: &[bool]) -> MemoryRead {
        let queries   = doc_ids.len();
        let slots     = self.capacity;
        let entry_dim = self.entry_dim();

        let mut entries = vec![0.0f32; queries * slots * entry_dim];
        let mut valid   = vec![false; queries * slots];

        for q in 0..queries {
            if !mask[q] {
                continue;
            }
            for (k, (_, e)) in self.ranked(doc_ids[q], positions[q]).into_iter().enumerate() {
                let at = (q * slots + k) * entry_dim;
                entries[at..at + self.repr_dim].copy_from_slice(&e.representation);
                entries[at + self.repr_dim..at + entry_dim].copy_from_slice(&e.label_embedding);
                valid[q * slots + k] = true;
            }
        }

        MemoryRead { queries, slots, entry_dim, entries, valid }
    }
}
