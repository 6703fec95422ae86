use crate::error::LlamaError;
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

/// What a batch feeds into the decoder: token ids, or a precomputed
/// embedding block (one `n_embd`-sized row per entry).
#[derive(Debug, Clone)]
enum Payload {
    Tokens(Vec<LlamaToken>),
    Embeddings { data: Vec<f32>, n_embd: usize },
}

/// A multi-sequence batch handed to one or more `decode` calls.
///
/// Every entry carries a position, the sequence(s) it belongs to, and a flag
/// requesting logits for that entry.  Use [`LlamaBatch::new`] plus
/// [`LlamaBatch::add`] for token batches, [`LlamaBatch::embedding`] for image
/// embedding batches, and [`LlamaBatch::view`] to slice either kind into
/// decoder-sized chunks.
#[derive(Debug, Clone)]
pub struct LlamaBatch {
    payload: Payload,
    pos: Vec<LlamaPos>,
    seq_ids: Vec<Vec<LlamaSeqId>>,
    logits: Vec<bool>,
    capacity: usize,
}

impl LlamaBatch {
    /// Create an empty token batch with the given maximum token capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            payload: Payload::Tokens(Vec::with_capacity(capacity)),
            pos: Vec::with_capacity(capacity),
            seq_ids: Vec::with_capacity(capacity),
            logits: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Create an embedding batch covering positions
    /// `[pos_start, pos_start + rows)` of a single sequence.
    ///
    /// `data` must hold exactly `rows * n_embd` floats.  No entry requests
    /// logits; embedding rows only populate the KV cache.
    pub fn embedding(data: Vec<f32>, n_embd: usize, pos_start: LlamaPos, seq_id: LlamaSeqId) -> Self {
        debug_assert!(n_embd > 0 && data.len() % n_embd == 0);
        let rows = data.len() / n_embd;
        Self {
            payload: Payload::Embeddings { data, n_embd },
            pos: (0..rows as LlamaPos).map(|i| pos_start + i).collect(),
            seq_ids: vec![vec![seq_id]; rows],
            logits: vec![false; rows],
            capacity: rows,
        }
    }

    /// Number of entries currently in the batch.
    pub fn n_tokens(&self) -> usize {
        self.pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    /// Add a single token to the batch.
    ///
    /// # Errors
    /// Returns [`LlamaError::BatchFull`] at capacity, or
    /// [`LlamaError::EmbeddingPayload`] if this batch carries embeddings.
    pub fn add(
        &mut self,
        token: LlamaToken,
        pos: LlamaPos,
        seq_ids: &[LlamaSeqId],
        logits: bool,
    ) -> Result<(), LlamaError> {
        let Payload::Tokens(tokens) = &mut self.payload else {
            return Err(LlamaError::EmbeddingPayload);
        };
        if tokens.len() >= self.capacity {
            return Err(LlamaError::BatchFull);
        }
        tokens.push(token);
        self.pos.push(pos);
        self.seq_ids.push(seq_ids.to_vec());
        self.logits.push(logits);
        Ok(())
    }

    /// Overwrite the logits-request flag of entry `index`.
    pub fn set_logits(&mut self, index: usize, value: bool) {
        self.logits[index] = value;
    }

    /// Clear all entries, allowing the batch buffers to be reused.
    pub fn clear(&mut self) {
        if let Payload::Tokens(tokens) = &mut self.payload {
            tokens.clear();
        }
        self.pos.clear();
        self.seq_ids.clear();
        self.logits.clear();
    }

    /// Borrow the entries `[offset, offset + len)` as one decoder chunk.
    pub fn view(&self, offset: usize, len: usize) -> BatchView<'_> {
        let payload = match &self.payload {
            Payload::Tokens(tokens) => BatchPayload::Tokens(&tokens[offset..offset + len]),
            Payload::Embeddings { data, n_embd } => BatchPayload::Embeddings {
                data: &data[offset * n_embd..(offset + len) * n_embd],
                n_embd: *n_embd,
            },
        };
        BatchView {
            payload,
            pos: &self.pos[offset..offset + len],
            seq_ids: &self.seq_ids[offset..offset + len],
            logits: &self.logits[offset..offset + len],
        }
    }
}

/// Borrowed payload of a [`BatchView`].
#[derive(Debug, Clone, Copy)]
pub enum BatchPayload<'a> {
    Tokens(&'a [LlamaToken]),
    Embeddings { data: &'a [f32], n_embd: usize },
}

/// One decoder-sized slice of a [`LlamaBatch`], as passed to a single
/// `decode` call.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a> {
    pub payload: BatchPayload<'a>,
    pub pos: &'a [LlamaPos],
    pub seq_ids: &'a [Vec<LlamaSeqId>],
    pub logits: &'a [bool],
}

impl BatchView<'_> {
    pub fn n_tokens(&self) -> usize {
        self.pos.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_respects_capacity() {
        let mut batch = LlamaBatch::new(2);
        batch.add(1, 0, &[0], false).unwrap();
        batch.add(2, 1, &[0], true).unwrap();
        assert!(matches!(batch.add(3, 2, &[0], true), Err(LlamaError::BatchFull)));
        assert_eq!(batch.n_tokens(), 2);
    }

    #[test]
    fn view_slices_tokens_and_flags() {
        let mut batch = LlamaBatch::new(8);
        for i in 0..5 {
            batch.add(i, i, &[0], i == 4).unwrap();
        }
        let view = batch.view(2, 3);
        assert_eq!(view.n_tokens(), 3);
        assert_eq!(view.pos, &[2, 3, 4]);
        assert_eq!(view.logits, &[false, false, true]);
        match view.payload {
            BatchPayload::Tokens(tokens) => assert_eq!(tokens, &[2, 3, 4]),
            BatchPayload::Embeddings { .. } => panic!("expected token payload"),
        }
    }

    #[test]
    fn embedding_batch_positions_and_slicing() {
        let data: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let batch = LlamaBatch::embedding(data, 4, 10, 3);
        assert_eq!(batch.n_tokens(), 3);
        let view = batch.view(1, 2);
        assert_eq!(view.pos, &[11, 12]);
        match view.payload {
            BatchPayload::Embeddings { data, n_embd } => {
                assert_eq!(n_embd, 4);
                assert_eq!(data, &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
            }
            BatchPayload::Tokens(_) => panic!("expected embedding payload"),
        }
    }

    #[test]
    fn tokens_rejected_on_embedding_batch() {
        let mut batch = LlamaBatch::embedding(vec![0.0; 4], 4, 0, 0);
        assert!(matches!(batch.add(1, 1, &[0], false), Err(LlamaError::EmbeddingPayload)));
    }
}
