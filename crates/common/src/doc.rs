// Replicated text document built on yrs.
//
// One document per room; each shared file maps to a text stream named
// `file:<fileId>` inside it. Local mutations return the encoded delta
// for exactly that mutation (a diff against the pre-mutation state
// vector), so callers forward their own edits without registering
// change observers on the document.
//
// All indices and lengths are in UTF-16 code units, the unit browser
// editors report, so offsets agree across peers regardless of the
// bytes a character occupies.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, Transact, Update};

pub const STREAM_PREFIX: &str = "file:";

/// Name of the text stream carrying the given shared file.
pub fn stream_name(file_id: &str) -> String {
    format!("{STREAM_PREFIX}{file_id}")
}

#[derive(Debug, Error)]
pub enum DocError {
    #[error("failed to decode document update: {0}")]
    DecodeUpdate(yrs::encoding::read::Error),
    #[error("failed to decode state vector: {0}")]
    DecodeStateVector(yrs::encoding::read::Error),
    #[error("failed to apply document update: {0}")]
    Apply(String),
}

#[derive(Debug)]
pub struct ReplicatedDoc {
    doc: Doc,
    /// Remote deltas seen so far, kept as one merged blob. A delta can
    /// reference blocks from deltas that have not arrived yet; replaying
    /// the merged backlog together with each new delta closes those gaps
    /// once the missing pieces show up, so delivery order never changes
    /// the merged result.
    backlog: Option<Vec<u8>>,
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        let options = Options { offset_kind: OffsetKind::Utf16, ..Default::default() };
        Self { doc: Doc::with_options(options), backlog: None }
    }

    pub fn with_client_id(client_id: u64) -> Self {
        let options =
            Options { client_id, offset_kind: OffsetKind::Utf16, ..Default::default() };
        Self { doc: Doc::with_options(options), backlog: None }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Encoded state vector, the payload of a sync step-1.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full document state as a single update, suitable for snapshots
    /// and for hydrating a fresh replica.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Delta containing everything the remote replica is missing, the
    /// payload of a sync step-2.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let state_vector =
            StateVector::decode_v1(remote_state_vector).map_err(DocError::DecodeStateVector)?;
        Ok(self.doc.transact().encode_diff_v1(&state_vector))
    }

    /// Merge a remote delta. Applying the same delta twice is a no-op,
    /// and deltas may arrive in any order: the backlog is merged in on
    /// every application so a delta whose dependencies were missing is
    /// retried once they arrive.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<(), DocError> {
        let combined = match &self.backlog {
            Some(backlog) => {
                let parts = [
                    Update::decode_v1(backlog).map_err(DocError::DecodeUpdate)?,
                    Update::decode_v1(bytes).map_err(DocError::DecodeUpdate)?,
                ];
                Update::merge_updates(parts).encode_v1()
            }
            None => {
                Update::decode_v1(bytes).map_err(DocError::DecodeUpdate)?;
                bytes.to_vec()
            }
        };

        let update = Update::decode_v1(&combined).map_err(DocError::DecodeUpdate)?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|error| DocError::Apply(error.to_string()))?;
        self.backlog = Some(combined);
        Ok(())
    }

    pub fn text(&self, stream: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(stream).map(|text| text.get_string(&txn)).unwrap_or_default()
    }

    pub fn text_len(&self, stream: &str) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(stream).map(|text| text.len(&txn)).unwrap_or(0)
    }

    /// Insert `chunk` at `index` (clamped to the stream length) and
    /// return the delta for broadcast.
    pub fn insert(&self, stream: &str, index: u32, chunk: &str) -> Vec<u8> {
        self.splice(stream, index, 0, chunk)
    }

    /// Delete `len` units starting at `index` and return the delta.
    pub fn delete(&self, stream: &str, index: u32, len: u32) -> Vec<u8> {
        self.splice(stream, index, len, "")
    }

    /// Delete-then-insert at `index` in a single transaction, producing
    /// one delta. Out-of-range offsets are clamped.
    pub fn splice(&self, stream: &str, index: u32, removed: u32, inserted: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        let text = self.doc.get_or_insert_text(stream);
        {
            let mut txn = self.doc.transact_mut();
            let len = text.len(&txn);
            let index = index.min(len);
            let removed = removed.min(len - index);
            if removed > 0 {
                text.remove_range(&mut txn, index, removed);
            }
            if !inserted.is_empty() {
                text.insert(&mut txn, index, inserted);
            }
        }
        self.doc.transact().encode_diff_v1(&before)
    }
}
