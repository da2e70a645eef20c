//! Reducer snapshots.
//!
//! ## Storage Layout
//!
//! - `cells`: `{cell_id}` -> `Cell`
//! - `posts`: `{post_id}` -> `Post`
//! - `comments`: `{comment_id}` -> `Comment`
//! - `votes`: `{voter}:{target_id}` -> effective `Vote`
//! - `moderation`: `rec:{message_id}` -> `ModerationRecord`, `audit:{message_id}` -> `AuditEntry`
//! - `profiles`: `{address}` -> `Profile`
//! - `applied`: `{message_id}` -> `()`
//!
//! A checkpoint rewrites all of these in one atomic batch, so a crash leaves
//! either the previous snapshot or the new one.

use crate::error::Result;
use crate::forum::state::{AuditEntry, ForumState, ModerationRecord};
use crate::forum::types::ContentHash;
use crate::storage::{
    composite_key, encode_value, KeyValueStore, KeyValueStoreExt, StoreName, WriteOp,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

const RECORD_PREFIX: &[u8] = b"rec";
const AUDIT_PREFIX: &[u8] = b"audit";

/// Stores holding reducer state.
const STATE_STORES: [StoreName; 7] = [
    StoreName::Cells,
    StoreName::Posts,
    StoreName::Comments,
    StoreName::Votes,
    StoreName::Moderation,
    StoreName::Profiles,
    StoreName::Applied,
];

/// Writes and reloads reducer snapshots.
#[derive(Clone)]
pub struct ForumStorage {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ForumStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForumStorage").finish_non_exhaustive()
    }
}

fn put<T: Serialize>(ops: &mut Vec<WriteOp>, store: StoreName, key: Vec<u8>, value: &T) -> Result<()> {
    ops.push(WriteOp::Put {
        store,
        key,
        value: encode_value(value)?,
    });
    Ok(())
}

impl ForumStorage {
    /// Wraps a key-value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Replaces the persisted snapshot with `state`.
    pub fn checkpoint(&self, state: &ForumState) -> Result<()> {
        let mut ops: Vec<WriteOp> = STATE_STORES
            .iter()
            .map(|&store| WriteOp::Clear { store })
            .collect();

        for cell in state.cells() {
            put(&mut ops, StoreName::Cells, cell.id.as_bytes().to_vec(), cell)?;
        }
        for post in state.all_posts() {
            put(&mut ops, StoreName::Posts, post.id.as_bytes().to_vec(), post)?;
        }
        for comment in state.all_comments() {
            put(&mut ops, StoreName::Comments, comment.id.as_bytes().to_vec(), comment)?;
        }
        for vote in state.all_votes() {
            let key = composite_key(vote.voter.as_str().as_bytes(), vote.target_id.as_bytes());
            put(&mut ops, StoreName::Votes, key, vote)?;
        }
        for record in state.all_moderation() {
            let key = composite_key(RECORD_PREFIX, record.message_id.as_bytes());
            put(&mut ops, StoreName::Moderation, key, record)?;
        }
        for entry in state.audit_log() {
            let key = composite_key(AUDIT_PREFIX, entry.message_id.as_bytes());
            put(&mut ops, StoreName::Moderation, key, entry)?;
        }
        for profile in state.all_profiles() {
            let key = profile.address.as_str().as_bytes().to_vec();
            put(&mut ops, StoreName::Profiles, key, profile)?;
        }
        for id in state.applied_ids() {
            put(&mut ops, StoreName::Applied, id.as_bytes().to_vec(), &())?;
        }

        let op_count = ops.len();
        self.store.write_batch(ops)?;
        info!(
            applied = state.applied_count(),
            ops = op_count,
            "Checkpointed reducer state"
        );
        Ok(())
    }

    /// Rebuilds the reducer from the persisted snapshot.
    ///
    /// An empty store yields an empty state.
    pub fn load_state(&self) -> Result<ForumState> {
        let mut state = ForumState::new();

        for cell in self.store.scan_values(StoreName::Cells)? {
            state.insert_cell(cell);
        }
        for post in self.store.scan_values(StoreName::Posts)? {
            state.insert_post(post);
        }
        for comment in self.store.scan_values(StoreName::Comments)? {
            state.insert_comment(comment);
        }
        for vote in self.store.scan_values(StoreName::Votes)? {
            state.insert_vote(vote);
        }
        for (key, bytes) in self.store.scan(StoreName::Moderation)? {
            if key.starts_with(AUDIT_PREFIX) {
                let entry: AuditEntry = crate::storage::decode_value(&bytes)?;
                state.insert_audit(entry);
            } else {
                let record: ModerationRecord = crate::storage::decode_value(&bytes)?;
                state.insert_moderation(record);
            }
        }
        for profile in self.store.scan_values(StoreName::Profiles)? {
            state.insert_profile(profile);
        }
        for (key, _) in self.store.scan(StoreName::Applied)? {
            if let Ok(bytes) = <[u8; 32]>::try_from(key.as_slice()) {
                state.mark_applied(ContentHash::from_bytes(bytes));
            }
        }

        info!(applied = state.applied_count(), "Loaded reducer state");
        Ok(state)
    }
}
