//! Shared constants for message validation and limits.
//!
//! Every client applies the same limits so that a message accepted by one
//! peer is accepted by all of them.

// =============================================================================
// Content Size Limits
// =============================================================================

/// Maximum cell name size (256 bytes).
pub const MAX_NAME_SIZE: usize = 256;

/// Maximum cell description size (10KB).
pub const MAX_DESCRIPTION_SIZE: usize = 10 * 1024;

/// Maximum cell icon reference size (2KB).
pub const MAX_ICON_SIZE: usize = 2 * 1024;

/// Maximum post title size (512 bytes).
pub const MAX_POST_TITLE_SIZE: usize = 512;

/// Maximum post body size (100KB).
pub const MAX_POST_CONTENT_SIZE: usize = 100 * 1024;

/// Maximum comment body size (20KB).
pub const MAX_COMMENT_CONTENT_SIZE: usize = 20 * 1024;

/// Maximum moderation reason size (1KB).
pub const MAX_REASON_SIZE: usize = 1024;

/// Maximum profile display name size (64 bytes).
pub const MAX_DISPLAY_NAME_SIZE: usize = 64;

/// Maximum profile call sign size (32 bytes).
pub const MAX_CALL_SIGN_SIZE: usize = 32;

/// Maximum wallet address size (128 bytes).
pub const MAX_ADDRESS_SIZE: usize = 128;

// =============================================================================
// Timestamp Validation
// =============================================================================

/// Maximum allowed clock skew for timestamps (5 minutes in milliseconds).
pub const MAX_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

/// Minimum valid timestamp (2024-01-01 00:00:00 UTC in milliseconds).
/// Prevents messages with unreasonably old or zero timestamps.
pub const MIN_VALID_TIMESTAMP_MS: u64 = 1704067200000;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum encoded frame size (256KB). Larger frames are dropped unparsed.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Content topic version segment of the default topic prefix.
pub const TOPIC_VERSION: u32 = 1;

/// Maximum frames accepted from one history query. The rest of a larger
/// result is discarded unverified.
pub const MAX_HISTORY_BATCH_SIZE: usize = 1000;
