//! Transaction token generation.
//!
//! A token is `txn_<millis>_<conversation>_<random>`:
//! - `millis`: 13 hex digits of wall-clock milliseconds, clamped so the value
//!   never goes backwards within this process.
//! - `conversation`: the conversation id reduced to `[A-Za-z0-9-]`, at most
//!   [`MAX_SLUG_LEN`] characters.
//! - `random`: 64 random bits.
//!
//! Tokens only contain `[A-Za-z0-9_-]` so they survive shell quoting and line
//! scanning unchanged.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use crate::ids::{ConversationId, TransactionId};

pub const TOKEN_PREFIX: &str = "txn";
pub const MAX_SLUG_LEN: usize = 24;

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Mint a new transaction token for a launch belonging to `conversation_id`.
pub fn generate(conversation_id: &ConversationId) -> TransactionId {
    let now = Utc::now().timestamp_millis();
    let millis = LAST_MILLIS.fetch_max(now, Ordering::SeqCst).max(now);
    let suffix: u64 = rand::random();
    TransactionId::from_raw(format!(
        "{TOKEN_PREFIX}_{millis:013x}_{}_{suffix:016x}",
        slug(conversation_id.as_str())
    ))
}

/// Milliseconds component of a token minted by [`generate`].
pub fn timestamp_millis(token: &TransactionId) -> Option<i64> {
    let rest = token.as_str().strip_prefix(TOKEN_PREFIX)?.strip_prefix('_')?;
    let (millis, _) = rest.split_once('_')?;
    i64::from_str_radix(millis, 16).ok()
}

fn slug(raw: &str) -> String {
    let slug: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_SLUG_LEN)
        .collect();
    if slug.is_empty() {
        "anon".to_string()
    } else {
        slug
    }
}
