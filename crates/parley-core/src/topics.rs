//! Broker channel naming. Every user has one channel; the bridge subscribes
//! to all of them with a single wildcard pattern.

use crate::ids::UserId;

const CHANNEL_PREFIX: &str = "user:";
const CHANNEL_SUFFIX: &str = ":messages";

/// Pattern matching every per-user channel.
pub const ALL_USERS_PATTERN: &str = "user:*:messages";

/// Channel carrying messages addressed to `user`.
pub fn user_channel(user: &UserId) -> String {
    format!("{CHANNEL_PREFIX}{user}{CHANNEL_SUFFIX}")
}

/// Recover the user id from a per-user channel name.
pub fn user_from_channel(channel: &str) -> Option<UserId> {
    let id = channel
        .strip_prefix(CHANNEL_PREFIX)?
        .strip_suffix(CHANNEL_SUFFIX)?;
    (!id.is_empty()).then(|| UserId::from_raw(id))
}
