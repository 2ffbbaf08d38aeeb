//! Tag index maintenance.
//!
//! A tag `T` is indexed by the set stored at `depend:T`, whose members are
//! the keys written with that tag. Linking appends a key to every index in
//! one `MULTI`/`EXEC` block; killing deletes every indexed key and the
//! indexes themselves in one script call.

use depcache_redis::{Arg, Command, RedisError, Wire};
use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::script::{KILL_BY_DEPENDENCY, ScriptRegistry};

/// Prefix reserved for tag indexes.
pub const DEPEND_PREFIX: &str = "depend:";

/// Key of the index for `tag`.
pub fn tag_key(tag: &str) -> String {
    format!("{DEPEND_PREFIX}{tag}")
}

/// Result of a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KillOutcome {
    /// Keys removed by the script: tagged keys plus the indexes.
    pub removed: i64,
    /// Keys removed by the follow-up `DEL` of the bare tag names.
    pub cleaned: i64,
}

/// Append `key` to the index of every tag, atomically.
pub async fn link<W: Wire + ?Sized>(conn: &mut W, key: &str, tags: &[&str]) -> CacheResult<()> {
    if tags.is_empty() {
        return Ok(());
    }

    let block: Vec<Command> = tags
        .iter()
        .map(|tag| Command::new("SADD").arg(tag_key(tag)).arg(key))
        .collect();
    let replies = conn.transaction(&block).await?;
    if replies.len() != block.len() {
        return Err(RedisError::Protocol(format!(
            "link of {key:?} expected {} replies, got {}",
            block.len(),
            replies.len()
        ))
        .into());
    }

    debug!(key = key, tags = tags.len(), "Linked key to tags");
    Ok(())
}

/// Delete every key linked to any of `tags`, the indexes, and then any
/// plain keys named like the tags.
///
/// The second `DEL` runs outside the script. If it fails the script's work
/// stands and the error is returned.
pub async fn kill<W: Wire + ?Sized>(
    conn: &mut W,
    scripts: &ScriptRegistry,
    tags: &[&str],
) -> CacheResult<KillOutcome> {
    if tags.is_empty() {
        return Ok(KillOutcome::default());
    }

    let indexes: Vec<Arg> = tags.iter().map(|tag| Arg::from(tag_key(tag))).collect();
    let removed = scripts
        .invoke(conn, KILL_BY_DEPENDENCY, &indexes, &[])
        .await?
        .into_int()?;

    let cleanup = Command::new("DEL").args(tags.iter().copied());
    let cleaned = conn
        .request(&cleanup)
        .await
        .and_then(|reply| reply.into_int())
        .inspect_err(|e| {
            warn!(tags = tags.len(), removed, error = %e, "Cleanup of tag-named keys failed");
        })?;

    debug!(tags = tags.len(), removed, cleaned, "Killed by dependency");
    Ok(KillOutcome { removed, cleaned })
}

/// Keys currently recorded in the index of `tag`. May include stale keys.
pub async fn members<W: Wire + ?Sized>(conn: &mut W, tag: &str) -> CacheResult<Vec<String>> {
    let mut members = conn
        .request(&Command::new("SMEMBERS").arg(tag_key(tag)))
        .await?
        .into_strings()?;
    members.sort();
    Ok(members)
}
