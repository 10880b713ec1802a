//! Command construction and routing-key extraction.
//!
//! Commands are token lists — the verb followed by its arguments, each a
//! binary-safe `Bytes`. The extractor answers the one routing question the
//! dispatcher asks: which key decides the slot for this command (or
//! pipeline), if any.

use bytes::Bytes;

/// Builds a command from string-like tokens, copying each into a `Bytes`.
///
/// ```
/// use shoal_cluster::cmd;
/// let get = cmd(&["GET", "user:42"]);
/// assert_eq!(get.len(), 2);
/// ```
pub fn cmd<T: AsRef<[u8]>>(tokens: &[T]) -> Vec<Bytes> {
    tokens
        .iter()
        .map(|t| Bytes::copy_from_slice(t.as_ref()))
        .collect()
}

/// Verbs that target the node itself rather than a key, and therefore
/// cannot be routed by slot.
const UNROUTABLE_VERBS: [&[u8]; 4] = [b"INFO", b"CONFIG", b"SHUTDOWN", b"SLAVEOF"];

/// Returns the routing key of a single command, or `None` when the
/// command cannot be routed.
///
/// `EVAL`/`EVALSHA` carry their first key at position 3
/// (`EVAL script numkeys key1 ...`); everything else at position 1.
pub fn command_key(cmd: &[Bytes]) -> Option<&Bytes> {
    let verb = cmd.first()?;

    if UNROUTABLE_VERBS
        .iter()
        .any(|v| verb.eq_ignore_ascii_case(v))
    {
        return None;
    }

    let key_index = if verb.eq_ignore_ascii_case(b"EVAL") || verb.eq_ignore_ascii_case(b"EVALSHA")
    {
        3
    } else {
        1
    };
    cmd.get(key_index)
}

/// Returns the routing key of a pipeline.
///
/// A leading `MULTI` is skipped (the transaction wrapper carries no key);
/// otherwise the first command decides. Pipelines are assumed to be
/// slot-affine — the caller guarantees all keys hash to the same slot.
pub fn pipeline_key(cmds: &[Vec<Bytes>]) -> Option<&Bytes> {
    let first = cmds.first()?;
    if first
        .first()
        .is_some_and(|verb| verb.eq_ignore_ascii_case(b"MULTI"))
    {
        return pipeline_key(&cmds[1..]);
    }
    command_key(first)
}
