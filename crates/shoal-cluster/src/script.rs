//! Server-side script evaluation with the EVALSHA fast path.
//!
//! Scripts are addressed by the SHA1 of their body. The happy path sends
//! only the digest; a `NOSCRIPT` reply means this node hasn't cached the
//! body yet, so the fallback pipelines `SCRIPT LOAD` with the retried
//! `EVALSHA` on the same routing key and returns the second reply.

use bytes::Bytes;
use sha1::{Digest, Sha1};

use shoal_protocol::Frame;

use crate::client::Cluster;
use crate::error::ClusterError;

/// Hex-encoded SHA1 of a script body, as the server computes it for
/// `SCRIPT LOAD`.
pub fn script_sha(script: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(script);
    hex::encode(hasher.finalize())
}

/// Stand-in routing key for scripts that take no keys. Keyless scripts
/// have no slot of their own, so they consistently land wherever this
/// key hashes.
const KEYLESS_ROUTING_KEY: &[u8] = b"A";

impl Cluster {
    /// Evaluates a script, preferring `EVALSHA` and falling back to
    /// loading the body on the owning node when it replies `NOSCRIPT`.
    ///
    /// Routing follows the first key; with no keys a fixed stand-in key
    /// picks the node.
    pub async fn eval(
        &self,
        script: &[u8],
        keys: &[Bytes],
        args: &[Bytes],
    ) -> Result<Frame, ClusterError> {
        let sha = script_sha(script);

        let mut evalsha = Vec::with_capacity(3 + keys.len() + args.len());
        evalsha.push(Bytes::from_static(b"EVALSHA"));
        evalsha.push(Bytes::from(sha.into_bytes()));
        evalsha.push(Bytes::from(keys.len().to_string().into_bytes()));
        evalsha.extend(keys.iter().cloned());
        evalsha.extend(args.iter().cloned());

        let routing_key: Bytes = keys
            .first()
            .cloned()
            .unwrap_or_else(|| Bytes::from_static(KEYLESS_ROUTING_KEY));

        match self.qk(&evalsha, &routing_key).await {
            Err(ClusterError::Server(msg)) if msg.starts_with("NOSCRIPT") => {
                let load = vec![
                    Bytes::from_static(b"SCRIPT"),
                    Bytes::from_static(b"LOAD"),
                    Bytes::copy_from_slice(script),
                ];
                let pipeline = vec![load, evalsha];
                let replies = self.qk_pipeline(&pipeline, &routing_key).await?;
                match replies.into_iter().next_back() {
                    Some(Frame::Error(msg)) => Err(ClusterError::Server(msg)),
                    Some(frame) => Ok(frame),
                    None => Ok(Frame::Null),
                }
            }
            other => other,
        }
    }
}
