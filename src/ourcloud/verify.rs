//! Signature verification for inbound push requests.

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::OurCloudClient;
use crate::proto::{signed_bytes, PushRequest};

/// Verify that `req` was signed by its claimed sender. Looks up the sender's
/// public signing key on the node, then checks the detached signature over
/// the request with its signature field cleared.
///
/// Returns `Ok(false)` for a present-but-invalid signature; errors when the
/// sender cannot be resolved.
pub(crate) async fn verify_push_request(
    client: &OurCloudClient,
    req: &PushRequest,
) -> Result<bool> {
    if req.sender_username.is_empty() {
        return Err(anyhow!("push request has no sender username"));
    }

    let sender_auth = client
        .get_user_auth(&req.sender_username)
        .await
        .context("getting sender user auth")?;

    if sender_auth.public_sign_key.is_empty() {
        return Err(anyhow!("sender has no public signing key"));
    }

    verify_signature(req, &sender_auth.public_sign_key)
}

/// Verify a push request signature against a known public key.
pub fn verify_signature(req: &PushRequest, public_key: &[u8]) -> Result<bool> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| anyhow!("public signing key must be 32 bytes"))?;
    let key = VerifyingKey::from_bytes(&key_bytes).context("invalid public signing key")?;

    let Ok(signature) = Signature::from_slice(&req.signature) else {
        return Ok(false);
    };

    Ok(key.verify(&signed_bytes(req), &signature).is_ok())
}
