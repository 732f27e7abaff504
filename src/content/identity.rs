//! Identities, signatures, and the signing keystore
//!
//! An identity is a bs58-encoded Ed25519 public key, so the verifying key is
//! derivable from the identity string alone. Each entity signs a fixed
//! projection of its own fields; the projection functions here are the single
//! source of truth shared by signing and verification, so the two can never
//! drift apart.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Value};

use super::{address, Comment, Community, Post, Tip, Vote, ANONYMOUS};

/// Derive the verifying key from an identity string.
///
/// Returns None for anything that is not a bs58-encoded 32-byte Ed25519 key;
/// callers must fail closed on None.
pub fn address_to_verifying_key(address: &str) -> Option<VerifyingKey> {
    let bytes = bs58::decode(address).into_vec().ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

/// Encode a verifying key as an identity string.
pub fn verifying_key_to_address(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

// Signable projections. Each entity signs a sorted-key JSON object of an
// explicit field subset: never the signature itself, never the content hash,
// and never the author-identity field (the identity is read off the record
// at verify time).

pub fn signable_community(c: &Community) -> Value {
    json!({
        "id": c.id,
        "name": c.name,
        "description": c.description,
        "createdAt": c.created_at,
    })
}

pub fn signable_post(p: &Post) -> Value {
    json!({
        "id": p.id,
        "title": p.title,
        "body": p.body,
        "communityId": p.community_id,
        "createdAt": p.created_at,
    })
}

pub fn signable_comment(c: &Comment) -> Value {
    json!({
        "id": c.id,
        "body": c.body,
        "postId": c.post_id,
        "parentId": c.parent_id,
        "createdAt": c.created_at,
    })
}

pub fn signable_vote(v: &Vote) -> Value {
    json!({
        "id": v.id,
        "targetId": v.target_id,
        "targetType": v.target_type,
        "value": v.value,
        "createdAt": v.created_at,
    })
}

pub fn signable_tip(t: &Tip) -> Value {
    json!({
        "id": t.id,
        "to": t.to,
        "amountRaw": t.amount_raw,
        "blockHash": t.block_hash,
        "targetId": t.target_id,
        "targetType": t.target_type,
        "createdAt": t.created_at,
    })
}

/// Check one signature over one canonical payload.
///
/// The anonymous identity always passes (anonymous content is allowed,
/// simply unverified). Any other identity must carry a non-empty hex
/// signature that verifies against the key derived from the identity.
fn verify_payload(identity: &str, payload: &Value, signature_hex: &str) -> bool {
    if identity == ANONYMOUS {
        return true;
    }
    if signature_hex.is_empty() {
        return false;
    }
    let Some(key) = address_to_verifying_key(identity) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_arr);
    let message = match serde_json::to_string(payload) {
        Ok(m) => m,
        Err(_) => return false,
    };
    key.verify(message.as_bytes(), &signature).is_ok()
}

pub fn verify_community(c: &Community) -> bool {
    verify_payload(&c.creator, &signable_community(c), &c.signature)
}

pub fn verify_post(p: &Post) -> bool {
    verify_payload(&p.author, &signable_post(p), &p.signature)
}

pub fn verify_comment(c: &Comment) -> bool {
    verify_payload(&c.author, &signable_comment(c), &c.signature)
}

pub fn verify_vote(v: &Vote) -> bool {
    verify_payload(&v.voter, &signable_vote(v), &v.signature)
}

pub fn verify_tip(t: &Tip) -> bool {
    verify_payload(&t.from, &signable_tip(t), &t.signature)
}

/// The local signing capability.
///
/// Key management (unlock, encryption at rest) lives elsewhere; this layer
/// only receives "a signing key" or "no signing key". Without one, locally
/// authored records are stamped anonymous and unsigned, a valid state rather than
/// an error.
pub struct Keystore {
    signing: Option<SigningKey>,
}

impl Keystore {
    pub fn anonymous() -> Self {
        Self { signing: None }
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        Self { signing: Some(key) }
    }

    pub fn generate() -> Self {
        Self {
            signing: Some(SigningKey::generate(&mut rand::rngs::OsRng)),
        }
    }

    pub fn can_sign(&self) -> bool {
        self.signing.is_some()
    }

    /// The identity locally-authored records carry.
    pub fn address(&self) -> String {
        match &self.signing {
            Some(key) => verifying_key_to_address(&key.verifying_key()),
            None => ANONYMOUS.to_string(),
        }
    }

    fn sign(&self, payload: &Value) -> Result<String, serde_json::Error> {
        match &self.signing {
            Some(key) => {
                let message = serde_json::to_string(payload)?;
                Ok(hex::encode(key.sign(message.as_bytes()).to_bytes()))
            }
            None => Ok(String::new()),
        }
    }

    /// Fill in author, content hash, and signature on a freshly built record.
    /// The identity field is set before hashing so the digest covers it.
    pub fn stamp_community(&self, c: &mut Community) -> Result<(), serde_json::Error> {
        c.creator = self.address();
        c.content_hash = String::new();
        c.signature = String::new();
        c.content_hash = address::content_hash(c)?;
        c.signature = self.sign(&signable_community(c))?;
        Ok(())
    }

    pub fn stamp_post(&self, p: &mut Post) -> Result<(), serde_json::Error> {
        p.author = self.address();
        p.content_hash = String::new();
        p.signature = String::new();
        p.content_hash = address::content_hash(p)?;
        p.signature = self.sign(&signable_post(p))?;
        Ok(())
    }

    pub fn stamp_comment(&self, c: &mut Comment) -> Result<(), serde_json::Error> {
        c.author = self.address();
        c.content_hash = String::new();
        c.signature = String::new();
        c.content_hash = address::content_hash(c)?;
        c.signature = self.sign(&signable_comment(c))?;
        Ok(())
    }

    pub fn stamp_vote(&self, v: &mut Vote) -> Result<(), serde_json::Error> {
        v.voter = self.address();
        v.signature = self.sign(&signable_vote(v))?;
        Ok(())
    }

    pub fn stamp_tip(&self, t: &mut Tip) -> Result<(), serde_json::Error> {
        t.from = self.address();
        t.signature = self.sign(&signable_tip(t))?;
        Ok(())
    }
}
