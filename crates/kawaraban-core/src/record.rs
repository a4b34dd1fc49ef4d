//! Records and their identity model
//!
//! A record is one post: a [`Head`] (topic, stamp, content-hash id) plus
//! an ordered field set and an optional signature. The id is the SHA-256
//! of the canonical serialization, so a record is self-verifying; a signed
//! record additionally carries `pubkey`, `sign` and `target` fields, where
//! `target` names exactly the fields the signature covers.
//!
//! Field order is preserved because the canonical serialization (and with
//! it the id) depends on it.

use serde::{Deserialize, Serialize};

use crate::error::{BbsError, BbsResult};
use crate::signer::{sha256_hex, verify_detached, RsaSigner, Signer};
use crate::wire::{Range, SEP};

/// Fixed insertion order for well-known fields; unknown fields keep the
/// order the caller supplied, after these.
const FIELD_ORDER: [&str; 5] = ["name", "mail", "body", "attach", "suffix"];

/// Minimal identity of a record, gossiped without the content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Head {
    pub topic: String,
    pub stamp: i64,
    pub id: String,
}

impl Head {
    pub fn new(topic: impl Into<String>, stamp: i64, id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            stamp,
            id: id.into(),
        }
    }

    /// `stamp_id`, the per-topic unique record name
    pub fn idstr(&self) -> String {
        format!("{}_{}", self.stamp, self.id)
    }

    /// Stable digest used for update dedup keys
    pub fn digest(&self) -> String {
        sha256_hex(format!("{}{}{}{}{}", self.topic, SEP, self.stamp, SEP, self.id).as_bytes())
    }

    /// Wire line `stamp<>id`
    pub fn to_wire(&self) -> String {
        format!("{}{}{}", self.stamp, SEP, self.id)
    }

    /// Parse a `/head` response line
    pub fn from_wire(topic: &str, line: &str) -> BbsResult<Self> {
        let mut parts = line.trim().split(SEP);
        let stamp = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
        let id = parts
            .next()
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
        Ok(Self::new(topic, stamp, id))
    }
}

/// A full post: head, ordered fields, soft-delete flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub head: Head,
    fields: Vec<(String, String)>,
    /// Soft-deleted records stay around as tombstones for a grace period
    pub deleted: bool,
}

impl Record {
    /// Build a record, signing it when a passphrase is given.
    ///
    /// Known fields are inserted in the fixed canonical order; with a
    /// non-empty passphrase the signature fields (`pubkey`, `sign`,
    /// `target`) are appended and the id covers them too.
    pub fn build(
        topic: &str,
        stamp: i64,
        fields: Vec<(String, String)>,
        passphrase: &str,
    ) -> BbsResult<Self> {
        let mut ordered: Vec<(String, String)> = Vec::with_capacity(fields.len() + 3);
        for key in FIELD_ORDER {
            if let Some((k, v)) = fields.iter().find(|(k, _)| k == key) {
                ordered.push((k.clone(), v.clone()));
            }
        }
        for (k, v) in &fields {
            if !FIELD_ORDER.contains(&k.as_str()) {
                ordered.push((k.clone(), v.clone()));
            }
        }

        let mut record = Self {
            head: Head::new(topic, stamp, String::new()),
            fields: ordered,
            deleted: false,
        };

        if !passphrase.is_empty() {
            let signer = RsaSigner::from_passphrase(passphrase)?;
            let target: Vec<String> = record.fields.iter().map(|(k, _)| k.clone()).collect();
            let names: Vec<&str> = target.iter().map(String::as_str).collect();
            let digest = record.target_digest(&names);
            let sig = signer.sign(&digest)?;
            record.fields.push(("pubkey".to_string(), signer.public_key()));
            record.fields.push(("sign".to_string(), sig));
            record.fields.push(("target".to_string(), target.join(",")));
        }

        record.head.id = record.compute_id();
        Ok(record)
    }

    /// Look up a field value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The ordered field set
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Canonical serialization: `key:value` joined by `<>`
    pub fn body_string(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(SEP)
    }

    /// Serialized size in bytes, used by the spam size cap
    pub fn len_bytes(&self) -> usize {
        self.body_string().len()
    }

    fn compute_id(&self) -> String {
        sha256_hex(self.body_string().as_bytes())
    }

    /// Digest over exactly the named fields, in stored order
    fn target_digest(&self, target: &[&str]) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let covered: String = self
            .fields
            .iter()
            .filter(|(k, _)| target.contains(&k.as_str()))
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join(SEP);
        Sha256::digest(covered.as_bytes()).into()
    }

    /// Integrity plus authorship check.
    ///
    /// The id must equal the hash of the serialization; when signature
    /// fields are present the signature must check out over the `target`
    /// fields against the embedded pubkey. This proves authorship only,
    /// never the transport endpoint.
    pub fn verify(&self) -> bool {
        if self.head.id != self.compute_id() {
            return false;
        }
        match self.get("pubkey") {
            None => true,
            Some(pubkey) => {
                let (Some(sig), Some(target)) = (self.get("sign"), self.get("target")) else {
                    return false;
                };
                let names: Vec<&str> = target.split(',').collect();
                let pubkey = pubkey.to_string();
                let sig = sig.to_string();
                let digest = self.target_digest(&names);
                verify_detached(&digest, &sig, &pubkey)
            }
        }
    }

    /// Range filter plus integrity check, applied to everything that
    /// arrives from the network before trust is extended
    pub fn meets(&self, range: &Range) -> bool {
        range.contains(self.head.stamp, &self.head.id) && self.verify()
    }

    /// Wire line `stamp<>id<>key:value<>...`
    pub fn to_wire(&self) -> String {
        format!("{}{}{}{}{}", self.head.stamp, SEP, self.head.id, SEP, self.body_string())
    }

    /// Parse a `/get` response line
    pub fn from_wire(topic: &str, line: &str) -> BbsResult<Self> {
        let line = line.trim();
        let mut parts = line.splitn(3, SEP);
        let stamp = parts
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
        let id = parts
            .next()
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
        let body = parts
            .next()
            .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
        let mut fields = Vec::new();
        for part in body.split(SEP) {
            let (k, v) = part
                .split_once(':')
                .ok_or_else(|| BbsError::InvalidRecord(line.to_string()))?;
            fields.push((k.to_string(), v.to_string()));
        }
        Ok(Self {
            head: Head::new(topic, stamp, id),
            fields,
            deleted: false,
        })
    }
}
