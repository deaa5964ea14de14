use crate::util::decode_hex32;
use async_trait::async_trait;

/// Resolves the opaque credential presented at connect time to a peer id.
/// Token issuance lives outside the relay; the relay only verifies.
#[async_trait]
pub trait ConnectAuthorizer: Send + Sync {
    async fn authorize(&self, token: &str) -> Option<i64>;
}

/// Keyed-hash tokens of the form `{peer}.{mac}`, where the mac is the blake3
/// keyed hash of the little-endian peer id, hex-encoded.
pub struct KeyedTokenAuthorizer {
    secret: [u8; 32],
}

impl KeyedTokenAuthorizer {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Mints the token a client presents for `peer`.
    #[cfg(test)]
    pub fn issue(&self, peer: i64) -> String {
        let mac = blake3::keyed_hash(&self.secret, &peer.to_le_bytes());
        format!("{}.{}", peer, crate::util::encode_hex(mac.as_bytes()))
    }
}

#[async_trait]
impl ConnectAuthorizer for KeyedTokenAuthorizer {
    async fn authorize(&self, token: &str) -> Option<i64> {
        let (peer_raw, mac_hex) = token.split_once('.')?;
        let peer = peer_raw.parse::<i64>().ok()?;
        let presented = decode_hex32(mac_hex).ok()?;
        let expected = blake3::keyed_hash(&self.secret, &peer.to_le_bytes());
        // blake3::Hash equality is constant-time.
        if expected == blake3::Hash::from(presented) {
            Some(peer)
        } else {
            None
        }
    }
}

/// Fixed token table for tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticAuthorizer {
    tokens: std::collections::HashMap<String, i64>,
}

#[cfg(test)]
impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: &str, peer: i64) {
        self.tokens.insert(token.to_string(), peer);
    }
}

#[cfg(test)]
#[async_trait]
impl ConnectAuthorizer for StaticAuthorizer {
    async fn authorize(&self, token: &str) -> Option<i64> {
        self.tokens.get(token).copied()
    }
}
