// =============================================================================
// Per-account bearer token minting — HMAC-SHA256
// =============================================================================
//
// SECURITY: private key material is never logged or serialized. Tokens are
// short-lived and carry their own expiry so a connector never has to ask
// the minter whether a token is still valid.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::types::AccountConfig;

type HmacSha256 = Hmac<Sha256>;

/// Minted tokens are valid for this long from issuance.
const TOKEN_VALIDITY_SECS: i64 = 600;

#[derive(Debug, Error)]
pub enum MintError {
    #[error("invalid key material for account {0}")]
    InvalidKey(i64),
}

#[derive(Clone, Debug)]
pub struct Token {
    pub value: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Token {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Mints short-lived bearer tokens per account from in-memory key material.
/// `Send + Sync` so both the REST and WS connectors can mint concurrently
/// without any shared mutable state.
pub struct AuthMinter {
    account_id: i64,
    private_key: String,
    public_key: String,
}

impl AuthMinter {
    pub fn new(config: &AccountConfig) -> Self {
        AuthMinter {
            account_id: config.account_id,
            private_key: config.private_key.clone(),
            public_key: config.public_key.clone(),
        }
    }

    pub fn mint(&self) -> Result<Token, MintError> {
        let issued_at = now_epoch();
        let expires_at = issued_at + TOKEN_VALIDITY_SECS;
        let payload = format!("{}.{}.{}", self.account_id, self.public_key, expires_at);

        let mut mac = HmacSha256::new_from_slice(self.private_key.as_bytes())
            .map_err(|_| MintError::InvalidKey(self.account_id))?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        debug!(account_id = self.account_id, expires_at, "minted auth token");

        Ok(Token {
            value: format!("{payload}.{signature}"),
            issued_at,
            expires_at,
        })
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AccountConfig {
        AccountConfig {
            account_id: 7,
            account_name: "acct-7".into(),
            api_key_index: 0,
            private_key: "secret-key-material".into(),
            public_key: "pub-material".into(),
            proxy_url: None,
        }
    }

    #[test]
    fn mint_produces_a_non_empty_token_with_future_expiry() {
        let minter = AuthMinter::new(&config());
        let token = minter.mint().unwrap();
        assert!(!token.value.is_empty());
        assert_eq!(token.expires_at - token.issued_at, TOKEN_VALIDITY_SECS);
        assert!(!token.is_expired(token.issued_at));
    }

    #[test]
    fn token_is_expired_once_past_its_window() {
        let minter = AuthMinter::new(&config());
        let token = minter.mint().unwrap();
        assert!(token.is_expired(token.expires_at + 1));
    }

    #[test]
    fn two_mints_for_the_same_account_differ() {
        // Different issuance times produce different signatures even for
        // the same key material, since the payload carries the expiry.
        let minter = AuthMinter::new(&config());
        let a = minter.mint().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = minter.mint().unwrap();
        assert_ne!(a.value, b.value);
    }
}
