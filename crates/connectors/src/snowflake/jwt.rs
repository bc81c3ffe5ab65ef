use crate::error::ConnectorError;
use base64::{Engine, engine::general_purpose::STANDARD};
use jwt_simple::prelude::*;
use sha2::{Digest, Sha256};

/// Key-pair JWT for the Snowflake SQL API. The issuer embeds the SHA-256
/// fingerprint of the public key; account and user are upper-cased the way
/// Snowflake canonicalizes them.
pub struct KeyPairAuth {
    key_pair: RS256KeyPair,
    qualified_user: String,
    issuer: String,
}

impl KeyPairAuth {
    pub fn new(account: &str, user: &str, private_key_pem: &str) -> Result<Self, ConnectorError> {
        let key_pair = RS256KeyPair::from_pem(private_key_pem)
            .map_err(|e| ConnectorError::InvalidConfig(format!("snowflake private key: {e}")))?;
        let public_der = key_pair
            .public_key()
            .to_der()
            .map_err(|e| ConnectorError::InvalidConfig(format!("snowflake public key: {e}")))?;
        let fingerprint = STANDARD.encode(Sha256::digest(&public_der));

        let qualified_user = format!(
            "{}.{}",
            account.to_ascii_uppercase(),
            user.to_ascii_uppercase()
        );
        let issuer = format!("{qualified_user}.SHA256:{fingerprint}");
        Ok(Self {
            key_pair,
            qualified_user,
            issuer,
        })
    }

    /// Mints a short-lived token; the API rejects anything older than an
    /// hour, so callers request a fresh one per statement.
    pub fn token(&self) -> Result<String, ConnectorError> {
        let claims = Claims::create(Duration::from_hours(1))
            .with_issuer(&self.issuer)
            .with_subject(&self.qualified_user);
        self.key_pair
            .sign(claims)
            .map_err(|e| ConnectorError::InvalidConfig(format!("jwt signing: {e}")))
    }
}
