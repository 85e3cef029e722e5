//! Request signing for authenticated exchange calls.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use trading_core::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// API key pair.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read the key pair from the named environment variables.
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self, ExchangeError> {
        let api_key = std::env::var(key_var)
            .map_err(|_| ExchangeError::Configuration(format!("{} not set", key_var)))?;
        let api_secret = std::env::var(secret_var)
            .map_err(|_| ExchangeError::Configuration(format!("{} not set", secret_var)))?;
        Ok(Self::new(api_key, api_secret))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"***")
            .finish()
    }
}

/// Signs the payload of a state-changing request.
///
/// Exchanges that authenticate with a wallet rather than an API secret
/// provide their own implementation.
pub trait RequestSigner: Send + Sync {
    /// Key sent alongside the signature.
    fn api_key(&self) -> &str;

    fn sign(&self, payload: &str) -> Result<String, ExchangeError>;
}

/// Hex-encoded HMAC-SHA256 over the payload.
#[derive(Debug, Clone)]
pub struct HmacSigner {
    credentials: Credentials,
}

impl HmacSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl RequestSigner for HmacSigner {
    fn api_key(&self) -> &str {
        &self.credentials.api_key
    }

    fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Configuration(format!("HMAC init failed: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_signature() {
        let signer = HmacSigner::new(Credentials::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        ));
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            signer.sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
        assert!(signer.api_key().starts_with("vmPUZE6m"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials::new("key", "very-secret");
        assert!(!format!("{:?}", creds).contains("very-secret"));
    }

    #[test]
    fn test_missing_env_vars() {
        let err = Credentials::from_env("TRADING_TEST_UNSET_KEY", "TRADING_TEST_UNSET_SECRET").unwrap_err();
        assert!(matches!(err, ExchangeError::Configuration(_)));
    }
}
