/*
[INPUT]:  32-byte master key from configuration, wallet secrets / ciphertext columns
[OUTPUT]: AES-256-GCM ciphertext (base64 nonce||ct) and decrypted WalletCredentials
[POS]:    Security layer - the only place plaintext wallet secrets are produced
[UPDATE]: When the ciphertext format or key loading rules change
*/

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use thiserror::Error;

use crate::types::{MaskedWallet, Wallet, WalletCredentials, WalletType};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid master key: expected {KEY_SIZE} bytes, got {0}")]
    InvalidMasterKey(usize),

    /// The master key changed since encryption, or the ciphertext is corrupt.
    #[error("invalid key or ciphertext")]
    InvalidKeyOrCiphertext,

    #[error("encryption failed")]
    Encryption,

    #[error("wallet {wallet_id} has no stored {field}")]
    MissingField { wallet_id: i64, field: &'static str },
}

/// Encrypts and decrypts wallet secrets with a single process-wide master key.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Load the master key from its configuration form.
    ///
    /// Accepts base64 of exactly 32 bytes, or a raw 32-byte string.
    pub fn from_config_value(value: &str) -> Result<Self, VaultError> {
        let value = value.trim();
        let bytes = match BASE64.decode(value) {
            Ok(decoded) if decoded.len() == KEY_SIZE => decoded,
            _ if value.len() == KEY_SIZE => value.as_bytes().to_vec(),
            Ok(decoded) => return Err(VaultError::InvalidMasterKey(decoded.len())),
            Err(_) => return Err(VaultError::InvalidMasterKey(value.len())),
        };

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self::new(&key))
    }

    /// Fresh random master key, base64 encoded.
    pub fn generate_master_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let data = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| VaultError::InvalidKeyOrCiphertext)?;
        if data.len() <= NONCE_SIZE {
            return Err(VaultError::InvalidKeyOrCiphertext);
        }

        let (nonce_bytes, body) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| VaultError::InvalidKeyOrCiphertext)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::InvalidKeyOrCiphertext)
    }

    pub fn decrypt_secret(&self, ciphertext: &str) -> Result<SecretString, VaultError> {
        self.decrypt(ciphertext).map(SecretString::from)
    }

    pub fn encrypt_secret(&self, secret: &SecretString) -> Result<String, VaultError> {
        self.encrypt(secret.expose_secret())
    }

    /// Re-materialise a wallet's credentials for one run.
    pub fn decrypt_credentials(&self, wallet: &Wallet) -> Result<WalletCredentials, VaultError> {
        fn field<'w>(
            wallet: &Wallet,
            value: &'w Option<String>,
            name: &'static str,
        ) -> Result<&'w str, VaultError> {
            value.as_deref().ok_or(VaultError::MissingField {
                wallet_id: wallet.id,
                field: name,
            })
        }

        match wallet.wallet_type {
            WalletType::Spot => {
                let api_key = field(wallet, &wallet.encrypted_api_key, "api_key")?;
                let secret_key = field(wallet, &wallet.encrypted_secret_key, "secret_key")?;
                Ok(WalletCredentials::Spot {
                    api_key: self.decrypt_secret(api_key)?,
                    secret_key: self.decrypt_secret(secret_key)?,
                })
            }
            WalletType::Futures => {
                let private_key = field(wallet, &wallet.encrypted_private_key, "private_key")?;
                Ok(WalletCredentials::Futures {
                    user_address: field(wallet, &wallet.user_address, "user_address")?.to_string(),
                    signer_address: field(wallet, &wallet.signer_address, "signer_address")?
                        .to_string(),
                    private_key: self.decrypt_secret(private_key)?,
                })
            }
        }
    }

    /// Display-safe projection; undecryptable fields show as `<undecryptable>`.
    pub fn mask(&self, wallet: &Wallet) -> MaskedWallet {
        let hidden = |value: &Option<String>| {
            value.as_deref().map(|ciphertext| match self.decrypt(ciphertext) {
                Ok(_) => "***".to_string(),
                Err(_) => "<undecryptable>".to_string(),
            })
        };
        let api_key = wallet
            .encrypted_api_key
            .as_deref()
            .map(|ciphertext| match self.decrypt(ciphertext) {
                Ok(plain) => format!("{}...", plain.chars().take(8).collect::<String>()),
                Err(_) => "<undecryptable>".to_string(),
            });

        MaskedWallet {
            id: wallet.id,
            name: wallet.name.clone(),
            wallet_type: wallet.wallet_type,
            api_key,
            secret_key: hidden(&wallet.encrypted_secret_key),
            private_key: hidden(&wallet.encrypted_private_key),
            user_address: wallet.user_address.clone(),
            signer_address: wallet.signer_address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn vault() -> CredentialVault {
        CredentialVault::from_config_value(&CredentialVault::generate_master_key()).unwrap()
    }

    fn spot_wallet(vault: &CredentialVault) -> Wallet {
        let now = Utc::now();
        Wallet {
            id: 7,
            user_id: 1,
            name: "main".to_string(),
            description: None,
            wallet_type: WalletType::Spot,
            encrypted_api_key: Some(vault.encrypt("AKIA1234567890").unwrap()),
            encrypted_secret_key: Some(vault.encrypt("very-secret").unwrap()),
            user_address: None,
            signer_address: None,
            encrypted_private_key: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_used: None,
        }
    }

    #[rstest]
    #[case("")]
    #[case("api-key-0001")]
    #[case("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")]
    #[case("多字节 payload ✓")]
    fn test_decrypt_recovers_plaintext(#[case] plaintext: &str) {
        let vault = vault();
        let ciphertext = vault.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(vault.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_ciphertexts_use_fresh_nonces() {
        let vault = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
        let reencrypted = vault.encrypt(&vault.decrypt(&a).unwrap()).unwrap();
        assert_eq!(vault.decrypt(&reencrypted).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = vault();
        let ciphertext = vault.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&ciphertext).unwrap();
        for index in 0..bytes.len() {
            bytes[index] ^= 0x01;
            let tampered = BASE64.encode(&bytes);
            assert!(matches!(
                vault.decrypt(&tampered),
                Err(VaultError::InvalidKeyOrCiphertext)
            ));
            bytes[index] ^= 0x01;
        }
    }

    #[test]
    fn test_changed_master_key_fails() {
        let ciphertext = vault().encrypt("secret").unwrap();
        assert!(matches!(
            vault().decrypt(&ciphertext),
            Err(VaultError::InvalidKeyOrCiphertext)
        ));
    }

    #[test]
    fn test_garbage_and_short_inputs_fail() {
        let vault = vault();
        assert!(vault.decrypt("not base64 !!").is_err());
        assert!(vault.decrypt(&BASE64.encode([0u8; NONCE_SIZE])).is_err());
    }

    #[test]
    fn test_master_key_forms() {
        assert!(CredentialVault::from_config_value("0123456789abcdef0123456789abcdef").is_ok());
        assert!(matches!(
            CredentialVault::from_config_value(&BASE64.encode([1u8; 16])),
            Err(VaultError::InvalidMasterKey(16))
        ));
        assert!(matches!(
            CredentialVault::from_config_value("short"),
            Err(VaultError::InvalidMasterKey(_))
        ));
    }

    #[test]
    fn test_decrypt_credentials_and_mask() {
        let vault = vault();
        let wallet = spot_wallet(&vault);

        match vault.decrypt_credentials(&wallet).unwrap() {
            WalletCredentials::Spot {
                api_key,
                secret_key,
            } => {
                assert_eq!(api_key.expose_secret(), "AKIA1234567890");
                assert_eq!(secret_key.expose_secret(), "very-secret");
            }
            other => panic!("unexpected credentials: {other:?}"),
        }

        let masked = vault.mask(&wallet);
        assert_eq!(masked.api_key.as_deref(), Some("AKIA1234..."));
        assert_eq!(masked.secret_key.as_deref(), Some("***"));
        assert_eq!(masked.private_key, None);
    }

    #[test]
    fn test_futures_credentials_borrow_addresses_from_wallet() {
        let vault = vault();
        let mut wallet = spot_wallet(&vault);
        wallet.wallet_type = WalletType::Futures;
        wallet.user_address = Some("0xabc".to_string());
        wallet.signer_address = Some("0xdef".to_string());
        wallet.encrypted_private_key = Some(vault.encrypt("0xfeedface").unwrap());

        match vault.decrypt_credentials(&wallet).unwrap() {
            WalletCredentials::Futures {
                user_address,
                signer_address,
                private_key,
            } => {
                assert_eq!(user_address, "0xabc");
                assert_eq!(signer_address, "0xdef");
                assert_eq!(private_key.expose_secret(), "0xfeedface");
            }
            other => panic!("unexpected credentials: {other:?}"),
        }
    }

    #[test]
    fn test_missing_futures_key_is_reported() {
        let vault = vault();
        let mut wallet = spot_wallet(&vault);
        wallet.wallet_type = WalletType::Futures;
        wallet.user_address = Some("0xabc".to_string());
        wallet.signer_address = Some("0xdef".to_string());

        let err = vault.decrypt_credentials(&wallet).unwrap_err();
        assert!(matches!(
            err,
            VaultError::MissingField {
                wallet_id: 7,
                field: "private_key"
            }
        ));
    }
}
