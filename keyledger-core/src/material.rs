//! Key material generation and the raw cipher/signature primitives
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KmsError, KmsResult};
use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyledger_types::KeyType;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const RSA_BITS: usize = 2048;

/// Freshly generated material for one key version
pub struct GeneratedMaterial {
    /// Raw AES key, or the PKCS#8 PEM of the RSA private key
    pub secret: Vec<u8>,
    /// SPKI PEM, asymmetric only
    pub public_pem: Option<String>,
}

/// Generate material for `key_type`. RSA generation is CPU-bound; run it
/// off the async executor.
pub fn generate(key_type: KeyType) -> KmsResult<GeneratedMaterial> {
    match key_type {
        KeyType::SymmetricAead => {
            let mut secret = vec![0u8; SYMMETRIC_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut secret);
            Ok(GeneratedMaterial {
                secret,
                public_pem: None,
            })
        }
        KeyType::AsymmetricSignEncrypt => {
            let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
                .map_err(|e| KmsError::Internal(format!("RSA key generation failed: {}", e)))?;
            let public = RsaPublicKey::from(&private);

            let private_pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KmsError::Internal(format!("PKCS#8 encoding failed: {}", e)))?;
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| KmsError::Internal(format!("SPKI encoding failed: {}", e)))?;

            Ok(GeneratedMaterial {
                secret: private_pem.as_bytes().to_vec(),
                public_pem: Some(public_pem),
            })
        }
    }
}

/// AES-256-GCM output with the tag kept apart from the ciphertext
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
}

fn aes_cipher(key: &[u8]) -> KmsResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| KmsError::Validation(format!("AES-256 key must be {} bytes", SYMMETRIC_KEY_LEN)))
}

/// Encrypt under a fresh 96-bit nonce
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> KmsResult<Sealed> {
    let cipher = aes_cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|e| KmsError::Internal(format!("Encryption failed: {}", e)))?;

    Ok(Sealed {
        ciphertext: buffer,
        nonce: nonce.to_vec(),
        tag: tag.to_vec(),
    })
}

/// Decrypt and authenticate; any mismatch is a validation failure
pub fn open(key: &[u8], ciphertext: &[u8], nonce: &[u8], tag: &[u8], aad: &[u8]) -> KmsResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(KmsError::Validation(format!("nonce must be {} bytes", NONCE_LEN)));
    }
    if tag.len() != TAG_LEN {
        return Err(KmsError::Validation(format!("tag must be {} bytes", TAG_LEN)));
    }

    let cipher = aes_cipher(key)?;
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut buffer, Tag::from_slice(tag))
        .map_err(|_| KmsError::Validation("ciphertext authentication failed".to_string()))?;
    Ok(buffer)
}

fn public_key(pem: &str) -> KmsResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| KmsError::Integrity(format!("stored public key is unreadable: {}", e)))
}

fn private_key(pem: &[u8]) -> KmsResult<RsaPrivateKey> {
    let pem = std::str::from_utf8(pem)
        .map_err(|_| KmsError::Integrity("unwrapped private key is not PEM".to_string()))?;
    RsaPrivateKey::from_pkcs8_pem(pem)
        .map_err(|e| KmsError::Integrity(format!("unwrapped private key is unreadable: {}", e)))
}

/// RSA-OAEP (SHA-256) encryption under an SPKI PEM public key
pub fn rsa_encrypt(public_pem: &str, plaintext: &[u8]) -> KmsResult<Vec<u8>> {
    public_key(public_pem)?
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| KmsError::Validation(format!("RSA-OAEP encryption failed: {}", e)))
}

pub fn rsa_decrypt(private_pem: &[u8], ciphertext: &[u8]) -> KmsResult<Vec<u8>> {
    private_key(private_pem)?
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|_| KmsError::Validation("RSA-OAEP decryption failed".to_string()))
}

/// RSA PKCS#1 v1.5 signature over SHA-256(payload)
pub fn rsa_sign(private_pem: &[u8], payload: &[u8]) -> KmsResult<Vec<u8>> {
    let digest = Sha256::digest(payload);
    private_key(private_pem)?
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| KmsError::Internal(format!("signing failed: {}", e)))
}

/// `false` for a well-formed signature that does not match
pub fn rsa_verify(public_pem: &str, payload: &[u8], signature: &[u8]) -> KmsResult<bool> {
    let digest = Sha256::digest(payload);
    let valid = public_key(public_pem)?
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok();
    Ok(valid)
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a standard-alphabet base64 field
pub fn decode_b64(field: &str, value: &str) -> KmsResult<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| KmsError::Validation(format!("{} is not valid base64", field)))
}
