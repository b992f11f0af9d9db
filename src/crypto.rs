// src/crypto.rs
// Envelope primitives for the pairing protocol: AES-256-CBC with a
// PBKDF2-derived key+IV, and RSA-2048 (OAEP encryption, PKCS#1 v1.5
// signatures). Everything binary travels base64-encoded inside JSON.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use pbkdf2::pbkdf2_hmac;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const DEFAULT_SALT: u64 = 0x368d_e30e_8ec0_63ce;

const PBKDF2_ROUNDS: u32 = 10_000;
const RSA_BITS: usize = 2048;
// OAEP with SHA-256 over a 2048-bit modulus: k - 2*hLen - 2
const OAEP_CHUNK: usize = RSA_BITS / 8 - 2 * 32 - 2;

/// Symmetric cipher shared by both ends of a pairing channel. The key and IV
/// are derived once from the configured password and salt; plaintext is
/// optionally zlib-compressed before encryption.
#[derive(Clone)]
pub struct AesCipher {
    key: [u8; 32],
    iv: [u8; 16],
    use_compression: bool,
}

impl AesCipher {
    pub fn new(password: &str, salt: u64, use_compression: bool) -> Self {
        let mut derived = [0u8; 48];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt.to_le_bytes(), PBKDF2_ROUNDS, &mut derived);
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        key.copy_from_slice(&derived[..32]);
        iv.copy_from_slice(&derived[32..]);
        Self { key, iv, use_compression }
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<String, String> {
        let payload = if self.use_compression {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(plain_text.as_bytes()).map_err(|e| e.to_string())?;
            encoder.finish().map_err(|e| e.to_string())?
        } else {
            plain_text.as_bytes().to_vec()
        };

        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.iv.into());
        let encrypted = cipher.encrypt_padded_vec_mut::<Pkcs7>(&payload);
        Ok(BASE64.encode(encrypted))
    }

    pub fn decrypt(&self, cipher_text: &str) -> Result<String, String> {
        let encrypted = BASE64.decode(cipher_text.trim()).map_err(|e| e.to_string())?;
        let cipher = Aes256CbcDec::new(&self.key.into(), &self.iv.into());
        let decrypted = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(&encrypted)
            .map_err(|_| "AES decryption failed".to_string())?;

        let plain = if self.use_compression {
            let mut decoder = ZlibDecoder::new(&decrypted[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|e| e.to_string())?;
            out
        } else {
            decrypted
        };

        String::from_utf8(plain).map_err(|e| e.to_string())
    }
}

/// An RSA identity: either a full keypair (our own) or just a public key
/// (a peer's). Keys are exchanged as PEM strings during pairing.
#[derive(Clone, Default)]
pub struct RsaKeys {
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl RsaKeys {
    /// Generate a fresh 2048-bit keypair.
    pub fn generate() -> Result<Self, String> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(|e| e.to_string())?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { public: Some(public), private: Some(private) })
    }

    pub fn from_public_pem(pem: &str) -> Result<Self, String> {
        let public = RsaPublicKey::from_public_key_pem(pem).map_err(|e| e.to_string())?;
        Ok(Self { public: Some(public), private: None })
    }

    pub fn from_private_pem(pem: &str) -> Result<Self, String> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| e.to_string())?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { public: Some(public), private: Some(private) })
    }

    pub fn has_public(&self) -> bool {
        self.public.is_some()
    }

    pub fn public_key_pem(&self) -> Result<String, String> {
        let public = self.public.as_ref().ok_or("no public key")?;
        public.to_public_key_pem(LineEnding::LF).map_err(|e| e.to_string())
    }

    pub fn private_key_pem(&self) -> Result<String, String> {
        let private = self.private.as_ref().ok_or("no private key")?;
        let pem = private.to_pkcs8_pem(LineEnding::LF).map_err(|e| e.to_string())?;
        Ok(pem.to_string())
    }

    /// Encrypt to the holder of this public key. Input is chunked because
    /// protocol frames exceed a single OAEP block.
    pub fn encrypt(&self, plain_text: &str) -> Result<String, String> {
        let public = self.public.as_ref().ok_or("no public key")?;
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        for chunk in plain_text.as_bytes().chunks(OAEP_CHUNK) {
            let block = public
                .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
                .map_err(|e| e.to_string())?;
            out.extend_from_slice(&block);
        }
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, cipher_text: &str) -> Result<String, String> {
        let private = self.private.as_ref().ok_or("no private key")?;
        let data = BASE64.decode(cipher_text.trim()).map_err(|e| e.to_string())?;
        let block_size = RSA_BITS / 8;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err("invalid RSA ciphertext length".to_string());
        }
        let mut out = Vec::new();
        for block in data.chunks(block_size) {
            let plain = private.decrypt(Oaep::new::<Sha256>(), block).map_err(|e| e.to_string())?;
            out.extend_from_slice(&plain);
        }
        String::from_utf8(out).map_err(|e| e.to_string())
    }

    /// PKCS#1 v1.5 signature over SHA-256 of the plaintext.
    pub fn sign(&self, plain_text: &str) -> Result<String, String> {
        let private = self.private.as_ref().ok_or("no private key")?;
        let digest = Sha256::digest(plain_text.as_bytes());
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| e.to_string())?;
        Ok(BASE64.encode(signature))
    }

    pub fn verify(&self, plain_text: &str, signature: &str) -> bool {
        let public = match self.public.as_ref() {
            Some(p) => p,
            None => return false,
        };
        let signature = match BASE64.decode(signature.trim()) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let digest = Sha256::digest(plain_text.as_bytes());
        public.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_roundtrip() {
        let cipher = AesCipher::new("1234567890", DEFAULT_SALT, false);
        let msg = r#"{"machine_name":"TestVehicle","seq":42}"#;
        let encrypted = cipher.encrypt(msg).unwrap();
        assert_ne!(encrypted, msg);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), msg);
    }

    #[test]
    fn test_aes_roundtrip_compressed() {
        let cipher = AesCipher::new("secret", DEFAULT_SALT, true);
        let msg = "x".repeat(4000);
        let encrypted = cipher.encrypt(&msg).unwrap();
        // compressible payload should come out much smaller than the input
        assert!(encrypted.len() < msg.len());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), msg);
    }

    #[test]
    fn test_aes_wrong_password_fails() {
        let cipher = AesCipher::new("password-a", DEFAULT_SALT, true);
        let other = AesCipher::new("password-b", DEFAULT_SALT, true);
        let encrypted = cipher.encrypt("hello").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
        assert!(cipher.decrypt("not base64 at all!!!").is_err());
    }

    #[test]
    fn test_rsa_roundtrip() {
        let ours = RsaKeys::generate().unwrap();
        let theirs_pub = RsaKeys::from_public_pem(&ours.public_key_pem().unwrap()).unwrap();

        // long enough to need several OAEP chunks
        let msg = r#"{"pair":{"request":{"public_key":"PEM"}}}"#.repeat(20);
        let encrypted = theirs_pub.encrypt(&msg).unwrap();
        assert_eq!(ours.decrypt(&encrypted).unwrap(), msg);
    }

    #[test]
    fn test_rsa_pem_reload() {
        let keys = RsaKeys::generate().unwrap();
        let reloaded = RsaKeys::from_private_pem(&keys.private_key_pem().unwrap()).unwrap();
        assert_eq!(keys.public_key_pem().unwrap(), reloaded.public_key_pem().unwrap());
    }

    #[test]
    fn test_sign_verify() {
        let keys = RsaKeys::generate().unwrap();
        let public_only = RsaKeys::from_public_pem(&keys.public_key_pem().unwrap()).unwrap();

        let msg = "bind this name to this key";
        let signature = keys.sign(msg).unwrap();
        assert!(public_only.verify(msg, &signature));
        assert!(!public_only.verify("tampered message", &signature));

        let other = RsaKeys::generate().unwrap();
        assert!(!other.verify(msg, &signature));
    }

    #[test]
    fn test_decrypt_garbage_fails() {
        let keys = RsaKeys::generate().unwrap();
        assert!(keys.decrypt("AAAA").is_err());
        assert!(keys.decrypt("@@@").is_err());
    }
}
