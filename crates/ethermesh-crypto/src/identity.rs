//! Node Identity Management
//!
//! Each node owns a long-term identity made of two keypairs:
//! - An Ed25519 signing keypair for authentication
//! - An X25519 static keypair for key agreement
//!
//! The node's 384-bit identity hash is the BLAKE3 XOF of both public keys,
//! and its 40-bit short address is the first five bytes of that hash. A
//! claimed address is only ever trusted after re-deriving it from the keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::address::{Address, IdentityHash};
use crate::constants::{
    ADDRESS_SIZE, ED25519_PUBKEY_SIZE, IDENTITY_HASH_SIZE, IDENTITY_MARSHAL_SIZE,
    SIGNATURE_SIZE, X25519_PUBKEY_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::symmetric::SessionKeys;

/// A node's complete long-term identity (secret halves included)
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    /// Ed25519 signing key
    #[zeroize(skip)]
    signing_key: SigningKey,

    /// X25519 static agreement secret
    #[zeroize(skip)]
    agreement_secret: StaticSecret,

    /// Cached public half
    #[zeroize(skip)]
    public: IdentityPublic,
}

/// The shareable half of an identity
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublic {
    signing: [u8; ED25519_PUBKEY_SIZE],
    agreement: [u8; X25519_PUBKEY_SIZE],
}

impl IdentityPublic {
    /// Reconstruct from raw public key bytes
    pub fn from_keys(
        signing: [u8; ED25519_PUBKEY_SIZE],
        agreement: [u8; X25519_PUBKEY_SIZE],
    ) -> CryptoResult<Self> {
        // Reject bytes that do not decode to a valid curve point up front
        VerifyingKey::from_bytes(&signing).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { signing, agreement })
    }

    /// The 384-bit hash of both public keys
    pub fn identity_hash(&self) -> IdentityHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing);
        hasher.update(&self.agreement);
        let mut out = [0u8; IDENTITY_HASH_SIZE];
        hasher.finalize_xof().fill(&mut out);
        IdentityHash::from_bytes(out)
    }

    /// The short address derived from this identity
    pub fn address(&self) -> Address {
        self.identity_hash().address()
    }

    /// Check a claimed address against the derived one
    pub fn verify_binding(&self, claimed: Address) -> CryptoResult<()> {
        let derived = self.address();
        if claimed != derived {
            return Err(CryptoError::AddressMismatch {
                claimed: claimed.to_string(),
                derived: derived.to_string(),
            });
        }
        Ok(())
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let key = VerifyingKey::from_bytes(&self.signing)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig_bytes: [u8; SIGNATURE_SIZE] = signature
            .try_into()
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        key.verify(message, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }

    /// Ed25519 public key bytes
    pub fn signing_key(&self) -> &[u8; ED25519_PUBKEY_SIZE] {
        &self.signing
    }

    /// X25519 public key bytes
    pub fn agreement_key(&self) -> &[u8; X25519_PUBKEY_SIZE] {
        &self.agreement
    }

    /// Wire form: address followed by both public keys
    pub fn marshal(&self) -> [u8; IDENTITY_MARSHAL_SIZE] {
        let mut out = [0u8; IDENTITY_MARSHAL_SIZE];
        out[..ADDRESS_SIZE].copy_from_slice(&self.address().to_bytes());
        out[ADDRESS_SIZE..ADDRESS_SIZE + ED25519_PUBKEY_SIZE].copy_from_slice(&self.signing);
        out[ADDRESS_SIZE + ED25519_PUBKEY_SIZE..].copy_from_slice(&self.agreement);
        out
    }

    /// Parse a marshaled identity and verify the embedded address binding
    pub fn unmarshal(data: &[u8]) -> CryptoResult<Self> {
        if data.len() < IDENTITY_MARSHAL_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: IDENTITY_MARSHAL_SIZE,
                actual: data.len(),
            });
        }
        let claimed = Address::from_bytes(&data[..ADDRESS_SIZE])?;
        let mut signing = [0u8; ED25519_PUBKEY_SIZE];
        signing.copy_from_slice(&data[ADDRESS_SIZE..ADDRESS_SIZE + ED25519_PUBKEY_SIZE]);
        let mut agreement = [0u8; X25519_PUBKEY_SIZE];
        agreement.copy_from_slice(
            &data[ADDRESS_SIZE + ED25519_PUBKEY_SIZE..IDENTITY_MARSHAL_SIZE],
        );
        let public = Self::from_keys(signing, agreement)?;
        public.verify_binding(claimed)?;
        Ok(public)
    }
}

impl std::fmt::Debug for IdentityPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityPublic({})", self.address())
    }
}

impl Identity {
    /// Generate a new random identity whose address is not reserved
    pub fn generate() -> Self {
        loop {
            let signing_key = SigningKey::generate(&mut OsRng);
            let mut agreement_bytes = [0u8; 32];
            OsRng.fill_bytes(&mut agreement_bytes);
            let agreement_secret = StaticSecret::from(agreement_bytes);
            let public = IdentityPublic {
                signing: signing_key.verifying_key().to_bytes(),
                agreement: X25519Public::from(&agreement_secret).to_bytes(),
            };
            if !public.address().is_reserved() {
                return Self {
                    signing_key,
                    agreement_secret,
                    public,
                };
            }
        }
    }

    /// Restore an identity from its secret key bytes
    pub fn from_secret_keys(signing: [u8; 32], agreement: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&signing);
        let agreement_secret = StaticSecret::from(agreement);
        let public = IdentityPublic {
            signing: signing_key.verifying_key().to_bytes(),
            agreement: X25519Public::from(&agreement_secret).to_bytes(),
        };
        Self {
            signing_key,
            agreement_secret,
            public,
        }
    }

    /// Export secret key bytes for storage
    pub fn export_secret_keys(&self) -> ([u8; 32], [u8; 32]) {
        (
            self.signing_key.to_bytes(),
            self.agreement_secret.to_bytes(),
        )
    }

    /// This node's short address
    pub fn address(&self) -> Address {
        self.public.address()
    }

    /// This node's identity hash
    pub fn identity_hash(&self) -> IdentityHash {
        self.public.identity_hash()
    }

    /// The shareable half
    pub fn public(&self) -> &IdentityPublic {
        &self.public
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Run key agreement against a peer identity and derive session keys
    pub fn agree(&self, other: &IdentityPublic) -> SessionKeys {
        let shared = self
            .agreement_secret
            .diffie_hellman(&X25519Public::from(*other.agreement_key()));
        SessionKeys::derive(shared.as_bytes())
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        let (signing, agreement) = self.export_secret_keys();
        Self::from_secret_keys(signing, agreement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_binding() {
        let id = Identity::generate();
        assert!(!id.address().is_reserved());
        assert!(id.public().verify_binding(id.address()).is_ok());
        assert!(id
            .public()
            .verify_binding(Address::from_u64(0x0102030405))
            .is_err());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let msg = b"hello overlay";
        let sig = id.sign(msg);
        assert!(id.public().verify(msg, &sig).is_ok());
        assert!(id.public().verify(b"other message", &sig).is_err());
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();
        let ab = a.agree(b.public());
        let ba = b.agree(a.public());
        assert_eq!(ab.crypt.as_bytes(), ba.crypt.as_bytes());
        assert_eq!(ab.mac.as_bytes(), ba.mac.as_bytes());
    }

    #[test]
    fn test_marshal_roundtrip_checks_binding() {
        let id = Identity::generate();
        let wire = id.public().marshal();
        let back = IdentityPublic::unmarshal(&wire).unwrap();
        assert_eq!(back.address(), id.address());

        // Corrupting the claimed address must be rejected
        let mut bad = wire;
        bad[0] ^= 0x01;
        assert!(IdentityPublic::unmarshal(&bad).is_err());
    }

    #[test]
    fn test_export_import() {
        let id = Identity::generate();
        let (s, a) = id.export_secret_keys();
        let restored = Identity::from_secret_keys(s, a);
        assert_eq!(restored.address(), id.address());
        assert_eq!(restored.identity_hash(), id.identity_hash());
    }
}
