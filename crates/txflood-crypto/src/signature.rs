//! Recoverable ECDSA signatures over secp256k1

use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use txflood_primitives::{Address, H256};

use crate::{keccak256, CryptoError};

/// Private key
pub type PrivateKey = SigningKey;

/// Public key
pub type PublicKey = VerifyingKey;

/// Recoverable signature with the y-parity bit kept separately
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    /// r scalar
    pub r: [u8; 32],
    /// s scalar, always in the lower half of the curve order
    pub s: [u8; 32],
    /// y parity of the ephemeral point (0 or 1)
    pub y_parity: u8,
}

impl Signature {
    fn to_k256(self) -> Result<(K256Signature, RecoveryId), CryptoError> {
        let sig = K256Signature::from_scalars(self.r, self.s)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let recid = RecoveryId::from_byte(self.y_parity)
            .ok_or(CryptoError::InvalidRecoveryId(self.y_parity))?;
        Ok((sig, recid))
    }
}

/// Sign a 32-byte prehash
pub fn sign(hash: &H256, key: &PrivateKey) -> Result<Signature, CryptoError> {
    let (mut sig, mut recid) = key
        .sign_prehash_recoverable(hash.as_bytes())
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

    // EIP-2: high-s values flip the parity of R
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recid = RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced());
    }

    Ok(Signature {
        r: sig.r().to_bytes().into(),
        s: sig.s().to_bytes().into(),
        y_parity: recid.to_byte(),
    })
}

/// Recover the signer's address from a prehash and signature
pub fn recover_address(hash: &H256, signature: &Signature) -> Result<Address, CryptoError> {
    let (sig, recid) = signature.to_k256()?;
    let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &sig, recid)
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;
    Ok(public_key_to_address(&key))
}

/// Derive the account address of a public key
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let point = public_key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash.as_bytes()[12..]);
    Address::from_bytes(bytes)
}
