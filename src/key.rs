//! Purpose-labelled subkey derivation
//!
//! All keys in the transit protocol are derived from one master secret, the
//! transit key, which the host obtained from some out-of-band key agreement.
//! Every derived key is labelled with the purpose it is used for, so that no
//! two protocol steps can ever end up with the same key material.

use hkdf::Hkdf;
use sha2::Sha256;
use std::{marker::PhantomData, ops::Deref};

/// Marker trait to distinguish the different key purposes
pub trait KeyPurpose: std::fmt::Debug {}

/// The transit key as handed over by the key agreement step
#[derive(Debug)]
pub struct TransitKey;
impl KeyPurpose for TransitKey {}

/// Key for sending data on an established record pipe
#[derive(Debug)]
pub struct TransitTxKey;
impl KeyPurpose for TransitTxKey {}

/// Key for receiving data on an established record pipe
#[derive(Debug)]
pub struct TransitRxKey;
impl KeyPurpose for TransitRxKey {}

/// A generic key purpose for when the subkey does not encrypt anything itself,
/// e.g. the material embedded into the handshake headers.
#[derive(Debug)]
pub struct GenericKey;
impl KeyPurpose for GenericKey {}

/**
 * Some secret key material, bound to the purpose it may be used for.
 *
 * The type parameter is a phantom; it only prevents e.g. a receive key from
 * being passed where a send key is expected.
 */
pub struct Key<P: KeyPurpose>(Box<[u8]>, PhantomData<P>);

/* Not derived: the purpose is phantom and must not bound the impl */
impl<P: KeyPurpose> Clone for Key<P> {
    fn clone(&self) -> Self {
        Key(self.0.clone(), PhantomData)
    }
}

impl<P: KeyPurpose> std::fmt::Debug for Key<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        /* Don't print the key bytes, even at debug level */
        write!(f, "Key<{:?}>(…)", PhantomData::<P>)
    }
}

impl<P: KeyPurpose> Deref for Key<P> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<P: KeyPurpose> Key<P> {
    pub fn new(key: Box<[u8]>) -> Self {
        Key(key, PhantomData)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /**
     * Derive a new 256 bit key from this one, for a different purpose.
     */
    pub fn derive_subkey_from_purpose<Q: KeyPurpose>(&self, purpose: &str) -> Key<Q> {
        const LENGTH: usize = 32;
        Key(
            derive_key(&self.0, purpose.as_bytes(), LENGTH).into_boxed_slice(),
            PhantomData,
        )
    }
}

/// HKDF-SHA256 with empty salt and the purpose as info string
pub fn derive_key(key: &[u8], purpose: &[u8], length: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(None, key);
    let mut v = vec![0; length];
    hk.expand(purpose, &mut v)
        .expect("Length must be a valid HKDF-SHA256 output size");
    v
}
