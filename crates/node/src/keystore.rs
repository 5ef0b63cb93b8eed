//! Wallet-side signing for mixing entries.

use std::collections::HashMap;

use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use umbra_mixing::KeyStore;
use umbra_primitives::hash::hash160;
use umbra_primitives::script::{extract_pubkey, extract_pubkey_hash};
use umbra_primitives::sighash::{signature_hash, SIGHASH_ALL};
use umbra_primitives::transaction::Transaction;

pub struct NodeKeyStore {
    secp: Secp256k1<All>,
    /// Keys addressed by their compressed public key bytes.
    by_pubkey: HashMap<Vec<u8>, SecretKey>,
    /// Same keys addressed by pubkey hash, for p2pkh outputs.
    by_pubkey_hash: HashMap<[u8; 20], Vec<u8>>,
}

impl NodeKeyStore {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            by_pubkey: HashMap::new(),
            by_pubkey_hash: HashMap::new(),
        }
    }

    pub fn add_key(&mut self, secret: SecretKey) -> PublicKey {
        let pubkey = PublicKey::from_secret_key(&self.secp, &secret);
        let serialized = pubkey.serialize().to_vec();
        self.by_pubkey_hash
            .insert(hash160(&serialized), serialized.clone());
        self.by_pubkey.insert(serialized, secret);
        pubkey
    }

    pub fn len(&self) -> usize {
        self.by_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pubkey.is_empty()
    }

    fn key_for_script(&self, script_pubkey: &[u8]) -> Option<(&Vec<u8>, &SecretKey)> {
        if let Some(hash) = extract_pubkey_hash(script_pubkey) {
            let pubkey = self.by_pubkey_hash.get(&hash)?;
            return self.by_pubkey.get_key_value(pubkey);
        }
        if let Some(pubkey) = extract_pubkey(script_pubkey) {
            return self.by_pubkey.get_key_value(&pubkey.to_vec());
        }
        None
    }
}

impl Default for NodeKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for NodeKeyStore {
    fn sign_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
    ) -> Option<Vec<u8>> {
        let (pubkey, secret) = self.key_for_script(script_pubkey)?;
        let digest = signature_hash(tx, input_index, script_pubkey, SIGHASH_ALL).ok()?;
        let message = Message::from_digest(digest);
        let mut signature = self.secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
        signature.push(SIGHASH_ALL as u8);

        let mut script_sig = Vec::with_capacity(2 + signature.len() + pubkey.len());
        script_sig.push(signature.len() as u8);
        script_sig.extend_from_slice(&signature);
        // p2pk outputs verify against the bare signature; p2pkh also needs
        // the public key on the stack.
        if extract_pubkey_hash(script_pubkey).is_some() {
            script_sig.push(pubkey.len() as u8);
            script_sig.extend_from_slice(pubkey);
        }
        Some(script_sig)
    }
}
