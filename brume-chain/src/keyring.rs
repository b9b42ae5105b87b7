//! BIP49 key derivation: P2SH-wrapped-P2WPKH account and change chains.
//!
//! Paths are `m/49'/c'/0'/0/i` (receive) and `m/49'/c'/0'/1/i` (change),
//! with coin type `c = 0` on mainnet and `1` everywhere else. Chains grow
//! lazily; the wallet keeps a `swipe_range` look-ahead of unused keys.

use std::collections::HashMap;

use anyhow::Context;
use bitcoin::{
    base58,
    bip32::{ChildNumber, Xpriv, Xpub},
    secp256k1::{All, Secp256k1, SecretKey},
    Address, CompressedPublicKey, Network, ScriptBuf,
};

use crate::electrum::ScriptHash;

/// BIP49 extended public key version bytes, rendered as "ypub...".
const VERSION_YPUB: [u8; 4] = [0x04, 0x9d, 0x7c, 0xb2];
/// Testnet equivalent, rendered as "upub...".
const VERSION_UPUB: [u8; 4] = [0x04, 0x4a, 0x52, 0x62];

/// Which derivation chain a key belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyChain {
    /// Receive keys, child 0.
    Account,
    /// Change keys, child 1.
    Change,
}

/// One derived key with everything the wallet needs precomputed.
#[derive(Clone, Debug)]
pub struct DerivedKey {
    pub index: u32,
    pub public_key: CompressedPublicKey,
    /// The P2WPKH script, which doubles as the P2SH redeem script.
    pub redeem_script: ScriptBuf,
    /// The P2SH output script the chain actually pays.
    pub script_pubkey: ScriptBuf,
    pub script_hash: ScriptHash,
    xpriv: Xpriv,
}

impl DerivedKey {
    pub(crate) fn secret_key(&self) -> SecretKey {
        self.xpriv.private_key
    }
}

pub struct KeyRing {
    secp: Secp256k1<All>,
    network: Network,
    /// `m/49'/c'/0'`, exported as ypub/upub.
    account_xpub: Xpub,
    /// `m/49'/c'/0'/0`.
    account_parent: Xpriv,
    /// `m/49'/c'/0'/1`.
    change_parent: Xpriv,
    account_keys: Vec<DerivedKey>,
    change_keys: Vec<DerivedKey>,
    by_script_hash: HashMap<ScriptHash, (KeyChain, u32)>,
}

impl KeyRing {
    /// Derive the BIP49 account from a seed and pre-derive `account_count`
    /// receive keys and `change_count` change keys.
    pub fn new(
        seed: &[u8],
        network: Network,
        account_count: u32,
        change_count: u32,
    ) -> anyhow::Result<Self> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)
            .context("Invalid seed for master key")?;

        let coin_type = match network {
            Network::Bitcoin => 0,
            _ => 1,
        };
        let account_path = [
            ChildNumber::Hardened { index: 49 },
            ChildNumber::Hardened { index: coin_type },
            ChildNumber::Hardened { index: 0 },
        ];
        let account_root = master
            .derive_priv(&secp, &account_path)
            .context("BIP49 account derivation failed")?;
        let account_xpub = Xpub::from_priv(&secp, &account_root);

        let account_parent = account_root
            .derive_priv(&secp, &[ChildNumber::Normal { index: 0 }])
            .context("Receive chain derivation failed")?;
        let change_parent = account_root
            .derive_priv(&secp, &[ChildNumber::Normal { index: 1 }])
            .context("Change chain derivation failed")?;

        let mut keyring = Self {
            secp,
            network,
            account_xpub,
            account_parent,
            change_parent,
            account_keys: Vec::new(),
            change_keys: Vec::new(),
            by_script_hash: HashMap::new(),
        };
        for _ in 0..account_count {
            keyring.derive_next(KeyChain::Account)?;
        }
        for _ in 0..change_count {
            keyring.derive_next(KeyChain::Change)?;
        }
        Ok(keyring)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Derive the next key of `chain` and return it.
    pub fn derive_next(
        &mut self,
        chain: KeyChain,
    ) -> anyhow::Result<&DerivedKey> {
        let (parent, keys) = match chain {
            KeyChain::Account =>
                (&self.account_parent, &mut self.account_keys),
            KeyChain::Change => (&self.change_parent, &mut self.change_keys),
        };
        let index = keys.len() as u32;
        let xpriv = parent
            .derive_priv(&self.secp, &[ChildNumber::Normal { index }])
            .context("Child key derivation failed")?;
        let public_key =
            CompressedPublicKey(xpriv.private_key.public_key(&self.secp));
        let redeem_script = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
        let script_pubkey = redeem_script.to_p2sh();
        let script_hash = ScriptHash::from_script(&script_pubkey);

        keys.push(DerivedKey {
            index,
            public_key,
            redeem_script,
            script_pubkey,
            script_hash,
            xpriv,
        });
        self.by_script_hash.insert(script_hash, (chain, index));
        Ok(&keys[index as usize])
    }

    pub fn keys(&self, chain: KeyChain) -> &[DerivedKey] {
        match chain {
            KeyChain::Account => &self.account_keys,
            KeyChain::Change => &self.change_keys,
        }
    }

    pub fn key(&self, chain: KeyChain, index: u32) -> Option<&DerivedKey> {
        self.keys(chain).get(index as usize)
    }

    pub fn key_count(&self, chain: KeyChain) -> u32 {
        self.keys(chain).len() as u32
    }

    /// Which chain and index a script hash belongs to, if it is ours.
    pub fn locate(&self, script_hash: ScriptHash) -> Option<(KeyChain, u32)> {
        self.by_script_hash.get(&script_hash).copied()
    }

    pub fn lookup(&self, script_hash: ScriptHash) -> Option<&DerivedKey> {
        let (chain, index) = self.locate(script_hash)?;
        self.key(chain, index)
    }

    pub fn contains(&self, script_hash: ScriptHash) -> bool {
        self.by_script_hash.contains_key(&script_hash)
    }

    /// All known script hashes, receive chain first.
    pub fn all_script_hashes(&self) -> Vec<ScriptHash> {
        self.account_keys
            .iter()
            .chain(self.change_keys.iter())
            .map(|key| key.script_hash)
            .collect()
    }

    /// The base58check P2SH address of a derived key.
    pub fn address(&self, key: &DerivedKey) -> Address {
        Address::p2shwpkh(&key.public_key, self.network)
    }

    /// The account xpub rendered with BIP49 version bytes: "ypub..." on
    /// mainnet, "upub..." on the test networks.
    pub fn master_xpub(&self) -> String {
        let mut data = self.account_xpub.encode();
        let version = match self.network {
            Network::Bitcoin => VERSION_YPUB,
            _ => VERSION_UPUB,
        };
        data[..4].copy_from_slice(&version);
        base58::encode_check(&data)
    }
}

#[cfg(test)]
mod test {
    use bitcoin::hashes::{sha256, Hash};

    use super::*;
    use crate::testing::test_seed;

    #[test]
    fn bip49_first_testnet_address() {
        // The BIP49 test vector: the "abandon .. about" seed derives
        // 2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2 at m/49'/1'/0'/0/0.
        let keyring =
            KeyRing::new(&test_seed(), Network::Testnet, 1, 1).unwrap();
        let key = keyring.key(KeyChain::Account, 0).unwrap();
        assert_eq!(
            keyring.address(key).to_string(),
            "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2",
        );
        assert!(keyring.master_xpub().starts_with("upub"));
    }

    #[test]
    fn mainnet_exports_ypub() {
        let keyring =
            KeyRing::new(&test_seed(), Network::Bitcoin, 1, 1).unwrap();
        assert!(keyring.master_xpub().starts_with("ypub"));
    }

    #[test]
    fn script_hash_lookup_and_reversal() {
        let mut keyring =
            KeyRing::new(&test_seed(), Network::Regtest, 2, 2).unwrap();
        let key = keyring.key(KeyChain::Change, 1).unwrap().clone();
        assert_eq!(
            keyring.locate(key.script_hash),
            Some((KeyChain::Change, 1)),
        );

        // The script hash is the byte-reversed sha256 of the output script.
        let digest = sha256::Hash::hash(key.script_pubkey.as_bytes());
        let mut reversed = digest.to_byte_array();
        reversed.reverse();
        assert_eq!(key.script_hash.as_bytes(), &reversed);

        // Derivation is append-only and indexes stay stable.
        let next = keyring.derive_next(KeyChain::Account).unwrap();
        assert_eq!(next.index, 2);
        assert_eq!(keyring.key_count(KeyChain::Account), 3);
        assert_eq!(keyring.all_script_hashes().len(), 5);
    }

    #[test]
    fn distinct_chains_distinct_keys() {
        let keyring =
            KeyRing::new(&test_seed(), Network::Regtest, 3, 3).unwrap();
        let mut hashes: Vec<ScriptHash> = keyring.all_script_hashes();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), 6);
    }
}
