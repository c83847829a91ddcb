// zerolink-coordinator
// Copyright (C) 2026  ZeroLink Coordinator contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Deterministic client-side wallets for tests. A [`TestClient`] owns a
//! funding key, blinds its destination against the coordinator key, produces
//! ownership proofs and signs its CoinJoin inputs, which is everything a real
//! mixing client does.

use std::collections::BTreeMap;

use bitcoin::hashes::hex::ToHex;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use bitcoin::util::misc::{signed_msg_hash, MessageSignature};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{EcdsaSighashType, OutPoint, Script, Transaction, Txid, Witness};
use blind_rsa_signatures::{BlindSignature, Signature};

use crate::blind::{self, BlindSigner};
use crate::round::{AliceRegistration, InputProof};

pub struct TestClient {
    pub sk: SecretKey,
    pub pk: bitcoin::PublicKey,
    /// Locks every UTXO this client registers.
    pub funding_script: Script,
    pub change_script: Script,
    pub output_script: Script,
    pub blinded_hex: String,
    pub blinding_secret: blind_rsa_signatures::Secret,
}

impl TestClient {
    pub fn new(seed: u8, signer: &BlindSigner) -> Self {
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        Self::build(sk, seed + 0x40, signer)
    }

    /// Same funding key, fresh destination and blinding; models a client
    /// retrying with a new blinded output.
    pub fn with_destination(self, destination_seed: u8, signer: &BlindSigner) -> Self {
        Self::build(self.sk, destination_seed, signer)
    }

    fn build(sk: SecretKey, destination_seed: u8, signer: &BlindSigner) -> Self {
        let secp = Secp256k1::new();
        let pk = bitcoin::PublicKey::new(SecpPublicKey::from_secret_key(&secp, &sk));
        let funding_script = Script::new_v0_p2wpkh(&pk.wpubkey_hash().unwrap());
        let change_script = p2wpkh_script(destination_seed ^ 0x80);
        let output_script = p2wpkh_script(destination_seed);
        let blinding = signer
            .public_key()
            .blind(&mut rand::thread_rng(), output_script.as_bytes(), false, &blind::options())
            .unwrap();
        Self {
            sk,
            pk,
            funding_script,
            change_script,
            output_script,
            blinded_hex: blinding.blind_msg.0.to_hex(),
            blinding_secret: blinding.secret,
        }
    }

    pub fn registration(&self, outpoints: &[OutPoint]) -> AliceRegistration {
        AliceRegistration {
            inputs: outpoints
                .iter()
                .map(|outpoint| InputProof {
                    outpoint: *outpoint,
                    proof: sign_message(&self.sk, &self.blinded_hex),
                })
                .collect(),
            blinded_output_hex: self.blinded_hex.clone(),
            change_script: self.change_script.clone(),
        }
    }

    /// Turns the coordinator's blind signature into a signature over the
    /// destination script, exactly as a client would before returning as
    /// its output-side identity.
    pub fn unblind(&self, blind_signature: &BlindSignature, signer: &BlindSigner) -> Signature {
        signer
            .public_key()
            .finalize(
                blind_signature,
                &self.blinding_secret,
                None,
                self.output_script.as_bytes(),
                &blind::options(),
            )
            .unwrap()
    }

    /// Witnesses for every input of `tx` that spends one of `coins`, keyed
    /// by input index.
    pub fn witnesses_for(
        &self,
        tx: &Transaction,
        coins: &[(OutPoint, u64)],
    ) -> BTreeMap<usize, Witness> {
        self.witnesses_for_script(tx, coins, &self.funding_script)
    }

    /// Like [`TestClient::witnesses_for`] but signing for an arbitrary
    /// script, to forge deliberately wrong witnesses.
    pub fn witnesses_for_script(
        &self,
        tx: &Transaction,
        coins: &[(OutPoint, u64)],
        script: &Script,
    ) -> BTreeMap<usize, Witness> {
        let secp = Secp256k1::new();
        let mut out = BTreeMap::new();
        for (index, txin) in tx.input.iter().enumerate() {
            let coin = coins.iter().find(|(outpoint, _)| *outpoint == txin.previous_output);
            if let Some((_, value)) = coin {
                let script_code = script.p2wpkh_script_code().unwrap();
                let sighash = SighashCache::new(tx)
                    .segwit_signature_hash(index, &script_code, *value, EcdsaSighashType::All)
                    .unwrap();
                let digest = Message::from_slice(&sighash[..]).unwrap();
                let mut der = secp.sign_ecdsa(&digest, &self.sk).serialize_der().to_vec();
                der.push(EcdsaSighashType::All.to_u32() as u8);
                out.insert(index, Witness::from_vec(vec![der, self.pk.to_bytes()]));
            }
        }
        out
    }
}

/// Standard Bitcoin signed-message proof over `message`.
pub fn sign_message(sk: &SecretKey, message: &str) -> String {
    let secp = Secp256k1::new();
    let digest = signed_msg_hash(message);
    let msg = Message::from_slice(&digest[..]).unwrap();
    let signature = secp.sign_ecdsa_recoverable(&msg, sk);
    MessageSignature::new(signature, true).to_base64()
}

pub fn p2wpkh_script(seed: u8) -> Script {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    let pk = bitcoin::PublicKey::new(SecpPublicKey::from_secret_key(&secp, &sk));
    Script::new_v0_p2wpkh(&pk.wpubkey_hash().unwrap())
}

pub fn outpoint(n: u8) -> OutPoint {
    OutPoint::new(Txid::from_slice(&[n; 32]).unwrap(), 0)
}
