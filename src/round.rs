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

//! The round state machine. A round walks its participants through input
//! registration, connection confirmation, output registration and signing,
//! and ends either with a broadcast CoinJoin or a failure that releases every
//! input claim. All per-round invariants are enforced here; cross-round
//! input exclusivity is the coordinator's job and happens before any call
//! lands on a round.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use bitcoin::hashes::hex::FromHex;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::{Message, Secp256k1, VerifyOnly};
use bitcoin::util::misc::{signed_msg_hash, MessageSignature};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    EcdsaSig, EcdsaSighashType, OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use blind_rsa_signatures::{BlindSignature, Signature};
use rand::seq::SliceRandom;

use crate::ban::{BanStore, Severity};
use crate::chain::{self, ChainOracle};
use crate::participant::{Alice, AliceId, AliceState, Bob, RegisteredInput};
use crate::util;
use crate::Config;

/// A round can never proceed with fewer participants than this.
const MIN_PARTICIPANTS: usize = 2;

/// Coinbase outputs need more confirmations than this before they may enter.
const COINBASE_MATURITY: u32 = 100;

/// Strictly increasing identifier of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundId(pub u64);

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commitment handed to confirmed participants. It binds the registered
/// blinded output set to one specific round, so an unblinded signature can
/// only ever be redeemed where it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundHash(sha256::Hash);

impl RoundHash {
    fn commit(round: RoundId, denomination: u64, anonymity_set: usize, blinded: &[&str]) -> Self {
        let mut values: Vec<&str> = blinded.to_vec();
        values.sort_unstable();
        let preimage = format!(
            "round:{round};denomination:{denomination};anonymity_set:{anonymity_set};{}",
            values.join(";")
        );
        RoundHash(util::hashes::sha256(preimage.as_bytes()))
    }
}

impl std::fmt::Display for RoundHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RoundHash {
    type Err = bitcoin::hashes::hex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use std::str::FromStr;
        Ok(RoundHash(sha256::Hash::from_str(s)?))
    }
}

/// The four protocol phases, in order. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    Signing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Succeeded,
    Failed,
}

/// Why an input cannot enter a round.
#[derive(Debug, PartialEq, Eq)]
pub enum InputRefusal {
    /// Not in the UTXO set, not even in the mempool.
    SpentOrMissing,
    /// Claimed by a participant of another running round.
    RegisteredElsewhere,
    /// Banned for earlier misbehavior.
    Banned { minutes: u64 },
    /// Unconfirmed and not the output of a coordinated CoinJoin.
    Unconfirmed,
    /// Unconfirmed CoinJoin output, but too many coordinated CoinJoins are
    /// already waiting for a block.
    TooManyUnconfirmed,
    /// Immature coinbase output.
    Immature { confirmations: u32 },
    /// Only native SegWit v0 key-hash outputs may enter a mix.
    WrongScriptType,
}

/// Tagged refusal returned by every round operation. The transport adapter
/// maps these onto status codes; nothing here ever aborts a round.
#[derive(Debug)]
pub enum Rejection {
    /// Malformed request. No state was touched.
    InvalidRequest(&'static str),
    /// A specific input is not acceptable.
    InputDisallowed { outpoint: OutPoint, reason: InputRefusal },
    /// The inputs do not cover the denomination plus the mining fee share.
    InsufficientFunds { available: u64, required: u64 },
    /// An ownership proof or an unblinded signature did not verify.
    InvalidProof,
    /// The operation is not valid in the round's current phase.
    PhaseMismatch { expected: Phase, actual: Phase },
    /// No such round or participant.
    NotFound,
    /// The round advanced or finished while the request was in flight; the
    /// client should ask for the current state and retry.
    Unavailable,
    /// The chain oracle failed; nothing was mutated.
    Chain(chain::Error),
    /// An internal invariant broke. The round is failed and logged; the
    /// coordinator keeps serving other rounds.
    Fatal(&'static str),
}

impl From<chain::Error> for Rejection {
    fn from(error: chain::Error) -> Self {
        Rejection::Chain(error)
    }
}

/// An input offered for registration: the outpoint plus a recoverable
/// signed-message proof over the registrant's blinded output hex, tying key
/// ownership to this session.
#[derive(Debug, Clone)]
pub struct InputProof {
    pub outpoint: OutPoint,
    /// Base64, standard Bitcoin signed-message encoding.
    pub proof: String,
}

/// A parsed input-registration request.
#[derive(Debug)]
pub struct AliceRegistration {
    pub inputs: Vec<InputProof>,
    pub blinded_output_hex: String,
    pub change_script: Script,
}

/// What a freshly admitted Alice takes home.
#[derive(Debug)]
pub struct AcceptedAlice {
    pub id: AliceId,
    pub blind_signature: BlindSignature,
    pub round: RoundId,
}

/// Outcome of a connection confirmation.
#[derive(Debug)]
pub enum Confirmation {
    /// Input registration is still open; the call only refreshed liveness.
    Heartbeat,
    /// The participant is confirmed and bound to the round by this hash.
    Confirmed(RoundHash),
}

/// External collaborators and the clock, bundled so round operations stay
/// callable from both request handlers and the timer.
pub struct Services<'a> {
    pub chain: &'a dyn ChainOracle,
    pub bans: &'a BanStore,
    pub signer: &'a crate::blind::BlindSigner,
    pub secp: &'a Secp256k1<VerifyOnly>,
    /// Monotonic time for deadlines and liveness.
    pub now: Instant,
    /// Wall-clock time for ban bookkeeping.
    pub wall: SystemTime,
}

/// Parameters fixed when the round opens.
#[derive(Debug, Clone)]
pub struct RoundParams {
    pub network: bitcoin::Network,
    pub denomination: u64,
    pub anonymity_set: usize,
    pub fee_per_input: u64,
    pub fee_per_output: u64,
    pub coordinator_fee_percent: f64,
    pub coordinator_script: Script,
    pub dust_threshold: u64,
    pub max_inputs_per_alice: usize,
    pub max_unconfirmed_coinjoins: usize,
    pub input_registration_timeout: Duration,
    pub max_registration_extensions: u32,
    pub connection_confirmation_timeout: Duration,
    pub output_registration_timeout: Duration,
    pub signing_timeout: Duration,
}

impl RoundParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            network: config.network,
            denomination: config.denomination,
            anonymity_set: config.anonymity_set,
            fee_per_input: config.fee_per_input,
            fee_per_output: config.fee_per_output,
            coordinator_fee_percent: config.coordinator_fee_percent,
            coordinator_script: config.coordinator_script.clone(),
            dust_threshold: config.dust_threshold,
            max_inputs_per_alice: config.max_inputs_per_alice,
            max_unconfirmed_coinjoins: config.max_unconfirmed_coinjoins,
            input_registration_timeout: config.input_registration_timeout,
            max_registration_extensions: config.max_registration_extensions,
            connection_confirmation_timeout: config.connection_confirmation_timeout,
            output_registration_timeout: config.output_registration_timeout,
            signing_timeout: config.signing_timeout,
        }
    }
}

/// Point-in-time view of a round for status reporting.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub round: RoundId,
    pub phase: Phase,
    pub denomination: u64,
    pub registered_peer_count: usize,
    pub required_peer_count: usize,
    pub max_inputs_per_peer: usize,
    pub registration_timeout: Duration,
    pub fee_per_input: u64,
    pub fee_per_output: u64,
    pub coordinator_fee_percent: f64,
}

/// One CoinJoin round.
pub struct Round {
    id: RoundId,
    phase: Phase,
    status: Status,
    params: RoundParams,
    /// Live participant target. Starts at the configured anonymity set and
    /// may shrink when confirmed-but-evicted participants leave.
    anonymity_set: usize,
    alices: HashMap<AliceId, Alice>,
    bobs: Vec<Bob>,
    round_hash: Option<RoundHash>,
    unsigned_tx: Option<Transaction>,
    witnesses: HashMap<AliceId, BTreeMap<usize, Witness>>,
    phase_deadline: Instant,
    extensions_used: u32,
    finished_at: Option<Instant>,
}

impl Round {
    pub fn new(id: RoundId, params: RoundParams, now: Instant) -> Self {
        log::info!(
            "round {id}: open for input registration (denomination {} sat, anonymity set {})",
            params.denomination,
            params.anonymity_set
        );
        Self {
            id,
            phase: Phase::InputRegistration,
            status: Status::Running,
            anonymity_set: params.anonymity_set,
            phase_deadline: now + params.input_registration_timeout,
            params,
            alices: HashMap::new(),
            bobs: Vec::new(),
            round_hash: None,
            unsigned_tx: None,
            witnesses: HashMap::new(),
            extensions_used: 0,
            finished_at: None,
        }
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub fn round_hash(&self) -> Option<RoundHash> {
        self.round_hash
    }

    pub fn alice_count(&self) -> usize {
        self.alices.len()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Whether any participant of this round claims the outpoint. Used by
    /// the coordinator for the cross-round exclusivity sweep.
    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.alices.values().any(|alice| alice.contains_input(outpoint))
    }

    pub fn state(&self) -> RoundState {
        RoundState {
            round: self.id,
            phase: self.phase,
            denomination: self.params.denomination,
            registered_peer_count: self.alices.len(),
            required_peer_count: self.anonymity_set,
            max_inputs_per_peer: self.params.max_inputs_per_alice,
            registration_timeout: self.params.input_registration_timeout,
            fee_per_input: self.params.fee_per_input,
            fee_per_output: self.params.fee_per_output,
            coordinator_fee_percent: self.params.coordinator_fee_percent,
        }
    }

    /// Admits an input-side participant. Only valid while input registration
    /// is open; a request that raced a phase change gets `Unavailable`.
    ///
    /// Re-registration is supported: when an offered outpoint is already held
    /// by participants of *this* round, those participants are replaced
    /// atomically with the new one.
    pub fn register_alice(
        &mut self,
        request: AliceRegistration,
        svc: &Services,
    ) -> Result<AcceptedAlice, Rejection> {
        if self.status != Status::Running || self.phase != Phase::InputRegistration {
            return Err(Rejection::Unavailable);
        }

        // 1. request shape
        if request.inputs.is_empty() {
            return Err(Rejection::InvalidRequest("no inputs"));
        }
        if request.inputs.len() > self.params.max_inputs_per_alice {
            return Err(Rejection::InvalidRequest("too many inputs"));
        }
        let blinded_raw = request.blinded_output_hex.trim();
        if blinded_raw.is_empty() {
            return Err(Rejection::InvalidRequest("blank blinded output"));
        }
        let blinded_hex = blinded_raw.to_lowercase();
        let blinded_bytes = Vec::<u8>::from_hex(&blinded_hex)
            .map_err(|_| Rejection::InvalidRequest("blinded output is not hex"))?;
        if request.change_script.is_empty() {
            return Err(Rejection::InvalidRequest("blank change script"));
        }

        // 2. the blinded output must be fresh within the round, or it could
        //    be signed twice
        if self.alices.values().any(|alice| alice.blinded_output == blinded_hex) {
            return Err(Rejection::InvalidRequest("blinded output already registered"));
        }

        // 3. per-input checks; nothing is mutated until all of them pass
        let mut seen = HashSet::new();
        let mut replaced = HashSet::new();
        let mut inputs = Vec::with_capacity(request.inputs.len());
        for InputProof { outpoint, proof } in &request.inputs {
            // 3a. no duplicates within the request
            if !seen.insert(*outpoint) {
                return Err(Rejection::InvalidRequest("duplicate input in request"));
            }

            // 3b. an outpoint held within this round means the same client is
            //     re-registering; its holders get replaced on commit. Holders
            //     in other running rounds were ruled out by the coordinator
            //     before this call.
            for alice in self.alices.values() {
                if alice.contains_input(outpoint) {
                    replaced.insert(alice.id);
                }
            }

            // 3c. active bans
            if let Some(minutes) = svc.bans.is_banned(outpoint, svc.wall) {
                return Err(Rejection::InputDisallowed {
                    outpoint: *outpoint,
                    reason: InputRefusal::Banned { minutes },
                });
            }

            // 3d. the UTXO must exist; mempool inputs only when they spend a
            //     coordinated CoinJoin and not too many of those are pending
            let info = svc
                .chain
                .get_txout(*outpoint, true)?
                .ok_or(Rejection::InputDisallowed {
                    outpoint: *outpoint,
                    reason: InputRefusal::SpentOrMissing,
                })?;
            if !info.is_confirmed() {
                if !svc.chain.contains_coinjoin(&outpoint.txid) {
                    return Err(Rejection::InputDisallowed {
                        outpoint: *outpoint,
                        reason: InputRefusal::Unconfirmed,
                    });
                }
                if svc.chain.unconfirmed_coinjoin_count() >= self.params.max_unconfirmed_coinjoins {
                    return Err(Rejection::InputDisallowed {
                        outpoint: *outpoint,
                        reason: InputRefusal::TooManyUnconfirmed,
                    });
                }
            }

            // 3e. coinbase maturity
            if info.is_coinbase && info.confirmations <= COINBASE_MATURITY {
                return Err(Rejection::InputDisallowed {
                    outpoint: *outpoint,
                    reason: InputRefusal::Immature { confirmations: info.confirmations },
                });
            }

            // 3f. only native SegWit v0 key hashes mix
            if !info.script_pubkey.is_v0_p2wpkh() {
                return Err(Rejection::InputDisallowed {
                    outpoint: *outpoint,
                    reason: InputRefusal::WrongScriptType,
                });
            }

            // 3g. the owner of the UTXO key must have signed this session's
            //     blinded output
            verify_ownership_proof(svc.secp, &info.script_pubkey, blinded_raw, proof)?;

            inputs.push(RegisteredInput {
                outpoint: *outpoint,
                value: info.value,
                script_pubkey: info.script_pubkey,
            });
        }

        // 4. the inputs must cover one denomination plus this registrant's
        //    mining fee share; one mix output and one change output are
        //    reserved per participant
        let network_fee_owed =
            inputs.len() as u64 * self.params.fee_per_input + 2 * self.params.fee_per_output;
        let required = self.params.denomination + network_fee_owed;
        let available: u64 = inputs.iter().map(|input| input.value).sum();
        if available < required {
            return Err(Rejection::InsufficientFunds { available, required });
        }

        // 5. commit: replacement and admission are atomic
        for id in &replaced {
            self.alices.remove(id);
            log::debug!("round {}: alice {id} replaced by a re-registration", self.id);
        }

        let blind_signature = svc
            .signer
            .sign_blinded(&blinded_bytes)
            .map_err(|_| self.abort("blind signing failed", svc.now))?;

        let alice = Alice {
            id: AliceId::random(),
            inputs,
            change_script: request.change_script,
            blinded_output: blinded_hex,
            network_fee_owed,
            coordinator_fee_owed: coordinator_fee(
                self.params.denomination,
                self.params.coordinator_fee_percent,
            ),
            state: AliceState::InputsRegistered,
            last_seen: svc.now,
        };
        let id = alice.id;
        let n_inputs = alice.inputs.len();
        self.alices.insert(id, alice);
        log::info!(
            "round {}: alice {id} registered with {n_inputs} input(s) ({}/{})",
            self.id,
            self.alices.len(),
            self.anonymity_set
        );

        // 6. a full quorum ends input registration early, after shaking out
        //    anything spent while registration was open
        if self.alices.len() >= self.anonymity_set {
            self.sweep_spent_inputs(svc, false);
            if self.alices.len() >= self.anonymity_set {
                self.enter_connection_confirmation(svc.now);
            }
        }

        Ok(AcceptedAlice { id, blind_signature, round: self.id })
    }

    /// During input registration this is a liveness heartbeat. During
    /// connection confirmation it marks the participant confirmed and hands
    /// back the round hash; re-confirming is a plain no-op that returns the
    /// hash again. The last confirmation sweeps spent inputs, bans their
    /// owners and moves the round on.
    pub fn confirm_connection(
        &mut self,
        id: &AliceId,
        svc: &Services,
    ) -> Result<Confirmation, Rejection> {
        if self.status != Status::Running {
            return Err(Rejection::Unavailable);
        }
        match self.phase {
            Phase::InputRegistration => {
                let alice = self.alices.get_mut(id).ok_or(Rejection::NotFound)?;
                alice.last_seen = svc.now;
                Ok(Confirmation::Heartbeat)
            }
            Phase::ConnectionConfirmation => {
                let hash = match self.round_hash {
                    Some(hash) => hash,
                    None => return Err(self.abort("round hash missing in confirmation", svc.now)),
                };

                let alice = self.alices.get_mut(id).ok_or(Rejection::NotFound)?;
                if alice.state == AliceState::ConnectionConfirmed {
                    return Ok(Confirmation::Confirmed(hash));
                }
                alice.state = AliceState::ConnectionConfirmed;
                alice.last_seen = svc.now;
                let caller_outpoint = alice.inputs[0].outpoint;
                log::debug!("round {}: alice {id} confirmed", self.id);

                if self.alices.values().all(|a| a.state == AliceState::ConnectionConfirmed) {
                    self.finalize_confirmation(svc);
                    if !self.alices.contains_key(id) {
                        // the caller itself was evicted by the spent sweep
                        return Err(Rejection::InputDisallowed {
                            outpoint: caller_outpoint,
                            reason: InputRefusal::SpentOrMissing,
                        });
                    }
                    if self.status == Status::Failed {
                        return Err(Rejection::Unavailable);
                    }
                }
                Ok(Confirmation::Confirmed(hash))
            }
            actual => Err(Rejection::PhaseMismatch {
                expected: Phase::ConnectionConfirmation,
                actual,
            }),
        }
    }

    /// Voluntary exit, penalty-free, only while input registration is open.
    pub fn unregister_alice(&mut self, id: &AliceId) -> Result<(), Rejection> {
        if self.status != Status::Running {
            return Err(Rejection::Unavailable);
        }
        if self.phase != Phase::InputRegistration {
            return Err(Rejection::PhaseMismatch {
                expected: Phase::InputRegistration,
                actual: self.phase,
            });
        }
        self.alices.remove(id).ok_or(Rejection::NotFound)?;
        log::debug!("round {}: alice {id} unregistered", self.id);
        Ok(())
    }

    /// Admits a mix output. The unblinded signature proves the script went
    /// through this coordinator's blind signer without revealing whose it
    /// is. Registering the final output builds the transaction and opens the
    /// signing phase.
    pub fn register_bob(
        &mut self,
        output_script: Script,
        signature: &Signature,
        svc: &Services,
    ) -> Result<(), Rejection> {
        if self.status != Status::Running {
            return Err(Rejection::Unavailable);
        }
        if self.phase != Phase::OutputRegistration {
            return Err(Rejection::PhaseMismatch {
                expected: Phase::OutputRegistration,
                actual: self.phase,
            });
        }
        if !output_script.is_v0_p2wpkh() {
            return Err(Rejection::InvalidRequest("mix output is not p2wpkh"));
        }
        if !svc.signer.verify_unblinded(output_script.as_bytes(), signature) {
            return Err(Rejection::InvalidProof);
        }
        // a duplicate mix output would merge two participants' coins
        if self.bobs.iter().any(|bob| bob.output_script == output_script) {
            return Err(Rejection::InvalidRequest("output script already registered"));
        }

        self.bobs.push(Bob { output_script });
        log::debug!(
            "round {}: {}/{} mix outputs registered",
            self.id,
            self.bobs.len(),
            self.anonymity_set
        );

        if self.bobs.len() == self.anonymity_set {
            self.enter_signing(svc.now);
        }
        Ok(())
    }

    /// The transaction each participant must sign, available once the
    /// signing phase has begun.
    pub fn coinjoin(&self, id: &AliceId) -> Result<&Transaction, Rejection> {
        if !self.alices.contains_key(id) {
            return Err(Rejection::NotFound);
        }
        match (&self.unsigned_tx, self.phase) {
            (Some(tx), Phase::Signing) => Ok(tx),
            _ => Err(Rejection::PhaseMismatch {
                expected: Phase::Signing,
                actual: self.phase,
            }),
        }
    }

    /// Records one participant's witnesses, keyed by input index of the
    /// unsigned transaction. Every index must belong to that participant and
    /// every witness must verify against the input it claims to spend; a
    /// single call must cover all of the participant's inputs. The last
    /// complete submission assembles and broadcasts the CoinJoin.
    pub fn post_signatures(
        &mut self,
        id: &AliceId,
        witnesses: BTreeMap<usize, Witness>,
        svc: &Services,
    ) -> Result<(), Rejection> {
        if self.status != Status::Running {
            return Err(Rejection::Unavailable);
        }
        if self.phase != Phase::Signing {
            return Err(Rejection::PhaseMismatch {
                expected: Phase::Signing,
                actual: self.phase,
            });
        }
        let Some(tx) = self.unsigned_tx.as_ref() else {
            return Err(self.abort("signing phase without a transaction", svc.now));
        };
        let alice = self.alices.get(id).ok_or(Rejection::NotFound)?;

        let mut verified = BTreeMap::new();
        for (index, witness) in witnesses {
            let txin = tx
                .input
                .get(index)
                .ok_or(Rejection::InvalidRequest("signature index out of range"))?;
            let input = alice
                .inputs
                .iter()
                .find(|input| input.outpoint == txin.previous_output)
                .ok_or(Rejection::InvalidRequest("signature for someone else's input"))?;
            verify_input_witness(svc.secp, tx, index, input, &witness)?;
            verified.insert(index, witness);
        }
        if verified.len() != alice.inputs.len() {
            return Err(Rejection::InvalidRequest("incomplete signature set"));
        }

        self.witnesses.insert(*id, verified);
        log::debug!(
            "round {}: signatures {}/{} collected",
            self.id,
            self.witnesses.len(),
            self.alices.len()
        );

        if self.witnesses.len() == self.alices.len() {
            self.broadcast(svc)?;
        }
        Ok(())
    }

    /// Drives phase expiry. Called from the coordinator's ticker; a round
    /// whose deadline has not passed is untouched.
    pub fn tick(&mut self, svc: &Services) {
        if self.status != Status::Running || svc.now < self.phase_deadline {
            return;
        }
        match self.phase {
            Phase::InputRegistration => {
                // idle registrants are dropped without penalty
                let timeout = self.params.input_registration_timeout;
                let idle: Vec<AliceId> = self
                    .alices
                    .values()
                    .filter(|alice| svc.now.saturating_duration_since(alice.last_seen) >= timeout)
                    .map(|alice| alice.id)
                    .collect();
                for id in idle {
                    self.alices.remove(&id);
                    log::debug!("round {}: alice {id} idle, dropped", self.id);
                }

                if self.alices.len() >= MIN_PARTICIPANTS {
                    self.sweep_spent_inputs(svc, false);
                    if self.alices.len() >= MIN_PARTICIPANTS {
                        self.enter_connection_confirmation(svc.now);
                        return;
                    }
                }
                if self.extensions_used >= self.params.max_registration_extensions {
                    self.fail("input registration never filled", svc.now);
                } else {
                    self.extensions_used += 1;
                    self.phase_deadline = svc.now + timeout;
                    log::debug!(
                        "round {}: input registration extended ({}/{})",
                        self.id,
                        self.extensions_used,
                        self.params.max_registration_extensions
                    );
                }
            }
            Phase::ConnectionConfirmation => {
                let unconfirmed: Vec<AliceId> = self
                    .alices
                    .values()
                    .filter(|alice| alice.state != AliceState::ConnectionConfirmed)
                    .map(|alice| alice.id)
                    .collect();
                for id in unconfirmed {
                    self.alices.remove(&id);
                    log::info!("round {}: alice {id} never confirmed, dropped", self.id);
                }
                if self.alices.len() >= MIN_PARTICIPANTS {
                    self.anonymity_set = self.alices.len();
                    self.enter_output_registration(svc.now);
                } else {
                    self.fail("not enough confirmed participants", svc.now);
                }
            }
            Phase::OutputRegistration => {
                // the input side did nothing wrong here; no bans
                self.fail("mix outputs never filled", svc.now);
            }
            Phase::Signing => {
                let laggards: Vec<OutPoint> = self
                    .alices
                    .values()
                    .filter(|alice| !self.witnesses.contains_key(&alice.id))
                    .flat_map(|alice| alice.outpoints())
                    .collect();
                svc.bans.ban(&laggards, Severity::DROPPED_MID_ROUND, svc.wall);
                self.fail("signatures missing at the deadline", svc.now);
            }
        }
    }

    /// Evicts participants whose inputs vanished from the UTXO set, banning
    /// them when `ban` is set. Oracle failures leave the participant in
    /// place; a flaky node must not cost honest users their round.
    fn sweep_spent_inputs(&mut self, svc: &Services, ban: bool) -> Vec<AliceId> {
        let mut evicted = Vec::new();
        for alice in self.alices.values() {
            for input in &alice.inputs {
                match svc.chain.get_txout(input.outpoint, true) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        evicted.push(alice.id);
                        break;
                    }
                    Err(error) => {
                        log::warn!(
                            "round {}: spent sweep skipped {}: {error:?}",
                            self.id,
                            input.outpoint
                        );
                    }
                }
            }
        }
        for id in &evicted {
            if let Some(alice) = self.alices.remove(id) {
                log::info!("round {}: alice {id} evicted, input spent elsewhere", self.id);
                if ban {
                    svc.bans.ban(&alice.outpoints(), Severity::DROPPED_MID_ROUND, svc.wall);
                }
            }
        }
        evicted
    }

    /// Runs once every participant has confirmed: spent inputs are swept
    /// with bans, and the round either fails for lack of participants or
    /// shrinks its anonymity set to the survivors and moves on.
    fn finalize_confirmation(&mut self, svc: &Services) {
        self.sweep_spent_inputs(svc, true);
        if self.alices.len() < MIN_PARTICIPANTS {
            self.fail("not enough participants after the spent sweep", svc.now);
            return;
        }
        self.anonymity_set = self.alices.len();
        self.enter_output_registration(svc.now);
    }

    fn enter_connection_confirmation(&mut self, now: Instant) {
        let blinded: Vec<&str> =
            self.alices.values().map(|alice| alice.blinded_output.as_str()).collect();
        let hash =
            RoundHash::commit(self.id, self.params.denomination, self.anonymity_set, &blinded);
        self.round_hash = Some(hash);
        self.phase = Phase::ConnectionConfirmation;
        self.phase_deadline = now + self.params.connection_confirmation_timeout;
        log::info!(
            "round {}: connection confirmation started with {} participants, hash {hash}",
            self.id,
            self.alices.len()
        );
    }

    fn enter_output_registration(&mut self, now: Instant) {
        self.phase = Phase::OutputRegistration;
        self.phase_deadline = now + self.params.output_registration_timeout;
        log::info!(
            "round {}: output registration started, anonymity set {}",
            self.id,
            self.anonymity_set
        );
    }

    fn enter_signing(&mut self, now: Instant) {
        let tx = self.build_unsigned_transaction();
        log::info!(
            "round {}: signing started, txid {} ({} in, {} out, ~{:.0} vB)",
            self.id,
            tx.txid(),
            tx.input.len(),
            tx.output.len(),
            util::fee::estimate_coinjoin_size(tx.input.len(), tx.output.len())
        );
        self.unsigned_tx = Some(tx);
        self.phase = Phase::Signing;
        self.phase_deadline = now + self.params.signing_timeout;
    }

    /// Assembles the unsigned CoinJoin: every registered input, one
    /// denomination output per mix output, change per participant and a
    /// single coordinator output, with input and output order shuffled
    /// independently.
    fn build_unsigned_transaction(&self) -> Transaction {
        let mut input: Vec<TxIn> = self
            .alices
            .values()
            .flat_map(|alice| alice.inputs.iter())
            .map(|registered| TxIn {
                previous_output: registered.outpoint,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        let mut output: Vec<TxOut> = self
            .bobs
            .iter()
            .map(|bob| TxOut {
                value: self.params.denomination,
                script_pubkey: bob.output_script.clone(),
            })
            .collect();

        let mut coordinator_total = 0_u64;
        for alice in self.alices.values() {
            coordinator_total += alice.coordinator_fee_owed;
            let change = alice
                .input_sum()
                .checked_sub(self.params.denomination)
                .and_then(|v| v.checked_sub(alice.network_fee_owed))
                .and_then(|v| v.checked_sub(alice.coordinator_fee_owed))
                .unwrap_or(0);
            // sub-dust change falls to the miners
            if change >= self.params.dust_threshold {
                output.push(TxOut {
                    value: change,
                    script_pubkey: alice.change_script.clone(),
                });
            }
        }

        if coordinator_total >= self.params.dust_threshold
            && !self.params.coordinator_script.is_empty()
        {
            output.push(TxOut {
                value: coordinator_total,
                script_pubkey: self.params.coordinator_script.clone(),
            });
        }

        let mut rng = rand::thread_rng();
        input.shuffle(&mut rng);
        output.shuffle(&mut rng);

        Transaction {
            version: 1,
            lock_time: PackedLockTime::ZERO,
            input,
            output,
        }
    }

    /// Installs all collected witnesses and hands the result to the node.
    fn broadcast(&mut self, svc: &Services) -> Result<(), Rejection> {
        let mut tx = match &self.unsigned_tx {
            Some(tx) => tx.clone(),
            None => return Err(self.abort("broadcast without a transaction", svc.now)),
        };
        for witnesses in self.witnesses.values() {
            for (index, witness) in witnesses {
                tx.input[*index].witness = witness.clone();
            }
        }
        match svc.chain.broadcast(&tx) {
            Ok(()) => {
                log::info!("round {}: coinjoin {} broadcast", self.id, tx.txid());
                self.status = Status::Succeeded;
                self.finished_at = Some(svc.now);
                Ok(())
            }
            Err(error) => {
                log::error!("round {}: broadcast refused: {error:?}", self.id);
                self.fail("broadcast refused", svc.now);
                Err(Rejection::Chain(error))
            }
        }
    }

    /// An invariant broke. The round dies, the coordinator lives.
    fn abort(&mut self, reason: &'static str, now: Instant) -> Rejection {
        log::error!("round {}: invariant violated: {reason}", self.id);
        self.fail(reason, now);
        Rejection::Fatal(reason)
    }

    fn fail(&mut self, reason: &str, now: Instant) {
        log::warn!("round {}: failed: {reason}", self.id);
        self.status = Status::Failed;
        self.finished_at = Some(now);
    }
}

impl std::fmt::Debug for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("status", &self.status)
            .field("alices", &self.alices.len())
            .field("bobs", &self.bobs.len())
            .finish_non_exhaustive()
    }
}

/// The per-participant coordinator revenue in satoshis, rounded down.
fn coordinator_fee(denomination: u64, percent: f64) -> u64 {
    (denomination as f64 * percent / 100.0) as u64
}

/// Checks that the proof is a valid recoverable signature over `message`
/// made with the key locking the UTXO.
fn verify_ownership_proof(
    secp: &Secp256k1<VerifyOnly>,
    utxo_script: &Script,
    message: &str,
    proof: &str,
) -> Result<(), Rejection> {
    let signature = MessageSignature::from_base64(proof).map_err(|_| Rejection::InvalidProof)?;
    let digest = signed_msg_hash(message);
    let pubkey = signature
        .recover_pubkey(secp, digest)
        .map_err(|_| Rejection::InvalidProof)?;
    let hash = pubkey.wpubkey_hash().ok_or(Rejection::InvalidProof)?;
    if &Script::new_v0_p2wpkh(&hash) == utxo_script {
        Ok(())
    } else {
        Err(Rejection::InvalidProof)
    }
}

/// Checks a posted witness against the input it claims to spend: exactly the
/// two P2WPKH stack items, a key matching the witness program, and a DER
/// signature valid for this transaction's SIGHASH_ALL digest.
fn verify_input_witness(
    secp: &Secp256k1<VerifyOnly>,
    tx: &Transaction,
    index: usize,
    input: &RegisteredInput,
    witness: &Witness,
) -> Result<(), Rejection> {
    let items = witness.to_vec();
    if items.len() != 2 {
        return Err(Rejection::InvalidProof);
    }

    let pubkey = bitcoin::PublicKey::from_slice(&items[1]).map_err(|_| Rejection::InvalidProof)?;
    let hash = pubkey.wpubkey_hash().ok_or(Rejection::InvalidProof)?;
    if Script::new_v0_p2wpkh(&hash) != input.script_pubkey {
        return Err(Rejection::InvalidProof);
    }

    let signature = EcdsaSig::from_slice(&items[0]).map_err(|_| Rejection::InvalidProof)?;
    if signature.hash_ty != EcdsaSighashType::All {
        return Err(Rejection::InvalidProof);
    }

    let script_code = input
        .script_pubkey
        .p2wpkh_script_code()
        .ok_or(Rejection::Fatal("registered input is not p2wpkh"))?;
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(index, &script_code, input.value, EcdsaSighashType::All)
        .map_err(|_| Rejection::InvalidProof)?;
    let digest = Message::from_slice(&sighash[..]).map_err(|_| Rejection::InvalidProof)?;
    secp.verify_ecdsa(&digest, &signature.sig, &pubkey.inner)
        .map_err(|_| Rejection::InvalidProof)
}
