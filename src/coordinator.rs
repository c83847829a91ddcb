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

//! The coordinator owns the fleet of concurrent rounds, routes requests to
//! the right one and enforces the two global exclusion scopes:
//!
//! * **the inputs lock** serializes every input registration across all
//!   rounds, because cross-round outpoint exclusivity cannot be checked
//!   against a moving target;
//! * **the output lock** serializes every mix output registration, so two
//!   simultaneous registrants cannot both take the last slot.
//!
//! Everything else locks one round at a time. Lock order is always global
//! lock, then fleet list, then a single round; no call path holds two round
//! locks at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{OutPoint, Script, Transaction, Txid, Witness};
use blind_rsa_signatures::Signature;
use std::collections::BTreeMap;

use crate::ban::BanStore;
use crate::blind::BlindSigner;
use crate::chain::ChainOracle;
use crate::round::{
    AcceptedAlice, AliceRegistration, Confirmation, InputRefusal, Phase, Rejection, Round,
    RoundHash, RoundId, RoundParams, RoundState, Services,
};
use crate::participant::AliceId;
use crate::Config;

/// Drives the whole mixing service. One value per process, constructed at
/// startup and shared by reference with every request handler and the
/// ticker thread.
pub struct Coordinator {
    config: Config,
    chain: Arc<dyn ChainOracle>,
    signer: BlindSigner,
    bans: BanStore,
    secp: Secp256k1<VerifyOnly>,
    rounds: Mutex<Vec<Arc<Mutex<Round>>>>,
    inputs_lock: Mutex<()>,
    output_lock: Mutex<()>,
    next_round_id: AtomicU64,
}

impl Coordinator {
    /// Builds the coordinator and opens the first round.
    pub fn new(config: Config, chain: Arc<dyn ChainOracle>, signer: BlindSigner) -> Self {
        let coordinator = Self {
            bans: BanStore::new(config.ban_duration),
            config,
            chain,
            signer,
            secp: Secp256k1::verification_only(),
            rounds: Mutex::new(Vec::new()),
            inputs_lock: Mutex::new(()),
            output_lock: Mutex::new(()),
            next_round_id: AtomicU64::new(1),
        };
        coordinator.input_round(Instant::now());
        coordinator
    }

    /// Registers an input-side participant with the round currently open for
    /// input registration. Serialized globally: the cross-round exclusivity
    /// check, the chain lookups and the blind signing all happen under the
    /// inputs lock.
    pub fn register_alice(&self, request: AliceRegistration) -> Result<AcceptedAlice, Rejection> {
        let _inputs = lock(&self.inputs_lock);
        let now = Instant::now();
        let current = self.input_round(now);

        for input in &request.inputs {
            if self.input_registered_elsewhere(&input.outpoint, &current) {
                return Err(Rejection::InputDisallowed {
                    outpoint: input.outpoint,
                    reason: InputRefusal::RegisteredElsewhere,
                });
            }
        }

        let svc = self.services(now, SystemTime::now());
        let mut round = lock(&current);
        round.register_alice(request, &svc)
    }

    /// Heartbeat or confirmation, depending on the round's phase.
    pub fn confirm_connection(
        &self,
        round: RoundId,
        alice: &AliceId,
    ) -> Result<Confirmation, Rejection> {
        let round = self.try_get_round(round).ok_or(Rejection::NotFound)?;
        let svc = self.services(Instant::now(), SystemTime::now());
        let mut round = lock(&round);
        round.confirm_connection(alice, &svc)
    }

    /// Penalty-free exit during input registration.
    pub fn unregister_alice(&self, round: RoundId, alice: &AliceId) -> Result<(), Rejection> {
        let round = self.try_get_round(round).ok_or(Rejection::NotFound)?;
        let mut round = lock(&round);
        round.unregister_alice(alice)
    }

    /// Registers a mix output with the round committed to by `hash`.
    /// Serialized globally by the output lock.
    pub fn register_bob(
        &self,
        hash: &RoundHash,
        output_script: Script,
        signature: &Signature,
    ) -> Result<(), Rejection> {
        let _outputs = lock(&self.output_lock);
        let round = self.try_get_round_by_hash(hash).ok_or(Rejection::NotFound)?;
        let svc = self.services(Instant::now(), SystemTime::now());
        let mut round = lock(&round);
        round.register_bob(output_script, signature, &svc)
    }

    /// The unsigned CoinJoin a participant has to sign, once signing is on.
    pub fn coinjoin(&self, round: RoundId, alice: &AliceId) -> Result<Transaction, Rejection> {
        let round = self.try_get_round(round).ok_or(Rejection::NotFound)?;
        let round = lock(&round);
        round.coinjoin(alice).cloned()
    }

    /// Accepts a participant's witnesses; the last complete set broadcasts
    /// the CoinJoin.
    pub fn post_signatures(
        &self,
        round: RoundId,
        alice: &AliceId,
        witnesses: BTreeMap<usize, Witness>,
    ) -> Result<(), Rejection> {
        let round = self.try_get_round(round).ok_or(Rejection::NotFound)?;
        let svc = self.services(Instant::now(), SystemTime::now());
        let mut round = lock(&round);
        round.post_signatures(alice, witnesses, &svc)
    }

    /// Snapshots of all running rounds, for status reporting.
    pub fn running_rounds(&self) -> Vec<RoundState> {
        lock(&self.rounds)
            .iter()
            .filter_map(|round| {
                let round = lock(round);
                round.is_running().then(|| round.state())
            })
            .collect()
    }

    /// The round currently accepting input registrations. There is always
    /// exactly one; it is created here if need be.
    pub fn current_input_registering_round(&self) -> Arc<Mutex<Round>> {
        self.input_round(Instant::now())
    }

    pub fn try_get_round(&self, id: RoundId) -> Option<Arc<Mutex<Round>>> {
        lock(&self.rounds).iter().find(|round| lock(round).id() == id).cloned()
    }

    pub fn try_get_round_by_hash(&self, hash: &RoundHash) -> Option<Arc<Mutex<Round>>> {
        lock(&self.rounds)
            .iter()
            .find(|round| lock(round).round_hash().as_ref() == Some(hash))
            .cloned()
    }

    /// Whether any running round already claims this outpoint.
    pub fn any_running_round_contains_input(&self, outpoint: &OutPoint) -> bool {
        lock(&self.rounds).iter().any(|round| {
            let round = lock(round);
            round.is_running() && round.contains_input(outpoint)
        })
    }

    /// Whether this coordinator produced the CoinJoin with that txid.
    pub fn contains_coinjoin(&self, txid: &Txid) -> bool {
        self.chain.contains_coinjoin(txid)
    }

    /// Timer entry point, called from a dedicated ticker thread. Expires
    /// phases, retires rounds that finished longer than the grace window ago
    /// and keeps an input registration round open.
    pub fn tick(&self, now: Instant, wall: SystemTime) {
        let svc = self.services(now, wall);
        let snapshot: Vec<_> = lock(&self.rounds).clone();
        for round in &snapshot {
            lock(round).tick(&svc);
        }

        let mut rounds = lock(&self.rounds);
        rounds.retain(|round| {
            let round = lock(round);
            match round.finished_at() {
                Some(finished) => {
                    let retire = now.saturating_duration_since(finished)
                        >= self.config.retirement_grace;
                    if retire {
                        log::debug!("round {} retired", round.id());
                    }
                    !retire
                }
                None => true,
            }
        });
        drop(rounds);

        self.input_round(now);
    }

    fn services(&self, now: Instant, wall: SystemTime) -> Services<'_> {
        Services {
            chain: self.chain.as_ref(),
            bans: &self.bans,
            signer: &self.signer,
            secp: &self.secp,
            now,
            wall,
        }
    }

    /// Finds the open input registration round or creates the next one.
    fn input_round(&self, now: Instant) -> Arc<Mutex<Round>> {
        let mut rounds = lock(&self.rounds);
        let open = rounds.iter().find(|round| {
            let round = lock(round);
            round.is_running() && round.phase() == Phase::InputRegistration
        });
        if let Some(round) = open {
            return Arc::clone(round);
        }

        let id = RoundId(self.next_round_id.fetch_add(1, Ordering::Relaxed));
        let round = Arc::new(Mutex::new(Round::new(
            id,
            RoundParams::from_config(&self.config),
            now,
        )));
        rounds.push(Arc::clone(&round));
        round
    }

    /// Cross-round exclusivity: is the outpoint held by a running round
    /// other than `current`? The current round handles its own holders as a
    /// re-registration.
    fn input_registered_elsewhere(
        &self,
        outpoint: &OutPoint,
        current: &Arc<Mutex<Round>>,
    ) -> bool {
        lock(&self.rounds)
            .iter()
            .filter(|round| !Arc::ptr_eq(round, current))
            .any(|round| {
                let round = lock(round);
                round.is_running() && round.contains_input(outpoint)
            })
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::blind::test_signer;
    use crate::chain::testing::MockChain;
    use crate::round::Status;
    use crate::testutil::{outpoint, p2wpkh_script, TestClient};

    const DENOMINATION: u64 = 10_000_000;

    #[test]
    fn two_party_mix_start_to_broadcast() {
        let (coordinator, chain) = coordinator();
        let clients =
            [TestClient::new(1, &signer()), TestClient::new(2, &signer())];

        // input registration; the second admission fills the round
        let accepted: Vec<_> = clients
            .iter()
            .enumerate()
            .map(|(n, client)| {
                let coin = outpoint(n as u8 + 1);
                chain.add_utxo(coin, 11_000_000, client.funding_script.clone());
                coordinator.register_alice(client.registration(&[coin])).unwrap()
            })
            .collect();
        assert_eq!(accepted[0].round, accepted[1].round);

        // both confirm and learn the round hash
        let mut hash = None;
        for a in &accepted {
            match coordinator.confirm_connection(a.round, &a.id).unwrap() {
                Confirmation::Confirmed(h) => hash = Some(h),
                Confirmation::Heartbeat => panic!("round should be past input registration"),
            }
        }
        let hash = hash.unwrap();

        // both return under fresh identities to claim their mix output
        for (client, a) in clients.iter().zip(&accepted) {
            let signature = client.unblind(&a.blind_signature, &signer());
            coordinator
                .register_bob(&hash, client.output_script.clone(), &signature)
                .unwrap();
        }

        // everyone signs her own inputs
        let tx = coordinator.coinjoin(accepted[0].round, &accepted[0].id).unwrap();
        for (n, (client, a)) in clients.iter().zip(&accepted).enumerate() {
            let witnesses = client.witnesses_for(&tx, &[(outpoint(n as u8 + 1), 11_000_000)]);
            coordinator.post_signatures(a.round, &a.id, witnesses).unwrap();
        }

        let broadcasts = chain.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        let round = coordinator.try_get_round(accepted[0].round).unwrap();
        assert_eq!(lock(&round).status(), Status::Succeeded);

        // two denomination outputs, two change outputs, one coordinator output
        let coinjoin = &broadcasts[0];
        assert_eq!(coinjoin.output.len(), 5);
        assert_eq!(
            coinjoin.output.iter().filter(|out| out.value == DENOMINATION).count(),
            2
        );
        // 0.1% of the denomination per participant
        assert!(coinjoin
            .output
            .iter()
            .any(|out| out.script_pubkey == p2wpkh_script(200) && out.value == 20_000));
        assert!(coordinator.contains_coinjoin(&coinjoin.txid()));
    }

    #[test]
    fn an_outpoint_cannot_sit_in_two_rounds() {
        let (coordinator, chain) = coordinator();
        let clients =
            [TestClient::new(1, &signer()), TestClient::new(2, &signer())];
        for (n, client) in clients.iter().enumerate() {
            let coin = outpoint(n as u8 + 1);
            chain.add_utxo(coin, 11_000_000, client.funding_script.clone());
            coordinator.register_alice(client.registration(&[coin])).unwrap();
        }

        // the filled round moved on, so this registration opens a new round
        // and must not steal the first round's outpoint
        let latecomer = TestClient::new(1, &signer()).with_destination(77, &signer());
        let result = coordinator.register_alice(latecomer.registration(&[outpoint(1)]));
        assert!(matches!(
            result,
            Err(Rejection::InputDisallowed {
                reason: InputRefusal::RegisteredElsewhere,
                ..
            })
        ));
        assert!(coordinator.any_running_round_contains_input(&outpoint(1)));

        // a fresh outpoint enters the new round just fine
        let newcomer = TestClient::new(3, &signer());
        chain.add_utxo(outpoint(9), 11_000_000, newcomer.funding_script.clone());
        let accepted = coordinator.register_alice(newcomer.registration(&[outpoint(9)])).unwrap();
        assert_ne!(accepted.round, RoundId(1));
    }

    #[test]
    fn a_failed_round_releases_its_input_claims() {
        let (coordinator, chain) = coordinator();
        let clients =
            [TestClient::new(1, &signer()), TestClient::new(2, &signer())];
        for (n, client) in clients.iter().enumerate() {
            let coin = outpoint(n as u8 + 1);
            chain.add_utxo(coin, 11_000_000, client.funding_script.clone());
            coordinator.register_alice(client.registration(&[coin])).unwrap();
        }

        // nobody confirms; the confirmation deadline kills the round
        coordinator.tick(Instant::now() + Duration::from_secs(61), SystemTime::now());
        let round = coordinator.try_get_round(RoundId(1)).unwrap();
        assert_eq!(lock(&round).status(), Status::Failed);

        // the outpoint may now enter the replacement round
        let retry = TestClient::new(1, &signer()).with_destination(77, &signer());
        let accepted = coordinator.register_alice(retry.registration(&[outpoint(1)])).unwrap();
        assert_ne!(accepted.round, RoundId(1));
    }

    #[test]
    fn finished_rounds_are_retired_after_the_grace_window() {
        let (coordinator, _) = coordinator();
        let now = Instant::now();

        // exhaust every registration extension to fail the empty round; the
        // failing tick itself does not retire it, the grace window just began
        let mut at = now;
        for _ in 0..5 {
            at += Duration::from_secs(3601);
            coordinator.tick(at, SystemTime::now());
        }
        let round = coordinator.try_get_round(RoundId(1)).unwrap();
        assert_eq!(lock(&round).status(), Status::Failed);

        // once the grace window passes, the round disappears
        coordinator.tick(at + Duration::from_secs(601), SystemTime::now());
        assert!(coordinator.try_get_round(RoundId(1)).is_none());

        // but an input registration round is always open
        let states = coordinator.running_rounds();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].phase, Phase::InputRegistration);
    }

    #[test]
    fn status_reporting_shows_the_open_round() {
        let (coordinator, _) = coordinator();
        let states = coordinator.running_rounds();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].round, RoundId(1));
        assert_eq!(states[0].phase, Phase::InputRegistration);
        assert_eq!(states[0].denomination, DENOMINATION);
        assert_eq!(states[0].required_peer_count, 2);
        assert_eq!(states[0].registered_peer_count, 0);
        assert_eq!(states[0].max_inputs_per_peer, 7);
    }

    // ---- fixtures ----

    fn coordinator() -> (Coordinator, Arc<MockChain>) {
        let chain = Arc::new(MockChain::new());
        let config = Config {
            network: bitcoin::Network::Regtest,
            denomination: DENOMINATION,
            anonymity_set: 2,
            fee_per_input: 5_000,
            fee_per_output: 10_000,
            coordinator_fee_percent: 0.1,
            coordinator_script: p2wpkh_script(200),
            connection_confirmation_timeout: Duration::from_secs(60),
            ..Config::default()
        };
        (Coordinator::new(config, chain.clone(), test_signer()), chain)
    }

    fn signer() -> crate::blind::BlindSigner {
        test_signer()
    }
}
