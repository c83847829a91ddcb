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

//! Per-round participant state. The same human appears twice under two
//! deliberately unlinkable identities: an [`Alice`] contributing inputs and a
//! [`Bob`] claiming one mix output.

use std::time::Instant;

use bitcoin::{OutPoint, Script};
use uuid::Uuid;

/// Opaque handle for one input-side registration. Fresh per registration and
/// meaningless outside the round that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AliceId(Uuid);

impl AliceId {
    pub fn random() -> Self {
        AliceId(Uuid::new_v4())
    }
}

impl std::fmt::Display for AliceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AliceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(AliceId(Uuid::parse_str(s)?))
    }
}

/// Where an Alice stands inside her round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliceState {
    InputsRegistered,
    ConnectionConfirmed,
}

/// One UTXO committed to the mix, with the chain data it was validated against.
#[derive(Debug, Clone)]
pub struct RegisteredInput {
    pub outpoint: OutPoint,
    /// Value in satoshis at validation time.
    pub value: u64,
    /// The UTXO's locking script (native SegWit v0 key hash).
    pub script_pubkey: Script,
}

/// An input-side participant of one round.
#[derive(Debug)]
pub struct Alice {
    pub id: AliceId,
    /// The committed inputs, never empty.
    pub inputs: Vec<RegisteredInput>,
    /// Where the non-mixed remainder goes.
    pub change_script: Script,
    /// Lowercased hex of the blinded output script this Alice registered
    /// with. Unique within a round; blind-signed exactly once.
    pub blinded_output: String,
    /// This Alice's share of the mining fee, in satoshis.
    pub network_fee_owed: u64,
    /// This Alice's share of the coordinator fee, in satoshis.
    pub coordinator_fee_owed: u64,
    pub state: AliceState,
    /// Last sign of life, used to drop idle registrants at the phase timer.
    pub last_seen: Instant,
}

impl Alice {
    pub fn input_sum(&self) -> u64 {
        self.inputs.iter().map(|input| input.value).sum()
    }

    pub fn contains_input(&self, outpoint: &OutPoint) -> bool {
        self.inputs.iter().any(|input| &input.outpoint == outpoint)
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|input| input.outpoint).collect()
    }
}

/// An output-side participant. A Bob is nothing but a validated destination
/// script — it must stay impossible to tell which Alice it belongs to.
#[derive(Debug)]
pub struct Bob {
    pub output_script: Script,
}
