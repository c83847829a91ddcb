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

//! Coordinator core of a Chaumian CoinJoin mixing service.
//!
//! Participants register Bitcoin inputs together with a *blinded* output
//! script, receive a blind RSA signature over it, and later return under a
//! fresh identity to register the unblinded script. The coordinator drives
//! everyone through four phases — input registration, connection
//! confirmation, output registration, signing — without ever learning which
//! input-side participant owns which mix output.
//!
//! This crate is the protocol core only. The HTTP transport, the full-node
//! RPC client behind [`chain::ChainOracle`] and ban-list persistence are
//! external adapters built on top of it.

use std::time::Duration;

pub mod ban;
pub mod blind;
pub mod chain;
pub mod codec;
pub mod coordinator;
pub mod participant;
pub mod round;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use bitcoin;

/// Runtime parameters for the coordinator and the rounds it opens.
#[derive(Debug, Clone)]
pub struct Config {
    /// The Bitcoin network to operate on.
    pub network: bitcoin::Network,
    /// The fixed value of every mix output, in satoshis.
    pub denomination: u64,
    /// Required number of indistinguishable mix outputs. Must be at least 2.
    pub anonymity_set: usize,
    /// Mining fee share collected per registered input, in satoshis.
    pub fee_per_input: u64,
    /// Mining fee share collected per produced output, in satoshis.
    pub fee_per_output: u64,
    /// Coordinator revenue as a percentage of the denomination, per participant.
    pub coordinator_fee_percent: f64,
    /// Script collecting the coordinator fees. An empty script disables the
    /// fee output and any owed amounts fall to the miners.
    pub coordinator_script: bitcoin::Script,
    /// Outputs below this value are not created; their value becomes mining fee.
    pub dust_threshold: u64,
    /// Maximum number of inputs one participant may register.
    pub max_inputs_per_alice: usize,
    /// Cap on coordinated CoinJoins waiting in the mempool before further
    /// inputs spending them are refused.
    pub max_unconfirmed_coinjoins: usize,
    /// How long the input registration phase runs before the timer fires.
    pub input_registration_timeout: Duration,
    /// How many times an underfilled input registration phase restarts its
    /// timer before the round is abandoned.
    pub max_registration_extensions: u32,
    /// Deadline for all participants to confirm their connection.
    pub connection_confirmation_timeout: Duration,
    /// Deadline for all mix outputs to be registered.
    pub output_registration_timeout: Duration,
    /// Deadline for all signatures to arrive.
    pub signing_timeout: Duration,
    /// How long a banned outpoint stays banned.
    pub ban_duration: Duration,
    /// How long a finished round remains queryable before it is retired.
    pub retirement_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: bitcoin::Network::Regtest,
            denomination: 10_000_000,
            anonymity_set: 2,
            fee_per_input: 5_000,
            fee_per_output: 10_000,
            coordinator_fee_percent: 0.0,
            coordinator_script: bitcoin::Script::new(),
            dust_threshold: 546,
            max_inputs_per_alice: 7,
            max_unconfirmed_coinjoins: 24,
            input_registration_timeout: Duration::from_secs(3600),
            max_registration_extensions: 4,
            connection_confirmation_timeout: Duration::from_secs(60),
            output_registration_timeout: Duration::from_secs(60),
            signing_timeout: Duration::from_secs(60),
            ban_duration: Duration::from_secs(30 * 24 * 60 * 60),
            retirement_grace: Duration::from_secs(600),
        }
    }
}
