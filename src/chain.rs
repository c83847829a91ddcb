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

//! Interface to the Bitcoin node. The core never talks RPC itself; an
//! external adapter implements [`ChainOracle`] over whatever node access it
//! has and the core asks it about UTXOs, mempool CoinJoins and broadcasts.

use bitcoin::{OutPoint, Script, Transaction, Txid};

/// State of a spendable transaction output as seen by the node.
#[derive(Debug, Clone)]
pub struct TxOutInfo {
    /// Value in satoshis.
    pub value: u64,
    /// The locking script.
    pub script_pubkey: Script,
    /// Number of confirmations; zero for mempool outputs.
    pub confirmations: u32,
    /// Whether the output was created by a coinbase transaction.
    pub is_coinbase: bool,
}

impl TxOutInfo {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

/// Why the node could not be asked or refused an answer.
#[derive(Debug)]
pub enum Error {
    /// The RPC deadline elapsed. The caller may retry.
    Timeout,
    /// The node was unreachable or answered nonsense.
    Unreachable(String),
    /// The node rejected a broadcast transaction.
    BroadcastRejected(String),
}

/// Node-side capabilities the round machinery depends on.
///
/// Implementations must also keep the ledger of coordinated CoinJoins: every
/// transaction handed to [`ChainOracle::broadcast`] is one, and
/// [`ChainOracle::contains_coinjoin`] / [`ChainOracle::unconfirmed_coinjoin_count`]
/// answer from that ledger.
pub trait ChainOracle: Send + Sync {
    /// Looks up an unspent output. `Ok(None)` means spent or never seen.
    /// With `include_mempool`, unconfirmed outputs are reported too.
    fn get_txout(&self, outpoint: OutPoint, include_mempool: bool)
        -> Result<Option<TxOutInfo>, Error>;

    /// Whether `txid` is a CoinJoin this coordinator produced.
    fn contains_coinjoin(&self, txid: &Txid) -> bool;

    /// How many coordinated CoinJoins are still waiting for a block.
    fn unconfirmed_coinjoin_count(&self) -> usize;

    /// Hands a finalized CoinJoin to the node for broadcast and records its
    /// txid in the CoinJoin ledger.
    fn broadcast(&self, tx: &Transaction) -> Result<(), Error>;
}
