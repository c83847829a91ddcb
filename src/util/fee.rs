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

const P2WPKH_IN_SIZE: f64 = 67.75;
const P2WPKH_OUT_SIZE: f64 = 31.0;

// segwit_marker + segwit_flag + witness_element_count
const WITNESS_MARKER: f64 = 0.50;
const WITNESS_ITEMS: f64 = 0.25;

/// Estimates the size of an all-P2WPKH CoinJoin in vBytes.
pub fn estimate_coinjoin_size(n_inputs: usize, n_outputs: usize) -> f64 {
    let input_size = n_inputs as f64 * (P2WPKH_IN_SIZE + WITNESS_ITEMS);
    let output_size = n_outputs as f64 * P2WPKH_OUT_SIZE;
    let overhead = 4_f64 // nVersion
            + sizeof_varint(n_inputs) as f64
            + sizeof_varint(n_outputs) as f64
            + 4_f64 // nLockTime
            + WITNESS_MARKER;

    input_size + output_size + overhead
}

fn sizeof_varint(int: usize) -> usize {
    match int {
        0..=252 => 1,
        253..=65534 => 3,
        65535..=4294967294 => 5,
        _ => 9,
    }
}
