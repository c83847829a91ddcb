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

//! Wire shapes for the coordinator's JSON interface and their conversions
//! into core types. The HTTP layer itself is an external adapter; it
//! deserializes into these types, calls the coordinator and serializes the
//! results back out. Scripts, digests and signatures travel as hex,
//! transactions in consensus wire format as hex, participant ids as UUID
//! text.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::consensus::Encodable;
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{OutPoint, Script, Transaction, Txid, Witness};
use blind_rsa_signatures::Signature;
use serde::{Deserialize, Serialize};

use crate::participant::AliceId;
use crate::round::{
    AcceptedAlice, AliceRegistration, Confirmation, InputProof, Phase, RoundHash, RoundState,
};

#[derive(Debug)]
pub enum Error {
    Hex,
    Txid,
    UniqueId,
    RoundHash,
    Json(serde_json::Error),
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json(error)
    }
}

/// One entry of the round state listing.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStateDto {
    pub phase: String,
    pub denomination: u64,
    pub registered_peer_count: usize,
    pub required_peer_count: usize,
    pub max_inputs_per_peer: usize,
    pub registration_timeout_seconds: u64,
    pub fee_per_input: u64,
    pub fee_per_output: u64,
    pub coordinator_fee_percent: f64,
    pub round_id: u64,
}

impl From<RoundState> for RoundStateDto {
    fn from(state: RoundState) -> Self {
        Self {
            phase: phase_name(state.phase).to_owned(),
            denomination: state.denomination,
            registered_peer_count: state.registered_peer_count,
            required_peer_count: state.required_peer_count,
            max_inputs_per_peer: state.max_inputs_per_peer,
            registration_timeout_seconds: state.registration_timeout.as_secs(),
            fee_per_input: state.fee_per_input,
            fee_per_output: state.fee_per_output,
            coordinator_fee_percent: state.coordinator_fee_percent,
            round_id: state.round.0,
        }
    }
}

pub fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::InputRegistration => "InputRegistration",
        Phase::ConnectionConfirmation => "ConnectionConfirmation",
        Phase::OutputRegistration => "OutputRegistration",
        Phase::Signing => "Signing",
    }
}

/// An outpoint on the wire: txid hex plus output index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutPointDto {
    pub hash: String,
    pub n: u32,
}

impl TryFrom<&OutPointDto> for OutPoint {
    type Error = Error;

    fn try_from(dto: &OutPointDto) -> Result<Self, Error> {
        let txid = Txid::from_str(&dto.hash).map_err(|_| Error::Txid)?;
        Ok(OutPoint::new(txid, dto.n))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProofDto {
    pub input: OutPointDto,
    pub proof: String,
}

/// Body of an input registration request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputsRequest {
    pub blinded_output_hex: String,
    pub change_output_script: String,
    pub inputs: Vec<InputProofDto>,
}

impl TryFrom<InputsRequest> for AliceRegistration {
    type Error = Error;

    fn try_from(request: InputsRequest) -> Result<Self, Error> {
        let change_script = script_from_hex(&request.change_output_script)?;
        let inputs = request
            .inputs
            .iter()
            .map(|dto| {
                Ok(InputProof {
                    outpoint: OutPoint::try_from(&dto.input)?,
                    proof: dto.proof.clone(),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(AliceRegistration {
            inputs,
            blinded_output_hex: request.blinded_output_hex,
            change_script,
        })
    }
}

/// Body of a successful input registration response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputsResponse {
    pub unique_id: String,
    pub blinded_output_signature: String,
    pub round_id: u64,
}

impl From<&AcceptedAlice> for InputsResponse {
    fn from(accepted: &AcceptedAlice) -> Self {
        Self {
            unique_id: accepted.id.to_string(),
            blinded_output_signature: accepted.blind_signature.0.to_hex(),
            round_id: accepted.round.0,
        }
    }
}

/// Body of a confirmation response. No hash means input registration is
/// still open and the adapter answers with no content.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_hash: Option<String>,
}

impl From<&Confirmation> for ConfirmationResponse {
    fn from(confirmation: &Confirmation) -> Self {
        match confirmation {
            Confirmation::Heartbeat => Self { round_hash: None },
            Confirmation::Confirmed(hash) => Self { round_hash: Some(hash.to_string()) },
        }
    }
}

/// Body of a mix output registration request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRequest {
    pub output_script: String,
    pub signature_hex: String,
}

impl OutputRequest {
    pub fn parse(&self) -> Result<(Script, Signature), Error> {
        let script = script_from_hex(&self.output_script)?;
        let signature =
            Signature::new(Vec::<u8>::from_hex(&self.signature_hex).map_err(|_| Error::Hex)?);
        Ok((script, signature))
    }
}

/// Body of a signature submission: witness stacks keyed by the input index
/// they sign, each stack item hex encoded.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturesRequest {
    pub signatures: BTreeMap<usize, Vec<String>>,
}

impl SignaturesRequest {
    pub fn parse(&self) -> Result<BTreeMap<usize, Witness>, Error> {
        self.signatures
            .iter()
            .map(|(index, items)| {
                let stack = items
                    .iter()
                    .map(|item| Vec::<u8>::from_hex(item).map_err(|_| Error::Hex))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok((*index, Witness::from_vec(stack)))
            })
            .collect()
    }
}

pub fn parse_unique_id(text: &str) -> Result<AliceId, Error> {
    AliceId::from_str(text).map_err(|_| Error::UniqueId)
}

pub fn parse_round_hash(text: &str) -> Result<RoundHash, Error> {
    RoundHash::from_str(text).map_err(|_| Error::RoundHash)
}

/// Renders a transaction in consensus wire format as hex.
pub fn transaction_hex(tx: &Transaction) -> String {
    let mut bytes = Vec::new();
    let _never_fails = tx.consensus_encode(&mut bytes);
    bytes.to_hex()
}

fn script_from_hex(hex: &str) -> Result<Script, Error> {
    Ok(Script::from(Vec::<u8>::from_hex(hex).map_err(|_| Error::Hex)?))
}
