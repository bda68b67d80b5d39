use std::collections::BTreeMap;

use num::{BigUint, One, Zero};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffer::{ContributionPayload, Round};
use crate::sockets::decimal;
use crate::worker::{AggregationError, Result};

/// What a client sends this server so it can produce the client's RSA share.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RsaProofMaterial {
	#[serde(with = "decimal")]
	pub token: BigUint,
	/// This server's share of the client's private exponent.
	#[serde(with = "decimal")]
	pub key_share: BigUint,
	#[serde(with = "decimal")]
	pub rsa_modulus: BigUint,
	#[serde(with = "decimal")]
	pub public_exponent: BigUint,
	pub server_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RsaPartialProof {
	pub client_id: u32,
	pub server_id: u32,
	pub substation_id: u32,
	#[serde(with = "decimal")]
	pub partial_proof: BigUint,
	#[serde(with = "decimal")]
	pub rsa_modulus: BigUint,
	#[serde(with = "decimal")]
	pub public_exponent: BigUint,
}

fn factorial(n: usize) -> BigUint {
	(1..=n).fold(BigUint::one(), |acc, i| acc * i)
}

/*
	`x^(2·n!·s) mod N` for one client's material.
	`n` is the registered server count; the client's own count must agree with it.
*/
pub fn signature_share(client_id: u32, material: &RsaProofMaterial, server_count: usize) -> Result<BigUint> {
	if material.rsa_modulus <= BigUint::one() {
		return Err(AggregationError::InvalidProofMaterial {
			client_id,
			reason: "modulus must exceed 1".to_string(),
		});
	}
	if server_count == 0 {
		return Err(AggregationError::InvalidProofMaterial {
			client_id,
			reason: "no servers registered".to_string(),
		});
	}
	if material.server_count as usize != server_count {
		return Err(AggregationError::InvalidProofMaterial {
			client_id,
			reason: format!(
				"key dealt to {} servers, {} registered",
				material.server_count, server_count
			),
		});
	}
	let delta = factorial(server_count);
	let exponent = delta * &material.key_share * 2u32;
	Ok(material.token.modpow(&exponent, &material.rsa_modulus))
}

/// One independently checkable proof per contributing client.
pub fn rsa_partial_proof(round: &Round, server_id: u32, server_count: usize) -> Result<BTreeMap<u32, RsaPartialProof>> {
	let mut proofs = BTreeMap::new();
	for contribution in round.contributions() {
		let material = match &contribution.payload {
			ContributionPayload::Rsa(material) => material,
			_ => {
				return Err(AggregationError::ProtocolMismatch {
					key: round.key(),
					expected: round.kind(),
					found: contribution.kind(),
				})
			}
		};
		if material.public_exponent.is_zero() {
			return Err(AggregationError::InvalidProofMaterial {
				client_id: contribution.client_id,
				reason: "public exponent is zero".to_string(),
			});
		}
		let partial_proof = signature_share(contribution.client_id, material, server_count)?;
		let replaced = proofs.insert(
			contribution.client_id,
			RsaPartialProof {
				client_id: contribution.client_id,
				server_id,
				substation_id: round.key().substation_id,
				partial_proof,
				rsa_modulus: material.rsa_modulus.clone(),
				public_exponent: material.public_exponent.clone(),
			},
		);
		// both shares stay in the partial sum, only the last proof is sent
		if replaced.is_some() {
			warn!(
				"client {} contributed twice to {}, keeping its last RSA proof",
				contribution.client_id,
				round.key()
			);
		}
	}
	Ok(proofs)
}
