use std::collections::BTreeMap;
use std::fmt;

use num::BigUint;
use serde::{Deserialize, Serialize};

use crate::buffer::{ContributionPayload, Round};
use crate::hash;
use crate::param::FieldContext;
use crate::rsa::{self, RsaPartialProof};
use crate::sockets::decimal;
use crate::worker::{AggregationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstructionKind {
	Hash,
	Rsa,
	Linear,
	Nonce,
}

impl ConstructionKind {
	pub const ALL: [ConstructionKind; 4] = [
		ConstructionKind::Hash,
		ConstructionKind::Rsa,
		ConstructionKind::Linear,
		ConstructionKind::Nonce,
	];

	/// Verifier endpoint that receives this construction's partials.
	pub fn endpoint(self) -> &'static str {
		match self {
			ConstructionKind::Hash => "hash",
			ConstructionKind::Rsa => "rsa",
			ConstructionKind::Linear => "linear",
			ConstructionKind::Nonce => "nonce",
		}
	}

	/// Ingress route clients submit this construction's shares on.
	pub fn route(self) -> &'static str {
		match self {
			ConstructionKind::Hash => "hash-data",
			ConstructionKind::Rsa => "rsa-data",
			ConstructionKind::Linear => "linear-data",
			ConstructionKind::Nonce => "nonce-data",
		}
	}

	pub fn from_route(route: &str) -> Option<ConstructionKind> {
		ConstructionKind::ALL.iter().copied().find(|k| k.route() == route)
	}

	fn construction(self) -> &'static dyn Construction {
		match self {
			ConstructionKind::Hash => &HomomorphicHash,
			ConstructionKind::Rsa => &RsaThreshold,
			ConstructionKind::Linear => &LinearSignature,
			ConstructionKind::Nonce => &NonceDistribution,
		}
	}

	pub fn compute(self, round: &Round, ctx: &FieldContext) -> Result<PartialResult> {
		if round.kind() != self {
			return Err(AggregationError::ProtocolMismatch {
				key: round.key(),
				expected: self,
				found: round.kind(),
			});
		}
		let (partial_result, proof) = self.construction().compute(round, ctx)?;
		Ok(PartialResult {
			substation_id: round.key().substation_id,
			round_id: round.key().round_id,
			server_id: ctx.server_id,
			kind: self,
			partial_result,
			proof,
		})
	}
}

impl fmt::Display for ConstructionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ConstructionKind::Hash => "homomorphic-hash",
			ConstructionKind::Rsa => "rsa-threshold",
			ConstructionKind::Linear => "linear-signature",
			ConstructionKind::Nonce => "nonce-distribution",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartialProof {
	Homomorphic {
		#[serde(with = "decimal")]
		partial_proof: BigUint,
	},
	Rsa {
		client_proofs: BTreeMap<u32, RsaPartialProof>,
	},
	Linear,
	Nonce {
		#[serde(with = "decimal")]
		partial_proof: BigUint,
		#[serde(with = "decimal")]
		partial_nonce: BigUint,
	},
}

/// What this server forwards to the verifier for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialResult {
	pub substation_id: u32,
	pub round_id: u32,
	pub server_id: u32,
	pub kind: ConstructionKind,
	#[serde(with = "decimal")]
	pub partial_result: BigUint,
	pub proof: PartialProof,
}

/// Turns a completed round into a partial result and its proof.
trait Construction: Sync {
	fn compute(&self, round: &Round, ctx: &FieldContext) -> Result<(BigUint, PartialProof)>;
}

struct HomomorphicHash;

impl Construction for HomomorphicHash {
	fn compute(&self, round: &Round, ctx: &FieldContext) -> Result<(BigUint, PartialProof)> {
		let partial_result = hash::partial_eval(round.shares(), &ctx.modulus);
		let partial_proof = hash::homomorphic_partial_proof(round.shares(), &ctx.modulus, &ctx.generator);
		Ok((partial_result, PartialProof::Homomorphic { partial_proof }))
	}
}

struct RsaThreshold;

impl Construction for RsaThreshold {
	fn compute(&self, round: &Round, ctx: &FieldContext) -> Result<(BigUint, PartialProof)> {
		let partial_result = hash::partial_eval(round.shares(), &ctx.modulus);
		let client_proofs = rsa::rsa_partial_proof(round, ctx.server_id, ctx.server_count)?;
		Ok((partial_result, PartialProof::Rsa { client_proofs }))
	}
}

// Authenticated out of band by the linear signature scheme.
struct LinearSignature;

impl Construction for LinearSignature {
	fn compute(&self, round: &Round, ctx: &FieldContext) -> Result<(BigUint, PartialProof)> {
		Ok((hash::partial_eval(round.shares(), &ctx.modulus), PartialProof::Linear))
	}
}

struct NonceDistribution;

impl Construction for NonceDistribution {
	fn compute(&self, round: &Round, ctx: &FieldContext) -> Result<(BigUint, PartialProof)> {
		let mut nonces = Vec::with_capacity(round.len());
		for c in round.contributions() {
			match &c.payload {
				ContributionPayload::Nonce { nonce_share } => nonces.push(nonce_share),
				_ => {
					return Err(AggregationError::ProtocolMismatch {
						key: round.key(),
						expected: ConstructionKind::Nonce,
						found: c.kind(),
					})
				}
			}
		}
		let partial_result = hash::partial_eval(round.shares(), &ctx.modulus);
		let partial_proof = hash::homomorphic_partial_proof(round.shares(), &ctx.modulus, &ctx.generator);
		// reduced only after all servers' partial nonces are combined
		let partial_nonce = hash::sum(nonces);
		Ok((
			partial_result,
			PartialProof::Nonce {
				partial_proof,
				partial_nonce,
			},
		))
	}
}
