use std::str;
use std::time::Duration;

use num::BigUint;
use serde::Deserialize;
use tracing::debug;
use zmq::{Socket, SNDMORE};

use crate::buffer::{Contribution, ContributionPayload, RoundKey};
use crate::construction::{ConstructionKind, PartialResult};
use crate::rsa::RsaProofMaterial;
use crate::worker::{AggregationError, Result};

/// Big integers travel as decimal strings.
pub mod decimal {
	use num::BigUint;
	use serde::{de, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&value.to_str_radix(10))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
		let s = String::deserialize(deserializer)?;
		BigUint::parse_bytes(s.as_bytes(), 10).ok_or_else(|| de::Error::custom(format!("not a decimal integer: {}", s)))
	}
}

/// Outbound path for computed partials. Fire-and-forget, bounded by `timeout`.
pub trait Delivery: Send + Sync {
	fn send(&self, endpoint: &str, partial: &PartialResult, timeout: Duration) -> Result<()>;
}

/*
	Pushes [endpoint, json] to the verifier.
	A fresh socket per partial keeps workers independent of each other.
*/
pub struct ZmqDelivery {
	context: zmq::Context,
	verifier: String,
	prefix: String,
}

impl ZmqDelivery {
	pub fn new(context: zmq::Context, verifier: &str) -> ZmqDelivery {
		ZmqDelivery {
			context,
			verifier: verifier.to_string(),
			prefix: "api/server/".to_string(),
		}
	}

	fn push(&self, path: &str, body: Vec<u8>, timeout: Duration) -> std::result::Result<(), zmq::Error> {
		let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
		let socket = self.context.socket(zmq::PUSH)?;
		socket.set_sndtimeo(millis)?;
		socket.set_linger(millis)?;
		// queue only on live connections, so a missing verifier hits the send timeout
		socket.set_immediate(true)?;
		socket.connect(&self.verifier)?;
		socket.send(path, SNDMORE)?;
		socket.send(body, 0)
	}
}

impl Delivery for ZmqDelivery {
	fn send(&self, endpoint: &str, partial: &PartialResult, timeout: Duration) -> Result<()> {
		let path = format!("{}{}", self.prefix, endpoint);
		let body = serde_json::to_vec(partial).map_err(|e| AggregationError::DeliveryFailure {
			endpoint: path.clone(),
			reason: e.to_string(),
		})?;
		match self.push(&path, body, timeout) {
			Ok(()) => {
				debug!("pushed partial to {} {}", self.verifier, path);
				Ok(())
			}
			Err(zmq::Error::EAGAIN) => Err(AggregationError::DeliveryTimeout(path)),
			Err(e) => Err(AggregationError::DeliveryFailure {
				endpoint: path,
				reason: e.to_string(),
			}),
		}
	}
}

#[derive(Debug, Deserialize)]
struct ClientShare {
	substation_id: u32,
	round_id: u32,
	client_id: u32,
	#[serde(with = "decimal")]
	secret_share: BigUint,
	#[serde(default, with = "optional_decimal")]
	nonce_share: Option<BigUint>,
	#[serde(default)]
	rsa: Option<RsaProofMaterial>,
}

mod optional_decimal {
	use num::BigUint;
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<BigUint>, D::Error> {
		#[derive(Deserialize)]
		struct Wrapper(#[serde(with = "super::decimal")] BigUint);

		let v = Option::<Wrapper>::deserialize(deserializer)?;
		Ok(v.map(|Wrapper(n)| n))
	}
}

/// Parses a `[route, json]` ingress message into the round it belongs to and the contribution.
pub fn parse_contribution(route: &str, body: &[u8]) -> Result<(RoundKey, Contribution)> {
	let kind = ConstructionKind::from_route(route)
		.ok_or_else(|| AggregationError::Malformed(format!("unknown route {}", route)))?;
	let share: ClientShare = serde_json::from_slice(body).map_err(|e| AggregationError::Malformed(e.to_string()))?;

	let payload = match kind {
		ConstructionKind::Hash => ContributionPayload::Hash,
		ConstructionKind::Linear => ContributionPayload::Linear,
		ConstructionKind::Nonce => match share.nonce_share {
			Some(nonce_share) => ContributionPayload::Nonce { nonce_share },
			None => return Err(AggregationError::Malformed("nonce share missing".to_string())),
		},
		ConstructionKind::Rsa => match share.rsa {
			Some(material) => ContributionPayload::Rsa(material),
			None => return Err(AggregationError::Malformed("RSA proof material missing".to_string())),
		},
	};

	Ok((
		RoundKey::new(share.substation_id, share.round_id),
		Contribution {
			client_id: share.client_id,
			secret_share: share.secret_share,
			payload,
		},
	))
}

pub fn take_id(socket: &Socket) -> std::result::Result<Vec<u8>, zmq::Error> {
	socket.recv_bytes(0)
}

pub fn recv(socket: &Socket) -> std::result::Result<Vec<Vec<u8>>, zmq::Error> {
	socket.recv_multipart(0)
}

pub fn route_name(frame: &[u8]) -> Result<&str> {
	str::from_utf8(frame).map_err(|_| AggregationError::Malformed("route is not utf-8".to_string()))
}
