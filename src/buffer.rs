use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use num::BigUint;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::construction::ConstructionKind;
use crate::rsa::RsaProofMaterial;
use crate::worker::{AggregationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundKey {
	pub substation_id: u32,
	pub round_id: u32,
}

impl RoundKey {
	pub fn new(substation_id: u32, round_id: u32) -> RoundKey {
		RoundKey {
			substation_id,
			round_id,
		}
	}
}

impl fmt::Display for RoundKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "substation {} fid {}", self.substation_id, self.round_id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContributionPayload {
	Hash,
	Rsa(RsaProofMaterial),
	Linear,
	Nonce { nonce_share: BigUint },
}

/// One client's input to a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
	pub client_id: u32,
	pub secret_share: BigUint,
	pub payload: ContributionPayload,
}

impl Contribution {
	pub fn hash(client_id: u32, secret_share: BigUint) -> Contribution {
		Contribution {
			client_id,
			secret_share,
			payload: ContributionPayload::Hash,
		}
	}

	pub fn rsa(client_id: u32, secret_share: BigUint, material: RsaProofMaterial) -> Contribution {
		Contribution {
			client_id,
			secret_share,
			payload: ContributionPayload::Rsa(material),
		}
	}

	pub fn linear(client_id: u32, secret_share: BigUint) -> Contribution {
		Contribution {
			client_id,
			secret_share,
			payload: ContributionPayload::Linear,
		}
	}

	pub fn nonce(client_id: u32, secret_share: BigUint, nonce_share: BigUint) -> Contribution {
		Contribution {
			client_id,
			secret_share,
			payload: ContributionPayload::Nonce { nonce_share },
		}
	}

	pub fn kind(&self) -> ConstructionKind {
		match self.payload {
			ContributionPayload::Hash => ConstructionKind::Hash,
			ContributionPayload::Rsa(_) => ConstructionKind::Rsa,
			ContributionPayload::Linear => ConstructionKind::Linear,
			ContributionPayload::Nonce { .. } => ConstructionKind::Nonce,
		}
	}
}

/// Contributions collected so far for one key. Every contribution has the round's kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
	key: RoundKey,
	kind: ConstructionKind,
	threshold: usize,
	contributions: Vec<Contribution>,
}

impl Round {
	pub fn new(key: RoundKey, kind: ConstructionKind, threshold: usize) -> Round {
		Round {
			key,
			kind,
			threshold,
			contributions: Vec::new(),
		}
	}

	pub fn key(&self) -> RoundKey {
		self.key
	}

	pub fn kind(&self) -> ConstructionKind {
		self.kind
	}

	pub fn threshold(&self) -> usize {
		self.threshold
	}

	pub fn len(&self) -> usize {
		self.contributions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.contributions.is_empty()
	}

	pub fn is_complete(&self) -> bool {
		self.contributions.len() >= self.threshold
	}

	pub fn contributions(&self) -> &[Contribution] {
		&self.contributions
	}

	pub fn shares(&self) -> impl Iterator<Item = &BigUint> {
		self.contributions.iter().map(|c| &c.secret_share)
	}

	pub fn contains_client(&self, client_id: u32) -> bool {
		self.contributions.iter().any(|c| c.client_id == client_id)
	}

	pub(crate) fn push(&mut self, contribution: Contribution) {
		self.contributions.push(contribution);
	}
}

/// What to do with a second contribution from the same client in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
	#[default]
	Accept,
	Reject,
}

/// What to do with contributions for a key whose round was already dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
	#[default]
	NewRound,
	Drop,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
	pub default_threshold: usize,
	pub thresholds: HashMap<u32, usize>,
	pub duplicates: DuplicatePolicy,
	pub late: LatePolicy,
	/// Dispatched keys each shard remembers under `LatePolicy::Drop`.
	pub late_window: usize,
	pub shards: usize,
}

impl Default for BufferConfig {
	fn default() -> BufferConfig {
		BufferConfig {
			default_threshold: 2,
			thresholds: HashMap::new(),
			duplicates: DuplicatePolicy::default(),
			late: LatePolicy::default(),
			late_window: 4096,
			shards: 16,
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
	Accumulating { received: usize, threshold: usize },
	/// This contribution completed the round; it has left the buffer.
	Completed(Round),
	/// Late contribution for an already dispatched key.
	Dropped,
}

#[derive(Debug, Default)]
struct Shard {
	rounds: HashMap<RoundKey, Round>,
	dispatched: HashSet<RoundKey>,
	// oldest first
	dispatch_order: VecDeque<RoundKey>,
}

impl Shard {
	fn remember(&mut self, key: RoundKey, window: usize) {
		if self.dispatched.insert(key) {
			self.dispatch_order.push_back(key);
		}
		while self.dispatch_order.len() > window {
			if let Some(old) = self.dispatch_order.pop_front() {
				self.dispatched.remove(&old);
			}
		}
	}
}

/*
	In-flight rounds, split over independently locked shards.
	Everything that touches one key happens under that key's shard lock.
*/
#[derive(Debug)]
pub struct ShareBuffer {
	shards: Vec<Mutex<Shard>>,
	config: BufferConfig,
}

impl ShareBuffer {
	pub fn new(config: BufferConfig) -> ShareBuffer {
		let shards = (0..config.shards.max(1)).map(|_| Mutex::new(Shard::default())).collect();
		ShareBuffer { shards, config }
	}

	pub fn threshold(&self, substation_id: u32) -> usize {
		self.config
			.thresholds
			.get(&substation_id)
			.copied()
			.unwrap_or(self.config.default_threshold)
	}

	/// Adds a contribution without dispatching the round.
	pub fn put_contribution(&self, key: RoundKey, kind: ConstructionKind, contribution: Contribution) -> Result<Submission> {
		if contribution.kind() != kind {
			return Err(AggregationError::ProtocolMismatch {
				key,
				expected: kind,
				found: contribution.kind(),
			});
		}
		let mut shard = self.shard(&key)?;
		self.insert(&mut shard, key, kind, contribution)
	}

	pub fn is_complete(&self, key: RoundKey) -> bool {
		match self.shard(&key) {
			Ok(shard) => shard.rounds.get(&key).map_or(false, Round::is_complete),
			Err(_) => false,
		}
	}

	/// Removes a completed round. Fails for unknown, already extracted, or incomplete rounds.
	pub fn extract_completed(&self, key: RoundKey) -> Result<Round> {
		let mut shard = self.shard(&key)?;
		self.take_completed(&mut shard, key)
	}

	/// Insert, completeness check and extraction as one critical section.
	pub fn submit(&self, key: RoundKey, contribution: Contribution) -> Result<Submission> {
		let kind = contribution.kind();
		let mut shard = self.shard(&key)?;
		match self.insert(&mut shard, key, kind, contribution)? {
			Submission::Accumulating { received, threshold } if received >= threshold => {
				Ok(Submission::Completed(self.take_completed(&mut shard, key)?))
			}
			other => Ok(other),
		}
	}

	/// Number of rounds still accumulating.
	pub fn pending(&self) -> usize {
		self.shards
			.iter()
			.map(|s| match s.lock() {
				Ok(guard) => guard.rounds.len(),
				Err(poisoned) => poisoned.into_inner().rounds.len(),
			})
			.sum()
	}

	fn shard(&self, key: &RoundKey) -> Result<MutexGuard<'_, Shard>> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		let index = (hasher.finish() % self.shards.len() as u64) as usize;
		self.shards[index]
			.lock()
			.map_err(|_| AggregationError::MutexLockFail("share buffer shard"))
	}

	fn insert(&self, shard: &mut Shard, key: RoundKey, kind: ConstructionKind, contribution: Contribution) -> Result<Submission> {
		if shard.dispatched.contains(&key) {
			warn!("dropping late share from client {} for {}", contribution.client_id, key);
			return Ok(Submission::Dropped);
		}

		let threshold = self.threshold(key.substation_id);
		let round = shard
			.rounds
			.entry(key)
			.or_insert_with(|| Round::new(key, kind, threshold));

		if round.kind() != kind {
			return Err(AggregationError::ProtocolMismatch {
				key,
				expected: round.kind(),
				found: kind,
			});
		}
		if self.config.duplicates == DuplicatePolicy::Reject && round.contains_client(contribution.client_id) {
			return Err(AggregationError::DuplicateContribution {
				key,
				client_id: contribution.client_id,
			});
		}

		debug!("buffered share from client {} for {}", contribution.client_id, key);
		round.push(contribution);
		Ok(Submission::Accumulating {
			received: round.len(),
			threshold: round.threshold(),
		})
	}

	fn take_completed(&self, shard: &mut Shard, key: RoundKey) -> Result<Round> {
		match shard.rounds.get(&key) {
			Some(round) if round.is_complete() => {}
			_ => return Err(AggregationError::RoundNotFound(key)),
		}
		let round = shard.rounds.remove(&key).ok_or(AggregationError::RoundNotFound(key))?;
		if self.config.late == LatePolicy::Drop {
			shard.remember(key, self.config.late_window);
		}
		Ok(round)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn buffer(threshold: usize) -> ShareBuffer {
		ShareBuffer::new(BufferConfig {
			default_threshold: threshold,
			..BufferConfig::default()
		})
	}

	fn share(client: u32, value: u32) -> Contribution {
		Contribution::hash(client, BigUint::from(value))
	}

	#[test]
	fn completes_at_threshold() {
		let buf = buffer(3);
		let key = RoundKey::new(1, 1);
		for (i, v) in [4u32, 7].iter().enumerate() {
			buf.put_contribution(key, ConstructionKind::Hash, share(i as u32, *v)).unwrap();
			assert!(!buf.is_complete(key));
		}
		buf.put_contribution(key, ConstructionKind::Hash, share(2, 9)).unwrap();
		assert!(buf.is_complete(key));
		// above threshold stays complete
		buf.put_contribution(key, ConstructionKind::Hash, share(3, 1)).unwrap();
		assert!(buf.is_complete(key));
	}

	#[test]
	fn second_extraction_fails() {
		let buf = buffer(1);
		let key = RoundKey::new(1, 2);
		buf.put_contribution(key, ConstructionKind::Hash, share(0, 1)).unwrap();
		let round = buf.extract_completed(key).unwrap();
		assert_eq!(round.len(), 1);
		assert_eq!(buf.extract_completed(key), Err(AggregationError::RoundNotFound(key)));
	}

	#[test]
	fn incomplete_round_is_not_extracted() {
		let buf = buffer(2);
		let key = RoundKey::new(1, 3);
		buf.put_contribution(key, ConstructionKind::Hash, share(0, 1)).unwrap();
		assert_eq!(buf.extract_completed(key), Err(AggregationError::RoundNotFound(key)));
		assert_eq!(buf.pending(), 1);
	}

	#[test]
	fn kind_mismatch_is_rejected_without_corrupting_round() {
		let buf = buffer(2);
		let key = RoundKey::new(4, 1);
		buf.put_contribution(key, ConstructionKind::Hash, share(0, 1)).unwrap();
		let err = buf
			.put_contribution(key, ConstructionKind::Linear, Contribution::linear(1, BigUint::from(2u32)))
			.unwrap_err();
		assert_eq!(
			err,
			AggregationError::ProtocolMismatch {
				key,
				expected: ConstructionKind::Hash,
				found: ConstructionKind::Linear,
			}
		);
		assert!(!buf.is_complete(key));
		buf.put_contribution(key, ConstructionKind::Hash, share(1, 2)).unwrap();
		assert_eq!(buf.extract_completed(key).unwrap().len(), 2);
	}

	#[test]
	fn payload_must_match_declared_kind() {
		let buf = buffer(2);
		let key = RoundKey::new(4, 2);
		let err = buf.put_contribution(key, ConstructionKind::Nonce, share(0, 1)).unwrap_err();
		assert!(matches!(err, AggregationError::ProtocolMismatch { .. }));
		assert_eq!(buf.pending(), 0);
	}

	#[test]
	fn distinct_keys_do_not_interfere() {
		let buf = buffer(2);
		let a = RoundKey::new(1, 1);
		let b = RoundKey::new(1, 2);
		let c = RoundKey::new(2, 1);
		buf.put_contribution(a, ConstructionKind::Hash, share(0, 1)).unwrap();
		buf.put_contribution(b, ConstructionKind::Linear, Contribution::linear(0, BigUint::from(1u32))).unwrap();
		buf.put_contribution(c, ConstructionKind::Hash, share(0, 1)).unwrap();
		buf.put_contribution(a, ConstructionKind::Hash, share(1, 1)).unwrap();
		assert!(buf.is_complete(a));
		assert!(!buf.is_complete(b));
		assert!(!buf.is_complete(c));
		buf.extract_completed(a).unwrap();
		assert_eq!(buf.pending(), 2);
	}

	#[test]
	fn per_substation_threshold() {
		let mut thresholds = HashMap::new();
		thresholds.insert(9, 1);
		let buf = ShareBuffer::new(BufferConfig {
			default_threshold: 5,
			thresholds,
			..BufferConfig::default()
		});
		assert_eq!(buf.threshold(9), 1);
		assert_eq!(buf.threshold(1), 5);
		let key = RoundKey::new(9, 1);
		assert!(matches!(buf.submit(key, share(0, 3)).unwrap(), Submission::Completed(_)));
	}

	#[test]
	fn duplicates_rejected_when_configured() {
		let buf = ShareBuffer::new(BufferConfig {
			default_threshold: 3,
			duplicates: DuplicatePolicy::Reject,
			..BufferConfig::default()
		});
		let key = RoundKey::new(1, 1);
		buf.submit(key, share(5, 1)).unwrap();
		assert_eq!(
			buf.submit(key, share(5, 2)),
			Err(AggregationError::DuplicateContribution { key, client_id: 5 })
		);
	}

	#[test]
	fn duplicates_counted_by_default() {
		let buf = buffer(2);
		let key = RoundKey::new(1, 1);
		buf.submit(key, share(5, 1)).unwrap();
		assert!(matches!(buf.submit(key, share(5, 2)).unwrap(), Submission::Completed(_)));
	}

	#[test]
	fn late_share_starts_new_round_by_default() {
		let buf = buffer(1);
		let key = RoundKey::new(1, 1);
		assert!(matches!(buf.submit(key, share(0, 1)).unwrap(), Submission::Completed(_)));
		assert!(matches!(buf.submit(key, share(1, 1)).unwrap(), Submission::Completed(_)));
	}

	#[test]
	fn late_share_dropped_when_configured() {
		let buf = ShareBuffer::new(BufferConfig {
			default_threshold: 1,
			late: LatePolicy::Drop,
			..BufferConfig::default()
		});
		let key = RoundKey::new(1, 1);
		assert!(matches!(buf.submit(key, share(0, 1)).unwrap(), Submission::Completed(_)));
		assert_eq!(buf.submit(key, share(1, 1)).unwrap(), Submission::Dropped);
		assert_eq!(buf.pending(), 0);
	}

	#[test]
	fn dispatched_keys_are_forgotten_oldest_first() {
		let buf = ShareBuffer::new(BufferConfig {
			default_threshold: 1,
			late: LatePolicy::Drop,
			late_window: 2,
			shards: 1,
			..BufferConfig::default()
		});
		for round_id in 1..=3 {
			buf.submit(RoundKey::new(1, round_id), share(0, 1)).unwrap();
		}
		{
			let shard = buf.shards[0].lock().unwrap();
			assert_eq!(shard.dispatched.len(), 2);
			assert_eq!(shard.dispatch_order, VecDeque::from(vec![RoundKey::new(1, 2), RoundKey::new(1, 3)]));
		}
		assert_eq!(buf.submit(RoundKey::new(1, 3), share(1, 1)).unwrap(), Submission::Dropped);
		// round 1 fell out of the window, so it forms a new round
		assert!(matches!(
			buf.submit(RoundKey::new(1, 1), share(1, 1)).unwrap(),
			Submission::Completed(_)
		));
	}
}
