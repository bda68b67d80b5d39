use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::buffer::{Contribution, RoundKey, ShareBuffer, Submission};
use crate::param::ParameterAuthority;
use crate::worker::{AggregationError, Job, Result, WorkerPool};

/// Where a contribution left its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
	Buffered { received: usize, threshold: usize },
	Dispatched,
	Dropped,
}

/* Acknowledgement text sent back to the client. */
impl fmt::Display for Receipt {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Receipt::Buffered { received, threshold } => write!(f, "OK {}/{}", received, threshold),
			Receipt::Dispatched => write!(f, "OK dispatched"),
			Receipt::Dropped => write!(f, "OK dropped"),
		}
	}
}

/*
	Accumulating -> Dispatched, once per round.
	The buffer hands out a completed round to exactly one caller,
	that caller snapshots the parameters and queues the round.
*/
pub struct RoundDispatcher {
	buffer: ShareBuffer,
	authority: Arc<dyn ParameterAuthority>,
	pool: WorkerPool,
}

impl RoundDispatcher {
	pub fn new(buffer: ShareBuffer, authority: Arc<dyn ParameterAuthority>, pool: WorkerPool) -> RoundDispatcher {
		RoundDispatcher {
			buffer,
			authority,
			pool,
		}
	}

	pub fn buffer(&self) -> &ShareBuffer {
		&self.buffer
	}

	pub fn authority(&self) -> &dyn ParameterAuthority {
		self.authority.as_ref()
	}

	pub fn receive(&self, key: RoundKey, contribution: Contribution) -> Result<Receipt> {
		debug!("received share from client {} for {} ({})", contribution.client_id, key, contribution.kind());
		let submission = match self.buffer.submit(key, contribution) {
			Ok(submission) => submission,
			Err(AggregationError::RoundNotFound(key)) => {
				error!("completed round {} vanished under its own lock", key);
				return Err(AggregationError::RoundNotFound(key));
			}
			Err(e) => return Err(e),
		};
		let round = match submission {
			Submission::Accumulating { received, threshold } => {
				return Ok(Receipt::Buffered { received, threshold })
			}
			Submission::Dropped => return Ok(Receipt::Dropped),
			Submission::Completed(round) => round,
		};

		let ctx = match self.authority.snapshot(key.substation_id) {
			Ok(ctx) => ctx,
			Err(e) => {
				error!("dropping completed round {}: {}", key, e);
				return Err(e);
			}
		};
		info!("=== dispatching {} with {} shares ===", key, round.len());
		self.pool.submit(Job { round, ctx })?;
		Ok(Receipt::Dispatched)
	}

	/// Waits for dispatched rounds to be computed and delivered.
	pub fn shutdown(self) {
		let pending = self.buffer.pending();
		if pending > 0 {
			info!("shutting down with {} incomplete rounds", pending);
		}
		self.pool.shutdown();
	}
}
