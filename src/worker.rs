use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::buffer::{Round, RoundKey};
use crate::construction::{ConstructionKind, PartialResult};
use crate::param::FieldContext;
use crate::sockets::Delivery;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregationError {
	#[error("round {key} is {expected} but contribution is {found}")]
	ProtocolMismatch {
		key: RoundKey,
		expected: ConstructionKind,
		found: ConstructionKind,
	},
	#[error("round {0} is not buffered")]
	RoundNotFound(RoundKey),
	#[error("field modulus is not prime, no totient")]
	NotPrimeModulus,
	#[error("generator has no inverse modulo the field modulus")]
	NoInverse,
	#[error("delivery to {0} timed out")]
	DeliveryTimeout(String),
	#[error("delivery to {endpoint} failed: {reason}")]
	DeliveryFailure { endpoint: String, reason: String },
	#[error("no parameters registered for substation {0}")]
	UnknownSubstation(u32),
	#[error("client {client_id} already contributed to round {key}")]
	DuplicateContribution { key: RoundKey, client_id: u32 },
	#[error("invalid RSA proof material from client {client_id}: {reason}")]
	InvalidProofMaterial { client_id: u32, reason: String },
	#[error("mutex lock failed: {0}")]
	MutexLockFail(&'static str),
	#[error("worker queue closed")]
	QueueClosed,
	#[error("configuration error: {0}")]
	Config(String),
	#[error("malformed message: {0}")]
	Malformed(String),
}

pub type Result<T> = std::result::Result<T, AggregationError>;

/// A completed round together with the parameters it must be computed with.
#[derive(Debug)]
pub struct Job {
	pub round: Round,
	pub ctx: FieldContext,
}

/// Computes a round's partial and hands it to the verifier.
pub fn process_round(job: &Job, delivery: &dyn Delivery, timeout: Duration) -> Result<PartialResult> {
	let kind = job.round.kind();
	let partial = kind.compute(&job.round, &job.ctx)?;
	delivery.send(kind.endpoint(), &partial, timeout)?;
	Ok(partial)
}

/*
	Fixed set of threads draining one job queue.
	Queueing never blocks the contribution path.
*/
pub struct WorkerPool {
	sender: Option<mpsc::Sender<Job>>,
	workers: Vec<Worker>,
}

struct Worker {
	id: String,
	handle: JoinHandle<()>,
}

impl WorkerPool {
	pub fn new(size: usize, delivery: Arc<dyn Delivery>, timeout: Duration) -> WorkerPool {
		let (sender, receiver) = mpsc::channel::<Job>();
		let receiver = Arc::new(Mutex::new(receiver));

		let mut workers = Vec::with_capacity(size.max(1));
		for i in 0..size.max(1) {
			let id = format!("Worker{}", i);
			let receiver = receiver.clone();
			let delivery = delivery.clone();
			let name = id.clone();
			let handle = thread::spawn(move || worker_task(&name, receiver, delivery, timeout));
			workers.push(Worker { id, handle });
		}

		WorkerPool {
			sender: Some(sender),
			workers,
		}
	}

	pub fn submit(&self, job: Job) -> Result<()> {
		match &self.sender {
			Some(sender) => sender.send(job).map_err(|_| AggregationError::QueueClosed),
			None => Err(AggregationError::QueueClosed),
		}
	}

	/// Stops accepting jobs and waits for queued ones to finish.
	pub fn shutdown(mut self) {
		self.sender.take();
		for worker in self.workers.drain(..) {
			if worker.handle.join().is_err() {
				error!("{} panicked", worker.id);
			}
		}
	}
}

fn worker_task(id: &str, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, delivery: Arc<dyn Delivery>, timeout: Duration) {
	loop {
		let job = match receiver.lock() {
			Ok(guard) => guard.recv(),
			Err(_) => {
				error!("{} lost the job queue", id);
				return;
			}
		};
		let job = match job {
			Ok(job) => job,
			Err(_) => {
				debug!("{} shutting down", id);
				return;
			}
		};

		let key = job.round.key();
		info!("{} computing partial for {} ({})", id, key, job.round.kind());
		match process_round(&job, delivery.as_ref(), timeout) {
			Ok(partial) => info!(
				"{} sent partial for {} as server {}",
				id, key, partial.server_id
			),
			// Abandoned: the verifier sees a missing partial for this round.
			Err(e) => error!("{} abandoned round {}: {}", id, key, e),
		}
	}
}
