use std::collections::HashMap;
use std::sync::RwLock;

use num::BigUint;
use tracing::info;

use crate::worker::{AggregationError, Result};

/// Per-substation group parameters, read once when a round is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldContext {
	pub modulus: BigUint,
	pub generator: BigUint,
	pub server_id: u32,
	/// Registered servers, the `n` in the RSA share exponent.
	pub server_count: usize,
}

impl FieldContext {
	pub fn new(modulus: BigUint, generator: BigUint, server_id: u32) -> FieldContext {
		FieldContext {
			modulus,
			generator,
			server_id,
			server_count: 1,
		}
	}

	pub fn with_servers(mut self, server_count: usize) -> FieldContext {
		self.server_count = server_count;
		self
	}
}

/// The parameter authority that owns field parameters and server registration.
pub trait ParameterAuthority: Send + Sync {
	fn field_modulus(&self, substation_id: u32) -> Result<BigUint>;
	fn generator(&self, substation_id: u32) -> Result<BigUint>;
	fn server_id(&self) -> u32;
	fn re_register(&self) -> Result<u32>;
	fn list_servers(&self) -> Vec<u32>;

	/// Consistent view of one substation's parameters for a single computation.
	fn snapshot(&self, substation_id: u32) -> Result<FieldContext> {
		Ok(FieldContext {
			modulus: self.field_modulus(substation_id)?,
			generator: self.generator(substation_id)?,
			server_id: self.server_id(),
			server_count: self.list_servers().len(),
		})
	}
}

#[derive(Debug, Clone)]
pub struct SubstationParams {
	pub modulus: BigUint,
	pub generator: BigUint,
}

#[derive(Debug)]
struct Registration {
	server_id: u32,
	servers: Vec<u32>,
}

/// In-process authority backed by configured parameters.
#[derive(Debug)]
pub struct StaticParameters {
	substations: HashMap<u32, SubstationParams>,
	registration: RwLock<Registration>,
}

impl StaticParameters {
	pub fn new(substations: HashMap<u32, SubstationParams>, server_id: u32, servers: Vec<u32>) -> StaticParameters {
		let mut servers = servers;
		if !servers.contains(&server_id) {
			servers.push(server_id);
		}
		servers.sort_unstable();
		StaticParameters {
			substations,
			registration: RwLock::new(Registration { server_id, servers }),
		}
	}

	fn params(&self, substation_id: u32) -> Result<&SubstationParams> {
		self.substations
			.get(&substation_id)
			.ok_or(AggregationError::UnknownSubstation(substation_id))
	}
}

impl ParameterAuthority for StaticParameters {
	fn field_modulus(&self, substation_id: u32) -> Result<BigUint> {
		Ok(self.params(substation_id)?.modulus.clone())
	}

	fn generator(&self, substation_id: u32) -> Result<BigUint> {
		Ok(self.params(substation_id)?.generator.clone())
	}

	fn server_id(&self) -> u32 {
		match self.registration.read() {
			Ok(guard) => guard.server_id,
			Err(poisoned) => poisoned.into_inner().server_id,
		}
	}

	fn re_register(&self) -> Result<u32> {
		let mut guard = self
			.registration
			.write()
			.map_err(|_| AggregationError::MutexLockFail("registration"))?;
		let old = guard.server_id;
		let new = guard.servers.iter().copied().max().unwrap_or(0) + 1;
		guard.servers.retain(|id| *id != old);
		guard.servers.push(new);
		guard.server_id = new;
		info!("re-registered server {} as {}", old, new);
		Ok(new)
	}

	fn list_servers(&self) -> Vec<u32> {
		match self.registration.read() {
			Ok(guard) => guard.servers.clone(),
			Err(poisoned) => poisoned.into_inner().servers.clone(),
		}
	}
}
