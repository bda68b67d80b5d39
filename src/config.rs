use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use num::BigUint;
use serde::Deserialize;

use crate::buffer::{BufferConfig, DuplicatePolicy, LatePolicy};
use crate::param::{StaticParameters, SubstationParams};
use crate::sockets::decimal;
use crate::worker::{AggregationError, Result};

#[derive(Debug, Parser)]
#[command(name = "aggregation-server", about = "Secure aggregation server node")]
pub struct Args {
	/// JSON configuration file
	#[arg(short, long)]
	pub config: PathBuf,
	/// Ingress port (overrides the file)
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Verifier address, e.g. tcp://localhost:3000
	#[arg(long)]
	pub verifier: Option<String>,
	/// Compute workers (overrides the file)
	#[arg(long)]
	pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubstationConfig {
	pub id: u32,
	#[serde(with = "decimal")]
	pub modulus: BigUint,
	#[serde(with = "decimal")]
	pub generator: BigUint,
	#[serde(default)]
	pub threshold: Option<usize>,
}

fn default_port() -> u16 {
	8888
}

fn default_verifier() -> String {
	"tcp://localhost:3000".to_string()
}

fn default_workers() -> usize {
	8
}

fn default_ingress_workers() -> usize {
	32
}

fn default_timeout_ms() -> u64 {
	3000
}

fn default_threshold() -> usize {
	2
}

fn default_shards() -> usize {
	16
}

fn default_late_window() -> usize {
	4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub server_id: u32,
	#[serde(default)]
	pub servers: Vec<u32>,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default = "default_verifier")]
	pub verifier: String,
	#[serde(default = "default_workers")]
	pub workers: usize,
	#[serde(default = "default_ingress_workers")]
	pub ingress_workers: usize,
	#[serde(default = "default_timeout_ms")]
	pub delivery_timeout_ms: u64,
	#[serde(default = "default_threshold")]
	pub default_threshold: usize,
	#[serde(default = "default_shards")]
	pub shards: usize,
	#[serde(default)]
	pub duplicates: DuplicatePolicy,
	#[serde(default)]
	pub late: LatePolicy,
	#[serde(default = "default_late_window")]
	pub late_window: usize,
	#[serde(default)]
	pub substations: Vec<SubstationConfig>,
}

impl ServerConfig {
	pub fn from_json(text: &str) -> Result<ServerConfig> {
		let config: ServerConfig = serde_json::from_str(text).map_err(|e| AggregationError::Config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<ServerConfig> {
		let text = fs::read_to_string(path)
			.map_err(|e| AggregationError::Config(format!("{}: {}", path.display(), e)))?;
		ServerConfig::from_json(&text)
	}

	pub fn apply(&mut self, args: &Args) {
		if let Some(port) = args.port {
			self.port = port;
		}
		if let Some(verifier) = &args.verifier {
			self.verifier = verifier.clone();
		}
		if let Some(workers) = args.workers {
			self.workers = workers;
		}
	}

	fn validate(&self) -> Result<()> {
		if self.default_threshold == 0 {
			return Err(AggregationError::Config("default_threshold must be positive".to_string()));
		}
		for s in &self.substations {
			if s.threshold == Some(0) {
				return Err(AggregationError::Config(format!("substation {} has zero threshold", s.id)));
			}
			if s.modulus <= BigUint::from(2u32) {
				return Err(AggregationError::Config(format!("substation {} modulus too small", s.id)));
			}
		}
		Ok(())
	}

	pub fn delivery_timeout(&self) -> Duration {
		Duration::from_millis(self.delivery_timeout_ms)
	}

	pub fn buffer_config(&self) -> BufferConfig {
		BufferConfig {
			default_threshold: self.default_threshold,
			thresholds: self
				.substations
				.iter()
				.filter_map(|s| s.threshold.map(|t| (s.id, t)))
				.collect(),
			duplicates: self.duplicates,
			late: self.late,
			late_window: self.late_window,
			shards: self.shards,
		}
	}

	pub fn parameters(&self) -> StaticParameters {
		let substations: HashMap<u32, SubstationParams> = self
			.substations
			.iter()
			.map(|s| {
				(
					s.id,
					SubstationParams {
						modulus: s.modulus.clone(),
						generator: s.generator.clone(),
					},
				)
			})
			.collect();
		StaticParameters::new(substations, self.server_id, self.servers.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::param::ParameterAuthority;

	const CONFIG: &str = r#"{
		"server_id": 2,
		"servers": [1, 2, 3],
		"late": "drop",
		"substations": [
			{ "id": 1, "modulus": "23", "generator": "5", "threshold": 3 },
			{ "id": 2, "modulus": "3073700804129980417", "generator": "5" }
		]
	}"#;

	#[test]
	fn defaults_and_overrides() {
		let mut config = ServerConfig::from_json(CONFIG).unwrap();
		assert_eq!(config.port, 8888);
		assert_eq!(config.delivery_timeout(), Duration::from_millis(3000));
		assert_eq!(config.late, LatePolicy::Drop);
		assert_eq!(config.duplicates, DuplicatePolicy::Accept);
		assert_eq!(config.buffer_config().late_window, 4096);

		let args = Args::parse_from(["aggregation-server", "--config", "x.json", "--port", "9000", "--workers", "2"]);
		config.apply(&args);
		assert_eq!(config.port, 9000);
		assert_eq!(config.workers, 2);
		assert_eq!(config.verifier, "tcp://localhost:3000");
	}

	#[test]
	fn thresholds_and_parameters() {
		let config = ServerConfig::from_json(CONFIG).unwrap();
		let buffer = config.buffer_config();
		assert_eq!(buffer.thresholds.get(&1), Some(&3));
		assert_eq!(buffer.thresholds.get(&2), None);
		assert_eq!(buffer.default_threshold, 2);

		let params = config.parameters();
		assert_eq!(params.server_id(), 2);
		assert_eq!(params.field_modulus(2).unwrap(), BigUint::from(3073700804129980417u64));
	}

	#[test]
	fn example_file_parses() {
		let config = ServerConfig::from_json(include_str!("../server.example.json")).unwrap();
		assert_eq!(config.substations.len(), 2);
		assert_eq!(config.buffer_config().thresholds.get(&2), Some(&2));
	}

	#[test]
	fn rejects_zero_threshold() {
		let text = r#"{ "server_id": 1, "substations": [{ "id": 1, "modulus": "23", "generator": "5", "threshold": 0 }] }"#;
		assert!(matches!(ServerConfig::from_json(text), Err(AggregationError::Config(_))));
	}
}
