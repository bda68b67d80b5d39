//! One server node of a multi-server secure aggregation protocol.
//!
//! Clients split metering values into additive shares and send one share to
//! every server. This crate buffers the shares of each (substation, round),
//! and once a round has enough contributors computes this server's partial
//! result and partial proof under one of four constructions and pushes them
//! to the verifier. Each round is computed and delivered at most once.

pub mod buffer;
pub mod config;
pub mod construction;
pub mod dispatcher;
pub mod hash;
pub mod param;
pub mod rsa;
pub mod sockets;
pub mod worker;

pub use buffer::{BufferConfig, Contribution, ContributionPayload, DuplicatePolicy, LatePolicy, Round, RoundKey, ShareBuffer, Submission};
pub use construction::{ConstructionKind, PartialProof, PartialResult};
pub use dispatcher::{Receipt, RoundDispatcher};
pub use hash::ClosingMethod;
pub use param::{FieldContext, ParameterAuthority, StaticParameters, SubstationParams};
pub use rsa::{RsaPartialProof, RsaProofMaterial};
pub use sockets::{Delivery, ZmqDelivery};
pub use worker::{AggregationError, Job, Result, WorkerPool};
