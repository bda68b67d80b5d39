use std::io::{self, BufRead};
use std::process;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aggregation_server::config::{Args, ServerConfig};
use aggregation_server::sockets::{parse_contribution, recv, route_name, take_id};
use aggregation_server::{AggregationError, ParameterAuthority, Receipt, RoundDispatcher, ShareBuffer, WorkerPool, ZmqDelivery};

const BACKEND: &str = "inproc://backend";

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_target(false)
		.init();

	let args = Args::parse();
	let mut config = match ServerConfig::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			error!("{}", e);
			process::exit(1);
		}
	};
	config.apply(&args);

	info!("server {} listening on port {}, verifier {}", config.server_id, config.port, config.verifier);
	info!(
		"{} compute workers, {} ingress workers, default threshold {}",
		config.workers, config.ingress_workers, config.default_threshold
	);

	let context = zmq::Context::new();
	let delivery = Arc::new(ZmqDelivery::new(context.clone(), &config.verifier));
	let pool = WorkerPool::new(config.workers, delivery, config.delivery_timeout());
	let authority: Arc<dyn ParameterAuthority> = Arc::new(config.parameters());
	let dispatcher = Arc::new(RoundDispatcher::new(
		ShareBuffer::new(config.buffer_config()),
		authority.clone(),
		pool,
	));

	// Server Thread
	/*
		ROUTER frontend for clients, DEALER backend for ingress workers.
	*/
	let frontend = match bind(&context, zmq::ROUTER, &format!("tcp://*:{}", config.port)) {
		Ok(socket) => socket,
		Err(e) => {
			error!("cannot bind port {}: {}", config.port, e);
			process::exit(1);
		}
	};
	let backend = match bind(&context, zmq::DEALER, BACKEND) {
		Ok(socket) => socket,
		Err(e) => {
			error!("cannot bind {}: {}", BACKEND, e);
			process::exit(1);
		}
	};
	let server_thread = thread::spawn(move || {
		if let Err(e) = zmq::proxy(&frontend, &backend) {
			error!("proxy stopped: {}", e);
		}
	});

	// Worker Threads
	/*
		One message + one reply per loop.
	*/
	let mut ingress_pool = Vec::new();
	for i in 0..config.ingress_workers.max(1) {
		let id = format!("Ingress{}", i);
		let socket = match connect(&context, &id) {
			Ok(socket) => socket,
			Err(e) => {
				error!("{} cannot connect to {}: {}", id, BACKEND, e);
				process::exit(1);
			}
		};
		let dispatcher = dispatcher.clone();
		ingress_pool.push(thread::spawn(move || ingress_task(&id, &socket, &dispatcher)));
	}

	// Console Thread
	thread::spawn(move || console_task(authority.as_ref()));

	for handle in ingress_pool {
		if handle.join().is_err() {
			error!("ingress worker panicked");
		}
	}
	if server_thread.join().is_err() {
		error!("server thread panicked");
	}
	match Arc::try_unwrap(dispatcher) {
		Ok(dispatcher) => dispatcher.shutdown(),
		Err(_) => warn!("dispatcher still shared, abandoning in-flight rounds"),
	}
	info!("Application shut down.");
}

fn bind(context: &zmq::Context, kind: zmq::SocketType, endpoint: &str) -> Result<zmq::Socket, zmq::Error> {
	let socket = context.socket(kind)?;
	socket.bind(endpoint)?;
	Ok(socket)
}

fn connect(context: &zmq::Context, id: &str) -> Result<zmq::Socket, zmq::Error> {
	let socket = context.socket(zmq::DEALER)?;
	socket.set_identity(id.as_bytes())?;
	socket.connect(BACKEND)?;
	Ok(socket)
}

fn ingress_task(id: &str, socket: &zmq::Socket, dispatcher: &RoundDispatcher) {
	loop {
		let identity = match take_id(socket) {
			Ok(identity) => identity,
			Err(e) => {
				error!("{} stopped: {}", id, e);
				return;
			}
		};
		let mut frames = match recv(socket) {
			Ok(frames) => frames,
			Err(e) => {
				error!("{} stopped: {}", id, e);
				return;
			}
		};

		// REQ clients put an empty delimiter in front of the body.
		let delimited = frames.first().map_or(false, |f| f.is_empty());
		if delimited {
			frames.remove(0);
		}

		let reply = match handle(dispatcher, &frames) {
			Ok(receipt) => receipt.to_string(),
			Err(e) => {
				warn!("{} rejected message: {}", id, e);
				format!("Error: {}", e)
			}
		};

		let sent = socket
			.send(identity.as_slice(), zmq::SNDMORE)
			.and_then(|_| if delimited { socket.send("", zmq::SNDMORE) } else { Ok(()) })
			.and_then(|_| socket.send(reply.as_str(), 0));
		if let Err(e) = sent {
			warn!("{} could not acknowledge: {}", id, e);
		}
	}
}

fn handle(dispatcher: &RoundDispatcher, frames: &[Vec<u8>]) -> Result<Receipt, AggregationError> {
	if frames.len() != 2 {
		return Err(AggregationError::Malformed(format!(
			"expected [route, body], got {} frames",
			frames.len()
		)));
	}
	let route = route_name(&frames[0])?;
	let (key, contribution) = parse_contribution(route, &frames[1])?;
	dispatcher.receive(key, contribution)
}

fn console_task(authority: &dyn ParameterAuthority) {
	println!("Enter r to re-register server, [l]ist servers");
	let stdin = io::stdin();
	for line in stdin.lock().lines() {
		let line = match line {
			Ok(line) => line,
			Err(_) => return,
		};
		match line.trim() {
			"r" => match authority.re_register() {
				Ok(id) => info!("now registered as server {}", id),
				Err(e) => error!("re-registration failed: {}", e),
			},
			"l" => info!("servers: {:?}", authority.list_servers()),
			"" => {}
			other => println!("unknown command {:?}; enter r or l", other),
		}
	}
}
