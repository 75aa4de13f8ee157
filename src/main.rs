//! Bootstraps a local cluster: one node per `--ports` entry, all wired into
//! a full mesh, running until interrupted.

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use log::{error, info};

use raftkv::supervisor::ClusterSupervisor;

fn parse_ports(args: &[String]) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--ports" => {
                i += 1;
                if i >= args.len() {
                    return Err("--ports requires at least one port number".to_string());
                }
                while i < args.len() && !args[i].starts_with("--") {
                    let port: u16 = args[i].parse().map_err(|_| format!("'{}' is not a valid port", args[i]))?;
                    ports.push(port);
                    i += 1;
                }
            }
            other => return Err(format!("unrecognized argument '{other}'")),
        }
    }
    if ports.is_empty() {
        return Err("usage: raftkv --ports <port> [<port> ...]".to_string());
    }
    Ok(ports)
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let ports = match parse_ports(&args) {
        Ok(ports) => ports,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("starting network with ports: {ports:?}");
    let supervisor = ClusterSupervisor::new("127.0.0.1");
    if let Err(e) = supervisor.bootstrap(&ports) {
        error!("failed to bootstrap cluster: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown_supervisor = supervisor.clone();
    let result = ctrlc::set_handler(move || {
        info!("stopping network...");
        shutdown_supervisor.stop_all();
        info!("all nodes stopped.");
        std::process::exit(0);
    });
    if let Err(e) = result {
        error!("failed to install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
