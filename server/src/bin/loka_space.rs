//! The space-server binary: parse config, wire the executors, run the main
//! loop until a signal asks for a graceful stop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};

use loka_server::net::NetCmd;
use loka_server::oh_transport::OhCmd;
use loka_server::{build, ServerConfig};

const TICK: Duration = Duration::from_millis(5);
const DRAIN_BUDGET: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut overrides: Vec<(String, String)> = Vec::new();
    for arg in args.by_ref() {
        if let Some(rest) = arg.strip_prefix("--") {
            match rest.split_once('=') {
                Some((key, value)) => overrides.push((key.to_string(), value.to_string())),
                None => {
                    eprintln!("expected --key=value, got `{arg}`");
                    return ExitCode::from(2);
                }
            }
        } else if config_path.is_none() {
            config_path = Some(PathBuf::from(arg));
        } else {
            eprintln!("unexpected argument `{arg}`");
            return ExitCode::from(2);
        }
    }

    let cfg = match config_path {
        Some(path) => match ServerConfig::load(&path, &overrides) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("configuration error: {e}");
                return ExitCode::from(2);
            }
        },
        None => {
            eprintln!("usage: loka-space <config-file> [--key=value ...]");
            return ExitCode::from(2);
        }
    };

    let mut runtime = match build(&cfg) {
        Ok(r) => r,
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("space server {} up", cfg.server_id);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            error!("cannot install signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut drain_deadline: Option<Instant> = None;
    loop {
        let now = Instant::now();
        if stop.load(Ordering::SeqCst) && !runtime.server.is_stopping() {
            runtime.server.stop();
            runtime.oh_cmds.post(OhCmd::StopAccepting);
            drain_deadline = Some(now + DRAIN_BUDGET);
        }
        runtime.server.tick(now);
        if runtime.server.is_stopping() {
            let deadline_passed = drain_deadline.map(|d| now >= d).unwrap_or(true);
            if runtime.server.drained() || deadline_passed {
                break;
            }
        }
        std::thread::sleep(TICK);
    }

    runtime.oh_cmds.post(OhCmd::Shutdown);
    runtime.net_cmds.post(NetCmd::Shutdown);
    runtime.counters.report();
    info!("space server {} stopped", cfg.server_id);
    ExitCode::SUCCESS
}
