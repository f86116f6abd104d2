use std::{
    error::Error,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bansuri::{
    cli::{Cli, parse_args},
    dashboard::{Dashboard, DashboardSettings},
    supervisor::{Supervisor, runner_map},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let runners = runner_map();
    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let _dashboard = if args.no_dashboard {
        None
    } else {
        let settings = DashboardSettings {
            port: args.port,
            username: args.username.clone(),
            password: args.password.clone(),
        };
        match Dashboard::spawn(Arc::clone(&runners), settings) {
            Ok(dashboard) => Some(dashboard),
            Err(err) => {
                warn!("Dashboard disabled: {err}");
                None
            }
        }
    };

    let supervisor = Supervisor::new(
        PathBuf::from(&args.config),
        Duration::from_secs(args.check_interval.max(1)),
        runners,
        shutdown,
    );
    supervisor.run();

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
