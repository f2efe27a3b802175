use std::{
    io::BufRead,
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
};

use sunxi_gpu_governor::{
    Governor, ThermalInput,
    config::Config,
    control::{ControlSurface, Endpoint},
    error::GovernorError,
    sysfs,
};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("Commands (one per line):");
    println!("  <endpoint>            read manual|android|tempctrl|scenectrl|voltage");
    println!("  <endpoint> <value>    write to an endpoint");
    println!("  cool <mhz|none>       frequency cap from an external cooling governor");
    println!("  suspend | resume      early suspend / late resume");
    println!("  status                json snapshot");
    println!("  quit");
}

/// One line of the control transport. Returns `false` once asked to stop.
fn handle_command(surface: &ControlSurface, line: &str) -> bool {
    let governor = surface.governor();
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let argument = words.next();

    let result: Result<(), GovernorError> = match (command, argument) {
        ("quit" | "exit", _) => return false,
        ("help", _) => {
            print_usage();
            Ok(())
        }
        ("status", _) => {
            match serde_json::to_string_pretty(&governor.status()) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("status: {e}"),
            }
            Ok(())
        }
        ("suspend", _) => governor.suspend().map(|t| println!("{t:?}")),
        ("resume", _) => governor.resume().map(|t| println!("{t:?}")),
        ("cool", Some(arg)) => {
            let cap = match arg {
                "none" => Ok(None),
                arg => arg.parse::<i64>().map(Some),
            };
            match cap {
                Ok(cap) => governor
                    .thermal_update(ThermalInput::ExternalCap(cap))
                    .map(|t| println!("{t:?}")),
                Err(e) => {
                    eprintln!("cool: {e}");
                    Ok(())
                }
            }
        }
        (endpoint, value) => match endpoint.parse::<Endpoint>() {
            Ok(endpoint) => match value {
                None => {
                    print!("{}", surface.read(endpoint));
                    Ok(())
                }
                Some(value) => surface.write(endpoint, value).map(|t| {
                    if let Some(t) = t {
                        println!("{t:?}");
                    }
                }),
            },
            Err(_) => {
                eprintln!("unknown command {command:?}, try help");
                Ok(())
            }
        },
    };
    if let Err(e) = result {
        eprintln!("{command}: {e}");
    }
    true
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    tracing::info!("loading {}", config_path.display());
    let config = Config::load(&config_path)?;

    let (rail, sensor) = sysfs::open(&config)?;
    let governor = Arc::new(Governor::new(config.settings(), rail, sensor)?);
    let surface = ControlSurface::new(Arc::clone(&governor));

    {
        let governor = Arc::clone(&governor);
        ctrlc::set_handler(move || {
            tracing::info!("stopping, gating gpu clocks");
            if let Err(e) = governor.shutdown() {
                tracing::error!("{e}");
            }
            std::process::exit(0);
        })?;
    }

    if config.capabilities.thermal_table && governor.sensor_id().is_some() {
        let initial = governor.temperature().unwrap_or_default();
        let (send, mut recv) = watch::channel(initial);

        let sampler = Arc::clone(&governor);
        let interval = config.sample_interval;
        let _jh_sample: JoinHandle<()> = std::thread::spawn(move || {
            loop {
                match sampler.temperature() {
                    Ok(temperature) => {
                        send.send(temperature);
                    }
                    Err(e) => tracing::error!("{e}"),
                }
                std::thread::sleep(interval);
            }
        });

        let notified = Arc::clone(&governor);
        let _jh_notify: JoinHandle<()> = std::thread::spawn(move || {
            loop {
                let temperature = recv.wait();
                match notified.thermal_update(ThermalInput::Temperature(temperature)) {
                    Ok(transition) => tracing::debug!("{temperature}: {transition:?}"),
                    Err(e) => tracing::error!("thermal update at {temperature}: {e}"),
                }
            }
        });
        tracing::info!(
            "thermal sampling every {} ms",
            config.sample_interval.as_millis()
        );
    }

    print_usage();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if !handle_command(&surface, line.trim()) {
            break;
        }
    }

    governor.shutdown()?;
    Ok(())
}
