use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use log::{error, info};
use sentrycast::config::{Config, app_name, version};
use sentrycast::motion::{EventKind, Motion, watcher};
use sentrycast::pipeline::StageRegistry;
use std::path::PathBuf;
use std::{panic, process};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: <config dir>/sentrycast.json).")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("DESCRIPTION")
                .help("Capture element description heading the backbone."),
        )
        .arg(
            Arg::new("gap")
                .short('g')
                .long("gap")
                .value_name("SECONDS")
                .help("Seconds without movement before motion is over.")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .help("Directory for snapshots and recordings.")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("no-automation")
                .long("no-automation")
                .help("Only watch for motion, never capture.")
                .action(ArgAction::SetTrue),
        )
}

fn load_config(matches: &clap::ArgMatches) -> anyhow::Result<Config> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = Config::load(path.map(PathBuf::as_path)).context("loading configuration")?;

    if let Some(source) = matches.get_one::<String>("source") {
        config.source = source.clone();
    }
    if let Some(gap) = matches.get_one::<u64>("gap") {
        config.motion_gap = *gap;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("output-dir") {
        config.output_dir = dir.clone();
    }
    if matches.get_flag("no-automation") {
        config.automation = false;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    info!(
        "{} {}: source {:?}, output {}",
        app_name(),
        version(),
        config.source,
        config.output_dir.display()
    );

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // invoke the default handler and exit the process
        orig_hook(panic_info);
        process::exit(105);
    }));

    let (quit_tx, mut quit_rx) = mpsc::unbounded_channel::<&'static str>();

    // stop the pipeline in order on SIGINT, SIGTERM, or SIGHUP
    let tx = quit_tx.clone();
    ctrlc::set_handler(move || {
        let _ = tx.send("interrupted");
    })
    .context("setting Ctrl-C handler")?;

    let (motion, control) = Motion::spawn(config, StageRegistry::with_builtins());

    let tx = quit_tx.clone();
    motion.watch(
        EventKind::Eos,
        watcher(move |_| {
            let _ = tx.send("end of stream");
        }),
    );
    let tx = quit_tx;
    motion.watch(
        EventKind::Error,
        watcher(move |event| {
            error!("{:?}", event);
            let _ = tx.send("pipeline error");
        }),
    );

    motion.run().await.context("starting pipeline")?;

    let reason = quit_rx.recv().await.unwrap_or("control loop gone");
    info!("Shutting down: {}", reason);
    let status = motion.status().await.ok();

    motion.shutdown().ok();
    control.await.context("joining control loop")?;
    if let Some(status) = status {
        info!("{}, {} detaches", status.stats, status.detaches);
    }
    Ok(())
}
