//! LaserRoom station controller: main entry point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (outer ring)                     │
//! │  JsonFileConfig   LogEventSink + StatsSink   stdin console   │
//! │  (ConfigPort)     (EventSink fan-out)        (AppCommand)    │
//! │                                                              │
//! │  ─────────────── Port Trait Boundary ─────────────────       │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Machine: StepperAxis · FireControl · OutputBank       │  │
//! │  │           SequenceEngine · InputMonitor                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                          │                                   │
//! │        DeviceLink: CoprocessorLink | SimulatedLink           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands are read from stdin as one JSON object per line and each
//! reply is printed as one JSON line on stdout.  End of input shuts the
//! machine down.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, select, unbounded};
use log::{error, info, warn};

use laserroom::adapters::channel_sink::{FanoutSink, StatsSink, load_totals};
use laserroom::adapters::log_sink::LogEventSink;
use laserroom::adapters::store::JsonFileConfig;
use laserroom::app::commands::AppCommand;
use laserroom::app::ports::{ConfigPort, EventSink};
use laserroom::app::Machine;
use laserroom::config::{BackendKind, LinkConfig, MachineConfig};
use laserroom::link::{self, DeviceLink};
use laserroom::sequence::Sequence;

/// LaserRoom hardware orchestration core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration store (JSON key-value file)
    #[arg(default_value = "laserroom.json")]
    config: PathBuf,

    /// run against the simulated device link
    #[arg(short, long)]
    simulate: bool,

    /// fail instead of falling back to simulation
    #[arg(long, conflicts_with = "simulate")]
    force_hardware: bool,

    /// coprocessor serial port
    #[arg(short, long)]
    port: Option<String>,

    /// sequence file to load and start after boot
    #[arg(short, long)]
    run: Option<PathBuf>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(logfile) = &args.logfile {
        let file = std::fs::File::create(logfile)
            .with_context(|| format!("creating log file {}", logfile.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[cfg(feature = "hardware")]
fn open_hardware(
    cfg: &MachineConfig,
    link_cfg: &LinkConfig,
) -> laserroom::error::Result<Arc<dyn DeviceLink>> {
    use std::time::Duration;

    use laserroom::adapters::gpio_cdev::GpioBank;
    use laserroom::adapters::serial_port::SerialTransport;
    use laserroom::link::CoprocessorLink;

    let transport = SerialTransport::open(&link_cfg.serial_port, link_cfg.baud_rate)?;
    let mut coprocessor = CoprocessorLink::new(
        Box::new(transport),
        Duration::from_millis(link_cfg.reply_timeout_ms),
        Duration::from_millis(link_cfg.move_timeout_ms),
    );

    let o = &cfg.outputs;
    let i = &cfg.inputs;
    let outputs = [o.fan_pin, o.red_lights_pin, o.table_forward_pin, o.table_backward_pin];
    let inputs = [
        o.table_front_switch_pin,
        o.table_back_switch_pin,
        i.button_in_pin,
        i.button_out_pin,
        i.fire_button_pin,
        i.invert_switch_pin,
    ];
    match GpioBank::open(&link_cfg.gpio_chip, &outputs, &inputs) {
        Ok(bank) => coprocessor = coprocessor.with_pin_bank(Box::new(bank)),
        Err(e) => warn!("Local GPIO unavailable ({e}), all pins go to the coprocessor"),
    }

    coprocessor.probe(cfg.axis.axis_id)?;
    Ok(Arc::new(coprocessor))
}

#[cfg(not(feature = "hardware"))]
fn open_hardware(
    _cfg: &MachineConfig,
    _link_cfg: &LinkConfig,
) -> laserroom::error::Result<Arc<dyn DeviceLink>> {
    Err(laserroom::error::Error::LinkUnavailable(
        "built without the `hardware` feature".into(),
    ))
}

fn load_sequence(path: &Path) -> Result<Sequence> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading sequence file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing sequence file {}", path.display()))
}

/// Forward stdin lines as commands; signal `done` at end of input.
fn spawn_console(commands: crossbeam_channel::Sender<AppCommand>) -> Result<Receiver<()>> {
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AppCommand>(line) {
                    Ok(cmd) => {
                        if commands.send(cmd).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        println!("{}", serde_json::json!({ "error": format!("bad command: {e}") }));
                    }
                }
            }
            let _ = done_tx.send(());
        })
        .context("spawning console thread")?;
    Ok(done_rx)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    info!("LaserRoom controller v{}", env!("CARGO_PKG_VERSION"));

    // ── Configuration ─────────────────────────────────────────
    let store: Arc<dyn ConfigPort> = Arc::new(
        JsonFileConfig::open(&args.config)
            .with_context(|| format!("opening config store {}", args.config.display()))?,
    );
    let mut cfg = MachineConfig::load(store.as_ref())
        .context("loading machine configuration")?;
    if args.simulate {
        cfg.link.backend = BackendKind::Simulated;
    }
    if args.force_hardware {
        cfg.link.force_hardware = true;
    }
    if let Some(port) = &args.port {
        cfg.link.serial_port.clone_from(port);
    }

    // ── Device link ───────────────────────────────────────────
    let link = link::connect(&cfg.link, |link_cfg| open_hardware(&cfg, link_cfg))
        .context("connecting to the machine hardware")?;
    if link.is_simulated() {
        warn!("Running on the SIMULATED device link");
    }

    // ── Machine ───────────────────────────────────────────────
    let sink: Arc<dyn EventSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(LogEventSink::new()))
            .with(Arc::new(StatsSink::new(Arc::clone(&store)))),
    );
    let machine = Machine::new(link, cfg, sink).context("initialising the machine")?;
    let (count, total_ms) = load_totals(store.as_ref());
    machine.fire().seed_stats(count, total_ms);
    info!("Fire statistics: {count} firings, {} s total", total_ms / 1000);

    let (cmd_tx, cmd_rx) = unbounded();
    machine
        .start_monitors(cmd_tx.clone())
        .context("starting monitors")?;
    let done = spawn_console(cmd_tx.clone())?;

    if let Some(path) = &args.run {
        let sequence = load_sequence(path)?;
        info!("Queueing sequence '{}' from {}", sequence.name, path.display());
        cmd_tx.send(AppCommand::LoadSequence { sequence })?;
        cmd_tx.send(AppCommand::StartSequence)?;
    }
    drop(cmd_tx);

    // ── Command loop ──────────────────────────────────────────
    loop {
        select! {
            recv(cmd_rx) -> cmd => {
                let Ok(cmd) = cmd else { break };
                let reply = match machine.handle_command(cmd) {
                    Ok(reply) => serde_json::to_value(&reply)?,
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                };
                println!("{reply}");
            }
            recv(done) -> _ => {
                info!("Console closed");
                break;
            }
        }
    }

    if let Err(e) = machine.shutdown() {
        error!("Shutdown incomplete: {e}");
    }
    info!("Bye");
    Ok(())
}
