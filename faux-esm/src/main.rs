// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use eses_fup::attributes::field_replaceable_attributes;
use eses_fup::attributes::lcc_attributes;
use eses_fup::attributes::AttributeStore;
use eses_fup::attributes::ComponentType;
use eses_fup::attributes::FwRevision;
use eses_fup::attributes::InMemoryAttributeStore;
use eses_fup::notify::LogNotifier;
use eses_fup::sim::Fault;
use eses_fup::sim::FaultSource;
use eses_fup::sim::SimTransport;
use eses_fup::sim::SimulatedPeer;
use eses_fup::transport::TunnelOpcode;
use eses_fup::EnclosureFup;
use eses_fup::EnclosureLocation;
use eses_fup::FupDriver;
use eses_fup::FupOutcome;
use eses_fup::FupTarget;
use eses_fup::FwTargetKind;
use eses_fup::TunnelFupConfig;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use rand::rngs::StdRng;
use rand::Rng;
use rand::RngCore;
use rand::SeedableRng;
use serde_json::json;
use slog::debug;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use strum::IntoEnumIterator;

/// Number of image bytes dumped at debug level before a download.
const IMAGE_HEAD_LEN: usize = 32;

/// Command line program that runs tunneled firmware upgrades against a
/// simulated peer enclosure.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Emit parseable JSON on stdout instead of "human-readable" data.
    #[clap(long, value_names = ["pretty"], value_parser = json_pretty_from_str)]
    json: Option<Option<JsonPretty>>,

    /// JSON file of upgrade tunables; absent fields take their defaults.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(flatten)]
    overrides: ConfigOverrides,

    #[clap(subcommand)]
    command: Command,
}

/// Tunables that may be overridden on the command line.
#[derive(clap::Args, Debug)]
struct ConfigOverrides {
    /// Consecutive failures of one tunneled command before the peer is reset.
    #[clap(long)]
    max_failure_retries: Option<u32>,

    /// Consecutive busy responses to one tunneled command before the peer is
    /// reset.
    #[clap(long)]
    max_busy_retries: Option<u32>,

    /// Largest image chunk sent per download control page.
    #[clap(long)]
    max_chunk_size: Option<u32>,

    /// Time after which a tunneled command is presumed hung (e.g. "10s").
    #[clap(long)]
    tunnel_cmd_time_limit: Option<humantime::Duration>,

    /// Time a peer LCC takes to come back from a power cycle.
    #[clap(long)]
    lcc_reset_time: Option<humantime::Duration>,

    /// Interval between revision checks while activating.
    #[clap(long)]
    check_rev_poll_time: Option<humantime::Duration>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut TunnelFupConfig) {
        if let Some(n) = self.max_failure_retries {
            config.max_failure_retry_count = n;
        }
        if let Some(n) = self.max_busy_retries {
            config.max_busy_retry_count = n;
        }
        if let Some(n) = self.max_chunk_size {
            config.max_chunk_size = n;
        }
        if let Some(t) = self.tunnel_cmd_time_limit {
            config.tunnel_cmd_time_limit = t.into();
        }
        if let Some(t) = self.lcc_reset_time {
            config.lcc_reset_time = t.into();
        }
        if let Some(t) = self.check_rev_poll_time {
            config.check_rev_poll_time = t.into();
        }
    }
}

/// The config file (or defaults) with command line overrides applied.
fn load_config(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<TunnelFupConfig> {
    let mut config = match path {
        Some(path) => TunnelFupConfig::from_path(path)?,
        None => TunnelFupConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("invalid command line overrides")?;
    Ok(config)
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonPretty;

fn json_pretty_from_str(s: &str) -> Result<JsonPretty> {
    if s == "pretty" {
        Ok(JsonPretty)
    } else {
        bail!("expected \"pretty\"")
    }
}

fn target_kind_from_str(s: &str) -> Result<FwTargetKind> {
    FwTargetKind::iter()
        .find(|kind| <&'static str>::from(*kind) == s)
        .ok_or_else(|| {
            let names = FwTargetKind::iter()
                .map(<&'static str>::from)
                .collect::<Vec<_>>()
                .join(",");
            anyhow!("invalid target kind {s:?} (expected one of {{{names}}})")
        })
}

fn fault_rate_from_str(s: &str) -> Result<f64> {
    let rate: f64 =
        s.parse().with_context(|| format!("invalid fault rate {s:?}"))?;
    if !(0.0..=1.0).contains(&rate) {
        bail!("fault rate must be between 0 and 1");
    }
    Ok(rate)
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print the effective upgrade tunables.
    ShowConfig,

    /// Download an image to a component on the peer side of the enclosure.
    Download {
        #[clap(flatten)]
        target: TargetArgs,
        #[clap(flatten)]
        source: ImageArgs,
        #[clap(flatten)]
        sim: SimArgs,
    },

    /// Download an image to a component, then activate it.
    Update {
        #[clap(flatten)]
        target: TargetArgs,
        #[clap(flatten)]
        source: ImageArgs,
        #[clap(flatten)]
        sim: SimArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct TargetArgs {
    /// Kind of component to upgrade.
    #[clap(value_parser = target_kind_from_str)]
    kind: FwTargetKind,

    /// Side of the enclosure the component sits on. Side 0 is local and
    /// cannot be upgraded through the tunnel.
    #[clap(long, default_value_t = 1)]
    side: u8,
}

#[derive(clap::Args, Debug, Clone)]
struct ImageArgs {
    /// Path to the firmware image.
    #[clap(
        long,
        required_unless_present = "random_image",
        conflicts_with = "random_image"
    )]
    image: Option<PathBuf>,

    /// Generate a random image of this many bytes instead of reading one.
    #[clap(long)]
    random_image: Option<u32>,
}

#[derive(clap::Args, Debug, Clone)]
struct SimArgs {
    /// Seed for random images and fault injection.
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Probability that the simulated peer mishandles any one command.
    #[clap(long, default_value_t = 0.0, value_parser = fault_rate_from_str)]
    fault_rate: f64,

    /// Status polls answered with "processing" before each tunneled result.
    #[clap(long, default_value_t = 1)]
    processing_polls: u32,

    /// Download status reads an activation stays in progress.
    #[clap(long, default_value_t = 2)]
    activation_polls: u32,

    /// Revision reported by components once activated.
    #[clap(long, default_value = "2.00")]
    new_revision: String,
}

enum Output {
    Json(serde_json::Value),
    Lines(Vec<String>),
}

fn build_logger(
    level: Level,
    path: Option<&Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path).with_context(|| {
            format!("failed to create logfile {}", path.display())
        })?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "faux-esm")), guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    let config = load_config(args.config.as_deref(), &args.overrides)?;

    let json = args.json.is_some();
    let result = run_command(&log, config, args.command, json).await;

    // Flush any logs before writing our results.
    drop(log_guard);

    let mut did_fail = false;
    let output = match result {
        Ok(output) => output,
        Err(err) => {
            did_fail = true;
            if json {
                Output::Json(json!({ "error": format!("{err:#}") }))
            } else {
                Output::Lines(vec![format!("Error: {err:#}")])
            }
        }
    };

    match (output, args.json) {
        (Output::Json(value), Some(Some(JsonPretty))) => {
            serde_json::to_writer_pretty(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        (Output::Json(value), _) => {
            serde_json::to_writer(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        (Output::Lines(lines), _) => {
            for line in lines {
                println!("{line}");
            }
        }
    }

    if did_fail {
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(
    log: &Logger,
    config: TunnelFupConfig,
    command: Command,
    json: bool,
) -> Result<Output> {
    match command {
        Command::ShowConfig => {
            if json {
                Ok(Output::Json(serde_json::to_value(config)?))
            } else {
                Ok(Output::Lines(vec![format!("{config:#?}")]))
            }
        }
        Command::Download { target, source, sim } => {
            let target = FupTarget { kind: target.kind, side: target.side };
            let SimBench { driver, mut rng, .. } =
                SimBench::new(log, config, &sim);
            let image = load_image(log, &source, &mut rng)?;
            let (_, outcome) =
                download(log, driver, target, image, json).await?;
            if !outcome.is_success() {
                bail!("download failed: {}", describe(&outcome));
            }
            if json {
                Ok(Output::Json(serde_json::to_value(outcome)?))
            } else {
                Ok(Output::Lines(vec![describe(&outcome)]))
            }
        }
        Command::Update { target, source, sim } => {
            let target = FupTarget { kind: target.kind, side: target.side };
            let SimBench { driver, attributes, mut rng } =
                SimBench::new(log, config, &sim);
            let image = load_image(log, &source, &mut rng)?;
            let (mut driver, downloaded) =
                download(log, driver, target, image, json).await?;
            if !downloaded.is_success() {
                bail!("download failed: {}", describe(&downloaded));
            }

            let id = driver
                .start_activate(target)
                .context("failed to start activation")?;
            info!(log, "activating"; "target" => %target, "id" => %id);
            let activated = driver
                .run_to_completion()
                .await
                .context("activation driver failed")?;
            if !activated.is_success() {
                bail!("activation failed: {}", describe(&activated));
            }

            let revision = target_revision(&attributes, target)?;
            if json {
                Ok(Output::Json(json!({
                    "download": downloaded,
                    "activate": activated,
                    "revision": revision.to_string(),
                })))
            } else {
                Ok(Output::Lines(vec![
                    describe(&downloaded),
                    describe(&activated),
                    format!("{target} now at revision {revision}"),
                ]))
            }
        }
    }
}

/// A two-sided enclosure whose peer side is simulated.
struct SimBench {
    driver: FupDriver,
    attributes: Arc<InMemoryAttributeStore>,
    rng: StdRng,
}

impl SimBench {
    fn new(
        log: &Logger,
        config: TunnelFupConfig,
        sim: &SimArgs,
    ) -> Self {
        let attributes = Arc::new(enclosure_attributes());
        let mut rng = StdRng::seed_from_u64(sim.seed);

        let mut peer = SimulatedPeer::new(
            log,
            Arc::clone(&attributes),
            FwRevision::from_str_lossy(&sim.new_revision),
        )
        .with_processing_polls(sim.processing_polls)
        .with_activation_polls(sim.activation_polls);
        if sim.fault_rate > 0.0 {
            let fault_rng = StdRng::seed_from_u64(rng.next_u64());
            peer = peer
                .with_fault_source(random_faults(fault_rng, sim.fault_rate));
        }

        let (transport, completions) =
            SimTransport::new(Arc::new(Mutex::new(peer)));
        let enclosure = EnclosureFup::new(
            log,
            config,
            EnclosureLocation { bus: 0, enclosure: 0 },
            Box::new(transport),
            attributes.clone(),
            Box::new(LogNotifier::new(log)),
        );
        let driver = FupDriver::new(log, enclosure, completions);
        Self { driver, attributes, rng }
    }
}

fn target_revision(
    attributes: &InMemoryAttributeStore,
    target: FupTarget,
) -> Result<FwRevision> {
    let component = target.kind.component_type();
    let index = attributes
        .index_for_side(component, target.side)
        .with_context(|| {
            format!("no {component:?} on side {}", target.side)
        })?;
    attributes
        .get_revision(component, index)
        .context("failed to read revision")
}

/// Local LCC on side 0, peer LCC on side 1, and one of every other upgradable
/// component on each side.
fn enclosure_attributes() -> InMemoryAttributeStore {
    let store = InMemoryAttributeStore::new();
    let rev = FwRevision::from_str_lossy("1.00");
    store.add_component(ComponentType::Lcc, lcc_attributes(0, true, rev));
    store.add_component(ComponentType::Lcc, lcc_attributes(1, false, rev));
    for component in [
        ComponentType::PowerSupply,
        ComponentType::Cooling,
        ComponentType::Sps,
    ] {
        for side in 0..2 {
            store.add_component(
                component,
                field_replaceable_attributes(side, rev),
            );
        }
    }
    store
}

/// Faults the driver is expected to recover from, drawn independently for
/// each command.
fn random_faults(mut rng: StdRng, rate: f64) -> FaultSource {
    Box::new(move |opcode| {
        if !rng.gen_bool(rate) {
            return None;
        }
        let choices: &[Fault] = match opcode {
            TunnelOpcode::GetTunnelCommandStatus => &[
                Fault::Busy,
                Fault::Failed,
                Fault::StalePage,
                Fault::TunneledCmdFailed,
            ],
            _ => &[Fault::Busy, Fault::Failed],
        };
        Some(choices[rng.gen_range(0..choices.len())])
    })
}

fn load_image(
    log: &Logger,
    args: &ImageArgs,
    rng: &mut StdRng,
) -> Result<Vec<u8>> {
    let image = match (&args.image, args.random_image) {
        (Some(path), _) => std::fs::read(path).with_context(|| {
            format!("failed to read {}", path.display())
        })?,
        (None, Some(size)) => {
            let mut image = vec![0; size as usize];
            rng.fill_bytes(&mut image);
            image
        }
        (None, None) => bail!("one of --image or --random-image is required"),
    };
    let head = &image[..image.len().min(IMAGE_HEAD_LEN)];
    debug!(
        log, "loaded image";
        "len" => image.len(),
        "head" => hex::encode(head),
    );
    Ok(image)
}

/// Run a download on its own task, following its progress. The driver is
/// handed back for any operation that follows.
async fn download(
    log: &Logger,
    mut driver: FupDriver,
    target: FupTarget,
    image: Vec<u8>,
    quiet: bool,
) -> Result<(FupDriver, FupOutcome)> {
    let id = driver
        .start_download(target, image)
        .context("failed to start download")?;
    info!(log, "downloading"; "target" => %target, "id" => %id);

    let mut progress = driver.progress();
    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        let style = ProgressStyle::default_bar()
            .template(
                "[{elapsed_precise}] {bar:40.cyan/blue} \
                 {bytes:>9}/{total_bytes:9} {msg}",
            )
            .context("invalid progress template")?
            .progress_chars("#>.");
        let bar = ProgressBar::new(u64::from(progress.borrow().image_size));
        bar.set_style(style);
        bar
    };
    bar.set_message(target.to_string());

    let mut task = driver.spawn();
    let (driver, result) = loop {
        tokio::select! {
            joined = &mut task => {
                break joined.context("download driver task died")?;
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break (&mut task)
                        .await
                        .context("download driver task died")?;
                }
                let p = *progress.borrow_and_update();
                bar.set_length(u64::from(p.image_size));
                bar.set_position(u64::from(p.bytes_transferred));
            }
        }
    };

    let outcome = result.context("download driver failed")?;
    bar.set_position(u64::from(outcome.bytes_transferred));
    bar.finish_with_message(format!("{target}: {}", status_str(&outcome)));
    Ok((driver, outcome))
}

fn status_str(outcome: &FupOutcome) -> &'static str {
    if outcome.is_success() {
        "success"
    } else {
        outcome.status.into()
    }
}

fn describe(outcome: &FupOutcome) -> String {
    let target = outcome
        .target
        .map_or_else(|| "no target".to_string(), |t| t.to_string());
    let operation: &'static str = outcome.operation.into();
    format!(
        "{operation} of {target}: {} ({}/{} bytes, {:?})",
        status_str(outcome),
        outcome.bytes_transferred,
        outcome.image_size,
        outcome.additional_status,
    )
}
