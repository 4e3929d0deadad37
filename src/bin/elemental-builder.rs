use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use elemental_builder::build::Builder;
use elemental_builder::cancel::CancelToken;
use elemental_builder::config::{
    self, manager::Manager, ConfigDir, Definition, MediaType, OutputDir,
};
use elemental_builder::customize::{CustomizeRunner, ISO_SEARCH_GLOB};
use elemental_builder::deployment::{self, Deployment, SnapshotterKind, Source};
use elemental_builder::helm::ValuesResolver;
use elemental_builder::http::HttpDownloader;
use elemental_builder::install::Installer;
use elemental_builder::manifest::extractor::SkopeoUnpacker;
use elemental_builder::manifest::resolver::MANIFEST_GLOB;
use elemental_builder::manifest::{OciFileExtractor, Resolver};
use elemental_builder::process::{HostRunner, SharedRunner};

fn usage() -> &'static str {
    "Usage:\n  \
     elemental-builder build <config-dir> <build-dir> [--output <image>] [--local]\n  \
     elemental-builder customize <config-dir> <output-dir> <iso|raw> [--output <image>] [--local]\n  \
     elemental-builder install --description <file> [--local]\n  \
     elemental-builder reset [--description <file>] [--overlay <uri>] [--config <script>] \
     [--snapshotter <snapper|overwrite>] [--enable-fips]"
}

fn main() -> ExitCode {
    init_logging();
    let cancel = CancelToken::new();
    register_signal_handlers(&cancel);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();

    let outcome = match args_ref.as_slice() {
        ["build", rest @ ..] => run_build(rest, &cancel),
        ["customize", rest @ ..] => run_customize(rest, &cancel),
        ["install", rest @ ..] => run_install(rest, &cancel),
        ["reset", rest @ ..] => run_reset(rest, &cancel),
        _ => {
            eprintln!("{}", usage());
            return ExitCode::from(1);
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if format!("{err}").starts_with("usage:") => {
            eprintln!("{err}\n\n{}", usage());
            ExitCode::from(1)
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("elemental_builder=info,elemental_builder::process=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: i32) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

fn register_signal_handlers(cancel: &CancelToken) {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGINT, &action);
        let _ = signal::sigaction(Signal::SIGTERM, &action);
    }

    let cancel = cancel.clone();
    std::thread::spawn(move || loop {
        if SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            tracing::warn!("termination signal received, cancelling");
            cancel.cancel();
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string())
        .replace(':', "-")
}

struct CommonFlags {
    output: Option<PathBuf>,
    local: bool,
}

fn parse_flags(rest: &[&str]) -> Result<CommonFlags> {
    let mut flags = CommonFlags {
        output: None,
        local: false,
    };
    let mut it = rest.iter();
    while let Some(flag) = it.next() {
        match *flag {
            "--output" => {
                let value = it.next().context("usage: --output requires a value")?;
                flags.output = Some(PathBuf::from(value));
            }
            "--local" => flags.local = true,
            other => bail!("usage: unrecognized flag '{other}'"),
        }
    }
    Ok(flags)
}

fn host_runner() -> SharedRunner {
    Arc::new(HostRunner)
}

fn setup_manager(
    runner: &SharedRunner,
    cancel: &CancelToken,
    config_dir: &ConfigDir,
    output: &OutputDir,
    local: bool,
) -> Result<Manager> {
    let extractor = OciFileExtractor::new(
        vec![MANIFEST_GLOB.to_string()],
        output.release_manifests_store_dir(),
        Box::new(SkopeoUnpacker::new(runner.clone(), local)),
        cancel.clone(),
    )
    .context("setting up the release manifest extractor")?;

    let helm = elemental_builder::config::kubernetes::Helm::new(
        output.clone(),
        ValuesResolver {
            values_dir: config_dir.helm_values_dir(),
        },
    );

    Ok(Manager::new(
        Box::new(Resolver::new(extractor)),
        Box::new(HttpDownloader::new()?),
        Some(Box::new(helm)),
        Box::new(elemental_builder::config::ignition::BinaryTranslator::new(
            runner.clone(),
        )),
        cancel.clone(),
    ))
}

fn run_build(rest: &[&str], cancel: &CancelToken) -> Result<()> {
    let [config_dir, build_dir, rest @ ..] = rest else {
        bail!("usage: build requires <config-dir> and <build-dir>");
    };
    let flags = parse_flags(rest)?;
    let runner = host_runner();

    tracing::info!("Reading image configuration");
    let config_dir = ConfigDir::new(*config_dir);
    let configuration = config::parse(&config_dir)
        .with_context(|| format!("parsing configuration directory {}", config_dir.0.display()))?;

    let output = config::create_output_dir(Path::new(build_dir), &format!("build-{}", timestamp()))
        .context("creating build directory")?;

    let image = flags
        .output
        .unwrap_or_else(|| Path::new(build_dir).join(format!("image-{}.raw", timestamp())));
    let definition = Definition {
        media_type: MediaType::Raw,
        output_image_name: image,
        configuration,
    };
    elemental_builder::build::validate_definition(&definition)?;

    let manager = setup_manager(&runner, cancel, &config_dir, &output, flags.local)?;
    let builder = Builder::new(runner, cancel.clone(), Box::new(manager), flags.local);

    tracing::info!("Starting build process");
    builder.run(&definition, &output)?;
    tracing::info!("Build process complete");
    Ok(())
}

fn run_customize(rest: &[&str], cancel: &CancelToken) -> Result<()> {
    let [config_dir, out_dir, media_type, rest @ ..] = rest else {
        bail!("usage: customize requires <config-dir>, <output-dir> and <iso|raw>");
    };
    let flags = parse_flags(rest)?;
    let runner = host_runner();

    tracing::info!("Customizing image");
    let media_type = MediaType::parse(media_type)
        .map_err(|e| anyhow::anyhow!("usage: {e}"))?;
    let config_dir = ConfigDir::new(*config_dir);
    let configuration = config::parse(&config_dir)
        .with_context(|| format!("parsing configuration directory {}", config_dir.0.display()))?;

    let output =
        config::create_output_dir(Path::new(out_dir), &format!("customize-{}", timestamp()))
            .context("creating customize directory")?;

    let extension = match media_type {
        MediaType::Iso => "iso",
        MediaType::Raw => "raw",
    };
    let image = flags
        .output
        .unwrap_or_else(|| Path::new(out_dir).join(format!("image-{}.{extension}", timestamp())));

    let definition = Definition {
        media_type,
        output_image_name: image,
        configuration,
    };

    let manager = setup_manager(&runner, cancel, &config_dir, &output, flags.local)?;
    let iso_extractor = OciFileExtractor::new(
        vec![ISO_SEARCH_GLOB.to_string()],
        output.iso_store_dir(),
        Box::new(SkopeoUnpacker::new(runner.clone(), flags.local)),
        cancel.clone(),
    )
    .context("setting up the installer media extractor")?;

    let customize = CustomizeRunner {
        runner,
        cancel: cancel.clone(),
        config_manager: Box::new(manager),
        extractor: Box::new(iso_extractor),
    };
    customize.run(&definition, &output)?;
    tracing::info!("Customization complete");
    Ok(())
}

fn parse_description_flag(rest: &[&str]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut description = None;
    let mut remaining = Vec::new();
    let mut it = rest.iter();
    while let Some(flag) = it.next() {
        if *flag == "--description" {
            let value = it.next().context("usage: --description requires a value")?;
            description = Some(PathBuf::from(value));
        } else {
            remaining.push(flag.to_string());
        }
    }
    Ok((description, remaining))
}

fn run_install(rest: &[&str], cancel: &CancelToken) -> Result<()> {
    let (description, remaining) = parse_description_flag(rest)?;
    let local = remaining.iter().any(|f| f == "--local");
    let description = description.context("usage: install requires --description <file>")?;

    let mut d = Deployment::parse_file(&description)?;
    d.sanitize().context("inconsistent deployment setup found")?;

    let installer = Installer::new(host_runner(), cancel.clone()).with_local(local);
    installer.install(&mut d)?;
    tracing::info!("Installation complete");
    Ok(())
}

fn run_reset(rest: &[&str], cancel: &CancelToken) -> Result<()> {
    let (description, remaining) = parse_description_flag(rest)?;
    let runner = host_runner();

    let description =
        description.unwrap_or_else(|| PathBuf::from("/etc/elemental/deployment.yaml"));
    let mut d = Deployment::parse_file(&description)?;

    let mut it = remaining.iter();
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "--overlay" => {
                let value = it.next().context("usage: --overlay requires a value")?;
                let overlay = Source::from_uri(value)
                    .with_context(|| format!("parsing overlay source URI ('{value}')"))?;
                d.overlay_tree = Some(overlay);
            }
            "--config" => {
                let value = it.next().context("usage: --config requires a value")?;
                d.cfg_script = value.clone();
            }
            "--snapshotter" => {
                let value = it.next().context("usage: --snapshotter requires a value")?;
                d.snapshotter.name = match value.as_str() {
                    "snapper" => SnapshotterKind::Snapper,
                    "overwrite" => SnapshotterKind::Overwrite,
                    other => bail!("usage: unknown snapshotter '{other}'"),
                };
            }
            "--enable-fips" => {
                d.security.crypto_policy = deployment::CryptoPolicy::Fips;
            }
            other => bail!("usage: unrecognized flag '{other}'"),
        }
    }

    d.sanitize().context("inconsistent deployment setup found")?;

    tracing::info!("Checked configuration, running reset process");
    let installer = Installer::new(runner, cancel.clone());
    installer.reset(&mut d)?;
    tracing::info!("Reset complete");
    Ok(())
}
