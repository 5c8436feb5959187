mod cli;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};

use mf_av::ToolRegistry;
use mf_core::config::Config;
use mf_core::paths::format_duration;
use mf_pipeline::{InputSource, JobSpec, JobState, OutputOptions};
use mf_server::context::AppContext;
use mf_server::routes::jobs::SourceKind;

/// Load the config file (or defaults) and apply environment overrides.
fn load_config(path: Option<&Path>) -> Config {
    let mut config = Config::load_or_default(path);
    config.apply_env();
    config
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "mediaforge=trace,mf_core=debug,mf_av=trace,mf_pipeline=trace,mf_server=debug,tower_http=debug"
                .to_string()
        } else {
            "mediaforge=info,mf_av=info,mf_pipeline=info,mf_server=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            tracing::info!(
                "Server will listen on {}:{}",
                config.server.host,
                config.server.port
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(mf_server::start(config))?;
            Ok(())
        }
        Commands::Convert {
            source,
            page,
            direct,
            container,
            codec,
            max_height,
            crf,
            checksum,
            output_dir,
        } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(dir) = output_dir {
                config.workspace.output_root = dir;
            }
            let kind = if page {
                Some(SourceKind::Page)
            } else if direct {
                Some(SourceKind::Url)
            } else {
                None
            };
            let output = OutputOptions {
                container,
                codec,
                max_height,
                crf,
                rename: None,
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(convert(config, &source, kind, output, checksum))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("mediaforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Run one job through a private single-worker scheduler and wait for it.
///
/// Ctrl+C cancels the job; the process exits once its workspace is gone.
async fn convert(
    mut config: Config,
    source: &str,
    kind: Option<SourceKind>,
    output: OutputOptions,
    checksum: Option<String>,
) -> Result<()> {
    let input = match kind.unwrap_or_else(|| SourceKind::infer(source)) {
        SourceKind::Url => InputSource::Url(source.to_string()),
        SourceKind::Page => InputSource::Page(source.to_string()),
        SourceKind::Upload => {
            // A local file is read through the uploads root, like an upload.
            let (root, name) = split_local_file(Path::new(source))?;
            config.workspace.uploads_root = Some(root);
            InputSource::Upload(name)
        }
    };
    config.scheduler.max_concurrent_jobs = 1;
    config.scheduler.queue_capacity = config.scheduler.queue_capacity.max(1);
    std::fs::create_dir_all(&config.workspace.output_root).with_context(|| {
        format!(
            "cannot create output directory {}",
            config.workspace.output_root.display()
        )
    })?;

    let ctx = AppContext::from_config(config)?;
    let spec = JobSpec {
        input,
        output,
        checksum: checksum.map(|c| c.to_ascii_lowercase()),
    };
    let job_id = ctx.scheduler.submit(spec)?;
    println!("Job {job_id} queued");

    let snapshot = tokio::select! {
        result = ctx.scheduler.wait(job_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling...");
            ctx.scheduler.cancel(job_id)?;
            ctx.scheduler.wait(job_id).await?
        }
    };
    ctx.scheduler.shutdown().await;

    let elapsed = match (snapshot.started_at, snapshot.finished_at) {
        (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
        _ => 0,
    };

    match snapshot.state {
        JobState::Succeeded => {
            let took = if elapsed == 0 {
                "under a second".to_string()
            } else {
                format_duration(elapsed)
            };
            println!("Conversion complete in {took}");
            if let Some(path) = snapshot.output {
                println!("Output: {}", path.display());
            }
            if let Some(media) = snapshot.media {
                if let Some(title) = media.title {
                    println!("Title: {title}");
                }
                if let Some(secs) = media.duration_secs {
                    println!("Duration: {}", format_duration(secs));
                }
            }
            Ok(())
        }
        JobState::Cancelled => anyhow::bail!("Job {job_id} was cancelled"),
        _ => {
            let detail = snapshot
                .failure
                .map(|f| format!("{}: {}", f.kind, f.detail))
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!("Job {job_id} failed ({detail})")
        }
    }
}

/// Split a local file into (canonical parent directory, file name).
fn split_local_file(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("input file does not exist: {}", path.display()))?;
    if !canonical.is_file() {
        anyhow::bail!("input is not a regular file: {}", path.display());
    }
    let parent = canonical
        .parent()
        .context("input file has no parent directory")?
        .to_path_buf();
    let name = canonical
        .file_name()
        .context("input file has no name")?
        .into();
    Ok((parent, name))
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = load_config(config_path);
    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable all features.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            let config = Config::from_json(&contents)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!(
        "  Workers: {} (queue capacity {})",
        config.scheduler.max_concurrent_jobs, config.scheduler.queue_capacity
    );
    println!(
        "  Output: {} {} (max {}p, crf {})",
        config.conversion.container,
        config.conversion.codec,
        config.conversion.max_height,
        config.conversion.crf
    );
    println!("  Temp root: {}", config.workspace.temp_root.display());
    println!("  Output root: {}", config.workspace.output_root.display());

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}
