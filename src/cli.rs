use crate::{
    install_prometheus_recorder, serve, AppState, CaptureOptions, CaptureOrchestrator, CaptureKind,
    CaptureRequestBody, CaptureResponse, CaptureResult, Config, Viewport, WaitCondition,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "capture-service")]
#[command(about = "Sandboxed terminal and web page capture service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Output base directory")]
    pub output: Option<PathBuf>,

    #[arg(long = "allow-domain", global = true, help = "Add a domain to the capture allowlist")]
    pub allow_domains: Vec<String>,

    #[arg(long = "allow-command", global = true, help = "Add a command prefix to the allowlist")]
    pub allow_commands: Vec<String>,

    #[arg(long, global = true, help = "Disable the Chrome sandbox (containers only)")]
    pub no_sandbox: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the capture API over HTTP
    Serve {
        #[arg(short, long, default_value = "8080", help = "Server port")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1", help = "Bind address")]
        bind: String,

        #[arg(long, help = "Do not install the Prometheus recorder")]
        no_metrics: bool,
    },

    /// Capture a web page
    Web {
        #[arg(short, long, help = "Output name")]
        name: String,

        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(long, help = "Output version (default from config)")]
        version: Option<String>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,

        #[arg(long, help = "CSS selector of the element to capture")]
        selector: Option<String>,

        #[arg(long, help = "Milliseconds to wait, or a CSS selector to wait for")]
        wait_for: Option<String>,
    },

    /// Run an allow-listed command and capture its terminal output
    Cli {
        #[arg(short, long, help = "Output name")]
        name: String,

        #[arg(long, help = "Output version (default from config)")]
        version: Option<String>,

        #[arg(long, help = "Terminal theme (dark, light)")]
        theme: Option<String>,

        #[arg(long, help = "Hide the prompt line")]
        no_prompt: bool,

        #[arg(long, help = "Prompt text shown before the command")]
        prompt_text: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, help = "Command line to run")]
        command: Vec<String>,
    },

    /// Validate a configuration file
    Validate {
        #[arg(help = "Configuration file to validate")]
        file: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub async fn new(args: &Cli) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => load_config(path).await?,
            None => Config::default(),
        };
        apply_overrides(&mut config, args);
        config.validate()?;

        info!(
            domains = config.network.allowed_domains.len(),
            commands = config.command.allowed_prefixes.len(),
            output = %config.output.base_path.display(),
            "Configuration loaded"
        );
        Ok(Self { config })
    }

    pub async fn run<F>(&self, command: Commands, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match command {
            Commands::Serve { port, bind, no_metrics } => self.run_server(&bind, port, !no_metrics, shutdown).await,
            Commands::Web {
                name,
                url,
                version,
                width,
                height,
                full_page,
                selector,
                wait_for,
            } => {
                let viewport = if width.is_some() || height.is_some() {
                    Some(Viewport {
                        width: width.unwrap_or(self.config.browser.viewport.width),
                        height: height.unwrap_or(self.config.browser.viewport.height),
                    })
                } else {
                    None
                };
                let body = CaptureRequestBody {
                    name: Some(name),
                    url: Some(url),
                    version,
                    config: Some(CaptureOptions {
                        kind: Some(CaptureKind::Web),
                        viewport,
                        selector,
                        full_page: Some(full_page),
                        wait_for: wait_for.as_deref().map(parse_wait_condition),
                        ..Default::default()
                    }),
                };
                self.run_once(body).await
            }
            Commands::Cli {
                name,
                version,
                theme,
                no_prompt,
                prompt_text,
                command,
            } => {
                let body = CaptureRequestBody {
                    name: Some(name),
                    url: None,
                    version,
                    config: Some(CaptureOptions {
                        kind: Some(CaptureKind::Cli),
                        command: Some(command.join(" ")),
                        theme,
                        show_prompt: Some(!no_prompt),
                        prompt_text,
                        ..Default::default()
                    }),
                };
                self.run_once(body).await
            }
            Commands::Validate { file } => self.validate_config(&file).await,
        }
    }

    pub async fn run_server<F>(&self, bind: &str, port: u16, metrics: bool, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The recorder has to exist before the orchestrator registers its handles
        let prometheus = if metrics {
            Some(install_prometheus_recorder()?)
        } else {
            None
        };

        let orchestrator = Arc::new(CaptureOrchestrator::new(self.config.clone())?);
        orchestrator.start_housekeeping();

        let addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .with_context(|| format!("invalid bind address {bind}:{port}"))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        if self.config.network.allowed_domains.is_empty() {
            warn!("No allowed domains configured, every web capture will be rejected");
        }
        if self.config.command.allowed_prefixes.is_empty() {
            warn!("No allowed command prefixes configured, every cli capture will be rejected");
        }

        serve(listener, Arc::new(AppState { orchestrator, prometheus }), shutdown).await?;
        Ok(())
    }

    async fn run_once(&self, body: CaptureRequestBody) -> anyhow::Result<()> {
        let orchestrator = CaptureOrchestrator::new(self.config.clone())?;
        let result = orchestrator.handle(body, "cli").await;

        println!("{}", serde_json::to_string_pretty(&CaptureResponse::from(&result))?);

        match result {
            CaptureResult::Success(_) => Ok(()),
            CaptureResult::Failure(failure) => bail!("capture failed ({}): {}", failure.status_hint, failure.error),
        }
    }

    pub async fn validate_config(&self, path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", path.display());

        let config = load_config(path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Allowed domains: {:?}", config.network.allowed_domains);
        println!("  Allowed commands: {:?}", config.command.allowed_prefixes);
        println!(
            "  Rate limit: {} requests per {:?}",
            config.rate_limit.max_requests, config.rate_limit.window
        );
        println!("  Output: {}", config.output.base_path.display());
        println!(
            "  Viewport: {}x{} @{}x",
            config.browser.viewport.width, config.browser.viewport.height, config.browser.device_scale_factor
        );

        Ok(())
    }
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }
    if let Some(output) = &args.output {
        config.output.base_path = output.clone();
    }
    if args.no_sandbox {
        config.browser.sandbox = false;
    }
    config.network.allowed_domains.extend(args.allow_domains.iter().cloned());
    config.command.allowed_prefixes.extend(args.allow_commands.iter().cloned());
}

/// `"1500"` waits 1.5s; anything else is a selector to wait for.
pub fn parse_wait_condition(value: &str) -> WaitCondition {
    match value.trim().parse::<u64>() {
        Ok(ms) => WaitCondition::Delay(ms),
        Err(_) => WaitCondition::Selector(value.to_string()),
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
