//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture service,
//! including admission limits, breaker thresholds, command and domain
//! allowlists, browser settings and output layout.

use crate::{CaptureError, HostPin};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture service
///
/// Every field has a default, so a configuration file only needs to name the
/// values it changes.
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Allow captures of docs.rs and its subdomains
/// let mut config = Config::default();
/// config.network.allowed_domains.push("docs.rs".to_string());
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Per-client admission control
    pub rate_limit: RateLimitSettings,

    /// Breaker thresholds, one set per capture mode
    pub breakers: BreakerConfig,

    /// Allow-listed commands and their execution limits
    pub command: CommandSettings,

    /// Allow-listed target domains and navigation limits
    pub network: NetworkSettings,

    /// Headless browser settings
    pub browser: BrowserSettings,

    /// Where encoded images are written
    pub output: OutputSettings,

    /// Default look of rendered terminal captures
    pub terminal: TerminalSettings,
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.rate_limit.max_requests == 0 {
            return Err(CaptureError::ConfigurationError(
                "rate_limit.max_requests must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "rate_limit.window must be greater than 0".to_string(),
            ));
        }

        for (mode, breaker) in [("network", &self.breakers.network), ("process", &self.breakers.process)] {
            if breaker.failure_threshold == 0 {
                return Err(CaptureError::ConfigurationError(format!(
                    "breakers.{mode}.failure_threshold must be greater than 0"
                )));
            }
            if breaker.request_timeout.is_zero() {
                return Err(CaptureError::ConfigurationError(format!(
                    "breakers.{mode}.request_timeout must be greater than 0"
                )));
            }
        }

        if self.command.max_output_bytes == 0 {
            return Err(CaptureError::ConfigurationError(
                "command.max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.browser.viewport.width == 0 || self.browser.viewport.height == 0 {
            return Err(CaptureError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.browser.device_scale_factor < 1.0 {
            return Err(CaptureError::ConfigurationError(
                "browser.device_scale_factor must be at least 1.0".to_string(),
            ));
        }

        if self.output.default_version.is_empty() {
            return Err(CaptureError::ConfigurationError(
                "output.default_version must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Requests admitted per identifier within one window (default: 10)
    pub max_requests: u32,

    /// Length of the fixed window (default: 60 seconds)
    pub window: Duration,

    /// How often expired entries are swept (default: 60 seconds)
    pub sweep_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Successes in half-open state needed to close it again
    pub success_threshold: u32,

    /// How long the breaker stays open before a trial call
    pub recovery_timeout: Duration,

    /// Deadline for a single guarded call
    pub request_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub network: BreakerSettings,
    pub process: BreakerSettings,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            network: BreakerSettings::default(),
            process: BreakerSettings {
                failure_threshold: 3,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
                request_timeout: Duration::from_secs(45),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Program names or path prefixes a command line may start with
    ///
    /// `"npx"` admits `npx` itself; `"./bin"` admits `./bin` and anything
    /// below it such as `./bin/demo`.
    pub allowed_prefixes: Vec<String>,

    /// Working directory for spawned commands (default: current directory)
    pub working_dir: PathBuf,

    /// Kill the command after this long (default: 30 seconds)
    pub timeout: Duration,

    /// Combined stdout and stderr bytes kept (default: 1 MiB)
    pub max_output_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            allowed_prefixes: Vec::new(),
            working_dir: PathBuf::from("."),
            timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Domains that may be captured, subdomains included
    pub allowed_domains: Vec<String>,

    /// Page load deadline (default: 20 seconds)
    pub navigation_timeout: Duration,

    /// How long to wait for a `waitFor` selector (default: 10 seconds)
    pub selector_timeout: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            navigation_timeout: Duration::from_secs(20),
            selector_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Default viewport for web captures
    pub viewport: Viewport,

    /// Pixel ratio of captured rasters (default: 2.0)
    ///
    /// The encoder downscales from this resolution, so it must be at least 1.
    pub device_scale_factor: f64,

    /// Keep Chrome's own sandbox enabled (default: true)
    ///
    /// Disable only inside containers that cannot provide the namespaces
    /// Chrome needs.
    pub sandbox: bool,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            viewport: Viewport::default(),
            device_scale_factor: 2.0,
            sandbox: true,
            user_agent: None,
        }
    }
}

/// Browser viewport size in CSS pixels
///
/// # Examples
///
/// ```rust
/// use capture_service::Viewport;
///
/// let mobile = Viewport { width: 375, height: 667 };
/// assert!(mobile.width < Viewport::default().width);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Root directory; files land in `base_path/vVERSION/` (default: `screenshots`)
    pub base_path: PathBuf,

    /// Version used when a request names none (default: `"1"`)
    pub default_version: String,

    /// Narrowest 2x source that is downscaled for the 1x output (default: 200)
    ///
    /// Narrower sources are written unchanged as the 1x image.
    pub min_downscale_width: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("screenshots"),
            default_version: "1".to_string(),
            min_downscale_width: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Theme name used when a request names none (default: `"dark"`)
    pub default_theme: String,

    /// Prompt shown before the command (default: `"$"`)
    pub prompt_text: String,

    /// Width of the rendered terminal window in CSS pixels (default: 880)
    pub width: u32,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            default_theme: "dark".to_string(),
            prompt_text: "$".to_string(),
            width: 880,
        }
    }
}

/// Generate Chrome command-line arguments for a capture session
pub fn get_chrome_args(settings: &BrowserSettings, pin: Option<&HostPin>) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--disable-plugins".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        format!(
            "--window-size={},{}",
            settings.viewport.width, settings.viewport.height
        ),
    ];

    if !settings.sandbox {
        args.push("--no-sandbox".to_string());
    }

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    if let Some(pin) = pin {
        args.push(pin.chrome_arg());
    }

    args
}

/// Build the launch configuration for one capture session
///
/// The profile directory is unique per session so concurrent sessions never
/// share state.
pub fn create_browser_config(
    settings: &BrowserSettings,
    profile_dir: &std::path::Path,
    pin: Option<&HostPin>,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.viewport.width, settings.viewport.height)
        .user_data_dir(profile_dir)
        .args(get_chrome_args(settings, pin));

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
