//! Capture pipeline coordinating admission, isolation, execution and output
//!
//! Every request passes through the same stages:
//!
//! 1. the [`RateLimiter`] admits or rejects the client,
//! 2. the breaker for the request's mode guards the external work,
//! 3. the command is run and rendered, or the URL is vetted and loaded,
//! 4. the browser backend captures a 2x raster,
//! 5. the [`ImageEncoder`] writes PNG and WebP at 1x and 2x.
//!
//! Failures at any stage come back as a [`CaptureResult::Failure`] carrying
//! the HTTP status the caller should answer with.
//!
//! # Examples
//!
//! ```rust,no_run
//! use capture_service::{CaptureOrchestrator, CaptureRequestBody, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.network.allowed_domains.push("example.com".to_string());
//!     let orchestrator = CaptureOrchestrator::new(config)?;
//!
//!     let body: CaptureRequestBody =
//!         serde_json::from_str(r#"{"name":"home","url":"https://example.com"}"#)?;
//!     let result = orchestrator.handle(body, "127.0.0.1").await;
//!     println!("status {}", result.status());
//!     Ok(())
//! }
//! ```

use crate::{
    render_document, CaptureBackend, CaptureError, CaptureFailure, CaptureOutput, CaptureRequest,
    CaptureRequestBody, CaptureResult, CaptureTarget, ChromeBackend, Clock, CommandExecutor,
    Config, DnsResolver, ErrorCategory, HealthReport, HostResolver, ImageEncoder, Metrics,
    ModeBreakers, PageJob, PromptOptions, RateLimiter, Raster, SystemClock, TerminalTheme,
    UrlGuard, Viewport, WaitCondition, TERMINAL_SELECTOR,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Horizontal room around the terminal window inside the page
const TERMINAL_MARGIN: u32 = 64;

pub struct CaptureOrchestrator {
    config: Config,
    limiter: Arc<RateLimiter>,
    breakers: ModeBreakers,
    executor: CommandExecutor,
    url_guard: UrlGuard,
    backend: Arc<dyn CaptureBackend>,
    encoder: ImageEncoder,
    metrics: Metrics,
}

impl CaptureOrchestrator {
    /// Builds the production pipeline: Chrome, system DNS and the tokio clock.
    pub fn new(config: Config) -> Result<Self, CaptureError> {
        let backend = Arc::new(ChromeBackend::new(&config.browser, &config.network));
        Self::with_components(config, backend, Arc::new(DnsResolver), Arc::new(SystemClock))
    }

    pub fn with_components(
        config: Config,
        backend: Arc<dyn CaptureBackend>,
        resolver: Arc<dyn HostResolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CaptureError> {
        config.validate()?;

        Ok(Self {
            limiter: Arc::new(RateLimiter::new(clock.clone())),
            breakers: ModeBreakers::new(config.breakers.network, config.breakers.process, clock),
            executor: CommandExecutor::new(&config.command),
            url_guard: UrlGuard::new(&config.network.allowed_domains, resolver),
            encoder: ImageEncoder::new(&config.output, config.browser.device_scale_factor),
            metrics: Metrics::new(),
            backend,
            config,
        })
    }

    /// Starts the periodic rate limit sweep. Needs a running tokio runtime.
    pub fn start_housekeeping(&self) {
        self.limiter.start_sweeper(self.config.rate_limit.sweep_interval);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Admits, validates and captures a raw request body.
    pub async fn handle(&self, body: CaptureRequestBody, client_id: &str) -> CaptureResult {
        let started = Instant::now();

        async {
            if let Err(e) = self.admit(client_id) {
                return self.finish("unknown", client_id, started, Err(e));
            }

            match body.into_request(&self.config) {
                Ok(request) => {
                    let mode = request.target.mode();
                    let outcome = self.run(&request).await;
                    self.finish(mode, client_id, started, outcome)
                }
                Err(e) => self.finish("unknown", client_id, started, Err(e)),
            }
        }
        .instrument(request_span())
        .await
    }

    /// Answers a request that could not be parsed.
    ///
    /// The client is still admitted first, so malformed requests count
    /// against its quota like any other.
    pub fn refuse(&self, client_id: &str, error: CaptureError) -> CaptureResult {
        let started = Instant::now();
        let outcome = self.admit(client_id).and(Err(error));
        self.finish("unknown", client_id, started, outcome)
    }

    /// Admits and captures an already validated request.
    pub async fn capture(&self, request: &CaptureRequest, client_id: &str) -> CaptureResult {
        let started = Instant::now();
        let mode = request.target.mode();

        async {
            let outcome = match self.admit(client_id) {
                Ok(()) => self.run(request).await,
                Err(e) => Err(e),
            };
            self.finish(mode, client_id, started, outcome)
        }
        .instrument(request_span())
        .await
    }

    fn admit(&self, client_id: &str) -> Result<(), CaptureError> {
        let limits = &self.config.rate_limit;
        if self.limiter.allow(client_id, limits.max_requests, limits.window) {
            return Ok(());
        }

        Err(CaptureError::RateLimited {
            retry_after: self.limiter.retry_after(client_id).unwrap_or(limits.window),
        })
    }

    async fn run(&self, request: &CaptureRequest) -> Result<CaptureOutput, CaptureError> {
        let raster = match &request.target {
            CaptureTarget::Network {
                url,
                viewport,
                selector,
                full_page,
                wait_for,
            } => {
                self.breakers
                    .network
                    .execute(|| self.capture_network(url, *viewport, selector.clone(), *full_page, wait_for.clone()))
                    .await?
            }
            CaptureTarget::Process {
                command,
                theme,
                show_prompt,
                prompt_text,
            } => {
                let prompt = PromptOptions {
                    show_prompt: *show_prompt,
                    prompt_text: prompt_text.clone(),
                };
                self.breakers
                    .process
                    .execute(|| self.capture_process(command, theme, prompt))
                    .await?
            }
        };

        let encoded = self.encoder.encode(raster.png, &request.version, &request.name).await?;
        Ok(CaptureOutput::from_paths(encoded.paths, encoded.width, encoded.height))
    }

    async fn capture_process(&self, command: &str, theme: &str, prompt: PromptOptions) -> Result<Raster, CaptureError> {
        let output = self.executor.run(command).await?;

        if output.timed_out {
            return Err(CaptureError::CommandTimedOut(self.config.command.timeout));
        }
        if !output.success() {
            return Err(CaptureError::CommandFailed { code: output.exit_code });
        }

        let width = self.config.terminal.width;
        let html = render_document(command, &output, &TerminalTheme::by_name(theme), &prompt, width);

        self.backend
            .capture(PageJob::Markup {
                html,
                viewport: Viewport {
                    width: width + TERMINAL_MARGIN,
                    height: self.config.browser.viewport.height,
                },
                selector: TERMINAL_SELECTOR.to_string(),
            })
            .await
    }

    async fn capture_network(
        &self,
        url: &str,
        viewport: Viewport,
        selector: Option<String>,
        full_page: bool,
        wait_for: Option<WaitCondition>,
    ) -> Result<Raster, CaptureError> {
        let target = self.url_guard.vet(url).await?;

        let raster = self
            .backend
            .capture(PageJob::Navigate {
                url: target.url.to_string(),
                pin: target.pin,
                viewport,
                selector,
                full_page,
                wait_for,
            })
            .await?;

        // Only the first host is pinned; a redirect is resolved by Chrome and
        // has to be checked after the fact
        if let Some(final_url) = raster.final_url.as_deref() {
            if final_url != target.url.as_str() {
                self.url_guard.validate(final_url).await?;
            }
        }

        Ok(raster)
    }

    fn finish(
        &self,
        mode: &str,
        client_id: &str,
        started: Instant,
        outcome: Result<CaptureOutput, CaptureError>,
    ) -> CaptureResult {
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                self.metrics.record_success(mode, elapsed);
                info!(
                    mode,
                    client = client_id,
                    path = %output.primary_path.display(),
                    width = output.width,
                    height = output.height,
                    duration_ms = elapsed.as_millis() as u64,
                    "Capture completed"
                );
                CaptureResult::Success(output)
            }
            Err(e) => {
                self.metrics.record_failure(mode, &e, elapsed);
                log_failure(mode, client_id, &e, elapsed);
                CaptureResult::Failure(CaptureFailure::from(&e))
            }
        }
    }

    /// Clears rate limit state and closes both breakers.
    pub fn reset(&self) {
        self.limiter.reset();
        self.breakers.reset();
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::new(self.breakers.snapshots(), self.limiter.tracked_identifiers())
    }
}

fn request_span() -> tracing::Span {
    info_span!("capture", request_id = %Uuid::new_v4())
}

fn log_failure(mode: &str, client_id: &str, error: &CaptureError, elapsed: Duration) {
    let status = error.status_hint();
    let duration_ms = elapsed.as_millis() as u64;

    match error.category() {
        ErrorCategory::TrustBoundary => warn!(
            security_event = true,
            mode,
            client = client_id,
            status,
            error = %error,
            "Capture rejected at trust boundary"
        ),
        ErrorCategory::Admission | ErrorCategory::Validation => info!(
            mode,
            client = client_id,
            status,
            error = %error,
            "Capture request refused"
        ),
        ErrorCategory::BreakerOpen => warn!(
            mode,
            client = client_id,
            status,
            error = %error,
            "Capture refused, breaker open"
        ),
        ErrorCategory::Transient | ErrorCategory::Internal => error!(
            mode,
            client = client_id,
            status,
            duration_ms,
            error = %error,
            "Capture failed"
        ),
    }
}
