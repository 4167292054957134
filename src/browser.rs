//! Headless browser capture
//!
//! Every capture launches its own Chrome session with a throwaway profile
//! directory. The session is closed explicitly when the capture finishes and
//! torn down by `Drop` when the capture future is abandoned (for example when
//! a breaker deadline fires), so no browser process or profile outlives its
//! request.

use crate::{create_browser_config, BrowserSettings, CaptureError, HostPin, NetworkSettings, Viewport};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// What to wait for after navigation before capturing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaitCondition {
    /// Fixed delay in milliseconds
    Delay(u64),
    /// CSS selector that must match an element
    Selector(String),
}

/// A single unit of browser work
#[derive(Debug, Clone, PartialEq)]
pub enum PageJob {
    /// Load an HTML document and capture one element of it
    Markup {
        html: String,
        viewport: Viewport,
        selector: String,
    },
    /// Navigate to an already validated URL and capture it
    ///
    /// With a `pin`, the browser resolves that host to the vetted address
    /// only.
    Navigate {
        url: String,
        pin: Option<HostPin>,
        viewport: Viewport,
        selector: Option<String>,
        full_page: bool,
        wait_for: Option<WaitCondition>,
    },
}

/// PNG bytes at the device scale factor, plus where the page ended up
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub png: Vec<u8>,
    pub final_url: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn capture(&self, job: PageJob) -> Result<Raster, CaptureError>;
}

/// Chrome-backed capture through the DevTools protocol
pub struct ChromeBackend {
    browser: BrowserSettings,
    navigation_timeout: Duration,
    selector_timeout: Duration,
}

impl ChromeBackend {
    pub fn new(browser: &BrowserSettings, network: &NetworkSettings) -> Self {
        Self {
            browser: browser.clone(),
            navigation_timeout: network.navigation_timeout,
            selector_timeout: network.selector_timeout,
        }
    }
}

#[async_trait]
impl CaptureBackend for ChromeBackend {
    async fn capture(&self, job: PageJob) -> Result<Raster, CaptureError> {
        let pin = match &job {
            PageJob::Navigate { pin, .. } => pin.clone(),
            PageJob::Markup { .. } => None,
        };
        let mut session = BrowserSession::launch(&self.browser, pin.as_ref()).await?;
        let result = session.capture(self, job).await;
        session.close().await;
        result
    }
}

/// One running browser, its protocol handler and its profile directory
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    _profile: TempDir,
}

impl BrowserSession {
    async fn launch(settings: &BrowserSettings, pin: Option<&HostPin>) -> Result<Self, CaptureError> {
        let profile = tempfile::Builder::new()
            .prefix("capture-profile-")
            .tempdir()
            .map_err(|e| CaptureError::BrowserLaunchFailed(format!("Failed to create profile dir: {e}")))?;

        let config = create_browser_config(settings, profile.path(), pin)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        // The handler must be polled for any page command to make progress
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
        });

        debug!(profile = %profile.path().display(), "Browser session started");
        Ok(Self {
            browser,
            handler,
            _profile: profile,
        })
    }

    async fn capture(&self, backend: &ChromeBackend, job: PageJob) -> Result<Raster, CaptureError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::PageError(e.to_string()))?;

        let result = capture_page(&page, backend, job).await;
        let _ = page.close().await;
        result
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

async fn capture_page(page: &Page, backend: &ChromeBackend, job: PageJob) -> Result<Raster, CaptureError> {
    match job {
        PageJob::Markup { html, viewport, selector } => {
            set_viewport(page, viewport, backend.browser.device_scale_factor).await?;
            page.set_content(html)
                .await
                .map_err(|e| CaptureError::PageError(e.to_string()))?;

            let png = screenshot_element(page, &selector, backend.selector_timeout).await?;
            Ok(Raster { png, final_url: None })
        }
        PageJob::Navigate {
            url,
            pin: _,
            viewport,
            selector,
            full_page,
            wait_for,
        } => {
            set_viewport(page, viewport, backend.browser.device_scale_factor).await?;

            match timeout(backend.navigation_timeout, page.goto(url.as_str())).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(CaptureError::NavigationFailed(e.to_string())),
                Err(_) => {
                    return Err(CaptureError::NavigationFailed(format!(
                        "page did not load within {:?}",
                        backend.navigation_timeout
                    )))
                }
            }

            match wait_for {
                Some(WaitCondition::Delay(ms)) => sleep(Duration::from_millis(ms)).await,
                Some(WaitCondition::Selector(css)) => {
                    wait_for_selector(page, &css, backend.selector_timeout).await?;
                }
                None => {}
            }

            let final_url = page.url().await.ok().flatten();

            let png = if let Some(selector) = selector {
                screenshot_element(page, &selector, backend.selector_timeout).await?
            } else {
                let params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(full_page)
                    .build();
                page.screenshot(params)
                    .await
                    .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?
            };

            Ok(Raster { png, final_url })
        }
    }
}

async fn set_viewport(page: &Page, viewport: Viewport, scale: f64) -> Result<(), CaptureError> {
    let params = SetDeviceMetricsOverrideParams::builder()
        .width(viewport.width)
        .height(viewport.height)
        .device_scale_factor(scale.max(1.0))
        .mobile(false)
        .build()
        .map_err(CaptureError::PageError)?;

    page.execute(params)
        .await
        .map_err(|e| CaptureError::PageError(e.to_string()))?;
    Ok(())
}

async fn wait_for_selector(page: &Page, selector: &str, limit: Duration) -> Result<(), CaptureError> {
    let deadline = Instant::now() + limit;
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CaptureError::ElementNotFound(format!(
                "'{selector}' did not appear within {limit:?}"
            )));
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn screenshot_element(page: &Page, selector: &str, limit: Duration) -> Result<Vec<u8>, CaptureError> {
    wait_for_selector(page, selector, limit).await?;

    let element = page
        .find_element(selector)
        .await
        .map_err(|e| CaptureError::ElementNotFound(e.to_string()))?;

    element
        .screenshot(CaptureScreenshotFormat::Png)
        .await
        .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
}
