use crate::{
    CaptureError, CaptureOrchestrator, CaptureRequest, CaptureRequestBody, CaptureResult,
    CaptureTarget, CircuitState, Config, ManualClock, MockCaptureBackend, MockHostResolver, PageJob,
    Raster,
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| Rgba([(x % 255) as u8, (y % 255) as u8, 200, 255]));
    let mut data = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .unwrap();
    data
}

/// Orchestrator over a mock browser, a resolver that always answers with a
/// public address and a manual clock.
pub(crate) fn orchestrator_with(
    backend: MockCaptureBackend,
    base: &Path,
    tweak: impl FnOnce(&mut Config),
) -> (CaptureOrchestrator, Arc<ManualClock>) {
    let mut config = Config::default();
    config.network.allowed_domains = vec!["example.com".to_string()];
    config.command.allowed_prefixes = vec!["echo".to_string(), "false".to_string(), "printf".to_string()];
    config.output.base_path = base.to_path_buf();
    tweak(&mut config);

    let mut resolver = MockHostResolver::new();
    resolver
        .expect_resolve()
        .returning(|_, _| Ok(vec!["93.184.216.34".parse().unwrap()]));

    let clock = Arc::new(ManualClock::new());
    let orchestrator =
        CaptureOrchestrator::with_components(config, Arc::new(backend), Arc::new(resolver), clock.clone())
            .unwrap();
    (orchestrator, clock)
}

fn body(json: serde_json::Value) -> CaptureRequestBody {
    serde_json::from_value(json).unwrap()
}

fn web(name: &str, url: &str) -> CaptureRequestBody {
    body(serde_json::json!({ "name": name, "url": url }))
}

fn cli(name: &str, command: &str) -> CaptureRequestBody {
    body(serde_json::json!({ "name": name, "config": { "type": "cli", "command": command } }))
}

fn ok_raster() -> Result<Raster, CaptureError> {
    Ok(Raster {
        png: sample_png(400, 240),
        final_url: None,
    })
}

fn failure(result: &CaptureResult) -> &crate::CaptureFailure {
    match result {
        CaptureResult::Failure(f) => f,
        CaptureResult::Success(s) => panic!("expected failure, got {s:?}"),
    }
}

#[tokio::test]
async fn test_process_capture_renders_terminal_and_encodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend
        .expect_capture()
        .withf(|job| match job {
            PageJob::Markup { html, selector, .. } => selector == "#terminal" && html.contains("hello world"),
            _ => false,
        })
        .times(1)
        .returning(|_| ok_raster());
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |_| {});

    let result = orchestrator.handle(cli("cli-demo", "echo hello world"), "client").await;

    match result {
        CaptureResult::Success(output) => {
            assert_eq!((output.width, output.height), (200, 120));
            assert!(output.primary_path.ends_with("v1/cli-demo.png"));
            assert!(output.primary_path.exists());
            assert!(output.primary_2x_path.exists());
            assert_eq!(output.alternate_format_paths.len(), 2);
            assert!(output.alternate_format_paths.iter().all(|p| p.exists()));
        }
        CaptureResult::Failure(f) => panic!("capture failed: {f:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit_rejects_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().times(2).returning(|_| ok_raster());
    let (orchestrator, clock) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 1;
    });

    assert!(orchestrator.handle(web("a", "https://example.com/"), "1.2.3.4").await.is_success());

    let denied = orchestrator.handle(web("a", "https://example.com/"), "1.2.3.4").await;
    let f = failure(&denied);
    assert_eq!(f.status_hint, 429);
    assert!(f.retry_after.is_some_and(|d| d <= Duration::from_secs(60)));

    // A different client has its own window
    let other = orchestrator.handle(web("a", "not a url"), "5.6.7.8").await;
    assert_eq!(failure(&other).status_hint, 400);

    clock.advance(Duration::from_millis(60_001));
    assert!(orchestrator.handle(web("a", "https://example.com/"), "1.2.3.4").await.is_success());
}

#[tokio::test]
async fn test_disallowed_commands_are_forbidden_and_never_reach_browser() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().never();
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 100;
    });

    for command in ["rm -rf /tmp/x", "echo hi; rm -rf /", "echo $(whoami)", "echo `id`", "echo a | cat"] {
        let result = orchestrator.handle(cli("bad", command), "client").await;
        let f = failure(&result);
        assert_eq!(f.status_hint, 403, "{command}");
        assert!(!f.error.contains("whoami"), "error echoes command: {}", f.error);
    }

    let health = orchestrator.health();
    assert!(health.breakers.iter().all(|b| b.state == CircuitState::Closed));
    assert!(health.breakers.iter().all(|b| b.failure_count == 0));
}

#[tokio::test]
async fn test_forbidden_urls_are_rejected_before_navigation() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().never();
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 100;
    });

    for url in [
        "http://10.0.0.5/",
        "http://172.16.0.1/",
        "http://192.168.0.1/",
        "http://169.254.169.254/latest/meta-data/",
        "https://evil.com/",
        "file:///etc/passwd",
    ] {
        let result = orchestrator.handle(web("x", url), "client").await;
        assert_eq!(failure(&result).status_hint, 403, "{url}");
    }
}

#[tokio::test]
async fn test_redirect_into_forbidden_host_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().times(1).returning(|_| {
        Ok(Raster {
            png: sample_png(400, 240),
            final_url: Some("http://169.254.169.254/latest/meta-data/".to_string()),
        })
    });
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |_| {});

    let result = orchestrator.handle(web("redirect", "https://example.com/go"), "client").await;
    assert_eq!(failure(&result).status_hint, 403);
    assert!(!dir.path().join("v1/redirect.png").exists());
}

#[tokio::test]
async fn test_failing_mode_does_not_starve_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend
        .expect_capture()
        .withf(|job| matches!(job, PageJob::Navigate { .. }))
        .times(1)
        .returning(|_| ok_raster());
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 100;
    });

    // `false` exits 1; the process breaker opens after three failures
    for _ in 0..3 {
        let result = orchestrator.handle(cli("f", "false"), "client").await;
        assert_eq!(failure(&result).status_hint, 500);
    }
    let open = orchestrator.handle(cli("f", "false"), "client").await;
    let f = failure(&open);
    assert_eq!(f.status_hint, 503);
    assert!(f.retry_after.is_some());

    assert!(orchestrator.handle(web("site", "https://docs.example.com/"), "client").await.is_success());

    let states: Vec<_> = orchestrator.health().breakers.iter().map(|b| (b.name.clone(), b.state)).collect();
    assert_eq!(
        states,
        vec![("network".to_string(), CircuitState::Closed), ("process".to_string(), CircuitState::Open)]
    );
}

#[tokio::test]
async fn test_network_breaker_recovers_through_half_open() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut backend = MockCaptureBackend::new();
    let counter = calls.clone();
    backend.expect_capture().returning(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 5 {
            Err(CaptureError::NavigationFailed("net::ERR_CONNECTION_RESET".to_string()))
        } else {
            ok_raster()
        }
    });
    let (orchestrator, clock) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 100;
    });

    for _ in 0..5 {
        let result = orchestrator.handle(web("n", "https://example.com/"), "client").await;
        assert_eq!(failure(&result).status_hint, 500);
    }
    let rejected = orchestrator.handle(web("n", "https://example.com/"), "client").await;
    assert_eq!(failure(&rejected).status_hint, 503);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    clock.advance(Duration::from_secs(30));
    assert!(orchestrator.handle(web("n", "https://example.com/"), "client").await.is_success());
    assert_eq!(orchestrator.health().breakers[0].state, CircuitState::HalfOpen);

    assert!(orchestrator.handle(web("n", "https://example.com/"), "client").await.is_success());
    assert_eq!(orchestrator.health().breakers[0].state, CircuitState::Closed);
}

#[tokio::test]
async fn test_repeated_request_yields_same_paths() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().times(2).returning(|_| ok_raster());
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |_| {});

    let request = || body(serde_json::json!({ "name": "home", "version": "4", "url": "https://example.com/" }));
    let first = orchestrator.handle(request(), "client").await;
    let second = orchestrator.handle(request(), "client").await;

    match (first, second) {
        (CaptureResult::Success(a), CaptureResult::Success(b)) => {
            assert_eq!(a, b);
            assert!(a.primary_path.ends_with("v4/home.png"));
            assert!(a.primary_2x_path.ends_with("v4/home@2x.png"));
        }
        other => panic!("expected two successes, got {other:?}"),
    }
}

#[tokio::test]
async fn test_validation_failures_are_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().never();
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |_| {});

    let missing_name = orchestrator.handle(body(serde_json::json!({ "url": "https://example.com/" })), "c").await;
    assert_eq!(failure(&missing_name).status_hint, 400);

    let missing_command = orchestrator
        .handle(body(serde_json::json!({ "name": "x", "config": { "type": "cli" } })), "c")
        .await;
    assert_eq!(failure(&missing_command).status_hint, 400);

    let unterminated = orchestrator.handle(cli("x", "echo \"open"), "c").await;
    assert_eq!(failure(&unterminated).status_hint, 400);
}

#[tokio::test]
async fn test_reset_clears_limits_and_breakers() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend
        .expect_capture()
        .returning(|_| Err(CaptureError::PageError("crashed".to_string())));
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |config| {
        config.rate_limit.max_requests = 5;
        config.breakers.network.failure_threshold = 1;
    });

    let result = orchestrator.handle(web("x", "https://example.com/"), "client").await;
    assert_eq!(failure(&result).status_hint, 500);
    let result = orchestrator.handle(web("x", "https://example.com/"), "client").await;
    assert_eq!(failure(&result).status_hint, 503);
    assert_eq!(orchestrator.health().tracked_identifiers, 1);

    orchestrator.reset();

    let health = orchestrator.health();
    assert_eq!(health.tracked_identifiers, 0);
    assert!(health.breakers.iter().all(|b| b.state == CircuitState::Closed));
}

#[test]
fn test_error_severity() {
    use crate::ErrorSeverity;

    assert_eq!(CaptureError::InvalidRequest("x".to_string()).severity(), ErrorSeverity::Low);
    assert_eq!(CaptureError::NavigationFailed("x".to_string()).severity(), ErrorSeverity::Medium);
    assert_eq!(CaptureError::ConfigurationError("x".to_string()).severity(), ErrorSeverity::High);
}

#[tokio::test]
async fn test_prebuilt_request_cannot_write_outside_base() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("shots");
    let mut backend = MockCaptureBackend::new();
    backend.expect_capture().times(1).returning(|_| ok_raster());
    let (orchestrator, _) = orchestrator_with(backend, &base, |_| {});

    let request = CaptureRequest {
        name: "../../escape".to_string(),
        version: "../1".to_string(),
        target: CaptureTarget::Process {
            command: "echo hi".to_string(),
            theme: "dark".to_string(),
            show_prompt: true,
            prompt_text: "$".to_string(),
        },
    };

    match orchestrator.capture(&request, "client").await {
        CaptureResult::Success(output) => {
            assert!(output.primary_path.starts_with(&base));
            assert!(output.primary_2x_path.starts_with(&base));
            assert!(output.alternate_format_paths.iter().all(|p| p.starts_with(&base)));
        }
        CaptureResult::Failure(f) => panic!("capture failed: {f:?}"),
    }
    assert!(!dir.path().join("escape.png").exists());
}

#[tokio::test]
async fn test_navigation_is_pinned_to_vetted_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = MockCaptureBackend::new();
    backend
        .expect_capture()
        .withf(|job| match job {
            PageJob::Navigate { url, pin: Some(pin), .. } => {
                url == "https://docs.example.com/guide"
                    && pin.host == "docs.example.com"
                    && pin.address == "93.184.216.34".parse::<std::net::IpAddr>().unwrap()
            }
            _ => false,
        })
        .times(1)
        .returning(|_| ok_raster());
    let (orchestrator, _) = orchestrator_with(backend, dir.path(), |_| {});

    let result = orchestrator.handle(web("guide", "https://docs.example.com/guide"), "client").await;
    assert!(result.is_success());
}
