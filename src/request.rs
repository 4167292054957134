//! Capture requests and results
//!
//! `CaptureRequestBody` is the JSON accepted by `POST /api/screenshot`.
//! It is validated into a [`CaptureRequest`] whose target is either a
//! network capture or a process capture, so each mode carries only the
//! fields it uses.

use crate::{sanitize_filename, CaptureError, Config, OutputPaths, Viewport, WaitCondition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequestBody {
    pub name: Option<String>,
    pub url: Option<String>,
    pub version: Option<String>,
    pub config: Option<CaptureOptions>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOptions {
    #[serde(rename = "type")]
    pub kind: Option<CaptureKind>,
    pub viewport: Option<Viewport>,
    pub selector: Option<String>,
    pub full_page: Option<bool>,
    pub wait_for: Option<WaitCondition>,
    pub command: Option<String>,
    pub theme: Option<String>,
    pub show_prompt: Option<bool>,
    pub prompt_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Web,
    Cli,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub name: String,
    pub version: String,
    pub target: CaptureTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureTarget {
    Network {
        url: String,
        viewport: Viewport,
        selector: Option<String>,
        full_page: bool,
        wait_for: Option<WaitCondition>,
    },
    Process {
        command: String,
        theme: String,
        show_prompt: bool,
        prompt_text: String,
    },
}

impl CaptureTarget {
    pub fn mode(&self) -> &'static str {
        match self {
            CaptureTarget::Network { .. } => "network",
            CaptureTarget::Process { .. } => "process",
        }
    }
}

impl CaptureRequestBody {
    /// Checks required fields and fills defaults from `config`.
    ///
    /// The mode is taken from `config.type` when given; otherwise a
    /// `command` selects process mode and anything else network mode.
    pub fn into_request(self, config: &Config) -> Result<CaptureRequest, CaptureError> {
        let raw_name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| CaptureError::InvalidRequest("name is required".to_string()))?;
        let name = sanitize_filename(raw_name.trim());
        if name.is_empty() || name.chars().all(|c| c == '.' || c == '_') {
            return Err(CaptureError::InvalidRequest("name is not a usable file name".to_string()));
        }

        let version = match self.version.filter(|v| !v.trim().is_empty()) {
            Some(v) => {
                let v = v.trim();
                if !v.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
                    || v.contains("..")
                {
                    return Err(CaptureError::InvalidRequest(
                        "version may only contain letters, digits, '.', '-' and '_'".to_string(),
                    ));
                }
                v.to_string()
            }
            None => config.output.default_version.clone(),
        };

        let options = self.config.unwrap_or_default();
        let kind = options.kind.unwrap_or(if options.command.is_some() {
            CaptureKind::Cli
        } else {
            CaptureKind::Web
        });

        let target = match kind {
            CaptureKind::Cli => {
                let command = options
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| CaptureError::InvalidRequest("config.command is required for cli captures".to_string()))?;
                CaptureTarget::Process {
                    command: command.trim().to_string(),
                    theme: options.theme.unwrap_or_else(|| config.terminal.default_theme.clone()),
                    show_prompt: options.show_prompt.unwrap_or(true),
                    prompt_text: options.prompt_text.unwrap_or_else(|| config.terminal.prompt_text.clone()),
                }
            }
            CaptureKind::Web => {
                let url = self
                    .url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| CaptureError::InvalidRequest("url is required for web captures".to_string()))?;
                let viewport = options.viewport.unwrap_or(config.browser.viewport);
                if viewport.width == 0 || viewport.height == 0 {
                    return Err(CaptureError::InvalidRequest("viewport dimensions must be greater than 0".to_string()));
                }
                CaptureTarget::Network {
                    url: url.trim().to_string(),
                    viewport,
                    selector: options.selector.filter(|s| !s.trim().is_empty()),
                    full_page: options.full_page.unwrap_or(false),
                    wait_for: options.wait_for,
                }
            }
        };

        Ok(CaptureRequest { name, version, target })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutput {
    pub primary_path: PathBuf,
    pub primary_2x_path: PathBuf,
    pub alternate_format_paths: Vec<PathBuf>,
    pub width: u32,
    pub height: u32,
}

impl CaptureOutput {
    pub fn from_paths(paths: OutputPaths, width: u32, height: u32) -> Self {
        Self {
            alternate_format_paths: paths.alternates(),
            primary_path: paths.primary,
            primary_2x_path: paths.primary_2x,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFailure {
    pub error: String,
    pub status_hint: u16,
    pub retry_after: Option<Duration>,
}

impl From<&CaptureError> for CaptureFailure {
    fn from(err: &CaptureError) -> Self {
        Self {
            error: err.to_string(),
            status_hint: err.status_hint(),
            retry_after: err.retry_after(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResult {
    Success(CaptureOutput),
    Failure(CaptureFailure),
}

impl CaptureResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CaptureResult::Success(_))
    }

    /// HTTP status for this result
    pub fn status(&self) -> u16 {
        match self {
            CaptureResult::Success(_) => 200,
            CaptureResult::Failure(failure) => failure.status_hint,
        }
    }
}

/// JSON body returned to HTTP callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path2x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webp_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webp2x_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&CaptureResult> for CaptureResponse {
    fn from(result: &CaptureResult) -> Self {
        match result {
            CaptureResult::Success(output) => {
                let display = |p: &PathBuf| p.to_string_lossy().into_owned();
                Self {
                    success: true,
                    path: Some(display(&output.primary_path)),
                    path2x: Some(display(&output.primary_2x_path)),
                    webp_path: output.alternate_format_paths.first().map(display),
                    webp2x_path: output.alternate_format_paths.get(1).map(display),
                    width: Some(output.width),
                    height: Some(output.height),
                    error: None,
                }
            }
            CaptureResult::Failure(failure) => Self {
                success: false,
                path: None,
                path2x: None,
                webp_path: None,
                webp2x_path: None,
                width: None,
                height: None,
                error: Some(failure.error.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<CaptureRequest, CaptureError> {
        serde_json::from_str::<CaptureRequestBody>(json)
            .unwrap()
            .into_request(&Config::default())
    }

    #[test]
    fn test_web_request_with_defaults() {
        let request = parse(r#"{"name":"home","url":"https://example.com"}"#).unwrap();

        assert_eq!(request.version, "1");
        assert_eq!(
            request.target,
            CaptureTarget::Network {
                url: "https://example.com".to_string(),
                viewport: Viewport::default(),
                selector: None,
                full_page: false,
                wait_for: None,
            }
        );
    }

    #[test]
    fn test_cli_request_fields() {
        let request = parse(
            r#"{"name":"help","version":"2","config":{"type":"cli","command":"npx tool --help","theme":"light","showPrompt":false}}"#,
        )
        .unwrap();

        assert_eq!(request.version, "2");
        assert_eq!(request.target.mode(), "process");
        assert_eq!(
            request.target,
            CaptureTarget::Process {
                command: "npx tool --help".to_string(),
                theme: "light".to_string(),
                show_prompt: false,
                prompt_text: "$".to_string(),
            }
        );
    }

    #[test]
    fn test_command_implies_cli_and_web_options_parse() {
        let request = parse(r#"{"name":"x","config":{"command":"ls"}}"#).unwrap();
        assert_eq!(request.target.mode(), "process");

        let request = parse(
            r#"{"name":"x","url":"https://example.com","config":{"viewport":{"width":375,"height":667},"fullPage":true,"waitFor":500}}"#,
        )
        .unwrap();
        match request.target {
            CaptureTarget::Network { viewport, full_page, wait_for, .. } => {
                assert_eq!(viewport.width, 375);
                assert!(full_page);
                assert_eq!(wait_for, Some(WaitCondition::Delay(500)));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_are_validation_errors() {
        for json in [
            r#"{"url":"https://example.com"}"#,
            r#"{"name":"  ","url":"https://example.com"}"#,
            r#"{"name":"x"}"#,
            r#"{"name":"x","config":{"type":"cli"}}"#,
            r#"{"name":"x","version":"../../etc","url":"https://example.com"}"#,
        ] {
            let err = parse(json).unwrap_err();
            assert_eq!(err.status_hint(), 400, "{json}");
        }
    }

    #[test]
    fn test_name_cannot_escape_output_dir() {
        let request = parse(r#"{"name":"../../etc/passwd","url":"https://example.com"}"#).unwrap();
        assert!(!request.name.contains('/'));
        assert!(!request.name.contains(".."));
    }

    #[test]
    fn test_response_shapes() {
        let success = CaptureResult::Success(CaptureOutput::from_paths(
            crate::output_paths(std::path::Path::new("shots"), "1", "home"),
            640,
            400,
        ));
        let json = serde_json::to_value(CaptureResponse::from(&success)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["path"], "shots/v1/home.png");
        assert_eq!(json["path2x"], "shots/v1/home@2x.png");
        assert_eq!(json["webpPath"], "shots/v1/home.webp");
        assert_eq!(json["webp2xPath"], "shots/v1/home@2x.webp");
        assert!(json.get("error").is_none());

        let failure = CaptureResult::Failure(CaptureFailure::from(&CaptureError::ForbiddenCharacters));
        assert_eq!(failure.status(), 403);
        let json = serde_json::to_value(CaptureResponse::from(&failure)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Command contains forbidden characters");
        assert!(json.get("path").is_none());
    }
}
