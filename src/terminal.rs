//! Renders captured command output as a styled terminal window.
//!
//! ANSI SGR sequences (16-colour, 256-colour and truecolour, bold, dim,
//! italic, underline) become inline-styled spans; every other escape
//! sequence is dropped. All text is HTML-escaped.

use crate::CommandExecutionResult;
use std::fmt::Write as _;

/// Element the capture step screenshots.
pub const TERMINAL_SELECTOR: &str = "#terminal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTheme {
    pub name: &'static str,
    pub background: &'static str,
    pub foreground: &'static str,
    pub chrome: &'static str,
    pub prompt: &'static str,
    /// Standard colours 0-7 followed by their bright variants 8-15.
    pub palette: [&'static str; 16],
}

impl TerminalTheme {
    pub fn dark() -> Self {
        Self {
            name: "dark",
            background: "#1e1e2e",
            foreground: "#cdd6f4",
            chrome: "#313244",
            prompt: "#a6e3a1",
            palette: [
                "#45475a", "#f38ba8", "#a6e3a1", "#f9e2af", "#89b4fa", "#f5c2e7", "#94e2d5", "#bac2de",
                "#585b70", "#f38ba8", "#a6e3a1", "#f9e2af", "#89b4fa", "#f5c2e7", "#94e2d5", "#a6adc8",
            ],
        }
    }

    pub fn light() -> Self {
        Self {
            name: "light",
            background: "#eff1f5",
            foreground: "#4c4f69",
            chrome: "#ccd0da",
            prompt: "#40a02b",
            palette: [
                "#5c5f77", "#d20f39", "#40a02b", "#df8e1d", "#1e66f5", "#ea76cb", "#179299", "#acb0be",
                "#6c6f85", "#d20f39", "#40a02b", "#df8e1d", "#1e66f5", "#ea76cb", "#179299", "#bcc0cc",
            ],
        }
    }

    /// Looks a theme up by name, falling back to dark.
    pub fn by_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "light" => Self::light(),
            _ => Self::dark(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOptions {
    pub show_prompt: bool,
    pub prompt_text: String,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            show_prompt: true,
            prompt_text: "$".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Indexed(u8),
    Rgb(u8, u8, u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Style {
    fg: Option<Color>,
    bg: Option<Color>,
    bold: bool,
    dim: bool,
    italic: bool,
    underline: bool,
}

impl Style {
    fn is_plain(&self) -> bool {
        *self == Style::default()
    }

    fn apply(&mut self, params: &[u16]) {
        if params.is_empty() {
            *self = Style::default();
            return;
        }

        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => *self = Style::default(),
                1 => self.bold = true,
                2 => self.dim = true,
                3 => self.italic = true,
                4 => self.underline = true,
                22 => {
                    self.bold = false;
                    self.dim = false;
                }
                23 => self.italic = false,
                24 => self.underline = false,
                n @ 30..=37 => self.fg = Some(Color::Indexed((n - 30) as u8)),
                n @ 90..=97 => self.fg = Some(Color::Indexed((n - 90 + 8) as u8)),
                39 => self.fg = None,
                n @ 40..=47 => self.bg = Some(Color::Indexed((n - 40) as u8)),
                n @ 100..=107 => self.bg = Some(Color::Indexed((n - 100 + 8) as u8)),
                49 => self.bg = None,
                n @ (38 | 48) => {
                    let (color, consumed) = parse_extended_color(&params[i + 1..]);
                    if let Some(color) = color {
                        if n == 38 {
                            self.fg = Some(color);
                        } else {
                            self.bg = Some(color);
                        }
                    }
                    i += consumed;
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn css(&self, theme: &TerminalTheme) -> String {
        let mut css = String::new();
        if let Some(fg) = self.fg {
            let _ = write!(css, "color:{};", color_css(fg, theme));
        }
        if let Some(bg) = self.bg {
            let _ = write!(css, "background-color:{};", color_css(bg, theme));
        }
        if self.bold {
            css.push_str("font-weight:bold;");
        }
        if self.dim {
            css.push_str("opacity:0.7;");
        }
        if self.italic {
            css.push_str("font-style:italic;");
        }
        if self.underline {
            css.push_str("text-decoration:underline;");
        }
        css
    }
}

/// Parses the tail of a `38;…` or `48;…` sequence.
fn parse_extended_color(rest: &[u16]) -> (Option<Color>, usize) {
    match rest {
        [5, n, ..] => (Some(Color::Indexed((*n).min(255) as u8)), 2),
        [2, r, g, b, ..] => (
            Some(Color::Rgb((*r).min(255) as u8, (*g).min(255) as u8, (*b).min(255) as u8)),
            4,
        ),
        _ => (None, rest.len()),
    }
}

fn color_css(color: Color, theme: &TerminalTheme) -> String {
    match color {
        Color::Indexed(n) if n < 16 => theme.palette[n as usize].to_string(),
        Color::Indexed(n) if n < 232 => {
            let n = n - 16;
            let level = |v: u8| if v == 0 { 0 } else { 55 + v * 40 };
            format!("#{:02x}{:02x}{:02x}", level(n / 36), level((n / 6) % 6), level(n % 6))
        }
        Color::Indexed(n) => {
            let gray = 8 + (n - 232) * 10;
            format!("#{gray:02x}{gray:02x}{gray:02x}")
        }
        Color::Rgb(r, g, b) => format!("#{r:02x}{g:02x}{b:02x}"),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Converts text containing ANSI escapes into HTML spans.
pub fn ansi_to_html(input: &str, theme: &TerminalTheme) -> String {
    let mut html = String::with_capacity(input.len());
    let mut style = Style::default();
    let mut span_open = false;
    let mut text = String::new();
    let mut chars = input.chars().peekable();

    let flush = |html: &mut String, text: &mut String| {
        if !text.is_empty() {
            html.push_str(&escape_html(text));
            text.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                flush(&mut html, &mut text);
                match chars.peek() {
                    Some('[') => {
                        chars.next();
                        let mut body = String::new();
                        let mut terminator = None;
                        for c in chars.by_ref() {
                            if ('\u{40}'..='\u{7e}').contains(&c) {
                                terminator = Some(c);
                                break;
                            }
                            body.push(c);
                        }
                        if terminator != Some('m') {
                            continue;
                        }

                        let params: Vec<u16> = body
                            .split(';')
                            .map(|p| p.parse().unwrap_or(0))
                            .collect();
                        let params = if body.is_empty() { Vec::new() } else { params };

                        let previous = style;
                        style.apply(&params);
                        if style != previous {
                            if span_open {
                                html.push_str("</span>");
                                span_open = false;
                            }
                            if !style.is_plain() {
                                let _ = write!(html, "<span style=\"{}\">", style.css(theme));
                                span_open = true;
                            }
                        }
                    }
                    Some(']') => {
                        // OSC runs to BEL or ESC \
                        for c in chars.by_ref() {
                            if c == '\u{7}' || c == '\\' {
                                break;
                            }
                        }
                    }
                    _ => {
                        chars.next();
                    }
                }
            }
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    text.push('\n');
                }
            }
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => text.push(c),
        }
    }

    flush(&mut html, &mut text);
    if span_open {
        html.push_str("</span>");
    }
    html
}

/// Builds the full HTML document captured for a process-mode request.
pub fn render_document(
    command_line: &str,
    result: &CommandExecutionResult,
    theme: &TerminalTheme,
    prompt: &PromptOptions,
    width: u32,
) -> String {
    let mut body = String::new();

    if prompt.show_prompt {
        let _ = writeln!(
            body,
            "<span class=\"prompt\">{}</span> <span class=\"command\">{}</span>",
            escape_html(&prompt.prompt_text),
            escape_html(command_line)
        );
    }

    body.push_str(&ansi_to_html(&result.stdout, theme));
    if !result.stderr.is_empty() {
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(&ansi_to_html(&result.stderr, theme));
    }
    let body = body.trim_end_matches('\n');

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  html, body {{ margin: 0; padding: 0; background: transparent; }}
  #terminal {{
    display: inline-block;
    width: {width}px;
    margin: 16px;
    border-radius: 10px;
    overflow: hidden;
    background: {background};
    box-shadow: 0 8px 24px rgba(0, 0, 0, 0.35);
  }}
  .titlebar {{ height: 28px; background: {chrome}; display: flex; align-items: center; padding-left: 12px; gap: 8px; }}
  .dot {{ width: 12px; height: 12px; border-radius: 50%; }}
  pre {{
    margin: 0;
    padding: 16px 20px;
    color: {foreground};
    font-family: "JetBrains Mono", "Fira Code", Menlo, Consolas, monospace;
    font-size: 14px;
    line-height: 1.5;
    white-space: pre-wrap;
    word-break: break-all;
  }}
  .prompt {{ color: {prompt_color}; font-weight: bold; }}
</style>
</head>
<body>
<div id="terminal" class="theme-{name}">
  <div class="titlebar"><span class="dot" style="background:#ff5f56"></span><span class="dot" style="background:#ffbd2e"></span><span class="dot" style="background:#27c93f"></span></div>
  <pre>{body}</pre>
</div>
</body>
</html>
"#,
        width = width,
        background = theme.background,
        chrome = theme.chrome,
        foreground = theme.foreground,
        prompt_color = theme.prompt,
        name = theme.name,
        body = body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn output(stdout: &str, stderr: &str) -> CommandExecutionResult {
        CommandExecutionResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(0),
            duration: Duration::from_millis(5),
            timed_out: false,
            truncated: false,
        }
    }

    #[test]
    fn test_plain_text_is_escaped() {
        let theme = TerminalTheme::dark();
        assert_eq!(
            ansi_to_html("<b>\"a\" & 'b'</b>", &theme),
            "&lt;b&gt;&quot;a&quot; &amp; &#39;b&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_basic_colors_and_reset() {
        let theme = TerminalTheme::dark();
        let html = ansi_to_html("\u{1b}[31merror\u{1b}[0m done", &theme);
        assert_eq!(html, "<span style=\"color:#f38ba8;\">error</span> done");
    }

    #[test]
    fn test_bold_bright_and_extended_colors() {
        let theme = TerminalTheme::light();

        let html = ansi_to_html("\u{1b}[1;92mok\u{1b}[m", &theme);
        assert_eq!(html, "<span style=\"color:#40a02b;font-weight:bold;\">ok</span>");

        let html = ansi_to_html("\u{1b}[38;5;196mred\u{1b}[39m", &theme);
        assert_eq!(html, "<span style=\"color:#ff0000;\">red</span>");

        let html = ansi_to_html("\u{1b}[48;2;1;2;3mx", &theme);
        assert_eq!(html, "<span style=\"background-color:#010203;\">x</span>");
    }

    #[test]
    fn test_non_sgr_sequences_are_dropped() {
        let theme = TerminalTheme::dark();
        assert_eq!(ansi_to_html("a\u{1b}[2Kb\u{1b}]0;title\u{7}c", &theme), "abc");
        assert_eq!(ansi_to_html("line\r\nnext\rover", &theme), "line\nnext\nover");
    }

    #[test]
    fn test_document_contains_prompt_and_streams() {
        let theme = TerminalTheme::by_name("LIGHT");
        let prompt = PromptOptions {
            show_prompt: true,
            prompt_text: "~ >".to_string(),
        };

        let doc = render_document("npx cowsay <hi>", &output("out\n", "warn\n"), &theme, &prompt, 720);

        assert!(doc.contains("id=\"terminal\""));
        assert!(doc.contains("theme-light"));
        assert!(doc.contains("width: 720px"));
        assert!(doc.contains("<span class=\"prompt\">~ &gt;</span> <span class=\"command\">npx cowsay &lt;hi&gt;</span>\nout\nwarn</pre>"));
    }

    #[test]
    fn test_document_without_prompt() {
        let doc = render_document(
            "echo hi",
            &output("hi\n", ""),
            &TerminalTheme::dark(),
            &PromptOptions {
                show_prompt: false,
                ..Default::default()
            },
            880,
        );

        assert!(!doc.contains("class=\"prompt\""));
        assert!(doc.contains("<pre>hi</pre>"));
    }
}
