//! Human-readable rendering of configuration errors.

use std::io::IsTerminal;
use std::io::Write;

use ariadne::Color;
use ariadne::Label;
use ariadne::Report;
use ariadne::ReportKind;
use ariadne::Source;

use crate::config::ConfigError;

/// Format a configuration error for stderr, colored when stderr is a terminal.
pub fn format_config_error(error: &ConfigError) -> String {
    format_config_error_with(error, std::io::stderr().is_terminal())
}

/// Format a configuration error.
///
/// Parse errors that carry a span are rendered with Ariadne against the config source;
/// everything else falls back to a single framed line.
pub fn format_config_error_with(error: &ConfigError, color: bool) -> String {
    let mut output = Vec::new();

    match error {
        ConfigError::Parse {
            path,
            message,
            span: Some(span),
            content,
        } => {
            let file_id = path.to_string_lossy().to_string();
            let report = Report::build(ReportKind::Error, (file_id.clone(), span.clone()))
                .with_config(ariadne::Config::default().with_color(color))
                .with_message("Failed to parse config file")
                .with_label(
                    Label::new((file_id.clone(), span.clone()))
                        .with_message(message.trim_end())
                        .with_color(Color::Red),
                )
                .finish();

            report
                .write((file_id, Source::from(content.clone())), &mut output)
                .ok();
        }
        ConfigError::Parse { path, message, .. } => {
            let location = path.display().to_string();
            write_framed(&mut output, color, "Failed to parse config file", &location, message);
        }
        ConfigError::Io(path, e) => {
            let location = path.display().to_string();
            write_framed(
                &mut output,
                color,
                "Failed to read config file",
                &location,
                &e.to_string(),
            );
        }
        ConfigError::Invalid(message) => {
            write_framed(&mut output, color, "Invalid configuration", "<config>", message);
        }
    }

    String::from_utf8_lossy(&output).to_string()
}

// Ariadne doesn't render notes well without a source, so errors without a span are
// written by hand in the same shape.
fn write_framed(output: &mut Vec<u8>, color: bool, title: &str, location: &str, note: &str) {
    if color {
        writeln!(output, "\x1b[31mError\x1b[0m: {}", title).ok();
    } else {
        writeln!(output, "Error: {}", title).ok();
    }
    writeln!(output, "  ┌─ {}:1:1", location).ok();
    writeln!(output, "  │").ok();
    writeln!(output, "  = {}", note.trim_end()).ok();
    writeln!(output).ok();
}
