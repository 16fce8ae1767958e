//! Styled diagnostic output.
//!
//! Uses `termcolor` for cross-platform colored terminal output and
//! honors the `NO_COLOR` environment variable.

use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Resolve the color choice from the environment.
pub fn resolve_color_choice() -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        ColorChoice::Never
    } else {
        ColorChoice::Auto
    }
}

/// Diagnostic sink: collected user errors print with a short styled
/// prefix on stderr.
pub struct Diagnostics {
    stderr: StandardStream,
}

impl Diagnostics {
    pub fn new(choice: ColorChoice) -> Self {
        Self {
            stderr: StandardStream::stderr(choice),
        }
    }

    /// One `error: message` line.
    pub fn error(&mut self, message: &str) {
        let mut spec = ColorSpec::new();
        spec.set_fg(Some(Color::Red)).set_bold(true);
        let _ = self.stderr.set_color(&spec);
        let _ = write!(self.stderr, "error");
        let _ = self.stderr.reset();
        let _ = writeln!(self.stderr, ": {}", message);
    }

    /// Print every collected message, in order.
    pub fn report_all(&mut self, messages: &[String]) {
        for m in messages {
            self.error(m);
        }
    }
}
