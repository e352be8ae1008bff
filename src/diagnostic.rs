use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use crate::span::Span;

/// An error or warning about a graph source file.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            span,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message, span)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    fn report<'a>(&self, filename: &'a str, color: bool) -> Report<'static, (&'a str, std::ops::Range<usize>)> {
        let (kind, tint) = match self.severity {
            Severity::Error => (ReportKind::Error, Color::Red),
            Severity::Warning => (ReportKind::Warning, Color::Yellow),
        };
        let mut report = Report::build(kind, filename, self.span.start as usize)
            .with_config(Config::default().with_color(color))
            .with_message(&self.message)
            .with_label(
                Label::new((filename, self.span.range()))
                    .with_message(&self.message)
                    .with_color(tint),
            );
        for note in &self.notes {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }
        report.finish()
    }

    /// Render to stderr.
    pub fn render(&self, filename: &str, source: &str) {
        // stderr going away is not worth a panic
        let _ = self
            .report(filename, true)
            .eprint((filename, Source::from(source)));
    }

    /// Render without colors, for logs and tests.
    pub fn to_text(&self, filename: &str, source: &str) -> String {
        let mut out = Vec::new();
        if self
            .report(filename, false)
            .write((filename, Source::from(source)), &mut out)
            .is_err()
        {
            return self.message.clone();
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

pub fn render_diagnostics(diagnostics: &[Diagnostic], filename: &str, source: &str) {
    for diag in diagnostics {
        diag.render(filename, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let d = Diagnostic::warning("unused node", Span::new(0, 5))
            .with_note("note 1")
            .with_help("add it to `out`")
            .with_note("note 2");
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.notes, vec!["note 1", "note 2"]);
        assert_eq!(d.help.as_deref(), Some("add it to `out`"));
    }

    #[test]
    fn test_text_rendering() {
        let source = "a = buffer HOST f32 16\nb = nope a\n";
        let d = Diagnostic::error("unknown op 'nope'", Span::new(27, 31))
            .with_help("see the list of ops");
        let text = d.to_text("model.tg", source);
        assert!(text.contains("unknown op 'nope'"));
        assert!(text.contains("model.tg"));
        assert!(text.contains("see the list of ops"));
    }

    #[test]
    fn test_span_line() {
        let source = "a\nbb\nccc\n";
        assert_eq!(Span::new(0, 1).line(source), 1);
        assert_eq!(Span::new(5, 8).line(source), 3);
        assert_eq!(Span::new(2, 4).merge(Span::new(0, 1)), Span::new(0, 4));
    }
}
