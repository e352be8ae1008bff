//! `tessera.toml` and environment overrides.
//!
//! ```toml
//! [render]
//! beam = 0
//! noopt = false
//! devectorize = 0
//!
//! [realize]
//! fanout = 2
//! expanded_reduce = true
//!
//! [rewrite]
//! max_steps = 100000
//!
//! [run]
//! wait = false
//! ```

use std::path::{Path, PathBuf};

use crate::device::RenderContext;
use crate::diagnostic::Diagnostic;
use crate::kernelize::{KernelizeOptions, RealizePolicy};
use crate::rewrite::DEFAULT_MAX_STEPS;
use crate::span::Span;

pub const CONFIG_FILE: &str = "tessera.toml";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub render: RenderContext,
    pub policy: RealizePolicy,
    /// Step budget of each rewrite pass.
    pub max_steps: usize,
    /// Wait for every kernel and time it.
    pub wait: bool,
    /// Where the file settings came from, if anywhere.
    pub path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            render: RenderContext::default(),
            policy: RealizePolicy::default(),
            max_steps: DEFAULT_MAX_STEPS,
            wait: false,
            path: None,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str, span: Span) -> Result<T, Diagnostic> {
    value
        .trim_matches('"')
        .parse()
        .map_err(|_| Diagnostic::error(format!("invalid value '{}' for '{}'", value, key), span))
}

/// Environment variables that override file settings.
const ENV_KEYS: [(&str, &str, &str); 5] = [
    ("TESSERA_BEAM", "render", "beam"),
    ("TESSERA_NOOPT", "render", "noopt"),
    ("TESSERA_DEVECTORIZE", "render", "devectorize"),
    ("TESSERA_FANOUT", "realize", "fanout"),
    ("TESSERA_MAX_STEPS", "rewrite", "max_steps"),
];

impl Config {
    pub fn kernelize_options(&self) -> KernelizeOptions {
        KernelizeOptions {
            policy: self.policy,
            max_steps: self.max_steps,
        }
    }

    fn set(&mut self, section: &str, key: &str, value: &str, span: Span) -> Result<(), Diagnostic> {
        match (section, key) {
            ("render", "beam") => self.render.beam = parse_value(key, value, span)?,
            ("render", "noopt") => self.render.noopt = parse_flag(key, value, span)?,
            ("render", "devectorize") => self.render.devectorize = parse_value(key, value, span)?,
            ("realize", "fanout") => self.policy.fanout = parse_value(key, value, span)?,
            ("realize", "expanded_reduce") => {
                self.policy.expanded_reduce = parse_flag(key, value, span)?
            }
            ("rewrite", "max_steps") => {
                let steps: usize = parse_value(key, value, span)?;
                if steps == 0 {
                    return Err(Diagnostic::error("'max_steps' must be positive", span));
                }
                self.max_steps = steps;
            }
            ("run", "wait") => self.wait = parse_flag(key, value, span)?,
            _ => tracing::warn!(section, key, "ignoring unknown config key"),
        }
        Ok(())
    }

    /// Parse the contents of a config file. Spans in errors are byte
    /// offsets into `content`.
    pub fn parse(content: &str) -> Result<Config, Diagnostic> {
        let mut config = Config::default();
        let mut section = String::new();
        let mut offset = 0;

        for line in content.split_inclusive('\n') {
            let start = offset;
            offset += line.len();
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            let lead = line.len() - line.trim_start().len();
            let span = Span::new((start + lead) as u32, (start + lead + trimmed.len()) as u32);

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Diagnostic::error("expected 'key = value'", span));
            };
            let key = key.trim().trim_matches('"');
            // trailing comments
            let value = value.split('#').next().unwrap_or("").trim();
            config.set(&section, key, value, span)?;
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(format!("cannot read '{}': {}", path.display(), e), Span::dummy())
        })?;
        let mut config = Config::parse(&content)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Find a `tessera.toml` in `start_dir` or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), Diagnostic> {
        for (var, section, key) in ENV_KEYS {
            if let Some(value) = lookup(var) {
                tracing::debug!(var, %value, "config override");
                self.set(section, key, value.trim(), Span::dummy())
                    .map_err(|d| d.with_note(format!("from environment variable {}", var)))?;
            }
        }
        Ok(())
    }

    pub fn with_env(mut self) -> Result<Config, Diagnostic> {
        self.apply_env(|var| std::env::var(var).ok())?;
        Ok(self)
    }
}

/// `true`/`false`, or `1`/`0` as environment variables spell them.
fn parse_flag(key: &str, value: &str, span: Span) -> Result<bool, Diagnostic> {
    match value.trim_matches('"') {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Diagnostic::error(format!("invalid value '{}' for '{}'", value, key), span)
            .with_help("expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.kernelize_options(), KernelizeOptions::default());
    }

    #[test]
    fn test_all_sections() {
        let config = Config::parse(
            r#"# tuning
[render]
beam = 4
noopt = true
devectorize = 2

[realize]
fanout = 0
expanded_reduce = false # keep them fused

[rewrite]
max_steps = 500

[run]
wait = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.render,
            RenderContext {
                beam: 4,
                noopt: true,
                devectorize: 2,
            }
        );
        assert_eq!(config.policy.fanout, 0);
        assert!(!config.policy.expanded_reduce);
        assert_eq!(config.max_steps, 500);
        assert!(config.wait);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = Config::parse("[render]\ncolor = \"blue\"\n[other]\nbeam = 9\n").unwrap();
        assert_eq!(config.render.beam, 0);
    }

    #[test]
    fn test_bad_value_points_at_the_line() {
        let content = "[render]\nbeam = lots\n";
        let err = Config::parse(content).unwrap_err();
        assert_eq!(err.message, "invalid value 'lots' for 'beam'");
        assert_eq!(&content[err.span.range()], "beam = lots");
        assert!(Config::parse("[rewrite]\nmax_steps = 0\n").is_err());
        assert!(Config::parse("[run]\nwait\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::parse("[render]\nbeam = 4\n[realize]\nfanout = 3\n").unwrap();
        let env: HashMap<&str, &str> = [("TESSERA_BEAM", "8"), ("TESSERA_NOOPT", "1")].into();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.render.beam, 8);
        assert!(config.render.noopt);
        assert_eq!(config.policy.fanout, 3);

        let err = config
            .apply_env(|k| (k == "TESSERA_MAX_STEPS").then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(err.notes, vec!["from environment variable TESSERA_MAX_STEPS"]);
    }

    #[test]
    fn test_load_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[run]\nwait = true\n").unwrap();
        let nested = dir.path().join("models").join("small");
        fs::create_dir_all(&nested).unwrap();

        let found = Config::find(&nested).unwrap();
        assert_eq!(found, path);
        let config = Config::load(&found).unwrap();
        assert!(config.wait);
        assert_eq!(config.path.as_deref(), Some(path.as_path()));

        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }
}
