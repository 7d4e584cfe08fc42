//! Parses the environment into a `Configuration`.
//!
//! Reads `ASAN_OPTIONS` (for `coverage` and `coverage_dir`),
//! `TRACE_NONCONST_CMP`, and `TRACE_MEMORY_CMP`. See the module-level
//! tokenizer contract in `tokenize_asan_options` for exact parsing rules.

use std::path::PathBuf;

use anyhow::{bail, Result};

/// Immutable configuration, parsed once at lazy-init time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    pub enabled: bool,
    pub trace_nonconst_cmp: bool,
    pub trace_memory_cmp: bool,
    pub output_dir: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enabled: false,
            trace_nonconst_cmp: false,
            trace_memory_cmp: true,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Configuration {
    /// Parses a `Configuration` from the three recognized environment
    /// variables, taking their raw string values so that callers (and
    /// tests) don't need to mutate the real process environment.
    pub fn parse(
        asan_options: Option<&str>,
        trace_nonconst_cmp: Option<&str>,
        trace_memory_cmp: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(asan_options) = asan_options {
            for (key, value) in parse_asan_options(asan_options)? {
                match key.as_str() {
                    "coverage" => {
                        config.enabled = parse_env_int(&value) != 0;
                    }
                    "coverage_dir" if !value.is_empty() => {
                        config.output_dir = PathBuf::from(value);
                    }
                    "coverage_dir" => {}
                    other => {
                        log::debug!("ignoring unrecognized ASAN_OPTIONS key: {}", other);
                    }
                }
            }
        }

        if let Some(value) = trace_nonconst_cmp {
            config.trace_nonconst_cmp = parse_env_int(value) != 0;
        }

        if let Some(value) = trace_memory_cmp {
            // Inverted polarity: presence of a zero disables; any other
            // value (including unparsable garbage) leaves the default on.
            if parse_env_int(value) == 0 {
                config.trace_memory_cmp = false;
            }
        }

        Ok(config)
    }

    /// Parses a `Configuration` directly from the real process environment.
    pub fn from_env() -> Result<Self> {
        let asan_options = std::env::var("ASAN_OPTIONS").ok();
        let trace_nonconst_cmp = std::env::var("TRACE_NONCONST_CMP").ok();
        let trace_memory_cmp = std::env::var("TRACE_MEMORY_CMP").ok();

        Self::parse(
            asan_options.as_deref(),
            trace_nonconst_cmp.as_deref(),
            trace_memory_cmp.as_deref(),
        )
    }
}

/// Interprets an environment variable's string value as an integer for
/// the purposes of a boolean "is it non-zero" check. Unparsable values
/// are treated as zero rather than rejected, matching the permissive
/// handling real sanitizer runtimes apply to these toggles.
fn parse_env_int(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

/// Splits an `ASAN_OPTIONS`-style string into `(key, value)` pairs.
///
/// Contract: splits on `,` at the top level and on the first `=` within
/// each token; does not trim whitespace around keys/values; a value may
/// be wrapped in matching `'` or `"` quotes, in which case a `,` inside
/// the quotes does not end the token. An unterminated quote is a fatal
/// parse error. Empty input yields zero pairs. A token with no `=` is
/// treated as a key with an empty value.
fn parse_asan_options(options: &str) -> Result<Vec<(String, String)>> {
    let tokens = tokenize(options)?;

    Ok(tokens
        .into_iter()
        .filter(|tok| !tok.is_empty())
        .map(|tok| match tok.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (tok, String::new()),
        })
        .collect())
}

fn tokenize(options: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in options.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                ',' => tokens.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }

    if quote.is_some() {
        bail!("malformed ASAN_OPTIONS: unterminated quote");
    }

    tokens.push(current);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_disabled() {
        let config = Configuration::parse(None, None, None).unwrap();
        assert!(!config.enabled);
        assert!(!config.trace_nonconst_cmp);
        assert!(config.trace_memory_cmp);
        assert_eq!(config.output_dir, PathBuf::from("."));
    }

    #[test]
    fn coverage_enables() {
        let config = Configuration::parse(Some("coverage=1"), None, None).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn coverage_zero_stays_disabled() {
        let config = Configuration::parse(Some("coverage=0"), None, None).unwrap();
        assert!(!config.enabled);
    }

    #[test]
    fn coverage_dir_is_parsed() {
        let config = Configuration::parse(Some("coverage=1,coverage_dir=/tmp/cov"), None, None)
            .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/cov"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config =
            Configuration::parse(Some("coverage=1,some_other_key=5"), None, None).unwrap();
        assert!(config.enabled);
    }

    #[test]
    fn quoted_value_can_contain_commas() {
        let pairs = parse_asan_options("coverage_dir='/tmp/a,b',coverage=1").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("coverage_dir".to_string(), "/tmp/a,b".to_string()),
                ("coverage".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn unterminated_quote_is_fatal() {
        assert!(parse_asan_options("coverage_dir='/tmp/a").is_err());
    }

    #[test]
    fn empty_input_yields_no_pairs() {
        assert!(parse_asan_options("").unwrap().is_empty());
    }

    #[test]
    fn trace_nonconst_cmp_overrides() {
        let config = Configuration::parse(None, Some("1"), None).unwrap();
        assert!(config.trace_nonconst_cmp);
    }

    #[test]
    fn trace_memory_cmp_zero_disables() {
        let config = Configuration::parse(None, None, Some("0")).unwrap();
        assert!(!config.trace_memory_cmp);
    }

    #[test]
    fn trace_memory_cmp_nonzero_leaves_default_on() {
        let config = Configuration::parse(None, None, Some("5")).unwrap();
        assert!(config.trace_memory_cmp);
    }
}
