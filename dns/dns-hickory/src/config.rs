//! `resolver_hickory.conf` parsing.
//!
//! The file holds a single `[general]` section of `key = value` lines.
//! `;` and `#` start comments, `nameserver` may repeat and keeps its order.

use nom::IResult;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, multispace0};
use nom::combinator::rest;
use nom::sequence::{delimited, separated_pair};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("line {0} is not a section header or assignment: {1:?}")]
    Syntax(usize, String),
    #[error("unknown option '{0}' in [general]")]
    UnknownOption(String),
    #[error("invalid value for option '{0}': {1:?}")]
    InvalidValue(&'static str, String),
    #[error("invalid nameserver address {0:?}")]
    InvalidNameserver(String),
}

/// A path option which may also name the system default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOrSystem {
    System,
    Path(PathBuf),
}

impl PathOrSystem {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "" => None,
            "system" => Some(Self::System),
            path => Some(Self::Path(PathBuf::from(path))),
        }
    }
}

/// Configuration of the hickory backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HickoryConfig {
    /// Alternate hosts file resolved by the backend itself.
    pub hosts: Option<PathOrSystem>,
    /// resolv.conf supplying fallback nameservers.
    pub resolv: Option<PathOrSystem>,
    /// Explicit nameservers, in preference order, tried before any from
    /// `resolv`.
    pub nameservers: Vec<String>,
    /// Backend debug verbosity.
    pub debug: u32,
    /// DNSSEC trust anchor file.
    pub ta_file: Option<PathBuf>,
}

impl Default for HickoryConfig {
    fn default() -> Self {
        Self {
            hosts: Some(PathOrSystem::System),
            resolv: Some(PathOrSystem::System),
            nameservers: Vec::new(),
            debug: 0,
            ta_file: None,
        }
    }
}

fn section(i: &str) -> IResult<&str, &str> {
    delimited(char('['), take_while1(|c| c != ']'), char(']'))(i)
}

fn assignment(i: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        delimited(multispace0, tag("="), multispace0),
        rest,
    )(i)
}

impl HickoryConfig {
    /// Load the configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse the configuration from its textual form.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut in_general = false;

        for (lineno, line) in input.lines().enumerate() {
            let line = match line.find([';', '#']) {
                Some(comment) => &line[..comment],
                None => line,
            };
            let line = line.trim();

            if line.is_empty() {
                continue;
            }

            if let Ok(("", name)) = section(line) {
                in_general = name.trim() == "general";

                if !in_general {
                    log::warn!("Ignoring unknown section [{}]", name.trim());
                }

                continue;
            }

            let Ok(("", (key, value))) = assignment(line) else {
                return Err(ConfigError::Syntax(lineno + 1, line.to_owned()));
            };

            if !in_general {
                continue;
            }

            let value = value.trim();

            match key {
                "hosts" => config.hosts = PathOrSystem::parse(value),
                "resolv" => config.resolv = PathOrSystem::parse(value),
                "nameserver" => {
                    if value.is_empty() {
                        return Err(ConfigError::InvalidNameserver(value.to_owned()));
                    }
                    config.nameservers.push(value.to_owned());
                }
                "debug" => {
                    config.debug = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("debug", value.to_owned()))?;
                }
                "ta_file" => {
                    config.ta_file = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                unknown => return Err(ConfigError::UnknownOption(unknown.to_owned())),
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_file() {
        let config = HickoryConfig::parse(
            "; resolver backend configuration\n\
             [general]\n\
             hosts = /etc/hosts.alt\n\
             resolv = system\n\
             nameserver = 127.0.0.53\n\
             nameserver = 192.0.2.1:5353 ; backup\n\
             debug = 3\n\
             ta_file = /etc/trust.anchors\n",
        )
        .unwrap();

        assert_eq!(
            config.hosts,
            Some(PathOrSystem::Path(PathBuf::from("/etc/hosts.alt")))
        );
        assert_eq!(config.resolv, Some(PathOrSystem::System));
        assert_eq!(config.nameservers, ["127.0.0.53", "192.0.2.1:5353"]);
        assert_eq!(config.debug, 3);
        assert_eq!(config.ta_file, Some(PathBuf::from("/etc/trust.anchors")));
    }

    #[test]
    fn empty_input_is_the_default() {
        let config = HickoryConfig::parse("").unwrap();

        assert_eq!(config, HickoryConfig::default());
        assert_eq!(config.hosts, Some(PathOrSystem::System));
        assert_eq!(config.resolv, Some(PathOrSystem::System));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let config = HickoryConfig::parse(
            "[transport]\n\
             nameserver = ignored\n\
             [general]\n\
             nameserver = 127.0.0.53\n",
        )
        .unwrap();

        assert_eq!(config.nameservers, ["127.0.0.53"]);
    }

    #[test]
    fn unknown_options_fail() {
        assert!(matches!(
            HickoryConfig::parse("[general]\nhost = /etc/hosts\n"),
            Err(ConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn bad_debug_value_fails() {
        assert!(matches!(
            HickoryConfig::parse("[general]\ndebug = verbose\n"),
            Err(ConfigError::InvalidValue("debug", _))
        ));
    }

    #[test]
    fn garbage_line_fails() {
        assert!(matches!(
            HickoryConfig::parse("[general]\nnameserver\n"),
            Err(ConfigError::Syntax(2, _))
        ));
    }

    #[test]
    fn empty_values_unset_the_paths() {
        let config = HickoryConfig::parse("[general]\nhosts =\n").unwrap();

        assert_eq!(config.hosts, None);
    }
}
