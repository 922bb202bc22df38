#![forbid(unsafe_code)]

//! Resolved server configuration. The core consumes these values at
//! construction time; parsing is a plain `--flag value` walk.

use std::fmt;

pub const DEFAULT_BIND: &str = "127.0.0.1:6410";
pub const DEFAULT_DATABASES: usize = 16;
pub const DEFAULT_FILENAME: &str = "quasar.qsdb";

/// One persistence trigger: save when at least `changes` writes
/// happened and `seconds` have passed since the last save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    pub seconds: u64,
    pub changes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub databases: usize,
    pub password: Option<Vec<u8>>,
    pub filename: String,
    /// Empty list disables periodic saving (and snapshot loading).
    pub save_points: Vec<SavePoint>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_owned(),
            databases: DEFAULT_DATABASES,
            password: None,
            filename: DEFAULT_FILENAME.to_owned(),
            save_points: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingValue(String),
    InvalidValue { flag: String, value: String },
    UnknownFlag(String),
    OddSavePairs(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingValue(flag) => write!(f, "flag {flag} needs a value"),
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value {value:?} for {flag}")
            }
            ConfigError::UnknownFlag(flag) => write!(f, "unknown flag {flag}"),
            ConfigError::OddSavePairs(spec) => {
                write!(f, "save spec {spec:?} is not a list of pairs")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Parse command-line style arguments (program name excluded).
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Config::default();
        let mut iter = args.into_iter();
        while let Some(flag) = iter.next() {
            let flag = flag.as_ref().to_owned();
            let mut value_for = |flag: &str| {
                iter.next()
                    .map(|v| v.as_ref().to_owned())
                    .ok_or_else(|| ConfigError::MissingValue(flag.to_owned()))
            };
            match flag.as_str() {
                "--bind" => config.bind = value_for(&flag)?,
                "--databases" => {
                    let raw = value_for(&flag)?;
                    config.databases = raw.parse().map_err(|_| ConfigError::InvalidValue {
                        flag,
                        value: raw,
                    })?;
                }
                "--password" => {
                    let raw = value_for(&flag)?;
                    config.password = if raw.is_empty() {
                        None
                    } else {
                        Some(raw.into_bytes())
                    };
                }
                "--filename" => config.filename = value_for(&flag)?,
                "--save" => {
                    let raw = value_for(&flag)?;
                    config.save_points = parse_save_points(&raw)?;
                }
                unknown => return Err(ConfigError::UnknownFlag(unknown.to_owned())),
            }
        }
        Ok(config)
    }

    /// Whether snapshots are enabled at all.
    #[must_use]
    pub fn persistence_enabled(&self) -> bool {
        !self.save_points.is_empty()
    }
}

/// Parse `"900 1 300 10"` into save points. An empty spec disables
/// saving.
pub fn parse_save_points(spec: &str) -> Result<Vec<SavePoint>, ConfigError> {
    let fields: Vec<&str> = spec.split_whitespace().collect();
    if fields.len() % 2 != 0 {
        return Err(ConfigError::OddSavePairs(spec.to_owned()));
    }
    let mut points = Vec::with_capacity(fields.len() / 2);
    for pair in fields.chunks(2) {
        let seconds = pair[0].parse().map_err(|_| ConfigError::InvalidValue {
            flag: "--save".to_owned(),
            value: pair[0].to_owned(),
        })?;
        let changes = pair[1].parse().map_err(|_| ConfigError::InvalidValue {
            flag: "--save".to_owned(),
            value: pair[1].to_owned(),
        })?;
        points.push(SavePoint { seconds, changes });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError, SavePoint, parse_save_points};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.bind, "127.0.0.1:6410");
        assert_eq!(config.databases, 16);
        assert_eq!(config.password, None);
        assert!(!config.persistence_enabled());
    }

    #[test]
    fn parses_flags() {
        let config = Config::from_args([
            "--bind",
            "0.0.0.0:7000",
            "--databases",
            "4",
            "--password",
            "sesame",
            "--save",
            "900 1 300 10",
        ])
        .expect("parse");
        assert_eq!(config.bind, "0.0.0.0:7000");
        assert_eq!(config.databases, 4);
        assert_eq!(config.password, Some(b"sesame".to_vec()));
        assert_eq!(
            config.save_points,
            vec![
                SavePoint { seconds: 900, changes: 1 },
                SavePoint { seconds: 300, changes: 10 },
            ]
        );
        assert!(config.persistence_enabled());
    }

    #[test]
    fn empty_password_means_disabled() {
        let config = Config::from_args(["--password", ""]).expect("parse");
        assert_eq!(config.password, None);
    }

    #[test]
    fn rejects_unknown_flag_and_missing_value() {
        assert_eq!(
            Config::from_args(["--nope"]),
            Err(ConfigError::UnknownFlag("--nope".to_owned()))
        );
        assert_eq!(
            Config::from_args(["--bind"]),
            Err(ConfigError::MissingValue("--bind".to_owned()))
        );
    }

    #[test]
    fn save_spec_must_pair_up() {
        assert!(matches!(
            parse_save_points("900 1 300"),
            Err(ConfigError::OddSavePairs(_))
        ));
        assert_eq!(parse_save_points("").expect("empty"), Vec::new());
    }
}
