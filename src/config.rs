//! Configuration of the signer, and logging set up from it.
use std::{
    collections::HashSet,
    env, fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::LevelFilter;
use serde::{de, Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::{commons::util::ext_serde, constants::*};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn data_dir() -> PathBuf {
        match env::var(SIGNER_ENV_DATA_DIR) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from("./data"),
        }
    }

    fn log_level() -> LevelFilter {
        match env::var(SIGNER_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}, using info",
                        SIGNER_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./secsigner.log")
    }

    #[cfg(unix)]
    fn syslog_facility() -> Facility {
        Facility::LOG_DAEMON
    }

    fn workers() -> usize {
        4
    }

    fn soft_token_enabled() -> bool {
        true
    }

    fn softtoken_pbkdf2_iterations() -> u32 {
        100_000
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the signer.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "ext_serde::de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[cfg(unix)]
    #[serde(
        default = "ConfigDefaults::syslog_facility",
        deserialize_with = "ext_serde::de_facility"
    )]
    pub syslog_facility: Facility,

    /// The number of requests handled concurrently.
    #[serde(default = "ConfigDefaults::workers")]
    pub workers: usize,

    #[serde(default = "ConfigDefaults::soft_token_enabled")]
    pub soft_token_enabled: bool,

    #[serde(default = "ConfigDefaults::softtoken_pbkdf2_iterations")]
    pub softtoken_pbkdf2_iterations: u32,

    #[serde(default)]
    pub pkcs11_modules: Vec<Pkcs11ModuleConfig>,
}

/// A PKCS#11 library to load, and the name its tokens are known by.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Pkcs11ModuleConfig {
    pub name: String,
    pub lib_path: PathBuf,
}

impl Config {
    /// A config using all defaults, for the given data dir.
    pub fn defaults(data_dir: &Path) -> Self {
        Config {
            data_dir: data_dir.to_path_buf(),
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            #[cfg(unix)]
            syslog_facility: ConfigDefaults::syslog_facility(),
            workers: ConfigDefaults::workers(),
            soft_token_enabled: ConfigDefaults::soft_token_enabled(),
            softtoken_pbkdf2_iterations: ConfigDefaults::softtoken_pbkdf2_iterations(),
            pkcs11_modules: vec![],
        }
    }

    /// Creates the config at startup.
    ///
    /// A missing config file is only acceptable at the default location,
    /// in which case all defaults are used.
    pub fn create(config_file: &Path) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Ok(config) => config,
            Err(ConfigError::IoError(e))
                if e.kind() == io::ErrorKind::NotFound && config_file == Path::new(SIGNER_DEFAULT_CONFIG_FILE) =>
            {
                Self::parse("")?
            }
            Err(e) => {
                return Err(ConfigError::Other(format!(
                    "Error parsing config file: {}, error: {}",
                    config_file.display(),
                    e
                )));
            }
        };

        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error in config file: {}, error: {}",
                config_file.display(),
                e
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(file)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::other("workers must be at least 1"));
        }

        if self.softtoken_pbkdf2_iterations == 0 {
            return Err(ConfigError::other("softtoken_pbkdf2_iterations must be at least 1"));
        }

        let mut names = HashSet::new();
        for module in &self.pkcs11_modules {
            if module.name.is_empty() {
                return Err(ConfigError::other("pkcs11_modules entries must have a name"));
            }
            if module.name == SOFT_TOKEN_KIND {
                return Err(ConfigError::Other(format!(
                    "pkcs11 module name '{}' is reserved for the software token",
                    SOFT_TOKEN_KIND
                )));
            }
            if !names.insert(module.name.as_str()) {
                return Err(ConfigError::Other(format!(
                    "duplicate pkcs11 module name '{}'",
                    module.name
                )));
            }
        }

        if !self.pkcs11_modules.is_empty() && !cfg!(feature = "hsm") {
            return Err(ConfigError::other(
                "pkcs11_modules are configured, but this build does not include the hsm feature",
            ));
        }

        if !self.soft_token_enabled && self.pkcs11_modules.is_empty() {
            return Err(ConfigError::other(
                "no devices configured: enable the soft token or add pkcs11_modules",
            ));
        }

        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => self.syslog_logger(self.syslog_facility),
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("syslog is only supported on unix")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fern::log_file(path)
            .map_err(|e| ConfigError::Other(format!("Failed to open log file '{}': {}", path.display(), e)))?;
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("secsigner"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => Err(ConfigError::Other(format!("Cannot connect to syslog: {}", err))),
        }
    }

    /// Creates a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
            .level_for("cryptoki", framework_level)
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
