//! Runtime configuration for pipes and their reactor.
//!
//! Values are resolved with [`figment`], in increasing priority:
//!
//! 1. [`PipeConfig::default`]
//! 2. `pipekit.toml` in the current directory, or the file named by `PIPEKIT_CONFIG`
//! 3. `PIPEKIT_*` environment variables, e.g. `PIPEKIT_READ_CHUNK_SIZE=16384`

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt};

/// Settings shared by every pipe registered with an [`IoContext`](crate::IoContext).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// How many bytes a single non-blocking read asks the OS for.
    pub read_chunk_size: usize,
    /// Permission bits for FIFOs created by [`AsyncPipe::named`](crate::AsyncPipe::named), before
    /// the process umask is applied.
    pub fifo_mode: u32,
}

impl PipeConfig {
    /// The default config file name.
    pub const FILE_NAME: &'static str = "pipekit.toml";

    /// Prefix of the environment variables that override config values.
    pub const ENV_PREFIX: &'static str = "PIPEKIT_";

    /// Default for [`read_chunk_size`](Self::read_chunk_size).
    pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

    /// Default for [`fifo_mode`](Self::fifo_mode).
    pub const DEFAULT_FIFO_MODE: u32 = 0o600;

    /// Loads the config from the default providers.
    ///
    /// See [`figment`](Self::figment) for the provider order.
    pub fn load() -> Result<Self, ExtractConfigError> {
        Self::try_from(Self::figment())
    }

    /// Returns the default figment: defaults, then the toml file, then the environment.
    pub fn figment() -> Figment {
        let file = Env::var_or("PIPEKIT_CONFIG", Self::FILE_NAME);
        Figment::from(Self::default())
            .merge(Toml::file(file))
            .merge(Env::prefixed(Self::ENV_PREFIX).ignore(&["CONFIG"]))
    }

    /// Attempts to extract a `PipeConfig` from `provider`.
    pub fn try_from<T: Provider>(provider: T) -> Result<Self, ExtractConfigError> {
        let config: Self = Figment::from(provider).extract().map_err(ExtractConfigError::new)?;
        config.validate()?;
        trace!(?config, "loaded pipe config");
        Ok(config)
    }

    fn validate(&self) -> Result<(), ExtractConfigError> {
        if self.read_chunk_size == 0 {
            return Err(ExtractConfigError::new(figment::Error::from(String::from(
                "`read_chunk_size` must be greater than 0",
            ))));
        }
        if self.fifo_mode & !0o7777 != 0 {
            return Err(ExtractConfigError::new(figment::Error::from(format!(
                "`fifo_mode` {:#o} is not a permission mask",
                self.fifo_mode
            ))));
        }
        Ok(())
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: Self::DEFAULT_READ_CHUNK_SIZE,
            fifo_mode: Self::DEFAULT_FIFO_MODE,
        }
    }
}

impl Provider for PipeConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("pipekit config")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

/// A failed attempt to extract a [`PipeConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractConfigError {
    error: figment::Error,
}

impl ExtractConfigError {
    /// Wraps the figment error.
    pub fn new(error: figment::Error) -> Self {
        Self { error }
    }
}

impl fmt::Display for ExtractConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to extract pipekit config: {}", self.error)?;
        if !self.error.path.is_empty() {
            write!(f, " for setting `{}`", self.error.path.join("."))?;
        }
        Ok(())
    }
}

impl Error for ExtractConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Error::source(&self.error)
    }
}
