//! Config for stream processing: restarts, retries and where processor state is kept.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eventstream_processor::StreamProcessorsConfig;
use eventstream_processor::retry::{Backoff, RetryPolicy};
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use observability_deps::tracing::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the file state store needs a directory, set --state-dir")]
    MissingStateDir,

    #[error("unable to create state directory {path}: {source}")]
    CreateStateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to open state directory {path}: {source}")]
    OpenStateDir {
        path: PathBuf,
        source: object_store::Error,
    },

    #[error("max retry delay {max:?} is less than the base retry delay {base:?}")]
    InvalidRetryDelays { base: Duration, max: Duration },
}

/// How failed events are retried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RetryBackoff {
    /// Wait the base delay before every retry
    Fixed,
    /// Double the delay with every retry of the same event
    #[default]
    Exponential,
}

impl From<RetryBackoff> for Backoff {
    fn from(value: RetryBackoff) -> Self {
        match value {
            RetryBackoff::Fixed => Self::Fixed,
            RetryBackoff::Exponential => Self::Exponential,
        }
    }
}

/// Where stream processor state is kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StateStoreType {
    /// Keep state in memory, it is lost on restart
    #[default]
    Memory,
    /// Keep state as files in the state directory
    File,
}

/// CLI config for hosting stream processors.
#[derive(Debug, Clone, clap::Parser)]
pub struct StreamProcessingConfig {
    /// How long to wait before restarting a stream processor that failed to read its stream or
    /// persist its state.
    #[clap(
        long = "processor-restart-delay",
        env = "EVENTSTREAM_PROCESSOR_RESTART_DELAY",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub processor_restart_delay: Duration,

    /// How the delay between retries of a failed event grows.
    #[clap(
        long = "retry-backoff",
        env = "EVENTSTREAM_RETRY_BACKOFF",
        default_value_t = RetryBackoff::default(),
        value_enum,
        action
    )]
    pub retry_backoff: RetryBackoff,

    /// Delay before the first retry of a failed event.
    #[clap(
        long = "retry-base-delay",
        env = "EVENTSTREAM_RETRY_BASE_DELAY",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_base_delay: Duration,

    /// Longest delay between two retries of a failed event.
    #[clap(
        long = "retry-max-delay",
        env = "EVENTSTREAM_RETRY_MAX_DELAY",
        default_value = "1m",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_max_delay: Duration,

    /// Park an event after this many failed retries. Retries forever if not set.
    #[clap(
        long = "retry-max-retries",
        env = "EVENTSTREAM_RETRY_MAX_RETRIES",
        action
    )]
    pub retry_max_retries: Option<u32>,

    /// Where to keep stream processor state.
    #[clap(
        long = "state-store",
        env = "EVENTSTREAM_STATE_STORE",
        default_value_t = StateStoreType::default(),
        value_enum,
        action
    )]
    pub state_store: StateStoreType,

    /// Directory for the file state store.
    #[clap(long = "state-dir", env = "EVENTSTREAM_STATE_DIR", action)]
    pub state_dir: Option<PathBuf>,
}

impl StreamProcessingConfig {
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::InvalidRetryDelays {
                base: self.retry_base_delay,
                max: self.retry_max_delay,
            });
        }
        Ok(RetryPolicy {
            backoff: self.retry_backoff.into(),
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            max_retries: self.retry_max_retries,
        })
    }

    pub fn processors_config(&self) -> StreamProcessorsConfig {
        StreamProcessorsConfig {
            restart_delay: self.processor_restart_delay,
        }
    }

    /// The object store to keep stream processor state in
    pub fn object_store(&self) -> Result<Arc<dyn ObjectStore>, ConfigError> {
        match self.state_store {
            StateStoreType::Memory => {
                info!("Stream processor state store: In-memory");
                Ok(Arc::new(InMemory::new()))
            }
            StateStoreType::File => {
                let path = self.state_dir.clone().ok_or(ConfigError::MissingStateDir)?;
                std::fs::create_dir_all(&path).map_err(|source| ConfigError::CreateStateDir {
                    path: path.clone(),
                    source,
                })?;
                let store = LocalFileSystem::new_with_prefix(&path)
                    .map_err(|source| ConfigError::OpenStateDir {
                        path: path.clone(),
                        source,
                    })?;
                info!("Stream processor state store: File-based in `{}`", path.display());
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::TempDir;

    use super::*;

    fn parse(args: &[&str]) -> StreamProcessingConfig {
        StreamProcessingConfig::try_parse_from(std::iter::once("test").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.processor_restart_delay, Duration::from_secs(1));
        assert_eq!(config.state_store, StateStoreType::Memory);
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
        assert_eq!(
            config.processors_config().restart_delay,
            StreamProcessorsConfig::default().restart_delay
        );
        assert!(config.object_store().is_ok());
    }

    #[test]
    fn retry_policy_from_flags() {
        let config = parse(&[
            "--retry-backoff",
            "fixed",
            "--retry-base-delay",
            "250ms",
            "--retry-max-delay",
            "10s",
            "--retry-max-retries",
            "3",
            "--processor-restart-delay",
            "2m",
        ]);
        assert_eq!(
            config.retry_policy().unwrap(),
            RetryPolicy {
                backoff: Backoff::Fixed,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(10),
                max_retries: Some(3),
            }
        );
        assert_eq!(
            config.processors_config().restart_delay,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(
            StreamProcessingConfig::try_parse_from(["test", "--retry-base-delay", "soon"]).is_err()
        );
        assert!(
            StreamProcessingConfig::try_parse_from(["test", "--retry-backoff", "linear"]).is_err()
        );
        let config = parse(&["--retry-base-delay", "1m", "--retry-max-delay", "1s"]);
        assert!(matches!(
            config.retry_policy(),
            Err(ConfigError::InvalidRetryDelays { .. })
        ));
    }

    #[test]
    fn file_store_needs_a_directory() {
        let config = parse(&["--state-store", "file"]);
        assert!(matches!(
            config.object_store(),
            Err(ConfigError::MissingStateDir)
        ));

        let dir = TempDir::new().expect("must be able to create temp directory");
        let state_dir = dir.path().join("state");
        let config = parse(&[
            "--state-store",
            "file",
            "--state-dir",
            state_dir.to_str().unwrap(),
        ]);
        assert!(config.object_store().is_ok());
        assert!(state_dir.is_dir());
    }
}
