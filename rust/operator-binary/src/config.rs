use std::{path::PathBuf, time::Duration as StdDuration};

use snafu::{Snafu, ensure};
use stackable_operator::shared::time::Duration;

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("at least one worker is required"))]
    NoWorkers,

    #[snafu(display("the work queue capacity must be at least 1"))]
    NoQueueCapacity,

    #[snafu(display("the base backoff {base:?} exceeds the maximum backoff {max:?}"))]
    BackoffBaseAboveMax { base: StdDuration, max: StdDuration },
}

/// Tuning of the controllers, on top of the common operator arguments.
#[derive(clap::Parser, Debug)]
pub struct ControllerArgs {
    /// Maximum number of resources waiting for a reconciliation pass, per controller.
    #[clap(long, env, default_value = "1024")]
    pub queue_capacity: usize,

    /// Concurrent reconciliation passes, per controller.
    #[clap(long, env, default_value = "4")]
    pub workers: usize,

    /// Upper bound for a single Kubernetes API request.
    #[clap(long, env, default_value = "10s")]
    pub operation_timeout: Duration,

    /// How long a cluster pass waits for its pod sets to converge.
    #[clap(long, env, default_value = "5m")]
    pub convergence_timeout: Duration,

    /// Interval of the periodic pass over all clusters.
    #[clap(long, env, default_value = "2m")]
    pub resync_interval: Duration,

    /// Consecutive failures after which a resource is reported as degraded.
    #[clap(long, env, default_value = "5")]
    pub max_retries: u32,

    #[clap(long, env, default_value = "1s")]
    pub backoff_base: Duration,

    #[clap(long, env, default_value = "5m")]
    pub backoff_max: Duration,

    /// How long running passes may take to finish once a shutdown signal was received.
    #[clap(long, env, default_value = "20s")]
    pub shutdown_timeout: Duration,

    /// Role relevance table of the configuration keys. Searched in the default locations when not
    /// set.
    #[clap(long, env)]
    pub relevance_table: Option<PathBuf>,
}

/// Settings shared by both controllers.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub operation_timeout: StdDuration,
    pub convergence_timeout: StdDuration,
    pub resync_interval: StdDuration,
    pub max_retries: u32,
    pub backoff_base: StdDuration,
    pub backoff_max: StdDuration,
    pub shutdown_timeout: StdDuration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 4,
            operation_timeout: StdDuration::from_secs(10),
            convergence_timeout: StdDuration::from_secs(5 * 60),
            resync_interval: StdDuration::from_secs(2 * 60),
            max_retries: 5,
            backoff_base: StdDuration::from_secs(1),
            backoff_max: StdDuration::from_secs(5 * 60),
            shutdown_timeout: StdDuration::from_secs(20),
        }
    }
}

impl ControllerConfig {
    pub fn from_args(args: &ControllerArgs) -> Result<Self, Error> {
        let config = Self {
            queue_capacity: args.queue_capacity,
            workers: args.workers,
            operation_timeout: *args.operation_timeout,
            convergence_timeout: *args.convergence_timeout,
            resync_interval: *args.resync_interval,
            max_retries: args.max_retries,
            backoff_base: *args.backoff_base,
            backoff_max: *args.backoff_max,
            shutdown_timeout: *args.shutdown_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        ensure!(self.workers > 0, NoWorkersSnafu);
        ensure!(self.queue_capacity > 0, NoQueueCapacitySnafu);
        ensure!(
            self.backoff_base <= self.backoff_max,
            BackoffBaseAboveMaxSnafu {
                base: self.backoff_base,
                max: self.backoff_max,
            }
        );
        Ok(())
    }

    /// Delay before retry number `attempt` (starting at 1), doubling from the base up to the
    /// maximum.
    pub fn backoff(&self, attempt: u32) -> StdDuration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_arguments() {
        let args = ControllerArgs::try_parse_from(["run"]).unwrap();
        assert_eq!(args.relevance_table, None);
        assert_eq!(
            ControllerConfig::from_args(&args).unwrap(),
            ControllerConfig::default()
        );
    }

    #[test]
    fn test_arguments() {
        let args = ControllerArgs::try_parse_from([
            "run",
            "--workers",
            "8",
            "--operation-timeout",
            "3s",
            "--shutdown-timeout",
            "1m",
            "--relevance-table",
            "/tmp/relevance.yaml",
        ])
        .unwrap();
        let config = ControllerConfig::from_args(&args).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.operation_timeout, StdDuration::from_secs(3));
        assert_eq!(config.shutdown_timeout, StdDuration::from_secs(60));
        assert_eq!(
            args.relevance_table,
            Some(PathBuf::from("/tmp/relevance.yaml"))
        );
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let args = ControllerArgs::try_parse_from(["run", "--workers", "0"]).unwrap();
        assert_eq!(ControllerConfig::from_args(&args), Err(Error::NoWorkers));
    }

    #[rstest]
    #[case::first_retry(1, 1)]
    #[case::doubles(2, 2)]
    #[case::keeps_doubling(5, 16)]
    #[case::capped(10, 300)]
    #[case::does_not_overflow(64, 300)]
    fn test_backoff(#[case] attempt: u32, #[case] expected_secs: u64) {
        let config = ControllerConfig::default();
        assert_eq!(config.backoff(attempt), StdDuration::from_secs(expected_secs));
    }

    #[test]
    fn test_invalid_config() {
        let config = ControllerConfig {
            workers: 0,
            ..ControllerConfig::default()
        };
        assert_eq!(config.validate(), Err(Error::NoWorkers));

        let config = ControllerConfig {
            backoff_base: StdDuration::from_secs(600),
            ..ControllerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::BackoffBaseAboveMax { .. })
        ));
    }
}
