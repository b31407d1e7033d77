use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_DEFAULT_DAILY_QUOTA: &str = "default-daily-quota";
pub const ARG_API_RATE_LIMIT: &str = "api-rate-limit";
pub const ARG_CLEANUP_INTERVAL: &str = "cleanup-interval";
pub const ARG_RETENTION_HOURS: &str = "retention-hours";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub default_daily_quota: u64,
    pub api_rate_limit: u64,
    pub cleanup_interval: Duration,
    pub retention_hours: i64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            default_daily_quota: matches
                .get_one::<u64>(ARG_DEFAULT_DAILY_QUOTA)
                .copied()
                .unwrap_or(1000),
            api_rate_limit: matches
                .get_one::<u64>(ARG_API_RATE_LIMIT)
                .copied()
                .unwrap_or(60),
            cleanup_interval: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_CLEANUP_INTERVAL)
                    .copied()
                    .unwrap_or(3600),
            ),
            retention_hours: matches
                .get_one::<i64>(ARG_RETENTION_HOURS)
                .copied()
                .unwrap_or(168),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DEFAULT_DAILY_QUOTA)
                .long(ARG_DEFAULT_DAILY_QUOTA)
                .help("Codes a realm may issue per day when abuse prevention has no explicit limit")
                .env("ENVERIFY_DEFAULT_DAILY_QUOTA")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_API_RATE_LIMIT)
                .long(ARG_API_RATE_LIMIT)
                .help("Requests per minute allowed for each API key")
                .env("ENVERIFY_API_RATE_LIMIT")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_CLEANUP_INTERVAL)
                .long(ARG_CLEANUP_INTERVAL)
                .help("Seconds between cleanup runs")
                .env("ENVERIFY_CLEANUP_INTERVAL")
                .default_value("3600")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RETENTION_HOURS)
                .long(ARG_RETENTION_HOURS)
                .help("Hours to keep expired codes and tokens before purging them")
                .env("ENVERIFY_RETENTION_HOURS")
                .default_value("168")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}
