use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use tributary_core::coordinator::parse_addresses;
use tributary_core::{Error, PoisonPolicy, Result, StartOffset, StreamConfig};

const COORDINATOR: &str = "coordinator";
const TOPIC: &str = "topic";
const PARTITION: &str = "partition";
const CLIENT_ID: &str = "client-id";
const LOG_DIR: &str = "log-dir";
const OFFSET_DIR: &str = "offset-dir";
const FLUSH_INTERVAL_MS: &str = "flush-interval-ms";
const MAX_BATCH: &str = "max-batch";
const POLL_TIMEOUT_MS: &str = "poll-timeout-ms";
const MAX_DECODE_FAILURES: &str = "max-decode-failures";
const MAX_FLUSH_FAILURES: &str = "max-flush-failures";
const MAX_PROCESS_ATTEMPTS: &str = "max-process-attempts";
const SKIP_POISON: &str = "skip-poison";
const START_OFFSET: &str = "start-offset";
const METRICS_ADDR: &str = "metrics-addr";

pub(super) fn root_cli() -> Command {
    Command::new("tributary")
        .author("Tributary Authors")
        .about("Consumes one topic partition, counting protobuf Counter messages with checkpoints")
        .arg(
            Arg::new(COORDINATOR)
                .long(COORDINATOR)
                .env("TRIBUTARY_COORDINATOR")
                .default_value("localhost:2181")
                .help("Comma separated coordination service addresses"),
        )
        .arg(
            Arg::new(TOPIC)
                .long(TOPIC)
                .env("TRIBUTARY_TOPIC")
                .required(true)
                .help("Topic to consume"),
        )
        .arg(
            Arg::new(PARTITION)
                .long(PARTITION)
                .env("TRIBUTARY_PARTITION")
                .default_value("0")
                .value_parser(value_parser!(u32))
                .help("Partition of the topic to consume"),
        )
        .arg(
            Arg::new(CLIENT_ID)
                .long(CLIENT_ID)
                .env("TRIBUTARY_CLIENT_ID")
                .required(true)
                .help("Client identity, unique per topic and partition"),
        )
        .arg(
            Arg::new(LOG_DIR)
                .long(LOG_DIR)
                .env("TRIBUTARY_LOG_DIR")
                .default_value("log")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding <topic>/<partition>.log segment files"),
        )
        .arg(
            Arg::new(OFFSET_DIR)
                .long(OFFSET_DIR)
                .env("TRIBUTARY_OFFSET_DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for committed offsets, offsets are kept in memory when unset"),
        )
        .arg(
            Arg::new(FLUSH_INTERVAL_MS)
                .long(FLUSH_INTERVAL_MS)
                .env("TRIBUTARY_FLUSH_INTERVAL_MS")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Interval between processor flushes in milliseconds"),
        )
        .arg(
            Arg::new(MAX_BATCH)
                .long(MAX_BATCH)
                .env("TRIBUTARY_MAX_BATCH")
                .default_value("500")
                .value_parser(value_parser!(usize))
                .help("Maximum records per fetch"),
        )
        .arg(
            Arg::new(POLL_TIMEOUT_MS)
                .long(POLL_TIMEOUT_MS)
                .env("TRIBUTARY_POLL_TIMEOUT_MS")
                .default_value("500")
                .value_parser(value_parser!(u64))
                .help("How long an empty fetch waits before returning"),
        )
        .arg(
            Arg::new(MAX_DECODE_FAILURES)
                .long(MAX_DECODE_FAILURES)
                .env("TRIBUTARY_MAX_DECODE_FAILURES")
                .default_value("100")
                .value_parser(value_parser!(u32))
                .help("Consecutive decode failures tolerated"),
        )
        .arg(
            Arg::new(MAX_FLUSH_FAILURES)
                .long(MAX_FLUSH_FAILURES)
                .env("TRIBUTARY_MAX_FLUSH_FAILURES")
                .default_value("6")
                .value_parser(value_parser!(u32))
                .help("Consecutive failed flush cycles tolerated"),
        )
        .arg(
            Arg::new(MAX_PROCESS_ATTEMPTS)
                .long(MAX_PROCESS_ATTEMPTS)
                .env("TRIBUTARY_MAX_PROCESS_ATTEMPTS")
                .value_parser(value_parser!(u32))
                .help("Attempts per record before giving up, unlimited when unset"),
        )
        .arg(
            Arg::new(SKIP_POISON)
                .long(SKIP_POISON)
                .env("TRIBUTARY_SKIP_POISON")
                .action(ArgAction::SetTrue)
                .help("Skip a record that exhausted its attempts instead of failing"),
        )
        .arg(
            Arg::new(START_OFFSET)
                .long(START_OFFSET)
                .env("TRIBUTARY_START_OFFSET")
                .default_value("earliest")
                .help("Where to start without a committed offset, `earliest` or an offset"),
        )
        .arg(
            Arg::new(METRICS_ADDR)
                .long(METRICS_ADDR)
                .env("TRIBUTARY_METRICS_ADDR")
                .value_parser(value_parser!(SocketAddr))
                .help("Address to serve /metrics and /livez on"),
        )
}

/// Settings of one binary run.
#[derive(Debug, Clone)]
pub(super) struct Settings {
    pub(super) coordinator: Vec<String>,
    pub(super) topic: String,
    pub(super) partition: u32,
    pub(super) client_id: String,
    pub(super) log_dir: PathBuf,
    pub(super) offset_dir: Option<PathBuf>,
    pub(super) poll_timeout: Duration,
    pub(super) metrics_addr: Option<SocketAddr>,
    pub(super) stream: StreamConfig,
}

impl TryFrom<&ArgMatches> for Settings {
    type Error = Error;

    fn try_from(matches: &ArgMatches) -> Result<Self> {
        let coordinator = parse_addresses(required::<String>(matches, COORDINATOR)?);
        let stream = StreamConfig {
            flush_interval: Duration::from_millis(*required::<u64>(matches, FLUSH_INTERVAL_MS)?),
            max_batch: *required::<usize>(matches, MAX_BATCH)?,
            start_offset: parse_start_offset(required::<String>(matches, START_OFFSET)?)?,
            max_decode_failures: *required::<u32>(matches, MAX_DECODE_FAILURES)?,
            max_flush_failures: *required::<u32>(matches, MAX_FLUSH_FAILURES)?,
            max_process_attempts: matches.get_one::<u32>(MAX_PROCESS_ATTEMPTS).copied(),
            poison_policy: if matches.get_flag(SKIP_POISON) {
                PoisonPolicy::Skip
            } else {
                PoisonPolicy::Fail
            },
            ..Default::default()
        };
        stream.validate()?;

        Ok(Self {
            coordinator,
            topic: required::<String>(matches, TOPIC)?.clone(),
            partition: *required::<u32>(matches, PARTITION)?,
            client_id: required::<String>(matches, CLIENT_ID)?.clone(),
            log_dir: required::<PathBuf>(matches, LOG_DIR)?.clone(),
            offset_dir: matches.get_one::<PathBuf>(OFFSET_DIR).cloned(),
            poll_timeout: Duration::from_millis(*required::<u64>(matches, POLL_TIMEOUT_MS)?),
            metrics_addr: matches.get_one::<SocketAddr>(METRICS_ADDR).copied(),
            stream,
        })
    }
}

fn required<'a, T>(matches: &'a ArgMatches, id: &str) -> Result<&'a T>
where
    T: std::any::Any + Clone + Send + Sync + 'static,
{
    matches
        .get_one::<T>(id)
        .ok_or_else(|| Error::Config(format!("missing argument --{id}")))
}

fn parse_start_offset(raw: &str) -> Result<StartOffset> {
    if raw.eq_ignore_ascii_case("earliest") {
        return Ok(StartOffset::Earliest);
    }
    raw.parse()
        .map(StartOffset::At)
        .map_err(|e| Error::Config(format!("invalid start offset {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn test_settings_defaults() {
        let matches = root_cli()
            .try_get_matches_from(["tributary", "--topic", "counters", "--client-id", "c1"])
            .unwrap();
        let settings = Settings::try_from(&matches).unwrap();

        assert_eq!(settings.coordinator, vec!["localhost:2181".to_string()]);
        assert_eq!(settings.topic, "counters");
        assert_eq!(settings.partition, 0);
        assert_eq!(settings.client_id, "c1");
        assert_eq!(settings.offset_dir, None);
        assert_eq!(settings.metrics_addr, None);
        assert_eq!(settings.stream, StreamConfig::default());
    }

    #[test]
    fn test_settings_overrides() {
        let matches = root_cli()
            .try_get_matches_from([
                "tributary",
                "--coordinator",
                "zk-1:2181, zk-2:2181",
                "--topic",
                "counters",
                "--partition",
                "3",
                "--client-id",
                "c1",
                "--offset-dir",
                "/tmp/offsets",
                "--flush-interval-ms",
                "250",
                "--max-process-attempts",
                "4",
                "--skip-poison",
                "--start-offset",
                "42",
                "--metrics-addr",
                "127.0.0.1:9090",
            ])
            .unwrap();
        let settings = Settings::try_from(&matches).unwrap();

        assert_eq!(
            settings.coordinator,
            vec!["zk-1:2181".to_string(), "zk-2:2181".to_string()]
        );
        assert_eq!(settings.partition, 3);
        assert_eq!(settings.offset_dir, Some(PathBuf::from("/tmp/offsets")));
        assert_eq!(settings.stream.flush_interval, Duration::from_millis(250));
        assert_eq!(settings.stream.max_process_attempts, Some(4));
        assert_eq!(settings.stream.poison_policy, PoisonPolicy::Skip);
        assert_eq!(settings.stream.start_offset, StartOffset::At(42));
        assert_eq!(settings.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
    }

    #[test]
    fn test_invalid_settings() {
        assert!(
            root_cli()
                .try_get_matches_from(["tributary", "--topic", "t"])
                .is_err()
        );

        let matches = root_cli()
            .try_get_matches_from([
                "tributary",
                "--topic",
                "t",
                "--client-id",
                "c",
                "--max-batch",
                "0",
            ])
            .unwrap();
        assert!(matches!(Settings::try_from(&matches), Err(Error::Config(_))));

        assert!(matches!(
            parse_start_offset("latest"),
            Err(Error::Config(_))
        ));
        assert_eq!(parse_start_offset("EARLIEST").unwrap(), StartOffset::Earliest);
    }
}
