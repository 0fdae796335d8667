//! Provides a means to read, parse and hold configuration options for scans.
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_derive::Deserialize;

use crate::candidates::CandidateOptions;
use crate::engine::{FragmentSettings, ProxySettings};
use crate::fragment::Range;
use crate::scanner::ScanConfig;
use crate::stability::StabilityConfig;

const DEFAULT_HEALTH_CHECK_URL: &str = "https://www.gstatic.com/generate_204";
const DEFAULT_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down?bytes=10000000";
const DEFAULT_UPLOAD_URL: &str = "https://speed.cloudflare.com/__up";

/// Parses a `min-max` pair into a [`Range`]. Example: `10-20`.
pub fn parse_range_arg(input: &str) -> Result<Range, String> {
    let Some((min, max)) = input.split_once('-') else {
        return Err(format!(
            "Invalid range format '{input}'. Expected 'min-max'. Example: 10-20.",
        ));
    };
    let min: i64 = min
        .trim()
        .parse()
        .map_err(|_| format!("Invalid lower bound '{min}' in range '{input}'"))?;
    let max: i64 = max
        .trim()
        .parse()
        .map_err(|_| format!("Invalid upper bound '{max}' in range '{input}'"))?;
    if min < 1 {
        return Err(format!("Lower bound in range '{input}' must be at least 1"));
    }
    if min > max {
        return Err(format!(
            "Lower bound {min} is greater than upper bound {max} in range '{input}'",
        ));
    }
    Ok(Range::new(min, max))
}

fn parse_port_span(input: &str) -> Result<(u16, u16), String> {
    let Some((start, end)) = input.split_once('-') else {
        return Err(format!(
            "Invalid port span '{input}'. Expected 'start-end'. Example: 40000-40999.",
        ));
    };
    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid start port '{start}' in span '{input}'"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("Invalid end port '{end}' in span '{input}'"))?;
    if start == 0 {
        return Err(format!("Start port in span '{input}' must be at least 1"));
    }
    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in span '{input}'",
        ));
    }
    Ok((start, end))
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fragscan",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Scans proxy endpoint candidates through a local proxy engine and finds
/// the ones that stay reachable, optionally tuning TLS fragmentation first.
pub struct Opts {
    /// A CIDR expression or a newline-delimited file of CIDRs, IPs, or hosts.
    #[arg(short, long)]
    pub addresses: Option<String>,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Path to the proxy engine binary.
    #[arg(long, default_value = "xray")]
    pub engine: PathBuf,

    /// Local SOCKS ports handed to engine instances. Example: 40000-40999.
    #[arg(long, value_parser = parse_port_span, default_value = "40000-40999")]
    pub local_ports: (u16, u16),

    /// Number of concurrent scan workers.
    #[arg(short, long, default_value = "16")]
    pub threads: usize,

    /// Full test cycles per candidate before it is recorded as failed.
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Per-probe timeout in milliseconds.
    #[arg(long, default_value = "10000")]
    pub timeout: u64,

    /// How long to wait for an engine instance to accept connections, in
    /// milliseconds.
    #[arg(long, default_value = "4000")]
    pub ready_timeout: u64,

    /// Demote successful probes slower than this many milliseconds.
    #[arg(long)]
    pub max_latency: Option<u64>,

    /// URL probed through each candidate.
    #[arg(long, default_value = DEFAULT_HEALTH_CHECK_URL)]
    pub url: String,

    /// Packet-loss probes per successful candidate; 0 disables.
    #[arg(long, default_value = "10")]
    pub loss_probes: u32,

    /// Also measure download and upload speed for successful candidates.
    #[arg(long)]
    pub bandwidth: bool,

    /// Download measurement URL.
    #[arg(long, default_value = DEFAULT_DOWNLOAD_URL)]
    pub download_url: String,

    /// Upload measurement URL.
    #[arg(long, default_value = DEFAULT_UPLOAD_URL)]
    pub upload_url: String,

    /// Scan at most this many candidates.
    #[arg(long)]
    pub cap: Option<usize>,

    /// Randomize candidate order before scanning.
    #[arg(long)]
    pub shuffle: bool,

    /// Keep at most this many random hosts per CIDR block.
    #[arg(long)]
    pub sample_per_subnet: Option<usize>,

    /// Pre-filter candidates with a direct ICMP/TCP reachability probe
    /// before the engine-backed scan.
    #[arg(long)]
    pub ping: bool,

    /// Profile phase-1 survivors for stability and score them.
    #[arg(long)]
    pub stability: bool,

    /// Measurement rounds per candidate in the stability phase.
    #[arg(long, default_value = "10")]
    pub stability_rounds: u32,

    /// Skip jitter measurement in the stability phase.
    #[arg(long)]
    pub no_jitter: bool,

    /// Fail stability candidates slower than this download rate in Mbps.
    /// Implies a bandwidth measurement after the rounds.
    #[arg(long)]
    pub min_download: Option<f64>,

    /// Fail stability candidates slower than this upload rate in Mbps.
    #[arg(long)]
    pub min_upload: Option<f64>,

    /// Search for the best TLS fragmentation settings before scanning.
    #[arg(long)]
    pub optimize_fragment: bool,

    /// Fragment length range in bytes, applied to every generated config.
    #[arg(long, value_parser = parse_range_arg)]
    pub fragment_length: Option<Range>,

    /// Fragment interval range in milliseconds.
    #[arg(long, value_parser = parse_range_arg)]
    pub fragment_interval: Option<Range>,

    /// Fragment packet selector passed to the engine.
    #[arg(long, default_value = "tlshello")]
    pub fragment_packets: String,

    /// Outbound protocol.
    #[arg(long, default_value = "vless")]
    pub protocol: String,

    /// Account id for the outbound.
    #[arg(long, default_value = "")]
    pub uuid: String,

    /// TLS server name presented to candidates.
    #[arg(long, default_value = "")]
    pub server_name: String,

    /// Remote port candidates are probed on.
    #[arg(long, default_value = "443")]
    pub server_port: u16,

    /// Reality public key, when the outbound needs one.
    #[arg(long, default_value = "")]
    pub public_key: String,

    /// Reality short id.
    #[arg(long, default_value = "")]
    pub short_id: String,

    /// Write results as JSON to this file.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Hide the banner
    #[arg(long)]
    pub no_banner: bool,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Opts::parse()
    }
}

impl Opts {
    /// Merges values found within the user configuration file. Command line
    /// flags win where both are present.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            engine, threads, retries, timeout, ready_timeout, url, loss_probes, bandwidth,
            shuffle, ping, stability, stability_rounds, optimize_fragment, fragment_packets,
            protocol, uuid, server_name, server_port, public_key, short_id
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        merge_optional!(
            addresses,
            max_latency,
            cap,
            sample_per_subnet,
            min_download,
            min_upload,
            fragment_length,
            fragment_interval
        );
    }

    #[must_use]
    pub fn candidate_options(&self) -> CandidateOptions {
        CandidateOptions {
            cap: self.cap,
            shuffle: self.shuffle,
            sample_per_subnet: self.sample_per_subnet,
        }
    }

    #[must_use]
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            protocol: self.protocol.clone(),
            uuid: self.uuid.clone(),
            server_name: self.server_name.clone(),
            server_port: self.server_port,
            public_key: self.public_key.clone(),
            short_id: self.short_id.clone(),
        }
    }

    /// Manual fragment settings; `None` unless both ranges were given.
    #[must_use]
    pub fn fragment_settings(&self) -> Option<FragmentSettings> {
        match (self.fragment_length, self.fragment_interval) {
            (Some(length), Some(interval)) => Some(FragmentSettings {
                packets: self.fragment_packets.clone(),
                length,
                interval,
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn scan_config(&self, fragment: Option<FragmentSettings>) -> ScanConfig {
        ScanConfig {
            threads: self.threads,
            retries: self.retries,
            ready_timeout: Duration::from_millis(self.ready_timeout),
            probe_timeout: Duration::from_millis(self.timeout),
            max_latency: self.max_latency.map(Duration::from_millis),
            health_check_url: self.url.clone(),
            loss_probes: self.loss_probes,
            bandwidth: self.bandwidth,
            download_url: self.download_url.clone(),
            upload_url: self.upload_url.clone(),
            proxy: self.proxy_settings(),
            fragment,
            ..ScanConfig::default()
        }
    }

    #[must_use]
    pub fn stability_config(&self, fragment: Option<FragmentSettings>) -> StabilityConfig {
        StabilityConfig {
            rounds: self.stability_rounds,
            loss_probes_per_round: self.loss_probes.max(1),
            ready_timeout: Duration::from_millis(self.ready_timeout),
            probe_timeout: Duration::from_millis(self.timeout),
            health_check_url: self.url.clone(),
            jitter_enabled: !self.no_jitter,
            bandwidth: self.bandwidth || self.min_download.is_some() || self.min_upload.is_some(),
            download_url: self.download_url.clone(),
            upload_url: self.upload_url.clone(),
            min_download_mbps: self.min_download,
            min_upload_mbps: self.min_upload,
            proxy: self.proxy_settings(),
            fragment,
            ..StabilityConfig::default()
        }
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: None,
            no_config: true,
            config_path: None,
            engine: PathBuf::from("xray"),
            local_ports: (40000, 40999),
            threads: 0,
            retries: 0,
            timeout: 0,
            ready_timeout: 0,
            max_latency: None,
            url: String::new(),
            loss_probes: 0,
            bandwidth: false,
            download_url: String::new(),
            upload_url: String::new(),
            cap: None,
            shuffle: false,
            sample_per_subnet: None,
            ping: false,
            stability: false,
            stability_rounds: 0,
            no_jitter: false,
            min_download: None,
            min_upload: None,
            optimize_fragment: false,
            fragment_length: None,
            fragment_interval: None,
            fragment_packets: String::new(),
            protocol: String::new(),
            uuid: String::new(),
            server_name: String::new(),
            server_port: 0,
            public_key: String::new(),
            short_id: String::new(),
            json: None,
            no_banner: false,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    addresses: Option<String>,
    engine: Option<PathBuf>,
    threads: Option<usize>,
    retries: Option<u32>,
    timeout: Option<u64>,
    ready_timeout: Option<u64>,
    max_latency: Option<u64>,
    url: Option<String>,
    loss_probes: Option<u32>,
    bandwidth: Option<bool>,
    cap: Option<usize>,
    shuffle: Option<bool>,
    sample_per_subnet: Option<usize>,
    ping: Option<bool>,
    stability: Option<bool>,
    stability_rounds: Option<u32>,
    min_download: Option<f64>,
    min_upload: Option<f64>,
    optimize_fragment: Option<bool>,
    fragment_length: Option<Range>,
    fragment_interval: Option<Range>,
    fragment_packets: Option<String>,
    protocol: Option<String>,
    uuid: Option<String>,
    server_name: Option<String>,
    server_port: Option<u16>,
    public_key: Option<String>,
    short_id: Option<String>,
}

#[cfg(not(tarpaulin_include))]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct.
    ///
    /// # Format
    ///
    /// addresses = "ranges.txt"
    /// uuid = "8f2a..."
    /// server_name = "cdn.example.net"
    /// threads = 32
    /// stability = true
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Self {
        let mut content = String::new();
        let config_path = custom_config_path.unwrap_or_else(default_config_path);
        if config_path.exists() {
            content = match fs::read_to_string(config_path) {
                Ok(content) => content,
                Err(_) => String::new(),
            }
        }

        let config: Config = match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                println!("Found {e} in configuration file.\nAborting scan.\n");
                std::process::exit(1);
            }
        };

        config
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> PathBuf {
    let Some(mut config_path) = dirs::home_dir() else {
        panic!("Could not infer config file path.");
    };
    config_path.push(".fragscan.toml");
    config_path
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;

    use super::{parse_range_arg, Config, Opts, Range};

    fn populated_config() -> Config {
        Config {
            addresses: Some("ranges.txt".to_owned()),
            threads: Some(32),
            retries: Some(1),
            timeout: Some(5_000),
            uuid: Some("11111111-2222-3333-4444-555555555555".to_owned()),
            server_name: Some("cdn.example.net".to_owned()),
            max_latency: Some(800),
            fragment_length: Some(Range::new(10, 30)),
            ..Config::default()
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[parameterized(input = {
        "10-20",
        "1-1",
        " 5 - 9 ",
    }, expected = {
        Range::new(10, 20),
        Range::new(1, 1),
        Range::new(5, 9),
    })]
    fn parse_valid_ranges(input: &str, expected: Range) {
        assert_eq!(parse_range_arg(input), Ok(expected));
    }

    #[parameterized(input = {
        "20-10",
        "0-5",
        "abc-5",
        "10",
    })]
    fn parse_invalid_ranges(input: &str) {
        assert!(parse_range_arg(input).is_err());
    }

    #[test]
    fn parse_full_command_line() {
        let opts = Opts::parse_from([
            "fragscan",
            "--addresses",
            "172.64.0.0/24",
            "--uuid",
            "11111111-2222-3333-4444-555555555555",
            "--server-name",
            "cdn.example.net",
            "--fragment-length",
            "10-20",
            "--fragment-interval",
            "10-20",
            "--stability",
        ]);

        assert_eq!(opts.addresses.as_deref(), Some("172.64.0.0/24"));
        assert!(opts.stability);
        let fragment = opts.fragment_settings().unwrap();
        assert_eq!(fragment.length, Range::new(10, 20));
        assert_eq!(fragment.packets, "tlshello");
    }

    #[test]
    fn fragment_settings_need_both_ranges() {
        let opts = Opts::parse_from(["fragscan", "--fragment-length", "10-20"]);
        assert!(opts.fragment_settings().is_none());
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();
        let config = populated_config();

        opts.merge(&config);

        assert_eq!(opts.addresses, None);
        assert_eq!(opts.threads, 0);
        assert_eq!(opts.uuid, "");
    }

    #[test]
    fn opts_merge_required_arguments() {
        let mut opts = Opts::default();
        let config = populated_config();

        opts.merge_required(&config);

        assert_eq!(opts.threads, 32);
        assert_eq!(opts.retries, 1);
        assert_eq!(opts.timeout, 5_000);
        assert_eq!(opts.uuid, "11111111-2222-3333-4444-555555555555");
        assert_eq!(opts.server_name, "cdn.example.net");
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts::default();
        let config = populated_config();

        opts.merge_optional(&config);

        assert_eq!(opts.addresses.as_deref(), Some("ranges.txt"));
        assert_eq!(opts.max_latency, Some(800));
        assert_eq!(opts.fragment_length, Some(Range::new(10, 30)));
    }

    #[test]
    fn command_line_wins_over_config() {
        let mut opts = Opts::parse_from(["fragscan", "--threads", "8"]);
        let config = Config::default();

        opts.merge(&config);

        assert_eq!(opts.threads, 8);
    }

    #[test]
    fn throughput_floor_implies_bandwidth_measurement() {
        let opts = Opts::parse_from(["fragscan", "--stability", "--min-download", "20"]);
        let config = opts.stability_config(None);

        assert!(config.bandwidth);
        assert_eq!(config.min_download_mbps, Some(20.0));
        assert_eq!(config.min_upload_mbps, None);
    }

    #[test]
    fn stability_config_uses_parsed_rounds() {
        let opts = Opts::parse_from(["fragscan", "--stability-rounds", "5", "--no-jitter"]);
        let config = opts.stability_config(None);

        assert_eq!(config.rounds, 5);
        assert!(!config.jitter_enabled);
        assert!(!config.bandwidth);
    }

    #[test]
    fn scan_config_uses_parsed_durations() {
        let opts = Opts::parse_from(["fragscan", "--timeout", "2500", "--max-latency", "700"]);
        let config = opts.scan_config(None);

        assert_eq!(config.probe_timeout.as_millis(), 2500);
        assert_eq!(config.max_latency.unwrap().as_millis(), 700);
    }
}
