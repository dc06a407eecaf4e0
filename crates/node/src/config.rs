//! Command-line and conf-file parsing.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use pepexd_consensus::constants::{
    DEFAULT_ADMIN_PORT, DEFAULT_DAEMON_RPC_PORT, DEFAULT_ELECTRUM_PORT, DEFAULT_REORG_LIMIT,
    HASH_CUTOVER_HEIGHT,
};
use pepexd_storage::cache::CacheConfig;

use crate::daemon::DaemonConfig;
use crate::logging;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "pepepow.conf";
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_DAEMON_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DAEMON_MAX_ATTEMPTS: u32 = 6;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_SESSIONS: usize = 1000;
const DEFAULT_DB_CACHE_MB: u64 = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub daemon: DaemonConfig,
    pub electrum_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub poll_ms: u64,
    pub reorg_limit: u32,
    pub cutover_height: u32,
    pub hash_lib_dir: Option<PathBuf>,
    pub db_cache_bytes: u64,
    pub cache: CacheConfig,
    pub request_timeout_secs: u64,
    pub max_sessions: usize,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub reindex: bool,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

/// Daemon connection flags shared by the daemon and the verification tool.
#[derive(Clone, Debug, Default)]
pub struct DaemonArgs {
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    timeout_secs: Option<u64>,
}

impl DaemonArgs {
    /// Consumes `arg` (and its value) when it is a daemon flag.
    pub fn take<I>(&mut self, arg: &str, args: &mut I) -> Result<bool, String>
    where
        I: Iterator<Item = String>,
    {
        match arg {
            "--daemon-url" => self.url = Some(next_value(args, arg)?),
            "--daemon-user" => self.user = Some(next_value(args, arg)?),
            "--daemon-password" => self.password = Some(next_value(args, arg)?),
            "--daemon-timeout-secs" => {
                self.timeout_secs = Some(parse_value(&next_value(args, arg)?, arg)?);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Flags win over the conf file; the conf file wins over defaults.
    pub fn resolve(self, conf: Option<&ConfFile>) -> Result<DaemonConfig, String> {
        let conf_value = |key: &str| conf.and_then(|conf| conf.last(key)).map(str::to_string);
        let url = match self.url {
            Some(url) => url,
            None => {
                let host = conf_value("rpcconnect").unwrap_or_else(|| "127.0.0.1".to_string());
                let port = match conf_value("rpcport") {
                    Some(port) => port
                        .parse::<u16>()
                        .map_err(|_| format!("invalid rpcport '{port}' in conf file"))?,
                    None => DEFAULT_DAEMON_RPC_PORT,
                };
                format!("http://{host}:{port}/")
            }
        };
        Ok(DaemonConfig {
            url,
            user: self.user.or_else(|| conf_value("rpcuser")),
            password: self.password.or_else(|| conf_value("rpcpassword")),
            timeout_secs: self.timeout_secs.unwrap_or(DEFAULT_DAEMON_TIMEOUT_SECS),
            max_attempts: DEFAULT_DAEMON_MAX_ATTEMPTS,
        })
    }
}

/// `key=value` file in the coin daemon's format. Keys are lowercased; repeated keys
/// keep every value in order.
#[derive(Clone, Debug, Default)]
pub struct ConfFile {
    values: HashMap<String, Vec<String>>,
}

impl ConfFile {
    pub fn parse(contents: &str) -> Self {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        for raw_line in contents.lines() {
            let mut line = raw_line.trim();
            if let Some(idx) = line.find(['#', ';']) {
                line = &line[..idx];
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, "1"),
            };
            if key.is_empty() {
                continue;
            }
            values
                .entry(key.to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
        Self { values }
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, String> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(Self::parse(&contents))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format!("failed to read {}: {err}", path.display())),
        }
    }

    pub fn get(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last(&self, key: &str) -> Option<&str> {
        self.get(key).last().map(String::as_str)
    }
}

/// Reads `explicit`, or the default conf in `data_dir` when it exists.
pub(crate) fn load_conf(
    explicit: Option<&Path>,
    data_dir: &Path,
) -> Result<Option<ConfFile>, String> {
    let Some(path) = explicit else {
        return ConfFile::load(&data_dir.join(CONF_FILE_NAME));
    };
    match ConfFile::load(path)? {
        Some(conf) => Ok(Some(conf)),
        None => Err(format!("conf file {} not found", path.display())),
    }
}

pub(crate) fn next_value<I>(args: &mut I, flag: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

pub(crate) fn parse_value<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

fn parse_bind(value: &str, default_port: u16, flag: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(format!("invalid address '{value}' for {flag}\n{}", usage()))
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut conf_path: Option<PathBuf> = None;
    let mut daemon = DaemonArgs::default();
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut electrum_addr = SocketAddr::new(localhost, DEFAULT_ELECTRUM_PORT);
    let mut admin_addr = SocketAddr::new(localhost, DEFAULT_ADMIN_PORT);
    let mut poll_ms = DEFAULT_POLL_MS;
    let mut reorg_limit = DEFAULT_REORG_LIMIT;
    let mut cutover_height = HASH_CUTOVER_HEIGHT;
    let mut hash_lib_dir: Option<PathBuf> = None;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut cache = CacheConfig::default();
    let mut request_timeout_secs = DEFAULT_REQUEST_TIMEOUT_SECS;
    let mut max_sessions = DEFAULT_MAX_SESSIONS;
    let mut log_level = logging::Level::Info;
    let mut log_format = logging::Format::Text;
    let mut log_timestamps = true;
    let mut reindex = false;

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        if daemon.take(&arg, &mut args)? {
            continue;
        }
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" | "version" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, &arg)?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => data_dir = PathBuf::from(next_value(&mut args, &arg)?),
            "--conf" => conf_path = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--electrum-bind" => {
                let value = next_value(&mut args, &arg)?;
                electrum_addr = parse_bind(&value, DEFAULT_ELECTRUM_PORT, &arg)?;
            }
            "--admin-bind" => {
                let value = next_value(&mut args, &arg)?;
                admin_addr = parse_bind(&value, DEFAULT_ADMIN_PORT, &arg)?;
            }
            "--poll-ms" => poll_ms = parse_value(&next_value(&mut args, &arg)?, &arg)?,
            "--reorg-limit" => reorg_limit = parse_value(&next_value(&mut args, &arg)?, &arg)?,
            "--cutover-height" => {
                cutover_height = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "--hash-lib-dir" => hash_lib_dir = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--db-cache-mb" => db_cache_mb = parse_value(&next_value(&mut args, &arg)?, &arg)?,
            "--utxo-cache-entries" => {
                cache.point_entries = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "--history-cache-entries" => {
                cache.page_entries = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "--request-timeout-secs" => {
                request_timeout_secs = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "--max-sessions" => max_sessions = parse_value(&next_value(&mut args, &arg)?, &arg)?,
            "--log-level" => {
                let value = next_value(&mut args, &arg)?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" => {
                let value = next_value(&mut args, &arg)?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--log-timestamps" => log_timestamps = true,
            "--no-log-timestamps" => log_timestamps = false,
            "--reindex" => reindex = true,
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    if poll_ms == 0 {
        return Err(format!("--poll-ms must be positive\n{}", usage()));
    }
    if max_sessions == 0 {
        return Err(format!("--max-sessions must be positive\n{}", usage()));
    }

    let conf = load_conf(conf_path.as_deref(), &data_dir)?;
    let daemon = daemon.resolve(conf.as_ref())?;

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        daemon,
        electrum_addr,
        admin_addr,
        poll_ms,
        reorg_limit,
        cutover_height,
        hash_lib_dir,
        db_cache_bytes: db_cache_mb.saturating_mul(1024 * 1024),
        cache,
        request_timeout_secs,
        max_sessions,
        log_level,
        log_format,
        log_timestamps,
        reindex,
    }))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  pepexd [options]",
        "  pepexd-cli [--admin host:port] getinfo",
        "  pepexd-verify [--samples N] [--seed S] [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Daemon conf file (default: <data-dir>/pepepow.conf)",
        "  --daemon-url  Daemon JSON-RPC URL (default: from conf, else http://127.0.0.1:8833/)",
        "  --daemon-user  Daemon RPC user (default: rpcuser from conf)",
        "  --daemon-password  Daemon RPC password (default: rpcpassword from conf)",
        "  --daemon-timeout-secs  Per-request daemon timeout (default: 30)",
        "  --electrum-bind  Electrum listen address (default: 127.0.0.1:50001)",
        "  --admin-bind  Admin listen address (default: 127.0.0.1:8000)",
        "  --poll-ms  Daemon polling interval in milliseconds (default: 1000)",
        "  --reorg-limit  Deepest reorg the index can undo (default: 100)",
        "  --cutover-height  First height hashed with Xelis v2 (default: 1930000)",
        "  --hash-lib-dir  Directory holding the libsph_* shared libraries",
        "  --db-cache-mb  Fjall block cache size (default: 256)",
        "  --utxo-cache-entries  Cached unspent/output records (default: 200000)",
        "  --history-cache-entries  Cached history/utxo pages (default: 20000)",
        "  --request-timeout-secs  Per-request Electrum timeout (default: 30)",
        "  --max-sessions  Concurrent Electrum sessions (default: 1000)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --reindex  Wipe the index and rebuild it from the daemon",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliAction, String> {
        parse_args_from(args.iter().map(|arg| arg.to_string()))
    }

    fn run_config(args: &[&str]) -> Config {
        match parse(args).expect("parse") {
            CliAction::Run(config) => config,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn defaults_point_at_local_daemon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.daemon.url, "http://127.0.0.1:8833/");
        assert_eq!(config.electrum_addr.port(), DEFAULT_ELECTRUM_PORT);
        assert_eq!(config.admin_addr.port(), DEFAULT_ADMIN_PORT);
        assert_eq!(config.reorg_limit, DEFAULT_REORG_LIMIT);
        assert_eq!(config.cutover_height, HASH_CUTOVER_HEIGHT);
        assert!(!config.reindex);
    }

    #[test]
    fn conf_file_fills_daemon_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join(CONF_FILE_NAME);
        fs::write(
            &conf,
            "# daemon\nrpcuser=alice\nRPCPASSWORD = secret ; trailing\nrpcport=9999\nserver\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.daemon.user.as_deref(), Some("alice"));
        assert_eq!(config.daemon.password.as_deref(), Some("secret"));
        assert_eq!(config.daemon.url, "http://127.0.0.1:9999/");

        let config = run_config(&["--data-dir", &data_dir, "--daemon-user", "bob"]);
        assert_eq!(config.daemon.user.as_deref(), Some("bob"));
    }

    #[test]
    fn conf_parser_keeps_repeated_keys() {
        let conf = ConfFile::parse("addnode=a\naddnode=b\n;comment\nflag\n");
        assert_eq!(conf.get("addnode"), ["a".to_string(), "b".to_string()]);
        assert_eq!(conf.last("flag"), Some("1"));
        assert!(conf.get("missing").is_empty());
    }

    #[test]
    fn explicit_missing_conf_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.conf").to_string_lossy().to_string();
        assert!(parse(&["--conf", &missing]).is_err());
    }

    #[test]
    fn invalid_values_include_usage() {
        let err = parse(&["--backend", "rocks"]).expect_err("bad backend");
        assert!(err.contains("invalid backend"));
        assert!(err.contains("Usage:"));
        assert!(parse(&["--poll-ms", "soon"]).is_err());
        assert!(parse(&["--electrum-bind"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(parse(&["--help"]), Ok(CliAction::PrintHelp)));
        assert!(matches!(parse(&["version"]), Ok(CliAction::PrintVersion)));
    }

    #[test]
    fn bind_accepts_bare_ip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_dir, "--electrum-bind", "0.0.0.0"]);
        assert_eq!(config.electrum_addr.to_string(), "0.0.0.0:50001");
    }
}
