use ini::Ini;
use std::time::Duration;

pub const CONFIG_FILE: &str = "pvslog.conf";
pub const DEFAULT_INFLUX_URL: &str = "http://127.0.0.1:8086/write";
pub const DEFAULT_INFLUX_DB: &str = "pvs6_detail";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60; //secs between polling
pub const MIN_POLL_INTERVAL_SECS: u64 = 1; //floor for the configured interval

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continuous,
    Once,
    Diagnose,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pvs_host: String,
    pub fallback_serial: Option<String>,
    pub influx_url: String,
    pub influx_db: String,
    pub poll_interval: Duration,
    pub mode: RunMode,
    pub verbose: bool,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let conf =
            Ini::load_from_file(path).map_err(|e| format!("cannot open {:?}: {}", path, e))?;
        Config::from_ini(&conf)
    }

    pub fn from_ini(conf: &Ini) -> Result<Config, String> {
        let general = conf.section(Some("general".to_owned()));
        let pvs = conf.section(Some("pvs".to_owned()));
        let influx = conf.section(Some("influxdb".to_owned()));
        let poller = conf.section(Some("poller".to_owned()));

        let pvs_host = pvs
            .and_then(|x| x.get("host").cloned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "missing host in [pvs] section".to_string())?;
        let fallback_serial = pvs
            .and_then(|x| x.get("serial").cloned())
            .filter(|v| !v.is_empty());

        let influx_url = influx
            .and_then(|x| x.get("url").cloned())
            .unwrap_or_else(|| DEFAULT_INFLUX_URL.to_string());
        let influx_db = influx
            .and_then(|x| x.get("dbname").cloned())
            .unwrap_or_else(|| DEFAULT_INFLUX_DB.to_string());

        let mut interval_secs = match poller.and_then(|x| x.get("interval").cloned()) {
            Some(v) => v
                .parse::<u64>()
                .map_err(|e| format!("bad poller interval {:?}: {}", v, e))?,
            None => DEFAULT_POLL_INTERVAL_SECS,
        };
        if interval_secs < MIN_POLL_INTERVAL_SECS {
            warn!(
                "poll interval too low, clamping to {} s",
                MIN_POLL_INTERVAL_SECS
            );
            interval_secs = MIN_POLL_INTERVAL_SECS;
        }

        let run_once = poller
            .and_then(|x| x.get("run_once").cloned())
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let mode = match general.and_then(|x| x.get("mode").cloned()).as_deref() {
            Some("diagnose") => RunMode::Diagnose,
            _ if run_once => RunMode::Once,
            _ => RunMode::Continuous,
        };
        let verbose = general
            .and_then(|x| x.get("verbose").cloned())
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Config {
            pvs_host,
            fallback_serial,
            influx_url,
            influx_db,
            poll_interval: Duration::from_secs(interval_secs),
            mode,
            verbose,
        })
    }
}
