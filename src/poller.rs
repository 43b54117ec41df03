use crate::classify;
use crate::config::Config;
use crate::influx::Influx;
use crate::lineproto::{self, FieldValue, Point};
use crate::pvs::{AuthError, Pvs, Session};
use serde_json::{json, Value};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const POLLER_STATS_DUMP_INTERVAL_SECS: f32 = 3600.0; //secs between showing stats
pub const CANCEL_CHECK_INTERVAL_MS: u64 = 50; //granularity of stop-flag checks while sleeping

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Authenticating,
    Fetching,
    Processing,
    Sending,
    Sleeping,
    Stopped,
}

#[derive(Debug, Default)]
pub struct CycleResult {
    pub points_sent: usize,
    pub points_dropped: usize,
    pub errors: Vec<(String, String)>,
}

impl fmt::Display for CycleResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} points sent, {} dropped, {} errors",
            self.points_sent,
            self.points_dropped,
            self.errors.len()
        )
    }
}

pub struct Poller {
    pub name: String,
    pub config: Config,
    pub run_once: bool,
    pub poll_ok: u64,
    pub poll_errors: u64,
    pvs: Pvs,
    sink: Influx,
    session: Option<Session>,
}

impl Poller {
    pub fn new(config: Config, run_once: bool) -> Result<Poller> {
        let pvs = Pvs::new("pvs".to_string(), config.pvs_host.clone())?;
        let sink = Influx::new(
            "influxdb".to_string(),
            config.influx_url.clone(),
            config.influx_db.clone(),
        )?;
        Ok(Poller {
            name: "poller".to_string(),
            config,
            run_once,
            poll_ok: 0,
            poll_errors: 0,
            pvs,
            sink,
            session: None,
        })
    }

    pub async fn worker(&mut self, worker_cancel_flag: Arc<AtomicBool>) -> Result<CycleResult> {
        info!(
            "{}: Starting task (interval: {})",
            self.name,
            humantime::format_duration(self.config.poll_interval)
        );
        let mut state = PollState::Idle;
        let mut stats_interval = Instant::now();
        let mut cycle_start = Instant::now();
        let mut result = CycleResult::default();
        let mut last_result = CycleResult::default();
        let mut raw_records: Vec<Value> = Vec::new();
        let mut points: Vec<Point> = Vec::new();

        loop {
            match state {
                PollState::Idle => {
                    cycle_start = Instant::now();
                    result = CycleResult::default();
                    raw_records.clear();
                    points.clear();
                    state = if self.session.is_some() {
                        PollState::Fetching
                    } else {
                        PollState::Authenticating
                    };
                }
                PollState::Authenticating => {
                    let discovered = self.pvs.discover_serial().await;
                    match self
                        .pvs
                        .authenticate(
                            discovered.as_deref(),
                            self.config.fallback_serial.as_deref(),
                        )
                        .await
                    {
                        Ok(session) => {
                            self.session = Some(session);
                            state = PollState::Fetching;
                        }
                        Err(e @ AuthError::NoSerialAvailable)
                        | Err(e @ AuthError::SerialTooShort) => {
                            //nothing to poll with, a later cycle cannot fix this
                            error!("{}: {}", self.name, e);
                            return Err(e.into());
                        }
                        Err(e) => {
                            warn!("{}: {}", self.name, e);
                            result.errors.push(("global".to_string(), e.to_string()));
                            state = PollState::Sleeping;
                        }
                    }
                }
                PollState::Fetching => {
                    let session = match &self.session {
                        Some(s) => s,
                        None => {
                            state = PollState::Authenticating;
                            continue;
                        }
                    };
                    debug!(
                        "{}: fetching device list (serial {})",
                        self.name, session.credential.identifier
                    );
                    match self.pvs.fetch_devices(session).await {
                        Ok(records) => {
                            raw_records = records;
                            state = PollState::Processing;
                        }
                        Err(e @ crate::pvs::FetchError::Unauthorized) => {
                            warn!("{}: session expired, will re-authenticate", self.name);
                            self.session = None;
                            result.errors.push(("global".to_string(), e.to_string()));
                            state = PollState::Sleeping;
                        }
                        Err(e) => {
                            warn!("{}: {}", self.name, e);
                            result.errors.push(("global".to_string(), e.to_string()));
                            state = PollState::Sleeping;
                        }
                    }
                }
                PollState::Processing => {
                    points = process_records(&raw_records, &mut result);
                    state = PollState::Sending;
                }
                PollState::Sending => {
                    if self.config.verbose {
                        for point in &points {
                            debug!("{}: > {}", self.name, point.to_line());
                        }
                    }
                    match self.sink.send(&points).await {
                        Ok(sent) => result.points_sent = sent,
                        Err(e) => {
                            warn!("{}: {}", self.name, e);
                            result.errors.push(("global".to_string(), e.to_string()));
                        }
                    }
                    state = PollState::Sleeping;
                }
                PollState::Sleeping => {
                    let elapsed = cycle_start.elapsed();
                    let ms = (elapsed.as_secs() * 1_000) + (elapsed.subsec_nanos() / 1_000_000) as u64;
                    if result.errors.is_empty() {
                        self.poll_ok += 1;
                        info!("{}: cycle complete: {} [⏱ {} ms]", self.name, result, ms);
                    } else {
                        self.poll_errors += 1;
                        warn!("{}: cycle finished with problems: {}", self.name, result);
                        for (scope, message) in &result.errors {
                            debug!("{}: [{}] {}", self.name, scope, message);
                        }
                    }
                    last_result = mem::take(&mut result);

                    if stats_interval.elapsed()
                        > Duration::from_secs_f32(POLLER_STATS_DUMP_INTERVAL_SECS)
                    {
                        stats_interval = Instant::now();
                        info!(
                            "{}: 📊 poll statistics: ok: {}, errors: {}",
                            self.name, self.poll_ok, self.poll_errors
                        );
                    }

                    if self.run_once {
                        state = PollState::Stopped;
                        continue;
                    }

                    //wall-clock schedule: the next cycle starts interval after this one
                    //started, or immediately when the cycle overran the interval
                    let deadline = cycle_start + self.config.poll_interval;
                    loop {
                        if worker_cancel_flag.load(Ordering::SeqCst) {
                            debug!("{}: Got terminate signal from main", self.name);
                            state = PollState::Stopped;
                            break;
                        }
                        if Instant::now() >= deadline {
                            state = PollState::Idle;
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(CANCEL_CHECK_INTERVAL_MS)).await;
                    }
                }
                PollState::Stopped => {
                    break;
                }
            }
        }

        info!("{}: task stopped", self.name);
        Ok(last_result)
    }
}

fn process_records(records: &[Value], result: &mut CycleResult) -> Vec<Point> {
    let mut points = Vec::with_capacity(records.len());
    for raw in records {
        let record = match classify::classify(raw) {
            Ok(r) => r,
            Err(e) => {
                result.points_dropped += 1;
                result.errors.push(("global".to_string(), e.to_string()));
                debug!("dropped record {}: {}", raw, e);
                continue;
            }
        };
        let measurement = record.device_class.measurement();
        match lineproto::encode(&record) {
            Ok(point) => points.push(point),
            Err(e) => {
                result.points_dropped += 1;
                result.errors.push((measurement.to_string(), e.to_string()));
                debug!("dropped {} record: {}", measurement, e);
            }
        }
    }
    points
}

pub async fn run(config: &Config, worker_cancel_flag: Arc<AtomicBool>) -> Result<()> {
    let mut poller = Poller::new(config.clone(), false)?;
    poller.worker(worker_cancel_flag).await.map(|_| ())
}

pub async fn run_once(config: &Config) -> Result<CycleResult> {
    let mut poller = Poller::new(config.clone(), true)?;
    poller.worker(Arc::new(AtomicBool::new(false))).await
}

pub async fn diagnose(config: &Config) -> Result<()> {
    info!("diagnose: encoding sample device records...");
    let mut result = CycleResult::default();
    let samples = sample_records();
    let points = process_records(&samples, &mut result);
    for point in &points {
        info!("diagnose: {}", point.to_line());
    }
    if result.points_dropped > 0 {
        return Err(format!("{} sample records failed to encode", result.points_dropped).into());
    }

    //hand-built probe covering every field type the wire format knows
    let probe = Point {
        measurement: "pvs_probe".to_string(),
        tags: vec![("source".to_string(), "diagnose".to_string())],
        fields: vec![
            ("ok".to_string(), FieldValue::Boolean(true)),
            ("value".to_string(), FieldValue::Integer(1)),
            ("note".to_string(), FieldValue::Text("hello".to_string())),
        ],
        timestamp: None,
    };
    info!("diagnose: {}", probe.to_line());

    let sink = Influx::new(
        "influxdb".to_string(),
        config.influx_url.clone(),
        config.influx_db.clone(),
    )?;
    if sink.test_connection().await {
        info!("diagnose: all checks passed");
        Ok(())
    } else {
        Err("influxdb connection test failed".into())
    }
}

#[rustfmt::skip]
pub fn sample_records() -> Vec<Value> {
    vec![
        json!({"type": "PVS", "serial": "ZT231385000549F1084", "model": "PVS6",
               "state": "working", "dl_cpu_load": "0.31", "dl_mem_used": "43208",
               "dl_uptime": "271131", "dl_comm_err": "204", "dl_err_count": "0",
               "dl_flash_avail": "98273", "dl_scan_time": "10",
               "dl_skipped_scans": "0", "dl_untransmitted": "0"}),
        json!({"type": "Power Meter", "serial": "PVS6M23131084p", "model": "PVS6M0400p",
               "state": "working", "ct_scl_fctr": "50", "freq_hz": "59.992973",
               "p_3phsum_kw": "0.013776", "net_ltea_3phsum_kwh": "82.77",
               "v12_v": "243.6701"}),
        json!({"type": "Inverter", "serial": "E00122150014918", "model": "AC_Module_Type_H",
               "state": "working", "freq_hz": "59.98", "p_3phsum_kw": "0.000265",
               "ltea_3phsum_kwh": "12.4", "t_htsnk_degc": "21.67",
               "vln_3phavg_v": "243.57"}),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;

    fn test_config() -> Config {
        Config {
            pvs_host: "127.0.0.1:1".to_string(),
            fallback_serial: Some("ZT012345678901234".to_string()),
            influx_url: "http://127.0.0.1:1/write".to_string(),
            influx_db: "pvs_test".to_string(),
            poll_interval: Duration::from_secs(60),
            mode: RunMode::Once,
            verbose: false,
        }
    }

    #[test]
    fn sample_records_encode_cleanly() {
        let mut result = CycleResult::default();
        let points = process_records(&sample_records(), &mut result);
        assert_eq!(points.len(), sample_records().len());
        assert_eq!(result.points_dropped, 0);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn bad_records_are_dropped_without_aborting() {
        let records = vec![
            json!({"type": "inverter", "serial": "E1", "p_3phsum_kw": "1.0"}),
            json!({"type": "flux capacitor"}),
            json!("not even an object"),
            //a known class with nothing measurable must not produce a point
            json!({"type": "inverter", "serial": "E2"}),
        ];
        let mut result = CycleResult::default();
        let points = process_records(&records, &mut result);
        assert_eq!(points.len(), 1);
        assert_eq!(result.points_dropped, 3);
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.errors[2].0, "pvs_inverter");
    }

    #[tokio::test]
    async fn run_once_completes_one_cycle_against_unreachable_device() {
        let result = run_once(&test_config())
            .await
            .expect("transient failures must not abort run_once");
        assert_eq!(result.points_sent, 0);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn stop_request_is_honored_after_a_failed_cycle() {
        let mut config = test_config();
        config.mode = RunMode::Continuous;
        let cancel = Arc::new(AtomicBool::new(true));
        //one full cycle runs (and fails), then the stop flag is seen at the
        //sleep boundary instead of the loop spinning forever
        run(&config, cancel).await.expect("stop must end the loop cleanly");
    }

    #[tokio::test]
    async fn unusable_fallback_serial_is_fatal() {
        let mut config = test_config();
        config.fallback_serial = Some("123".to_string());
        assert!(run_once(&config).await.is_err());

        config.fallback_serial = None;
        assert!(run_once(&config).await.is_err());
    }
}
