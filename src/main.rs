#[macro_use]
extern crate log;
extern crate ctrlc;
extern crate simplelog;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

extern crate ini;
use self::ini::Ini;

use std::fs::OpenOptions;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod classify;
mod config;
mod influx;
mod lineproto;
mod poller;
mod pvs;

use crate::config::RunMode;

fn general_option(name: &str) -> Option<String> {
    let conf = Ini::load_from_file(config::CONFIG_FILE).expect("Cannot open config file");
    conf.section(Some("general".to_owned()))
        .and_then(|x| x.get(name).cloned())
}

fn logging_init() {
    let verbose = general_option("verbose")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let console_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        console_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    let mut logfile_error: Option<String> = None;
    if let Some(ref log_path) = general_option("log") {
        let logfile = OpenOptions::new().create(true).append(true).open(log_path);
        match logfile {
            Ok(logfile) => {
                loggers.push(WriteLogger::new(
                    LevelFilter::Info,
                    Config::default(),
                    logfile,
                ));
            }
            Err(e) => {
                logfile_error = Some(format!(
                    "Error creating/opening log file: {:?}: {:?}",
                    log_path, e
                ));
            }
        }
    }

    CombinedLogger::init(loggers).expect("Cannot initialize logging subsystem");
    if let Some(err) = logfile_error {
        error!("{}", err);
        warn!("Will do console logging only...");
    }
}

#[tokio::main]
async fn main() {
    logging_init();
    info!("Welcome to pvslog (PVS supervisor influxdb logger)");

    let config = match crate::config::Config::load(config::CONFIG_FILE) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    //Ctrl-C / SIGTERM support
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let c = cancel_flag.clone();
    ctrlc::set_handler(move || {
        c.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let result = match config.mode {
        RunMode::Diagnose => poller::diagnose(&config).await,
        RunMode::Once => poller::run_once(&config).await.map(|_| ()),
        RunMode::Continuous => poller::run(&config, cancel_flag).await,
    };

    match result {
        Ok(()) => info!("Done, exiting"),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
