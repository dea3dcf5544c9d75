use clap::{Arg, Command};
use log::LevelFilter;
use rspamd_rescan::{Config, Session};
use std::process;
use std::sync::atomic::Ordering;

#[tokio::main]
async fn main() {
    let matches = Command::new("rspamd-rescan")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Re-classify delivered Maildir messages and rewrite their spam headers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/rspamd-rescan.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("continue-on-error")
                .long("continue-on-error")
                .help("Keep going after a message fails and report all failures")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("account")
                .value_name("ACCOUNT")
                .help("Account address owning the mailbox, e.g. alice@example.org")
                .required_unless_present_any(["generate-config", "test-config"]),
        )
        .arg(
            Arg::new("folder")
                .value_name("FOLDER")
                .help("Folder path, e.g. /INBOX or /lists/announce")
                .required_unless_present_any(["generate-config", "test-config"]),
        )
        .arg(
            Arg::new("message-id")
                .value_name("MESSAGE_ID")
                .help("Only rescan messages with these Message-Ids")
                .num_args(0..),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/rspamd-rescan.yaml");
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    if matches.get_flag("verbose") {
        config.verbose = true;
    }
    if matches.get_flag("continue-on-error") {
        config.continue_on_error = true;
    }

    let log_level = if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Err(e) = config.validate() {
        eprintln!("Configuration invalid: {e:#}");
        process::exit(1);
    }
    if matches.get_flag("test-config") {
        println!("Configuration {config_path} is valid");
        return;
    }

    let account = matches.get_one::<String>("account").cloned().unwrap_or_default();
    let folder = matches.get_one::<String>("folder").cloned().unwrap_or_default();
    let ids: Vec<String> = matches
        .get_many::<String>("message-id")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let session = match Session::connect(config) {
        Ok(session) => session,
        Err(e) => {
            log::error!("Failed to set up rescan session: {e:#}");
            process::exit(1);
        }
    };

    let interrupt = session.interrupt_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Received interrupt, stopping after the current message");
        interrupt.store(true, Ordering::SeqCst);
    }) {
        log::warn!("Failed to install interrupt handler: {e}");
    }

    match session.rescan(&account, &folder, &ids).await {
        Ok(report) => {
            println!("{}", report.count());
            if !report.failures.is_empty() || report.interrupted {
                process::exit(2);
            }
        }
        Err(e) => {
            log::error!("Rescan failed ({:?}): {e}", e.kind());
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        // logging is not set up yet
        eprintln!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
