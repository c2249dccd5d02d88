use clap::{Arg, ArgAction, Command};
use log::LevelFilter;
use std::io::Read;
use std::process;
use std::time::Duration;
use surgat::config::Config;
use surgat::replay::ReplayMessage;
use surgat::scorer::SpamdClient;
use surgat::Relay;

#[tokio::main]
async fn main() {
    let matches = Command::new("surgat")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Spam-scoring mail relay backed by SpamAssassin's spamd")
        .long_about(
            "surgat scores each message with spamd, drops mail above the kill level,\n\
             prepends the X-Spam headers to everything else and forwards it to the\n\
             downstream relay. Mail that cannot be scored or delivered is kept on disk.\n\n\
             In the default mode a single message is read from stdin and relayed to\n\
             every RECIPIENT, which lets an MTA run surgat as a content filter.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/usr/local/etc/surgat.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .help("Re-score stored messages and print the verdicts")
                .num_args(1..)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("from")
                .short('f')
                .long("from")
                .value_name("SENDER")
                .help("Envelope sender of the message on stdin")
                .default_value(""),
        )
        .arg(
            Arg::new("peer")
                .long("peer")
                .value_name("ADDR")
                .help("Address of the client that submitted the message")
                .default_value("localhost"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("recipients")
                .value_name("RECIPIENT")
                .help("Envelope recipients of the message on stdin")
                .num_args(0..)
                .action(ArgAction::Append),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/usr/local/etc/surgat.yaml");

    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(files) = matches.get_many::<String>("replay") {
        let files: Vec<&String> = files.collect();
        replay_files(&config, &files).await;
        return;
    }

    let recipients: Vec<String> = matches
        .get_many::<String>("recipients")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if recipients.is_empty() {
        eprintln!("At least one RECIPIENT is required");
        process::exit(1);
    }

    let sender = matches
        .get_one::<String>("from")
        .cloned()
        .unwrap_or_default();
    let peer = matches
        .get_one::<String>("peer")
        .cloned()
        .unwrap_or_else(|| "localhost".to_string());

    if let Err(e) = relay_stdin(&config, &peer, &sender, &recipients).await {
        log::error!("Relay failed: {e:#}");
        process::exit(1);
    }
}

async fn relay_stdin(
    config: &Config,
    peer: &str,
    sender: &str,
    recipients: &[String],
) -> anyhow::Result<()> {
    let mut data = Vec::new();
    std::io::stdin().read_to_end(&mut data)?;

    let relay = Relay::start(config)?;
    let intake = relay.intake();
    let queued = intake.submit(peer, sender, recipients, data).await?;
    log::debug!("Submitted message for {queued} recipient(s)");
    drop(intake);

    relay.shutdown().await;
    Ok(())
}

async fn replay_files(config: &Config, files: &[&String]) {
    let client = SpamdClient::new(
        &config.spamd.host,
        config.spamd.port,
        config.spamd.user.clone(),
        Duration::from_secs(config.spamd.timeout_seconds),
    );

    let mut failed = false;
    for file in files {
        let message = match ReplayMessage::load(file.as_str()) {
            Ok(Some(message)) => message,
            Ok(None) => {
                println!("⚠️  {file}: no such file");
                failed = true;
                continue;
            }
            Err(e) => {
                println!("❌ {file}: {e}");
                failed = true;
                continue;
            }
        };

        match message.process(&client).await {
            Ok(result) => {
                let verdict = if result.is_spam { "SPAM" } else { "ham" };
                println!(
                    "{file}: {verdict} ({}/{}) for {}",
                    result.score, result.base_score, message.recipient
                );
                if !result.symbols.is_empty() {
                    println!("  Rules: {}", result.symbols.join(", "));
                }
            }
            Err(e) => {
                println!("❌ {file}: {e}");
                failed = true;
                if matches!(e, surgat::replay::ReplayError::ScorerUnavailable) {
                    break;
                }
            }
        }
    }

    if failed {
        process::exit(1);
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(1);
    }

    println!("Listen address: {}", config.listen);
    println!(
        "Forward to: {}:{} (timeout {}s)",
        config.forward.host, config.forward.port, config.forward.timeout_seconds
    );
    println!(
        "spamd: {}:{} (timeout {}s)",
        config.spamd.host, config.spamd.port, config.spamd.timeout_seconds
    );
    println!(
        "Workers: {}, queue capacity: {}",
        config.threads,
        config.queue_capacity()
    );
    match config.kill_level {
        Some(level) => println!("Kill level: {level}"),
        None => println!("Kill level: disabled"),
    }
    match &config.store_directory {
        Some(directory) => println!("Store directory: {}", directory.display()),
        None => println!("Store directory: none (undeliverable mail will be lost)"),
    }
    if config.filter.enabled {
        println!(
            "Filter: enabled, above {:?}, {} address(es)",
            config.filter.above,
            config.filter.addresses.len()
        );
    }
    if config.stats.enabled {
        println!(
            "Statistics: every {} minutes to {}",
            config.stats.report_interval_minutes,
            config.stats.report_to.as_deref().unwrap_or_default()
        );
    }
    println!("✅ Configuration is valid");
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
