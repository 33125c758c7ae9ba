use clap::{Arg, Command};
use fencepost::bot::run_bot;
use fencepost::classify::{FeatureFlags, RuleSet};
use fencepost::config::Config;
use fencepost::messages::{determine, MessageBuilder, MessageContext};
use fencepost::store::SqliteStore;
use log::LevelFilter;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("fencepost")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Forum bot that nudges posters toward proper code formatting")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("fencepost.yaml"),
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
                .help("Test configuration validity and print a summary")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("init-db")
                .long("init-db")
                .help("Create the database schema and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-string")
                .long("test-string")
                .value_name("TEXT")
                .help("Classify a text against the formatting rules and show the reply")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
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
        let config = Config::default();
        if let Err(e) = config.to_file(generate_path) {
            eprintln!("Error generating configuration: {e}");
            process::exit(1);
        }
        println!("Default configuration written to {generate_path}");
        println!("Edit it before starting the bot.");
        return;
    }

    if let Some(text) = matches.get_one::<String>("test-string") {
        test_string(text);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration loaded from {config_path}");
        println!("  bot username:  {}", config.bot_username);
        println!("  watched feed:  {}", config.feed);
        println!("  trustees:      {}", config.trustees.join(", "));
        println!("  database:      {}", config.database_path);
        println!(
            "  recheck every: {}-{}s",
            config.recheck.base_poll_interval_secs, config.recheck.max_poll_interval_secs
        );
        match RuleSet::new() {
            Ok(_) => println!("All formatting patterns compiled successfully."),
            Err(e) => {
                eprintln!("Pattern compilation failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("init-db") {
        match SqliteStore::open(&config.database_path) {
            Ok(_) => println!("Database initialized at {}", config.database_path),
            Err(e) => {
                eprintln!("Error initializing database: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run_bot(config).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn test_string(text: &str) {
    let rules = match RuleSet::new() {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Pattern compilation failed: {e}");
            process::exit(1);
        }
    };

    let flags = rules.classify(text);
    println!("Detected features:");
    for (name, flag) in [
        ("code outside of code block", FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK),
        ("multiline inline code", FeatureFlags::MULTILINE_INLINE_CODE),
        ("very long inline code", FeatureFlags::VERY_LONG_INLINE_CODE),
        ("contains code block", FeatureFlags::CONTAINS_CODE_BLOCK),
        ("code fence", FeatureFlags::CODE_FENCE),
    ] {
        println!("  [{}] {name}", if flags.contains(flag) { "x" } else { " " });
    }

    match determine(flags) {
        Some(kind) => {
            let builder = MessageBuilder::new("https://example.com", "fencepost");
            let reply = builder.build(
                kind,
                &MessageContext {
                    document_id: "example",
                    permalink_path: "/p/example/",
                    body_len: text.len(),
                    passing: false,
                },
            );
            println!();
            println!("The bot would reply:");
            println!("---");
            println!("{reply}");
            println!("---");
        }
        None => {
            println!();
            println!("The text passes all formatting rules.");
        }
    }
}
