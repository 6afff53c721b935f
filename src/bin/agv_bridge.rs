use agv_bridge::protocol::parse_controller_command;
use agv_bridge::{BridgeConfig, RobotCommand, Translator};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("agv-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Fleet Integration Engineering Team")
        .about("Protocol bridge between a factory PLC and VDA5050-style mobile robots")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (RUST_LOG overrides)")
                .takes_value(true)
                .possible_values(&["trace", "debug", "info", "warn", "error"])
                .default_value(DEFAULT_LOG_LEVEL)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("validate")
                .about("Load and validate a configuration file")
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .help("Path to the TOML configuration")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("gen-config")
                .about("Write the default configuration as TOML")
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .value_name("FILE")
                        .help("Destination file (stdout when omitted)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("translate")
                .about("Translate a controller command without sending it")
                .long_about(
                    "Parses a 'serial:command' payload exactly as received on the controller \
                     topic and prints the target topic and the JSON message that would be published",
                )
                .arg(
                    Arg::with_name("payload")
                        .help("Controller payload, e.g. DEX0002:I:pickA")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .help("Take topic prefix and manufacturer from this configuration")
                        .takes_value(true),
                ),
        )
        .get_matches();

    init_tracing(matches.value_of("log-level").unwrap_or(DEFAULT_LOG_LEVEL));

    let result = match matches.subcommand() {
        ("validate", Some(sub)) => validate(sub),
        ("gen-config", Some(sub)) => gen_config(sub),
        ("translate", Some(sub)) => translate(sub),
        _ => Ok(()),
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(matches: &ArgMatches) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match matches.value_of("config") {
        Some(path) => Ok(BridgeConfig::from_file(path)?),
        None => Ok(BridgeConfig::default()),
    }
}

fn validate(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    info!(
        broker = %config.broker.url,
        robots = ?config.app.target_robot_serials,
        reconnect = ?config.app.steady_state_reconnect,
        "configuration is valid"
    );
    println!("✅ configuration OK");
    println!("   broker:  {}", config.broker.url);
    println!("   robots:  {}", config.app.target_robot_serials.join(", "));
    println!("   prefix:  {}/{}", config.topics.prefix, config.topics.manufacturer);
    Ok(())
}

fn gen_config(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let text = BridgeConfig::default().to_toml_string()?;
    match matches.value_of("output") {
        Some(path) => {
            std::fs::write(path, text)?;
            info!(path, "wrote default configuration");
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn translate(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(matches)?;
    let payload = matches.value_of("payload").unwrap_or_default();

    let parsed = parse_controller_command(payload.as_bytes())?;
    let serial = parsed
        .serial
        .ok_or("broadcast commands need a running bridge; use 'serial:command'")?;
    let command = RobotCommand::parse(&parsed.command)?;

    let translator = Translator::new(&config.topics.manufacturer, &config.topics.interface_version);
    let message = translator.build(&command, &serial, None);
    let topic = config.topic_scheme().outbound(&serial, command.channel());

    println!("topic: {topic}");
    println!("{}", serde_json::to_string_pretty(&message)?);
    Ok(())
}
