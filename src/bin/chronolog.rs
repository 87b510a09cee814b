//! chronolog is a fault-tolerant distributed messaging node. It accepts
//! client messages over JSON/HTTP, commits them through a leader-based
//! replicated log, applies timestamp correction and per-sender ordering,
//! and serves the committed log via a query interface.
//!
//! Run one process per cluster node, e.g. a local three-node cluster:
//!
//!   chronolog --id a --port 8001 --peers http://127.0.0.1:8002,http://127.0.0.1:8003
//!   chronolog --id b --port 8002 --peers http://127.0.0.1:8001,http://127.0.0.1:8003
//!   chronolog --id c --port 8003 --peers http://127.0.0.1:8001,http://127.0.0.1:8002

#![warn(clippy::all)]

use chronolog::error::Result;
use chronolog::raft::ReplicationMode;
use chronolog::server::{Config, Server};
use chronolog::{errinput, storage};

#[tokio::main]
async fn main() -> Result<()> {
    let args = clap::command!()
        .about("A fault-tolerant distributed messaging node")
        .args([
            clap::Arg::new("host")
                .long("host")
                .help("The address to bind")
                .default_value("127.0.0.1"),
            clap::Arg::new("port")
                .long("port")
                .help("The port to bind")
                .value_parser(clap::value_parser!(u16))
                .default_value("8000"),
            clap::Arg::new("id").long("id").help("The node ID, unique per cluster").required(true),
            clap::Arg::new("peers")
                .long("peers")
                .help("Comma-separated peer base URLs, e.g. http://127.0.0.1:8001")
                .default_value(""),
            clap::Arg::new("replication_mode")
                .long("replication_mode")
                .help("Commit policy for client writes: async or sync_quorum")
                .default_value("async"),
            clap::Arg::new("quorum")
                .long("quorum")
                .help("Ack quorum for sync_quorum writes (default: majority)")
                .value_parser(clap::value_parser!(usize)),
            clap::Arg::new("advertise_url")
                .long("advertise-url")
                .help("The base URL peers and clients use to reach this node"),
            clap::Arg::new("data_dir")
                .long("data-dir")
                .help("The durable store directory")
                .default_value("data"),
            clap::Arg::new("storage")
                .long("storage")
                .help("Storage engine: file or memory")
                .default_value("file"),
            clap::Arg::new("log_level")
                .long("log-level")
                .help("Log level: error, warn, info, debug, or trace")
                .default_value("info"),
        ])
        .get_matches();

    let log_level = args.get_one::<String>("log_level").expect("defaulted");
    let log_level = log_level
        .parse::<simplelog::LevelFilter>()
        .map_err(|_| chronolog::Error::InvalidInput(format!("invalid log level {log_level}")))?;
    let mut log_config = simplelog::ConfigBuilder::new();
    if log_level != simplelog::LevelFilter::Debug {
        log_config.add_filter_allow_str("chronolog");
    }
    simplelog::SimpleLogger::init(log_level, log_config.build())
        .map_err(|err| chronolog::Error::InvalidInput(err.to_string()))?;

    let host = args.get_one::<String>("host").expect("defaulted").clone();
    let port = *args.get_one::<u16>("port").expect("defaulted");
    let id = args.get_one::<String>("id").expect("required").clone();
    let peers: Vec<String> = args
        .get_one::<String>("peers")
        .expect("defaulted")
        .split(',')
        .map(|p| p.trim().trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let mode: ReplicationMode =
        args.get_one::<String>("replication_mode").expect("defaulted").parse()?;
    let quorum = args.get_one::<usize>("quorum").copied();
    let url = match args.get_one::<String>("advertise_url") {
        Some(url) => url.trim_end_matches('/').to_string(),
        // 0.0.0.0 binds all interfaces but isn't a reachable URL.
        None if host == "0.0.0.0" => format!("http://127.0.0.1:{port}"),
        None => format!("http://{host}:{port}"),
    };

    let (log_engine, state_engine): (Box<dyn storage::Engine>, Box<dyn storage::Engine>) =
        match args.get_one::<String>("storage").expect("defaulted").as_str() {
            "file" => {
                let dir = std::path::Path::new(args.get_one::<String>("data_dir").expect("defaulted"));
                (
                    Box::new(storage::FileLog::new(dir.join("log"))?),
                    Box::new(storage::FileLog::new(dir.join("state"))?),
                )
            }
            "memory" => (Box::new(storage::Memory::new()), Box::new(storage::Memory::new())),
            name => return errinput!("invalid storage engine {name}"),
        };

    let mut config = Config::new(id, url, peers);
    config.mode = mode;
    config.quorum = quorum;

    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    Server::new(config, log_engine, state_engine)?.serve(listener).await
}
