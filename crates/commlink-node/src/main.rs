//! Commlink node - host remote objects or talk to a running host.
//!
//! `serve` runs a comm server exposing the `echo` object type. `ping` and
//! `make` connect a client to a server by discovery key or literal address.

mod objects;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use commlink::cancel::{install_interrupt_handler, interrupt_pending};
use commlink::{
    ClientConfig, CommClient, CommServer, Discovery, RemoteObject, ServerConfig, SqliteDiscovery,
};
use objects::{EchoObject, SleepParams, ECHO_TYPE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "commlink-node")]
#[command(about = "Host and call commlink remote objects")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Discovery database shared by servers and clients on this machine
    #[arg(long, global = true)]
    discovery_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host echo objects until interrupted
    Serve {
        /// Discovery key to publish (requires --discovery-db)
        #[arg(short, long)]
        name: Option<String>,

        /// Object socket address, e.g. tcp://127.0.0.1:5555 (scans local ports when omitted)
        #[arg(short, long)]
        bind: Option<String>,

        /// Object worker threads
        #[arg(short, long, default_value = "4")]
        workers: usize,
    },
    /// Ping a server
    Ping {
        /// Discovery key or literal tcp:// address
        #[arg(short, long)]
        server: String,

        /// Number of pings
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
    /// Create an object, exercise it and release it
    Make {
        /// Discovery key or literal tcp:// address
        #[arg(short, long)]
        server: String,

        /// Object type to create
        #[arg(short = 't', long = "type", default_value = ECHO_TYPE)]
        type_name: String,

        /// Milliseconds the object should sleep; Ctrl-C cancels it
        #[arg(long, default_value = "0")]
        sleep: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    install_interrupt_handler()?;

    let discovery = match &args.discovery_db {
        Some(path) => {
            let db = SqliteDiscovery::open_at(path)
                .with_context(|| format!("Failed to open discovery db {}", path.display()))?;
            Some(Arc::new(db) as Arc<dyn Discovery>)
        }
        None => None,
    };

    match args.command {
        Command::Serve {
            name,
            bind,
            workers,
        } => serve(discovery, name, bind, workers),
        Command::Ping { server, count } => ping(discovery, &server, count),
        Command::Make {
            server,
            type_name,
            sleep,
        } => make(discovery, &server, &type_name, sleep),
    }
}

fn serve(
    discovery: Option<Arc<dyn Discovery>>,
    name: Option<String>,
    bind: Option<String>,
    workers: usize,
) -> Result<()> {
    let mut config = ServerConfig::new(name.unwrap_or_default()).with_worker_threads(workers);
    if let Some(bind) = bind {
        config = config.with_bind_address(bind);
    }

    let server = CommServer::new(config, discovery)?;
    server.register_type(ECHO_TYPE, || Arc::new(EchoObject::default()) as Arc<dyn RemoteObject>);
    let address = server.start()?;

    // Printed for scripts that spawn a node and read its address.
    println!("COMMLINK_ADDRESS={}", address);
    info!("Serving on {}, Ctrl-C to stop", address);

    while !interrupt_pending() {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("Shutdown signal received, stopping");
    let stats = server.stats();
    server.stop();
    info!(
        "Served {} calls, created {} objects, released {}",
        stats.calls, stats.objects_created, stats.objects_released
    );
    Ok(())
}

fn connect(discovery: Option<Arc<dyn Discovery>>, server: &str) -> Result<CommClient> {
    let config = ClientConfig::new(server).with_ops_interruptible(true);
    let client = CommClient::new(config, discovery)?;
    client
        .start()
        .with_context(|| format!("Failed to connect to {}", server))?;
    Ok(client)
}

fn ping(discovery: Option<Arc<dyn Discovery>>, server: &str, count: usize) -> Result<()> {
    let client = connect(discovery, server)?;

    for i in 0..count {
        if interrupt_pending() {
            break;
        }
        let started = Instant::now();
        let value = format!("ping-{}", i);
        let echoed = client.ping(&value)?;
        if echoed != value {
            bail!("Ping returned {:?}, expected {:?}", echoed, value);
        }
        println!("{}: {:?}", value, started.elapsed());
    }

    client.stop();
    Ok(())
}

fn make(
    discovery: Option<Arc<dyn Discovery>>,
    server: &str,
    type_name: &str,
    sleep: u64,
) -> Result<()> {
    let client = connect(discovery, server)?;
    client.add_status_watch(ECHO_TYPE, |message| println!("status: {}", message))?;

    let object = client.make_proxy(type_name)?;
    info!("Created {} object {}", type_name, object.id());

    let reply = object.call("echo", "hello")?;
    println!("echo: {}", String::from_utf8_lossy(&reply.body));
    object.call("status", bytes::Bytes::new())?;

    if sleep > 0 {
        match object.call_json::<_, SleepParams>("sleep", &SleepParams { millis: sleep }) {
            Ok(done) => println!("slept {} ms", done.millis),
            Err(e) => warn!("Sleep did not finish: {}", e),
        }
    }

    drop(object);
    client.stop();
    Ok(())
}
