use clap::Parser;
use clap_derive::Parser;
use pipebridge::config::RelayConfig;
use pipebridge::relay::run_relay;
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// address to accept the client connection on
    #[clap(long, default_value = "0.0.0.0:55555")]
    listen: String,

    /// address to relay the client connection to
    #[clap(long, default_value = "127.0.0.1:22")]
    upstream: String,

    /// 'plain', 'client' (framing toward the upstream) or 'server' (framing on the accepted connection)
    #[clap(long, default_value = "plain")]
    mode: String,

    #[clap(long)]
    recv_size: Option<usize>,

    #[clap(long)]
    max_datagram_size: Option<usize>,

    #[clap(long)]
    max_relay_per_event: Option<usize>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = RelayConfig::new(args.listen.parse()?, args.upstream.parse()?, args.mode.parse()?);
    if let Some(recv_size) = args.recv_size {
        config.set_recv_size(recv_size);
    }
    if let Some(max_datagram_size) = args.max_datagram_size {
        config.max_datagram_size = max_datagram_size;
    }
    if let Some(max_relay_per_event) = args.max_relay_per_event {
        config.max_relay_per_event = max_relay_per_event;
    }

    let graceful = run_relay(config)?;
    info!("done, graceful shutdown: {}", graceful);
    Ok(())
}
