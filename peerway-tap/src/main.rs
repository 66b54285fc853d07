mod relay;

use clap::ArgGroup;
use clap::Parser;
use relay::FrameTap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

/// pwtap - proxy that gives detailed inspection of peerway frames
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["listen", "bind"])))]
struct Args {
    /// Listen on port
    #[arg(group = "source", short, long)]
    listen: Option<u16>,

    /// Listen with specific bind address (ip:port)
    #[arg(group = "source", short, long)]
    bind: Option<SocketAddr>,

    /// Target endpoint (address:port)
    #[arg(short, long, required = true)]
    target: SocketAddr,

    /// Verbosity level (up to -vv)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let bind_addr: SocketAddr = if let Some(listen_port) = args.listen {
        if args.target.is_ipv4() {
            format!("0.0.0.0:{}", listen_port).parse()?
        } else {
            format!("[::]:{}", listen_port).parse()?
        }
    } else if let Some(bind_addr) = args.bind {
        bind_addr
    } else {
        bail!("One of --listen or --bind must be specified");
    };

    let _tap = FrameTap::new(bind_addr, args.target, args.verbose);
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
