//! convsweep-device: serves kernels uploaded by a remote sweep
//!
//! Usage:
//!   convsweep-device --listen 0.0.0.0:9190 --key android

use clap::Parser;
use convsweep::rpc::DeviceServer;

/// Device endpoint for `convsweep <ARCH> remote`
#[derive(Parser, Debug)]
#[command(name = "convsweep-device")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:9190")]
    listen: String,

    /// Device key clients must request
    #[arg(short, long, default_value = convsweep::config::DEFAULT_DEVICE_KEY)]
    key: String,
}

#[tokio::main]
async fn main() {
    convsweep::init_logger();
    let args = Args::parse();
    if let Err(e) = serve(&args).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(args: &Args) -> Result<(), convsweep::rpc::RpcError> {
    let server = DeviceServer::bind(&args.listen, args.key.clone()).await?;
    log::info!(
        "Serving device '{}' on {}",
        args.key,
        server.local_addr()?
    );
    server.serve().await
}
