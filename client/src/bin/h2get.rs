//! Fetch one resource over HTTP/2 and print the response.

use clap::Parser;
use http2::Request;
use http2_client::{Client, ClientConfig, Target, logging};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "h2get")]
#[command(about = "Fetch a resource over HTTP/2")]
struct Args {
    /// Server to contact, as host:port
    #[arg(required_unless_present = "print_config")]
    authority: Option<String>,

    /// Request path
    #[arg(default_value = "/")]
    path: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Connect with TLS and negotiate h2 via ALPN
    #[arg(long)]
    tls: bool,

    /// TLS server name, when it differs from the host
    #[arg(long, requires = "tls")]
    server_name: Option<String>,

    /// Extra request header, as name:value (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Print the body to stdout instead of only its size
    #[arg(short, long)]
    body: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        match toml::to_string_pretty(&ClientConfig::default()) {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("Failed to render config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match &args.config {
        Some(path) => match ClientConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(&args, config) {
        tracing::error!(error = %e, "request failed");
        std::process::exit(1);
    }
}

fn run(args: &Args, config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let authority = args.authority.as_deref().unwrap_or_default();
    let mut target = Target::parse(authority, args.tls)?;
    if let Some(name) = &args.server_name {
        target = target.with_server_name(name.clone());
    }

    let mut request = Request::get(target.scheme(), &target.authority(), &args.path);
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| format!("invalid header {header:?}, expected name:value"))?;
        request = request.header(name.trim(), value.trim());
    }

    let client = Client::new(config)?;
    let start = Instant::now();
    let response = client.fetch(&target, request)?;
    let body = response.body.collect()?;
    let elapsed = start.elapsed();

    println!("{} {}", target, response.status);
    for (name, value) in &response.headers {
        println!("{name}: {value}");
    }
    if let Some(trailers) = response.body.trailers() {
        for (name, value) in &trailers {
            println!("{name}: {value} (trailer)");
        }
    }
    println!();

    if args.body {
        println!("{}", String::from_utf8_lossy(&body));
    } else {
        println!("{} bytes in {:.1} ms", body.len(), elapsed.as_secs_f64() * 1000.0);
    }

    client.shutdown();
    Ok(())
}
