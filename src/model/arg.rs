use clap::Parser;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "qpool-rs", about = "Multi-account Amazon Q / Kiro API gateway")]
pub struct Args {
    /// Listen host, overrides HOST
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port, overrides PORT
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Database URL, overrides DATABASE_URL
    #[arg(long)]
    pub database_url: Option<String>,
}
