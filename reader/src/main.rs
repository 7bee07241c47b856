use std::error::Error;

use clap::Parser;

use secretmem::{SecretStore, StoreConfig};

#[derive(Parser)]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "secretmem.toml")]
    config: String,
    /// Record id to look up.
    id: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let cfg: StoreConfig = confy::load_path(&opts.config)?;

    let store = SecretStore::new();
    match store.read(&cfg.key_file, opts.id.as_bytes())? {
        Some(secret) => println!("{}", String::from_utf8_lossy(&secret)),
        None => println!("absent"),
    }
    Ok(())
}
