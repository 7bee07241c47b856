use std::error::Error;

use clap::Parser;

use secretmem::{SecretStore, StoreConfig};

#[derive(Parser)]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "secretmem.toml")]
    config: String,
    /// Drop every record instead of writing one.
    #[arg(long)]
    clear: bool,
    /// Record id to write or delete.
    id: Option<String>,
    /// Secret to store; omit to delete the id.
    secret: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let cfg: StoreConfig = confy::load_path(&opts.config)?;
    let store = SecretStore::new();

    if opts.clear {
        store.clear(&cfg.key_file, cfg.perms)?;
        println!("cleared");
        return Ok(());
    }

    let id = opts.id.ok_or("an id is required unless --clear is given")?;
    let secret = opts.secret.as_deref().map(str::as_bytes);
    store.write(&cfg.key_file, id.as_bytes(), secret, cfg.perms)?;
    println!(
        "{}",
        if secret.is_some() { "stored" } else { "deleted" }
    );
    Ok(())
}
