//! Decode a binary file with a `.ksy` schema and print the parse tree.
//!
//! Usage:
//!   ksy_dump <SCHEMA.ksy> <DATA> [--depth N] [--no-offsets] [--config LOADER.yaml]
//!
//! Each line shows `name [type] = value  @ start..end`. Instances are evaluated as the tree
//! is walked. Set `RUST_LOG=debug` to see loader and engine diagnostics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ksinspect::{dump, LoaderConfig, ParseTreeModel, SchemaLoader};

#[derive(Parser, Debug)]
#[command(name = "ksy_dump", version, about = "Dump a binary file through a Kaitai Struct schema")]
struct Args {
    /// Schema file (`.ksy`) or `file://` URL.
    schema: String,
    /// Binary data to decode.
    data: PathBuf,
    /// Maximum tree depth to print.
    #[arg(long)]
    depth: Option<usize>,
    /// Omit byte offsets.
    #[arg(long)]
    no_offsets: bool,
    /// Loader configuration (YAML).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            LoaderConfig::from_yaml(&text).with_context(|| format!("parse {}", path.display()))?
        }
        None => LoaderConfig::default(),
    };
    let loader = SchemaLoader::new(config);
    let definition = loader.load(&args.schema)?;
    let data = std::fs::read(&args.data).with_context(|| format!("read {}", args.data.display()))?;
    log::info!(
        "{}: {} bytes with schema {}",
        args.data.display(),
        data.len(),
        definition.id
    );

    let mut model = ParseTreeModel::new(definition, Arc::new(data));
    let text = dump::dump_tree(&mut model, args.depth, !args.no_offsets)?;
    print!("{}", text);
    Ok(())
}
