mod archive;
mod args;
mod error;
mod input_data;
mod input_files;
mod layout;
mod leb;
mod symbol;
mod symbol_db;
#[cfg(test)]
mod testing;
mod wasm;
mod wasm_writer;

use crate::error::Result;
use anyhow::Context;
use std::path::Path;

fn main() -> Result {
    let args = args::Args::from_env()?;
    if args.should_print_version {
        println!("wasmld {}", env!("CARGO_PKG_VERSION"));
        if args.version_only {
            return Ok(());
        }
    }
    init_tracing(&args);
    link(&args)
}

fn init_tracing(args: &args::Args) {
    let default_filter = if args.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(args: &args::Args) -> Result {
    let input_data = input_data::InputData::from_args(args)?;
    let inputs = input_data
        .files
        .iter()
        .map(|file| (file.filename.as_path(), file.data()));
    let output = link_to_bytes(args, inputs)?;
    tracing::debug!("writing: {}", args.output.display());
    std::fs::write(&args.output, output)
        .with_context(|| format!("failed to write `{}`", args.output.display()))?;
    Ok(())
}

/// The pipeline short of the filesystem: ingest and resolve the inputs, lay out the output
/// module, then rewrite and emit its bytes.
fn link_to_bytes<'data>(
    args: &'data args::Args,
    inputs: impl Iterator<Item = (&'data Path, &'data [u8])>,
) -> Result<Vec<u8>> {
    let mut symtab = symbol_db::SymbolTable::new(args);
    if !args.relocatable {
        if let Some(entry) = args.entry.as_deref() {
            tracing::debug!("injecting undefined entry function: {entry}");
            symtab.add_undefined_function(entry)?;
        }
        for (index, (name, _)) in args.synthetic_globals.iter().enumerate() {
            tracing::debug!("injecting global: {name}");
            let id = symtab.add_defined_global(name)?;
            symtab.symbol_mut(id).set_output_index(index as u32);
        }
    }
    for (filename, data) in inputs {
        symtab.add_file(filename, data)?;
    }
    if !args.allow_undefined && !args.relocatable {
        symtab.report_remaining_undefines()?;
    }
    let layout = layout::compute(&mut symtab)?;
    wasm_writer::write(&mut symtab, &layout)
}
