//! Code for figuring out which input files we need to read, then mapping them into memory.
//! Everything parsed later borrows from the maps owned here.

use crate::args::Args;
use crate::args::Input;
use crate::error::Result;
use anyhow::bail;
use anyhow::Context;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    data: Mmap,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        if args.inputs.is_empty() {
            bail!("no input files");
        }
        let mut files = Vec::with_capacity(args.inputs.len());
        for input in &args.inputs {
            let filename = match input {
                Input::File(path) => path.clone(),
                Input::Library(name) => search_library(args, name)
                    .with_context(|| format!("unable to find library -l{name}"))?,
            };
            let file = File::open(&filename)
                .with_context(|| format!("failed to open `{}`", filename.display()))?;
            let data = unsafe { Mmap::map(&file) }
                .with_context(|| format!("failed to map `{}`", filename.display()))?;
            files.push(InputFile { filename, data });
        }
        Ok(InputData { files })
    }
}

/// For `-lfoo` we look for libfoo.a on the search paths. A name prefixed with ':' is looked up
/// verbatim instead.
fn search_library(args: &Args, name: &str) -> Option<PathBuf> {
    if let Some(raw) = name.strip_prefix(':') {
        return find_from_search_paths(args, Path::new(raw));
    }
    find_from_search_paths(args, Path::new(&format!("lib{name}.a")))
}

fn find_from_search_paths(args: &Args, file: &Path) -> Option<PathBuf> {
    args.search_paths
        .iter()
        .find_map(|dir| find_file(args, dir, file))
}

/// A search path starting with "=" has that prefix replaced with the --sysroot value.
fn find_file(args: &Args, dir: &Path, file: &Path) -> Option<PathBuf> {
    let path = match dir.to_str().and_then(|dir| dir.strip_prefix('=')) {
        Some(rest) => {
            let sysroot = args.sysroot.clone().unwrap_or_default();
            sysroot.join(rest.trim_start_matches('/')).join(file)
        }
        None => dir.join(file),
    };
    path.exists().then_some(path)
}
