//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because linker command lines don't fit one:
//! positional inputs are interleaved with `-l` libraries and their relative order is meaningful,
//! long options are accepted with either one or two leading dashes, and `-z` takes key=value
//! pairs.

use crate::error::Result;
use crate::wasm;
use ahash::AHashSet;
use anyhow::bail;
use anyhow::Context;
use std::path::PathBuf;

pub(crate) struct Args {
    pub(crate) inputs: Vec<Input>,
    pub(crate) output: PathBuf,
    pub(crate) entry: Option<String>,
    pub(crate) export_entry_as: Option<String>,
    pub(crate) relocatable: bool,
    pub(crate) emit_relocs: bool,
    pub(crate) allow_undefined: bool,
    pub(crate) allow_undefined_symbols: AHashSet<String>,
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) sysroot: Option<PathBuf>,
    pub(crate) initial_memory: u32,
    pub(crate) max_memory: u32,
    pub(crate) stack_size: u32,
    pub(crate) strip_all: bool,
    pub(crate) strip_debug: bool,
    pub(crate) verbose: bool,
    pub(crate) should_print_version: bool,
    pub(crate) version_only: bool,
    /// Globals the linker injects, as (symbol, initial value) pairs. The stack pointer is first;
    /// its value is recomputed when memory is laid out.
    pub(crate) synthetic_globals: Vec<(String, i32)>,
}

pub(crate) enum Input {
    File(PathBuf),
    Library(String),
}

impl Default for Args {
    fn default() -> Args {
        Args {
            inputs: Vec::new(),
            output: PathBuf::from("a.out"),
            entry: None,
            export_entry_as: None,
            relocatable: false,
            emit_relocs: false,
            allow_undefined: false,
            allow_undefined_symbols: AHashSet::new(),
            search_paths: Vec::new(),
            sysroot: None,
            initial_memory: 0,
            max_memory: 0,
            stack_size: wasm::PAGE_SIZE,
            strip_all: false,
            strip_debug: false,
            verbose: false,
            should_print_version: false,
            version_only: false,
            synthetic_globals: Vec::new(),
        }
    }
}

impl Args {
    pub(crate) fn from_env() -> Result<Args> {
        parse(std::env::args().skip(1))
    }
}

pub(crate) fn parse<S: AsRef<str>>(input: impl IntoIterator<Item = S>) -> Result<Args> {
    let mut args = Args::default();
    let mut input = input.into_iter();
    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        // Short options whose value may be joined to the flag.
        if let Some(rest) = arg.strip_prefix("-l") {
            let name = if rest.is_empty() { next_value(&mut input, "-l")? } else { rest.to_owned() };
            args.inputs.push(Input::Library(name));
            continue;
        }
        if let Some(rest) = arg.strip_prefix("-L") {
            let dir = if rest.is_empty() { next_value(&mut input, "-L")? } else { rest.to_owned() };
            args.search_paths.push(dir.into());
            continue;
        }
        if arg == "-o" {
            args.output = next_value(&mut input, "-o")?.into();
            continue;
        }
        if arg == "-z" {
            let value = next_value(&mut input, "-z")?;
            if let Some(size) = value.strip_prefix("stack-size=") {
                args.stack_size = parse_int(size).with_context(|| format!("invalid stack-size: {size}"))?;
            } else {
                tracing::debug!("ignoring unknown -z key: {value}");
            }
            continue;
        }
        if !arg.starts_with('-') {
            args.inputs.push(Input::File(arg.into()));
            continue;
        }

        // Long options take one or two leading dashes and `=` or a separate value.
        let option = arg.strip_prefix("--").unwrap_or(&arg[1..]);
        let (name, inline_value) = match option.split_once('=') {
            Some((name, value)) => (name, Some(value.to_owned())),
            None => (option, None),
        };
        match name {
            "entry" => args.entry = Some(value(name, inline_value, &mut input)?),
            "export-entry-as" => {
                args.export_entry_as = Some(value(name, inline_value, &mut input)?);
            }
            "relocatable" | "r" => args.relocatable = true,
            "emit-relocs" => args.emit_relocs = true,
            "allow-undefined" => args.allow_undefined = true,
            "allow-undefined-file" => {
                let path = value(name, inline_value, &mut input)?;
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read `{path}`"))?;
                for line in contents.lines() {
                    let line = line.trim();
                    if !line.is_empty() {
                        args.allow_undefined_symbols.insert(line.to_owned());
                    }
                }
            }
            "initial-memory" => {
                let v = value(name, inline_value, &mut input)?;
                args.initial_memory =
                    parse_int(&v).with_context(|| format!("invalid --initial-memory: {v}"))?;
            }
            "max-memory" => {
                let v = value(name, inline_value, &mut input)?;
                args.max_memory =
                    parse_int(&v).with_context(|| format!("invalid --max-memory: {v}"))?;
            }
            "strip-all" | "s" => args.strip_all = true,
            "strip-debug" | "S" => args.strip_debug = true,
            "sysroot" => args.sysroot = Some(value(name, inline_value, &mut input)?.into()),
            "verbose" => args.verbose = true,
            "version" => {
                args.should_print_version = true;
                args.version_only = true;
            }
            "v" => args.should_print_version = true,
            _ => bail!("unknown argument: {arg}"),
        }
    }

    if !args.relocatable {
        if args.entry.is_none() {
            args.entry = Some("_start".to_owned());
        }
        args.synthetic_globals.push(("__stack_pointer".to_owned(), 0));
    }
    Ok(args)
}

fn value<S: AsRef<str>>(
    name: &str,
    inline_value: Option<String>,
    input: &mut impl Iterator<Item = S>,
) -> Result<String> {
    match inline_value {
        Some(value) => Ok(value),
        None => next_value(input, name),
    }
}

fn next_value<S: AsRef<str>>(input: &mut impl Iterator<Item = S>, flag: &str) -> Result<String> {
    input
        .next()
        .map(|value| value.as_ref().to_owned())
        .with_context(|| format!("expected a value for {flag}"))
}

fn parse_int(value: &str) -> Result<u32> {
    Ok(value.parse()?)
}
