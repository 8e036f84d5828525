use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::sync::Once;

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "plume_core=info,plume_cli=info";

use anyhow::{Context, Result, bail};
use clap::Parser;
use plume_core::bytecode::{Chunk, Constant, ProgramUnit, decode_unit};
use plume_core::vm::{ModuleLoader, Vm, VmOptions};


#[derive(Debug, Parser)]
#[command(
    name = "plume",
    author,
    version,
    about = "Run compiled Plume bytecode units",
    long_about = None
)]
struct CliArgs {
    /// Compiled unit to run (.plbc)
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Print the unit's instructions and constant pool instead of running
    #[arg(long)]
    disasm: bool,

    /// Decode and validate the unit, then exit without running it
    #[arg(long)]
    dry_run: bool,

    /// Live-object count that triggers the first collection
    #[arg(long, value_name = "N")]
    gc_threshold: Option<usize>,

    /// Instructions each green thread runs per scheduler turn
    #[arg(long, value_name = "N")]
    quantum: Option<usize>,
}

fn maybe_init_tracing() {
    let raw = match std::env::var("PLUME_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };
    if raw.is_empty() || raw == "0" {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let builder = fmt().with_writer(std::io::stderr);
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|expr| EnvFilter::try_new(expr).ok());
        let builder = match filter {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };
        let _ = builder.try_init();
    });
}

/// Resolves `import` names against sibling `.plbc` files of the unit being
/// run.
struct DirModuleLoader {
    dir: PathBuf,
}

impl ModuleLoader for DirModuleLoader {
    fn load(&mut self, name: &str) -> Result<Option<Rc<Chunk>>> {
        if !module_name_ok(name) {
            bail!("invalid module name '{name}'");
        }
        let path = self.dir.join(format!("{name}.plbc"));
        if !path.is_file() {
            return Ok(None);
        }
        let bytes =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let unit =
            decode_unit(&bytes).with_context(|| format!("decoding {}", path.display()))?;
        Ok(Some(unit.entry))
    }
}

/// Module names may not escape the unit's directory.
fn module_name_ok(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        && !name.contains(['/', '\\'])
}

fn print_unit(unit: &ProgramUnit) {
    if let Some(meta) = &unit.meta {
        if let Some(source) = &meta.source {
            println!("; source: {source}");
        }
        for (key, value) in &meta.tags {
            println!("; {key}: {value}");
        }
    }
    print_chunk(&unit.entry, "entry");
}

fn print_chunk(chunk: &Chunk, label: &str) {
    println!("{label}:");
    if !chunk.params.is_empty() {
        println!("  params: {}", chunk.params.join(", "));
    }
    for (i, op) in chunk.ops.iter().enumerate() {
        println!("  {i:04}  {op:?}");
    }
    let mut nested = Vec::new();
    for (i, constant) in chunk.constants.iter().enumerate() {
        match constant {
            Constant::Code(code) => {
                println!("  const {i:3}  <code {label}.{i}>");
                nested.push((i, code.clone()));
            }
            other => println!("  const {i:3}  {other:?}"),
        }
    }
    for (i, code) in nested {
        print_chunk(&code, &format!("{label}.{i}"));
    }
}

fn main() -> Result<()> {
    maybe_init_tracing();
    let args = CliArgs::parse();

    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let unit =
        decode_unit(&bytes).with_context(|| format!("decoding {}", args.file.display()))?;

    if args.disasm {
        print_unit(&unit);
        return Ok(());
    }
    if args.dry_run {
        return Ok(());
    }

    let mut options = VmOptions::default();
    if let Some(threshold) = args.gc_threshold {
        options.gc_threshold = threshold;
    }
    if let Some(quantum) = args.quantum {
        options.quantum = quantum;
    }

    let mut vm = Vm::with_options(options);
    let dir = args
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    vm.set_module_loader(Box::new(DirModuleLoader { dir }));

    vm.interpret(unit.entry)?;
    Ok(())
}
