use clap::Parser;
use kiln::bytecode::disasm::{count_opcodes, disassemble, format_ops};
use kiln::bytecode::{AssembleError, CodeGenerator, CodeMeta, CodeObject};
use kiln::lang::value::Const;
use kiln::runtime::{Value, Vm, VmConfig};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Assemble a source fragment into a stack-checked code object")]
struct Cli {
    /// Fragment source file
    file: PathBuf,

    /// Compile the file as a single expression instead of statements
    #[arg(long)]
    expr: bool,

    /// Keep the fragment's own framing (line marker and trailing return)
    #[arg(long)]
    no_trim: bool,

    /// Make NAME available as a function parameter; it becomes one if the
    /// fragment reads it before assigning it. `NAME=EXPR` also gives the
    /// value used by --run
    #[arg(long = "param", value_name = "NAME[=EXPR]")]
    params: Vec<String>,

    /// Print the symbolic stream before serialization
    #[arg(long)]
    ops: bool,

    /// Print the disassembled code object
    #[arg(long)]
    dis: bool,

    /// Print opcode frequencies
    #[arg(long)]
    stats: bool,

    /// Write the serialized code object to this path
    #[arg(long, value_name = "PATH")]
    emit: Option<PathBuf>,

    /// Execute the code object and print its result
    #[arg(long)]
    run: bool,

    /// Step limit for --run
    #[arg(long)]
    max_steps: Option<usize>,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to read '{}': {}", cli.file.display(), e);
            std::process::exit(1);
        }
    };

    let params: Vec<(String, Option<String>)> = cli
        .params
        .iter()
        .map(|p| match p.split_once('=') {
            Some((name, expr)) => (name.trim().to_string(), Some(expr.to_string())),
            None => (p.trim().to_string(), None),
        })
        .collect();

    let filename = cli.file.display().to_string();
    let code = match assemble_file(&cli, &filename, &source, &params) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!(
        name = %code.name,
        instructions = code.code.len(),
        stacksize = code.stacksize,
        "assembled"
    );

    if cli.dis {
        print!("{}", disassemble(&code));
    }

    if cli.stats {
        let mut counts: Vec<(&str, usize)> = count_opcodes(&code).into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        for (name, n) in counts {
            println!("{:>6}  {}", n, name);
        }
    }

    if let Some(path) = &cli.emit {
        let written = code
            .to_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| fs::write(path, &bytes).map(|_| bytes.len()).map_err(|e| e.to_string()));
        match written {
            Ok(n) => info!("wrote {} bytes to {}", n, path.display()),
            Err(e) => {
                error!("Failed to write '{}': {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    if cli.run {
        run(&cli, &code, &params);
    }
}

fn assemble_file(
    cli: &Cli,
    filename: &str,
    source: &str,
    params: &[(String, Option<String>)],
) -> Result<CodeObject, AssembleError> {
    let trim = !cli.no_trim;
    let mut cg = CodeGenerator::new(filename);

    if cli.expr {
        cg.insert_expr(source, trim)?;
        if trim {
            cg.return_value();
        }
    } else {
        cg.insert_block(source, trim)?;
        if trim {
            cg.load_const(Const::None);
            cg.return_value();
        }
    }

    let mut meta = CodeMeta::new("<fragment>").first_line(1);
    if !params.is_empty() {
        let available: HashSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
        let required = cg.rewrite_to_fast_locals(&available);
        info!(?required, "rewrote names to fast locals");

        for name in unused_params(params, &required) {
            warn!("parameter '{}' is never read before assignment; ignoring it", name);
        }

        // The signature is what the fragment reads, in order of first read.
        meta = meta.args(required).newlocals(true);
    }

    if cli.ops {
        print!("{}", format_ops(cg.ops()));
    }

    cg.to_code(meta)
}

/// Declared parameters the rewritten fragment does not take.
fn unused_params<'a>(params: &'a [(String, Option<String>)], required: &[String]) -> Vec<&'a str> {
    params
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| !required.iter().any(|r| r == name))
        .collect()
}

/// Evaluate a `--param` value expression.
fn eval_param(vm: &mut Vm, source: &str) -> Result<Value, String> {
    let mut cg = CodeGenerator::new("<param>");
    cg.insert_expr(source, false).map_err(|e| e.to_string())?;
    let code = cg.to_code(CodeMeta::new("<param>")).map_err(|e| e.to_string())?;
    vm.run(&code).map_err(|e| e.to_string())
}

fn run(cli: &Cli, code: &CodeObject, params: &[(String, Option<String>)]) {
    let mut vm = Vm::with_config(VmConfig {
        max_steps: cli.max_steps,
        ..VmConfig::default()
    });

    let positional = code.varnames.iter().take(code.argcount as usize);
    let mut args = Vec::with_capacity(code.argcount as usize);
    for name in positional {
        let expr = params
            .iter()
            .find(|(param, _)| param == name)
            .and_then(|(_, expr)| expr.as_ref());
        let value = match expr {
            Some(expr) => match eval_param(&mut vm, expr) {
                Ok(v) => v,
                Err(e) => {
                    error!("Bad value for parameter '{}': {}", name, e);
                    std::process::exit(1);
                }
            },
            None => Value::None,
        };
        args.push(value);
    }

    let func = vm.function(code.clone());
    match vm.call(&func, args, Vec::new()) {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
