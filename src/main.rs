use std::{collections::BTreeMap, path::PathBuf};

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;
use mxc::{
    backend::{CodegenOptions, coloring::Coloring},
    frontend::parse_program,
    pipeline::{CompileOptions, Stage, compile},
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Checked program, as JSON
    input: PathBuf,

    /// Write the output here instead of to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after this stage and print what it produced
    #[arg(long, value_enum, default_value_t = Stage::Asm)]
    emit: Stage,

    /// Register coloring per function, as JSON
    #[arg(long)]
    coloring: Option<PathBuf>,

    #[arg(long)]
    no_dce: bool,

    /// Skip the IR verification between passes
    #[arg(long)]
    no_verify: bool,

    /// Comment every assembly instruction with the IR it came from
    #[arg(long)]
    annotate: bool,
}

fn report_fatal_error(message: impl std::fmt::Display) -> ! {
    eprintln!("{} {message}", "error:".red().bold());
    std::process::exit(1);
}

fn read_input(path: &PathBuf) -> String {
    if !path.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Input path '{}' is not a file!", path.display()),
            )
            .exit()
    }

    std::fs::read_to_string(path)
        .unwrap_or_else(|e| report_fatal_error(format!("cannot read '{}': {e}", path.display())))
}

fn main() {
    let args = Args::parse();

    let program = parse_program(&read_input(&args.input)).unwrap_or_else(|e| {
        report_fatal_error(format!("malformed program '{}': {e}", args.input.display()))
    });

    let colorings: BTreeMap<String, Coloring> = match &args.coloring {
        Some(path) => serde_json::from_str(&read_input(path)).unwrap_or_else(|e| {
            report_fatal_error(format!("malformed coloring '{}': {e}", path.display()))
        }),
        None => BTreeMap::new(),
    };

    let options = CompileOptions {
        stop_after: args.emit,
        eliminate_dead_code: !args.no_dce,
        verify: !args.no_verify,
        codegen: CodegenOptions {
            annotate: args.annotate,
        },
        ..CompileOptions::default()
    };

    let output = compile(&program, &colorings, &options).unwrap_or_else(|e| report_fatal_error(e));

    match &args.output {
        Some(path) => {
            let plain = strip_ansi_escapes::strip_str(&output);

            if let Err(e) = std::fs::write(path, plain) {
                report_fatal_error(format!("cannot write '{}': {e}", path.display()));
            }
        }
        None => print!("{output}"),
    }
}
