//! Command line front-end: parse a textual module, encode every function and
//! write assembler text, an object file or the interop header.

use clap::{Parser, ValueEnum};
use portasm::object::header::{c_header, go_stub};
use portasm::object::DEFAULT_GO_PACKAGE;
use portasm::{
    parse_module, to_text, Architecture, CallingConvention, Dialect, EncodedFunction, Module,
    ObjectFormat,
};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Abi {
    Go,
    Sysv,
    Ms,
}

impl From<Abi> for CallingConvention {
    fn from(abi: Abi) -> Self {
        match abi {
            Abi::Go => CallingConvention::GoAmd64,
            Abi::Sysv => CallingConvention::SystemV,
            Abi::Ms => CallingConvention::Microsoft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmitKind {
    Asm,
    Obj,
    Header,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Syntax {
    Gas,
    Nasm,
    Masm,
    Go,
}

impl From<Syntax> for Dialect {
    fn from(syntax: Syntax) -> Self {
        match syntax {
            Syntax::Gas => Dialect::Gas,
            Syntax::Nasm => Dialect::Nasm,
            Syntax::Masm => Dialect::Masm,
            Syntax::Go => Dialect::Go,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Elf,
    Macho,
    Coff,
}

impl From<Format> for ObjectFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Elf => ObjectFormat::Elf,
            Format::Macho => ObjectFormat::MachO,
            Format::Coff => ObjectFormat::Coff,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "portasm")]
#[command(about = "Portable x86-64 assembler")]
struct Cli {
    #[arg(help = "Input function description, '-' for stdin")]
    input: PathBuf,

    #[arg(long, value_enum, default_value = "sysv", help = "Calling convention")]
    abi: Abi,

    #[arg(long, value_enum, default_value = "asm", help = "Artifact to produce")]
    emit: EmitKind,

    #[arg(long, value_enum, help = "Assembler dialect (defaults to go for --abi go, gas otherwise)")]
    dialect: Option<Syntax>,

    #[arg(long, value_enum, default_value = "elf", help = "Object file format")]
    format: Format,

    #[arg(long, default_value = DEFAULT_GO_PACKAGE, help = "Package name for Go stubs")]
    go_package: String,

    #[arg(short, long, help = "Output path (stdout for text when absent)")]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("portasm: {err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = read_input(&cli.input)?;
    let module = Module::from_functions(parse_module(&source)?);
    let convention = CallingConvention::from(cli.abi);
    log::info!(
        "{}: {} functions, convention {convention}",
        cli.input.display(),
        module.len()
    );

    match cli.emit {
        EmitKind::Asm => {
            let dialect = cli.dialect.map(Dialect::from).unwrap_or(match cli.abi {
                Abi::Go => Dialect::Go,
                _ => Dialect::Gas,
            });
            let encoded = module.encode_parallel(Architecture::X86_64, convention)?;
            let text = encoded
                .iter()
                .map(|function| to_text(function, dialect))
                .collect::<Result<Vec<_>, _>>()?
                .join("\n");
            write_text(cli.output.as_deref(), &text)?;
        }
        EmitKind::Header => {
            let encoded = module.encode_parallel(Architecture::X86_64, convention)?;
            let functions: Vec<&EncodedFunction> = encoded.iter().collect();
            let text = if convention.is_c() {
                c_header(&functions)
            } else {
                go_stub(&cli.go_package, &functions)?
            };
            write_text(cli.output.as_deref(), &text)?;
        }
        EmitKind::Obj => {
            let format = ObjectFormat::from(cli.format);
            let artifact = module.to_object(format, convention, Some(&cli.go_package))?;
            let path = match &cli.output {
                Some(path) => path.clone(),
                None => default_output(&cli.input, format.extension()),
            };
            fs::write(&path, &artifact.bytes)?;
            let header_path = path.with_extension(artifact.header_kind.extension());
            fs::write(&header_path, &artifact.header)?;
            log::info!(
                "wrote {} ({} bytes) and {}",
                path.display(),
                artifact.bytes.len(),
                header_path.display()
            );
        }
    }
    Ok(())
}

fn read_input(path: &Path) -> io::Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        fs::read_to_string(path)
    }
}

fn write_text(output: Option<&Path>, text: &str) -> io::Result<()> {
    match output {
        Some(path) => fs::write(path, text),
        None => io::stdout().write_all(text.as_bytes()),
    }
}

fn default_output(input: &Path, extension: &str) -> PathBuf {
    if input.as_os_str() == "-" {
        PathBuf::from("out").with_extension(extension)
    } else {
        input.with_extension(extension)
    }
}
