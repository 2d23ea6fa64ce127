//! # zss - command-line front end
//!
//! Four subcommands over the `zss` core:
//!
//! ```text
//! zss make [--codec=X] [--approx-block-size=B] [--metadata=JSON]
//!          [--terminator=BYTES | --length-prefixed=TYPE] [-j N] INPUT OUT
//! zss dump [--start=S] [--stop=E] [--prefix=P] [-j N] [-o FILE]
//!          [--terminator=BYTES | --length-prefixed=TYPE] FILE_OR_URL
//! zss info [-m] FILE_OR_URL
//! zss validate [-j N] FILE_OR_URL
//! ```
//!
//! Arguments beginning with `http` are treated as URLs and read over
//! byte-range requests. Exit codes: 0 success, 1 user error, 2
//! corruption or I/O failure.

pub mod records;

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use records::{render_records, unescape, Framing, LengthPrefix};
use transport::{FileTransport, HttpTransport, Transport};
use zss::{Codec, Error, Query, ReaderOptions, WriterOptions, Zss, ZssWriter};

#[derive(Debug, Parser)]
#[command(name = "zss", version, about = "Sorted record archives: build, query, verify")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new .zss file from sorted records
    Make(MakeArgs),
    /// Print records, optionally restricted to a range or prefix
    Dump(DumpArgs),
    /// Print header fields as JSON
    Info(InfoArgs),
    /// Exhaustively check a file for corruption
    Validate(ValidateArgs),
}

#[derive(Debug, clap::Args)]
pub struct MakeArgs {
    /// Records to pack, already in ASCIIbetical order; "-" for stdin
    pub input: String,
    /// File to create (must not already exist)
    pub output: PathBuf,
    /// Compression codec: none, deflate, bz2, lzma
    #[arg(long, default_value = "bz2")]
    pub codec: String,
    /// Target uncompressed bytes per data block
    #[arg(long, default_value_t = zss::writer::DEFAULT_APPROX_BLOCK_SIZE)]
    pub approx_block_size: usize,
    /// JSON object stored in the header
    #[arg(long, default_value = "{}")]
    pub metadata: String,
    /// Compression worker threads (default: all CPUs)
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,
    /// Record terminator in the input (escapes allowed)
    #[arg(long, default_value = "\\n", conflicts_with = "length_prefixed")]
    pub terminator: String,
    /// Input records are length-prefixed instead of terminated
    #[arg(long, value_enum)]
    pub length_prefixed: Option<LengthPrefix>,
}

#[derive(Debug, clap::Args)]
pub struct DumpArgs {
    /// Path or URL of the .zss file
    pub file: String,
    /// Only records >= this value (escapes allowed)
    #[arg(long)]
    pub start: Option<String>,
    /// Only records < this value (escapes allowed)
    #[arg(long)]
    pub stop: Option<String>,
    /// Only records beginning with this value (escapes allowed)
    #[arg(long)]
    pub prefix: Option<String>,
    /// Decompression worker threads; 0 decompresses in-thread
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,
    /// Output file; "-" for stdout
    #[arg(short = 'o', long, default_value = "-")]
    pub output: String,
    /// Record terminator in the output (escapes allowed)
    #[arg(long, default_value = "\\n", conflicts_with = "length_prefixed")]
    pub terminator: String,
    /// Emit length-prefixed records instead of terminated ones
    #[arg(long, value_enum)]
    pub length_prefixed: Option<LengthPrefix>,
}

#[derive(Debug, clap::Args)]
pub struct InfoArgs {
    /// Path or URL of the .zss file
    pub file: String,
    /// Print only the metadata object
    #[arg(short = 'm', long)]
    pub metadata_only: bool,
}

#[derive(Debug, clap::Args)]
pub struct ValidateArgs {
    /// Path or URL of the .zss file
    pub file: String,
    /// Decompression worker threads
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,
}

/// Parses `args` and runs the selected command, writing normal output
/// to `stdout`. Returns the process exit code.
pub fn main_with<I, T>(args: I, stdout: &mut dyn Write) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            e.print().ok();
            return code;
        }
    };
    match run(cli, stdout) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("zss: {err}");
            exit_code(&err)
        }
    }
}

fn exit_code(err: &Error) -> i32 {
    match err {
        Error::BadUsage(_) => 1,
        _ => 2,
    }
}

pub fn run(cli: Cli, stdout: &mut dyn Write) -> zss::Result<()> {
    match cli.command {
        Command::Make(args) => make(args, stdout),
        Command::Dump(args) => dump(args, stdout),
        Command::Info(args) => info(args, stdout),
        Command::Validate(args) => validate(args, stdout),
    }
}

fn input_framing(terminator: &str, length_prefixed: Option<LengthPrefix>) -> zss::Result<Framing> {
    match length_prefixed {
        Some(mode) => Ok(Framing::LengthPrefixed(mode)),
        None => Ok(Framing::Terminated(unescape(terminator)?)),
    }
}

fn open_source(file: &str, parallelism: Option<usize>) -> zss::Result<Zss> {
    let transport: Box<dyn Transport> = if file.starts_with("http") {
        Box::new(HttpTransport::new(file)?)
    } else {
        Box::new(FileTransport::open(file)?)
    };
    Zss::with_transport(
        transport,
        ReaderOptions {
            parallelism,
            ..ReaderOptions::default()
        },
    )
}

fn make(args: MakeArgs, stdout: &mut dyn Write) -> zss::Result<()> {
    let codec = Codec::from_name(&args.codec).ok_or_else(|| {
        Error::BadUsage(format!(
            "unknown codec {:?} (expected none, deflate, bz2 or lzma)",
            args.codec
        ))
    })?;
    let metadata = match serde_json::from_str(&args.metadata) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => {
            return Err(Error::BadUsage(
                "metadata must be a JSON object".to_string(),
            ))
        }
        Err(e) => return Err(Error::BadUsage(format!("bad metadata JSON: {e}"))),
    };
    let framing = input_framing(&args.terminator, args.length_prefixed)?;

    let mut writer = ZssWriter::create(
        &args.output,
        WriterOptions {
            codec,
            approx_block_size: args.approx_block_size,
            parallelism: args.parallelism,
            metadata,
        },
    )?;

    let result = if args.input == "-" {
        let mut stdin = std::io::stdin().lock();
        pack_input(&mut writer, &mut stdin, &framing)
    } else {
        let mut reader = BufReader::new(File::open(&args.input)?);
        pack_input(&mut writer, &mut reader, &framing)
    };
    result?;
    writer.finish()?;
    writeln!(stdout, "zss: wrote {}", args.output.display())?;
    Ok(())
}

fn pack_input<R: Read>(
    writer: &mut ZssWriter,
    reader: &mut R,
    framing: &Framing,
) -> zss::Result<()> {
    records::read_records(reader, framing, |record| writer.add_record(record))
}

fn dump(args: DumpArgs, stdout: &mut dyn Write) -> zss::Result<()> {
    let query = Query {
        start: args.start.as_deref().map(unescape).transpose()?,
        stop: args.stop.as_deref().map(unescape).transpose()?,
        prefix: args.prefix.as_deref().map(unescape).transpose()?,
    };
    let framing = input_framing(&args.terminator, args.length_prefixed)?;
    let z = open_source(&args.file, args.parallelism)?;

    let render = move |records: Vec<Vec<u8>>| render_records(&records, &framing);
    let chunks = z.block_map(render, query)?;

    if args.output == "-" {
        write_chunks(chunks, stdout)
    } else {
        let mut out = BufWriter::new(File::create(&args.output)?);
        write_chunks(chunks, &mut out)?;
        out.flush()?;
        Ok(())
    }
}

fn write_chunks(
    chunks: impl Iterator<Item = zss::Result<Vec<u8>>>,
    out: &mut dyn Write,
) -> zss::Result<()> {
    for chunk in chunks {
        out.write_all(&chunk?)?;
    }
    out.flush()?;
    Ok(())
}

fn info(args: InfoArgs, stdout: &mut dyn Write) -> zss::Result<()> {
    // Header-only work: no point spinning up a worker pool.
    let z = open_source(&args.file, Some(0))?;
    let rendered = if args.metadata_only {
        serde_json::Value::Object(z.metadata().clone())
    } else {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "root_index_offset".to_string(),
            z.root_index_offset().into(),
        );
        fields.insert(
            "root_index_length".to_string(),
            z.root_index_length().into(),
        );
        fields.insert(
            "total_file_length".to_string(),
            z.total_file_length().into(),
        );
        fields.insert("codec".to_string(), z.codec().name().into());
        fields.insert("data_sha256".to_string(), hex(z.data_sha256()).into());
        fields.insert(
            "metadata".to_string(),
            serde_json::Value::Object(z.metadata().clone()),
        );
        let mut statistics = serde_json::Map::new();
        statistics.insert(
            "root_index_level".to_string(),
            z.root_index_level()?.into(),
        );
        fields.insert(
            "statistics".to_string(),
            serde_json::Value::Object(statistics),
        );
        serde_json::Value::Object(fields)
    };
    let text = serde_json::to_string_pretty(&rendered)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    writeln!(stdout, "{text}")?;
    Ok(())
}

fn validate(args: ValidateArgs, stdout: &mut dyn Write) -> zss::Result<()> {
    let z = open_source(&args.file, args.parallelism)?;
    z.validate()?;
    writeln!(stdout, "looks good!")?;
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
