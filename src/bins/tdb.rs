use std::path::PathBuf;

use tdb::addr::Addr;
use tdb::dbginfo::DebugInfoIndex;
use tdb::debugger::Debugger;
use tdb::errors::DebuggerError;
use tdb::frame::FrameIndex;
use tdb::prepare::PreparedTarget;
use tdb::source::DEFAULT_LIST_RANGE;
use tdb::tracee::PtraceTracee;
use tdb::ui::cli::CliUi;

use clap::Parser;
use object::{Object, ObjectKind};
use tracing::{debug, warn, Level};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
"#
)]
/// tdb - a source level debugger for x86-64 Linux
///
/// Launches the target under ptrace and lets you set breakpoints on source lines, step by
/// lines or instructions, look at the call stack, disassemble and print variables. Type
/// `help` at the prompt for the commands.
struct Args {
    /// The executable to debug, or a `.go` or `.c` file that is built first
    target: PathBuf,

    /// Arguments for the debuggee
    #[arg(last = true)]
    args: Vec<String>,

    /// Log more, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Keep the executable built from a source file
    #[arg(long)]
    keep_build: bool,

    /// Lines of source shown around a line by `list`
    #[arg(long, default_value_t = DEFAULT_LIST_RANGE)]
    list_range: u64,
}

fn main() -> Result<(), DebuggerError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);
    debug!("set up the logger");

    let target = PreparedTarget::prepare(&args.target, args.keep_build)?;
    let data = std::fs::read(target.path())?;
    let obj = object::File::parse(&*data)?;

    let tracee = PtraceTracee::launch(target.path(), &args.args)?;
    let bias = if obj.kind() == ObjectKind::Dynamic {
        tracee.load_bias()?
    } else {
        Addr::NULL
    };

    let index = DebugInfoIndex::build(&obj, bias)?;
    let frames = match FrameIndex::build(&obj, bias) {
        Ok(frames) => Some(frames),
        Err(DebuggerError::MissingSection(section)) => {
            warn!("no {section}, printing variables relative to the frame will not work");
            None
        }
        Err(e) => return Err(e),
    };

    let mut ui = CliUi::build();
    let mut debugger =
        Debugger::build(tracee, index, frames, bias).with_list_range(args.list_range);
    debugger.run_debugger(&mut ui)?;

    Ok(())
}

fn setup_logger(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stderr, stdout belongs to the ui
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    // use that subscriber to process traces emitted after this point
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not set up the logger: {e}");
    }
}
