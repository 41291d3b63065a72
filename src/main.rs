use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use yao_max::channel::TcpChannel;
use yao_max::constants::{DEFAULT_LABEL_BYTES, DEFAULT_PORT, DEFAULT_PRIME_BITS};
use yao_max::error::Error;
use yao_max::input::read_input;
use yao_max::session::{EvaluatorSession, GarblerSession, ProtocolOptions};

/// Two-party secure maximum over Yao's garbled circuits
#[derive(Parser, Debug)]
#[command(name = "yao-max")]
#[command(about = "Secure two-party computation of the maximum of private integer lists")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Disable oblivious transfer and send both labels in the clear
    /// (insecure, protocol validation only)
    #[arg(long = "no-ot", global = true)]
    no_ot: bool,

    /// Bit width of the OT prime group modulus
    #[arg(long, global = true, default_value_t = DEFAULT_PRIME_BITS)]
    prime_bits: u64,

    /// Wire label width in bytes
    #[arg(long, global = true, default_value_t = DEFAULT_LABEL_BYTES)]
    label_bytes: usize,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Garble the max circuit and drive the session
    Garbler {
        /// File with whitespace-separated non-negative integers
        #[arg(short, long)]
        input: PathBuf,

        /// Evaluator address to connect to
        #[arg(short, long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
        connect: String,

        /// Evaluator input file; enables plaintext verification (testing)
        #[arg(long)]
        verify: Option<PathBuf>,

        /// File receiving 1 or 0 for verification success or failure
        #[arg(long)]
        result_file: Option<PathBuf>,

        /// Dump the synthesized circuit as pretty-printed JSON
        #[arg(long)]
        circuit_json: Option<PathBuf>,
    },
    /// Evaluate the garbled circuit (waits for the garbler)
    Evaluator {
        /// File with whitespace-separated non-negative integers
        #[arg(short, long)]
        input: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
        listen: String,
    },
    /// Run both parties over loopback and verify the result
    Local {
        /// Garbler input file
        #[arg(long)]
        garbler_input: PathBuf,

        /// Evaluator input file
        #[arg(long)]
        evaluator_input: PathBuf,

        /// File receiving 1 or 0 for verification success or failure
        #[arg(long)]
        result_file: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match execute(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("{err:#}");
            let transport = err
                .chain()
                .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Transport(_))));
            ExitCode::from(if transport { 2 } else { 1 })
        }
    }
}

/// Run the selected role; `Ok(false)` means the verification oracle disagreed.
fn execute(args: Args) -> Result<bool> {
    let options = ProtocolOptions {
        oblivious_transfer: !args.no_ot,
        prime_bits: args.prime_bits,
        label_bytes: args.label_bytes,
    };

    match args.command {
        Commands::Garbler {
            input,
            connect,
            verify,
            result_file,
            circuit_json,
        } => {
            let inputs = read_input(&input)?;
            let channel = TcpChannel::connect(connect.as_str())?;
            let mut session = GarblerSession::new(channel, inputs.clone(), options)?;
            let secure_max = run_garbler(&mut session)?;
            println!("secure maximum: {secure_max}");

            if let Some(path) = circuit_json {
                if let Some(entry) = session.circuits().first() {
                    entry.circuit().save_json(&path)?;
                    println!("circuit dumped to {}", path.display());
                }
            }

            match verify {
                Some(peer_input) => {
                    let peer = read_input(&peer_input)?;
                    let verified = verify_output(secure_max, &inputs, &peer, result_file.as_deref())?;
                    Ok(verified)
                }
                None => Ok(true),
            }
        }
        Commands::Evaluator { input, listen } => {
            let inputs = read_input(&input)?;
            let channel = TcpChannel::listen(listen.as_str())?;
            let mut session = EvaluatorSession::new(channel, inputs, options)?;
            let secure_max = session
                .run()
                .map_err(|err| anyhow!(err).context(format!("evaluator aborted in {}", session.state())))?;
            println!("secure maximum: {secure_max}");
            Ok(true)
        }
        Commands::Local {
            garbler_input,
            evaluator_input,
            result_file,
        } => {
            let garbler_inputs = read_input(&garbler_input)?;
            let evaluator_inputs = read_input(&evaluator_input)?;

            // Loopback listener on an ephemeral port; the evaluator accepts
            // on its own thread while the garbler connects and drives.
            let listener =
                TcpListener::bind("127.0.0.1:0").context("cannot bind loopback listener")?;
            let address = listener.local_addr().context("no local address")?;

            let evaluator_values = evaluator_inputs.clone();
            let evaluator = std::thread::spawn(move || -> Result<u64> {
                let channel = TcpChannel::accept(&listener)?;
                let mut session = EvaluatorSession::new(channel, evaluator_values, options)?;
                session.run().map_err(|err| {
                    anyhow!(err).context(format!("evaluator aborted in {}", session.state()))
                })
            });

            let channel = TcpChannel::connect(address)?;
            let mut session = GarblerSession::new(channel, garbler_inputs.clone(), options)?;
            let secure_max = run_garbler(&mut session)?;

            let evaluator_max = evaluator
                .join()
                .map_err(|_| anyhow!("evaluator thread panicked"))??;
            println!("secure maximum: {secure_max} (evaluator saw {evaluator_max})");

            verify_output(
                secure_max,
                &garbler_inputs,
                &evaluator_inputs,
                result_file.as_deref(),
            )
        }
    }
}

fn run_garbler<C: yao_max::channel::Channel>(session: &mut GarblerSession<C>) -> Result<u64> {
    session
        .run()
        .map_err(|err| anyhow!(err).context(format!("garbler aborted in {}", session.state())))
}

/// Compare the protocol output with the plaintext maximum and record a single
/// 1 or 0 in the result file.
fn verify_output(
    secure_max: u64,
    garbler_inputs: &[u64],
    evaluator_inputs: &[u64],
    result_file: Option<&Path>,
) -> Result<bool> {
    let clear_max = garbler_inputs
        .iter()
        .chain(evaluator_inputs)
        .copied()
        .max()
        .unwrap_or(0);
    let verified = secure_max == clear_max;

    if verified {
        println!("the evaluation was correct, {secure_max} equals {clear_max}");
    } else {
        println!("the evaluation was not correct, {secure_max} does not equal {clear_max}");
    }
    if let Some(path) = result_file {
        std::fs::write(path, if verified { "1" } else { "0" })
            .with_context(|| format!("cannot write result file {}", path.display()))?;
    }
    Ok(verified)
}
