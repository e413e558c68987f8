/// cityvm supervisor.
///
/// Thin shell around the interpreter: loads configuration, boots from the
/// latest snapshot (or startup sources when none exists), drives the step
/// loop on a current-thread tokio runtime, takes periodic checkpoints, and
/// turns TERM/INT into checkpoint-then-exit and HUP into an immediate
/// snapshot.

use clap::Parser as ClapParser;
use cityvm::conf::Conf;
use cityvm::interp::{RunOutcome, Runtime};
use cityvm::{loader, retention, snapshot};
use miette::{miette, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Steps per scheduling slice; signal and timer checks happen in between.
const STEP_SLICE: usize = 20_000;

#[derive(ClapParser)]
#[command(
    name = "cityvm",
    version,
    about = "Persistent ES5 virtual machine",
    long_about = "cityvm — hosts a long-lived script whose entire state checkpoints to \
                  .city snapshot files and resumes exactly where it left off."
)]
struct Cli {
    /// Path to the JSON configuration file
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sig {
    Term,
    Int,
    Hup,
}

impl Sig {
    fn number(self) -> i32 {
        match self {
            Sig::Term => libc::SIGTERM,
            Sig::Int => libc::SIGINT,
            Sig::Hup => libc::SIGHUP,
        }
    }
}

enum Outcome {
    Clean(i32),
    Signalled(Sig),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(Outcome::Clean(code)) => std::process::exit(code),
        Ok(Outcome::Signalled(sig)) => {
            // Re-deliver the terminating signal with default disposition so
            // the parent observes a signal death, not a plain exit.
            unsafe {
                libc::signal(sig.number(), libc::SIG_DFL);
                libc::raise(sig.number());
            }
            std::process::exit(1);
        }
        Err(report) => {
            eprintln!("{:?}", report);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<Outcome> {
    let conf = Conf::load(&cli.config).map_err(|e| miette!("{}", e))?;
    let dir = conf.database_directory.clone();

    let mut vm = match loader::latest_snapshot(&dir).map_err(|e| miette!("cannot scan '{}': {}", dir.display(), e))? {
        Some(path) => {
            log::info!("restoring snapshot {}", path.display());
            let mut vm = Runtime::new();
            snapshot::load_file(&mut vm, &path).map_err(|e| miette!("{}", e))?;
            vm
        }
        None => {
            let sources = loader::startup_sources(&dir)
                .map_err(|e| miette!("cannot scan '{}': {}", dir.display(), e))?;
            if sources.is_empty() {
                return Err(miette!(
                    "no .city snapshot and no startup sources in '{}'",
                    dir.display()
                ));
            }
            let mut vm = Runtime::boot();
            // Frames run top-of-stack first; push in reverse so the
            // lexically first file executes first.
            for (path, text) in sources.iter().rev() {
                log::info!("loading {}", path.display());
                vm.create_thread_for_src(&path.display().to_string(), text)
                    .map_err(|e| miette!("{}", e))?;
            }
            vm
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| miette!("tokio runtime: {}", e))?;
    runtime.block_on(supervise(&mut vm, &conf))
}

async fn supervise(vm: &mut Runtime, conf: &Conf) -> Result<Outcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for (kind, sig) in [
        (SignalKind::terminate(), Sig::Term),
        (SignalKind::interrupt(), Sig::Int),
        (SignalKind::hangup(), Sig::Hup),
    ] {
        let tx = tx.clone();
        let mut stream = signal(kind).map_err(|e| miette!("signal handler: {}", e))?;
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).is_err() {
                    break;
                }
            }
        });
    }

    let interval = conf.checkpoint_interval;
    let mut next_checkpoint = if interval > 0.0 {
        Some(Instant::now() + Duration::from_secs_f64(interval))
    } else {
        None
    };

    loop {
        // Signals first; the pause flag is observed before the next step.
        match rx.try_recv() {
            Ok(Sig::Hup) => {
                log::info!("SIGHUP: immediate checkpoint");
                checkpoint(vm, conf);
            }
            Ok(sig @ (Sig::Term | Sig::Int)) => {
                log::info!("terminating on signal");
                if conf.checkpoint_at_shutdown {
                    checkpoint(vm, conf);
                }
                return Ok(Outcome::Signalled(sig));
            }
            Err(_) => {}
        }

        if let Some(code) = vm.shutdown_requested.take() {
            log::info!("shutdown requested by program (code {})", code);
            if conf.checkpoint_at_shutdown {
                checkpoint(vm, conf);
            }
            return Ok(Outcome::Clean(code));
        }

        if vm.checkpoint_requested {
            vm.checkpoint_requested = false;
            checkpoint(vm, conf);
            vm.resume();
        }

        if let Some(due) = next_checkpoint {
            if Instant::now() >= due {
                checkpoint(vm, conf);
                next_checkpoint = Some(Instant::now() + Duration::from_secs_f64(interval));
            }
        }

        let outcome = match vm.run_slice(STEP_SLICE) {
            Ok(o) => o,
            Err(e) => {
                log::error!("unrecoverable interpreter error: {}", e);
                return Ok(Outcome::Clean(1));
            }
        };
        match outcome {
            RunOutcome::More => tokio::task::yield_now().await,
            RunOutcome::Done | RunOutcome::Paused => {
                // A pause raised by sys.checkpoint / sys.shutdown is
                // handled at the top of the loop, not slept through.
                if vm.checkpoint_requested || vm.shutdown_requested.is_some() {
                    continue;
                }
                // Nothing to step: sleep until a signal, the next periodic
                // checkpoint, or an appended workload wakes us.
                let wait = next_checkpoint
                    .map(|due| due.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_secs(3600));
                tokio::select! {
                    sig = rx.recv() => {
                        if let Some(sig) = sig {
                            // Re-queue so the top of the loop handles it.
                            let _ = tx.send(sig);
                        }
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

/// Pause, write, retain, resume. Write failures are logged and execution
/// continues; the partial file is already gone.
fn checkpoint(vm: &mut Runtime, conf: &Conf) {
    let was_paused = vm.paused;
    vm.pause();
    match snapshot::write_checkpoint(vm, &conf.database_directory) {
        Ok(path) => {
            log::info!("checkpoint written to {}", path.display());
            if let Some(max) = conf.max_directory_bytes() {
                if let Err(e) = retention::enforce_budget(
                    &conf.database_directory,
                    max,
                    conf.checkpoint_interval,
                    conf.checkpoint_min_files,
                ) {
                    log::warn!("retention failed: {}", e);
                }
            }
        }
        Err(e) => {
            log::error!("checkpoint failed: {}", e);
        }
    }
    if !was_paused {
        vm.resume();
    }
}
