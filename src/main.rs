use {
    atty::Stream,
    clap::{App, AppSettings, Arg},
    env_logger::{fmt::Color, Builder},
    griddle::{
        config::Config,
        event::Event,
        failure,
        failure::Failure,
        queue,
        runlog,
        semaphore,
        server,
        supervisor::Supervisor,
        taskrunner,
    },
    log::{error, Level, LevelFilter},
    std::{
        env,
        io::{stdout, Write},
        mem::drop,
        path::PathBuf,
        process::exit,
        str::FromStr,
        sync::Arc,
    },
};

// The program version
const VERSION: &str = env!("CARGO_PKG_VERSION");

// Defaults
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

// Command-line argument and option names
const TASKRUNNER_OPTION: &str = "taskrunner";
const COMMIT_OPTION: &str = "commit";
const BRANCH_OPTION: &str = "branch";
const IDENTIFIER_OPTION: &str = "identifier";
const REPO_NAME_OPTION: &str = "repo-name";
const LOG_URL_OPTION: &str = "log-url";
const LOGDIR_OPTION: &str = "logdir";
const FILE_OPTION: &str = "file";
const SEMAPHORE_OPTION: &str = "semaphore";
const SELF_DESCRIPTION_OPTION: &str = "self-description";
const READ_OPTION: &str = "read";

// Set up the logger.
fn set_up_logging() {
    Builder::new()
        .filter_module(
            module_path!(),
            LevelFilter::from_str(
                &env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string()),
            )
            .unwrap_or(DEFAULT_LOG_LEVEL),
        )
        .format(|buf, record| {
            let mut style = buf.style();
            style.set_bold(true);
            match record.level() {
                Level::Error => {
                    style.set_color(Color::Red);
                }
                Level::Warn => {
                    style.set_color(Color::Yellow);
                }
                Level::Info => {
                    style.set_color(Color::Green);
                }
                Level::Debug | Level::Trace => {
                    style.set_color(Color::Blue);
                }
            }

            writeln!(
                buf,
                "{} {}",
                style.value(format!("[{}]", record.level())),
                record.args().to_string(),
            )
        })
        .init();
}

// Set up the signal handlers. A SIGTERM or SIGINT cancels the root kill
// event; everything spawned through the process runner observes it and
// terminates its whole process tree. This also traps SIGTERM because the
// `ctrlc` crate is compiled with the `termination` feature [ref:ctrlc_term].
fn set_up_signal_handlers(kill_signal: Event) -> Result<(), Failure> {
    ctrlc::set_handler(move || {
        kill_signal.set();

        // We may have been in the middle of printing a line of output. Here
        // we print a newline to prepare for further printing.
        drop(stdout().write(b"\n"));
    })
    .map_err(failure::system("Error installing signal handler."))
}

// Which of the three programs this invocation is.
enum Mode {
    Server,
    Taskrunner(taskrunner::Args),
    Semaphore {
        path: PathBuf,
        description: String,
        read: bool,
    },
}

// Parse the command-line arguments.
#[allow(clippy::too_many_lines)]
fn settings() -> Result<Mode, Failure> {
    let matches = App::new("Griddle")
        .version(VERSION)
        .about("Griddle is a minimal continuous integration server.")
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::NextLineHelp)
        .setting(AppSettings::UnifiedHelpMessage)
        .arg(
            Arg::with_name(TASKRUNNER_OPTION)
                .long(TASKRUNNER_OPTION)
                .help("Runs the tasks for a single commit and exits"),
        )
        .arg(
            Arg::with_name(COMMIT_OPTION)
                .value_name("SHA")
                .long(COMMIT_OPTION)
                .help("Sets the commit to run tasks for"),
        )
        .arg(
            Arg::with_name(BRANCH_OPTION)
                .value_name("NAME")
                .long(BRANCH_OPTION)
                .help("Sets the branch the commit was fetched from"),
        )
        .arg(
            Arg::with_name(IDENTIFIER_OPTION)
                .value_name("ID")
                .long(IDENTIFIER_OPTION)
                .help("Sets the run identifier"),
        )
        .arg(
            Arg::with_name(REPO_NAME_OPTION)
                .value_name("NAME")
                .long(REPO_NAME_OPTION)
                .help("Sets the repository name"),
        )
        .arg(
            Arg::with_name(LOG_URL_OPTION)
                .value_name("URL")
                .long(LOG_URL_OPTION)
                .help("Sets the URL of this run's log page"),
        )
        .arg(
            Arg::with_name(LOGDIR_OPTION)
                .value_name("PATH")
                .long(LOGDIR_OPTION)
                .help("Sets the directory for the state and log files"),
        )
        .arg(
            Arg::with_name(FILE_OPTION)
                .value_name("PATH")
                .short("f")
                .long(FILE_OPTION)
                .help("Sets the path to the task file"),
        )
        .arg(
            Arg::with_name(SEMAPHORE_OPTION)
                .value_name("PATH")
                .long(SEMAPHORE_OPTION)
                .help("Runs the semaphore queue helper against a queue file"),
        )
        .arg(
            Arg::with_name(SELF_DESCRIPTION_OPTION)
                .value_name("TEXT")
                .long(SELF_DESCRIPTION_OPTION)
                .help("Sets the description recorded in the semaphore queue"),
        )
        .arg(
            Arg::with_name(READ_OPTION)
                .long(READ_OPTION)
                .help("Prints the semaphore queue as JSON and exits"),
        )
        .get_matches();

    if let Some(path) = matches.value_of(SEMAPHORE_OPTION) {
        return Ok(Mode::Semaphore {
            path: PathBuf::from(path),
            description: matches
                .value_of(SELF_DESCRIPTION_OPTION)
                .unwrap_or_default()
                .to_owned(),
            read: matches.is_present(READ_OPTION),
        });
    }

    if matches.is_present(TASKRUNNER_OPTION) {
        let required = |option: &str| -> Result<String, Failure> {
            matches
                .value_of(option)
                .map(std::borrow::ToOwned::to_owned)
                .ok_or_else(|| Failure::Config(format!("Missing --{}.", option)))
        };
        return Ok(Mode::Taskrunner(taskrunner::Args {
            commit: required(COMMIT_OPTION)?,
            branch: required(BRANCH_OPTION)?,
            identifier: required(IDENTIFIER_OPTION)?,
            repo_name: required(REPO_NAME_OPTION)?,
            log_url: required(LOG_URL_OPTION)?,
            logdir: PathBuf::from(required(LOGDIR_OPTION)?),
            file: PathBuf::from(required(FILE_OPTION)?),
        }));
    }

    Ok(Mode::Server)
}

// Print a queue endpoint as JSON: directly for a local file, through the
// caller-side reader for a `user@host:path` endpoint.
fn read_semaphore(path: &std::path::Path) -> Result<(), Failure> {
    let endpoint = path.to_string_lossy();
    if endpoint.contains(':') {
        let (concurrency, entries) =
            semaphore::read_queue(&endpoint, Event::new(), runlog::Log::plain())?;
        let output = serde_json::to_string(&(concurrency, entries))
            .map_err(failure::system("Unable to serialize queue."))?;
        println!("{}", output);
        Ok(())
    } else {
        queue::print_queue(path)
    }
}

// Program entrypoint
fn entry() -> Result<(), Failure> {
    // Determine whether to print colored output.
    colored::control::set_override(atty::is(Stream::Stderr));

    // Set up the logger.
    set_up_logging();

    // Parse the command-line arguments.
    match settings()? {
        Mode::Semaphore {
            path,
            description,
            read,
        } => {
            if read {
                read_semaphore(&path)
            } else {
                let stop = Event::new();
                set_up_signal_handlers(stop.clone())?;
                queue::wait_in_queue(&path, &description, &stop)
            }
        }
        Mode::Taskrunner(args) => {
            let kill_signal = Event::new();
            set_up_signal_handlers(kill_signal.clone())?;
            taskrunner::run(args, kill_signal)
        }
        Mode::Server => {
            let kill_signal = Event::new();
            set_up_signal_handlers(kill_signal.clone())?;
            let config = Config::from_env()?;
            let supervisor = Arc::new(Supervisor::new(config, kill_signal));
            supervisor.init()?;

            // Scan once at boot, then on every trigger.
            supervisor.scan_trigger.set();
            server::serve(supervisor)
        }
    }
}

// Let the fun begin!
fn main() {
    // Jump to the entrypoint and handle any resulting errors.
    if let Err(e) = entry() {
        error!("{}", e);
        exit(1);
    }
}
