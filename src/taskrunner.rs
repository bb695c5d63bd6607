use crate::{
    event::Event,
    executor,
    executor::Executor,
    failure::Failure,
    format,
    runlog::Log,
    scheduler::{run_tasks, RunInfo, State},
    stash,
    state::{epoch_now, Status},
    taskfile,
    taskfile::Task,
};
use std::{fs, path::PathBuf, sync::Arc};

// The flag surface of the in-container runner. The supervisor passes all of
// these on the `docker run` command line.
pub struct Args {
    pub commit: String,
    pub branch: String,
    pub identifier: String,
    pub repo_name: String,
    pub log_url: String,
    pub logdir: PathBuf,
    pub file: PathBuf,
}

// Record a run that never got as far as having tasks: a single synthetic
// task carries the failure, and the run is failed.
fn record_failed_import(info: RunInfo, error: &Failure, kill_signal: Event, log: &Log) {
    let state = State::new(
        info,
        vec![Task::synthetic("FailedImport")],
        kill_signal,
        log.clone(),
    );
    let task_log = log.task("FailedImport");
    task_log.line("Unable to load task file");
    for line in format!("{}", error).lines() {
        task_log.line(line);
    }
    state.set_status(0, Status::Failed);
    state.set_finished(0, epoch_now());
    state.completed(0).set();
    state.finish_run();
}

// Turn a fetched commit into a finished run: load the task declarations,
// stash the commit's tree for tasks that want it, run the scheduler, and
// leave the outcome in `state.json`. Returns `Ok` regardless of task
// success; an error here means the runner itself crashed.
pub fn run(args: Args, kill_signal: Event) -> Result<(), Failure> {
    let log = Log::open(&args.logdir)?;

    // Clean shutdown: best-effort removal of local stash files, on every
    // exit path.
    defer! {
        stash::remove_registered_tmp_files();
    }

    let info = RunInfo {
        commit: args.commit.clone(),
        branch: args.branch,
        repo_name: args.repo_name,
        log_url: args.log_url,
        identifier: args.identifier,
        logdir: args.logdir,
    };

    let taskfile = match fs::read_to_string(&args.file)
        .map_err(|e| {
            Failure::User(
                format!(
                    "Unable to read task file {}. Reason: {}",
                    args.file.to_string_lossy(),
                    e,
                ),
                None,
            )
        })
        .and_then(|data| taskfile::parse(&data))
    {
        Ok(taskfile) => taskfile,
        Err(e) => {
            error!("{}", e);
            record_failed_import(info, &e, kill_signal, &log);
            return Ok(()); // The outcome lives in the state file.
        }
    };

    let needs_source = taskfile.tasks.iter().any(|task| task.unstash_source);
    let state = Arc::new(State::new(
        info,
        taskfile.tasks,
        kill_signal.clone(),
        log.clone(),
    ));

    if needs_source {
        let mut exe = executor::Local::open(None, false, kill_signal, log.clone())?;
        let source = exe.stash_from_git_archive(&args.commit)?;
        exe.close()?;
        state.set_source(source);
    }

    info!(
        "Running {}",
        format::number(state.task_count(), "task"),
    );
    run_tasks(&state);
    state.finish_run();
    Ok(())
}
