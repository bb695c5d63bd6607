use crate::{
    config::STATE_FILE,
    event::Event,
    executor,
    executor::{Executor, ShOptions},
    failure::Failure,
    runlog::Log,
    semaphore::{acquire_either, Lock, SemaphoreQueue},
    stash::Stash,
    state::{epoch_now, overall_status, StateSnapshot, Status, TaskSnapshot},
    taskfile,
    taskfile::{ExecutorKind, Substitutions, Task},
};
use std::{
    collections::HashMap,
    env,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

// The attributes that identify a run. Everything here is immutable for the
// run's whole life.
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub commit: String,
    pub branch: String,
    pub repo_name: String,
    pub log_url: String,
    pub identifier: String,
    pub logdir: PathBuf,
}

// A task's mutable fields. Tasks live in a vector owned by the run state;
// dependencies refer to them by name, resolved to positions at load time.
struct TaskData {
    status: Status,
    acquired_semaphore: String,
    started: Option<f64>,
    finished: Option<f64>,
}

struct Inner {
    tasks: Vec<TaskData>,
    started: f64,
    finished: Option<f64>,
    source: Option<Stash>,
    artifacts: HashMap<String, Stash>,
}

// The live state of one run. All mutation happens under the single `inner`
// mutex, and every status assignment writes a full snapshot while still
// holding it, so any `state.json` read observes a globally-consistent task
// set.
pub struct State {
    pub info: RunInfo,
    decls: Vec<Task>,
    task_index: HashMap<String, usize>,
    completed: Vec<Event>,
    inner: Mutex<Inner>,
    kill_signal: Event,
    log: Log,
}

impl State {
    pub fn new(info: RunInfo, decls: Vec<Task>, kill_signal: Event, log: Log) -> State {
        let task_index = decls
            .iter()
            .enumerate()
            .map(|(i, task)| (task.name.clone(), i))
            .collect();
        let completed = decls.iter().map(|_| Event::new()).collect();
        let tasks = decls
            .iter()
            .map(|_| TaskData {
                status: Status::NotStarted,
                acquired_semaphore: String::new(),
                started: None,
                finished: None,
            })
            .collect();
        State {
            info,
            decls,
            task_index,
            completed,
            inner: Mutex::new(Inner {
                tasks,
                started: epoch_now(),
                finished: None,
                source: None,
                artifacts: HashMap::new(),
            }),
            kill_signal,
            log,
        }
    }

    pub fn task_count(&self) -> usize {
        self.decls.len()
    }

    pub fn task_status(&self, index: usize) -> Status {
        self.inner.lock().unwrap().tasks[index].status
    }

    pub fn completed(&self, index: usize) -> &Event {
        &self.completed[index]
    }

    pub fn set_source(&self, source: Stash) {
        self.inner.lock().unwrap().source = Some(source);
    }

    pub fn source(&self) -> Option<Stash> {
        self.inner.lock().unwrap().source.clone()
    }

    pub fn store_artifact(&self, task_name: &str, stash: Stash) {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .insert(task_name.to_owned(), stash);
    }

    pub fn artifact(&self, task_name: &str) -> Option<Stash> {
        self.inner.lock().unwrap().artifacts.get(task_name).cloned()
    }

    fn snapshot_locked(&self, inner: &Inner) -> StateSnapshot {
        StateSnapshot {
            commit: self.info.commit.clone(),
            branch: self.info.branch.clone(),
            repo_name: self.info.repo_name.clone(),
            log_url: self.info.log_url.clone(),
            identifier: self.info.identifier.clone(),
            status: overall_status(
                &inner
                    .tasks
                    .iter()
                    .map(|task| task.status)
                    .collect::<Vec<_>>(),
            ),
            started: inner.started,
            finished: inner.finished,
            tasks: self
                .decls
                .iter()
                .zip(inner.tasks.iter())
                .map(|(decl, data)| TaskSnapshot {
                    name: decl.name.clone(),
                    status: data.status,
                    run_after: decl.run_after.clone(),
                    run_always: decl.run_always,
                    acquire_semaphore: decl.acquire_semaphore.clone(),
                    acquired_semaphore: data.acquired_semaphore.clone(),
                    started: data.started,
                    finished: data.finished,
                })
                .collect(),
        }
    }

    fn save_locked(&self, inner: &Inner) {
        let snapshot = self.snapshot_locked(inner);
        if let Err(e) = snapshot.save(&self.info.logdir.join(STATE_FILE)) {
            error!("{}", e);
        }
    }

    pub fn save(&self) {
        let inner = self.inner.lock().unwrap();
        self.save_locked(&inner);
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock().unwrap();
        self.snapshot_locked(&inner)
    }

    pub fn status(&self) -> Status {
        let inner = self.inner.lock().unwrap();
        overall_status(
            &inner
                .tasks
                .iter()
                .map(|task| task.status)
                .collect::<Vec<_>>(),
        )
    }

    pub fn set_status(&self, index: usize, status: Status) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index].status = status;
        self.save_locked(&inner);
    }

    pub fn set_started(&self, index: usize, timestamp: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index].started = Some(timestamp);
        self.save_locked(&inner);
    }

    pub fn set_finished(&self, index: usize, timestamp: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index].finished = Some(timestamp);
        self.save_locked(&inner);
    }

    pub fn set_acquired_semaphore(&self, index: usize, endpoint: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks[index].acquired_semaphore = endpoint.to_owned();
        self.save_locked(&inner);
    }

    // Stamp the run itself as finished and persist.
    pub fn finish_run(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished = Some(epoch_now());
        self.save_locked(&inner);
    }
}

// Task failures never propagate out of the worker: a skip is recorded as
// `skipped`, anything else as `failed`, and dependents observe either
// through the completion event and the persisted status.
enum TaskError {
    Skipped,
    Failed(Failure),
}

// Start every task in its own thread and wait for all of them. The
// dependency graph is enforced purely through prerequisite waiting.
pub fn run_tasks(state: &Arc<State>) {
    state.save();

    let handles = (0..state.task_count())
        .map(|index| {
            let state = state.clone();
            let name = state.decls[index].name.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || task_worker(&state, index))
        })
        .collect::<Vec<_>>();

    for handle in handles {
        match handle {
            Ok(handle) => {
                let _ = handle.join();
            }
            Err(e) => error!("Unable to spawn task thread: {}", e),
        }
    }
}

fn task_worker(state: &State, index: usize) {
    let decl = &state.decls[index];
    let log = state.log.task(&decl.name);

    match execute_task(state, index, &log) {
        Ok(()) => {}
        Err(TaskError::Skipped) => {
            state.set_status(index, Status::Skipped);
            log.line("Task skipped");
        }
        Err(TaskError::Failed(e)) => {
            state.set_status(index, Status::Failed);
            if let Failure::Process(process_error) = &e {
                // The exit code was already printed by the runner.
                log.line(&format!("Task failed: {}", process_error));
            } else {
                log.line("Task failed");
                for line in format!("{}", e).lines() {
                    log.line(line);
                }
            }
        }
    }

    // In all exit paths: stamp, persist, then wake dependents.
    state.set_finished(index, epoch_now());
    state.completed[index].set();
}

fn execute_task(state: &State, index: usize, log: &Log) -> Result<(), TaskError> {
    wait_for_tasks(state, index, log)?;

    let decl = &state.decls[index];
    if decl.acquire_semaphore.is_empty() {
        run_and_mark(state, index, log).map_err(TaskError::Failed)
    } else {
        state.set_status(index, Status::WaitingForSemaphore);
        let self_description = format!(
            "{}:{}:{}",
            decl.name, state.info.repo_name, state.info.identifier,
        );
        let locks = decl
            .acquire_semaphore
            .iter()
            .map(|endpoint| {
                Box::new(SemaphoreQueue::new(
                    endpoint,
                    &self_description,
                    state.kill_signal.clone(),
                    log.clone(),
                )) as Box<dyn Lock>
            })
            .collect::<Vec<_>>();
        let acquired = acquire_either(locks).map_err(TaskError::Failed)?;
        state.set_acquired_semaphore(index, &decl.acquire_semaphore[acquired.index()]);
        run_and_mark(state, index, log).map_err(TaskError::Failed)
        // `acquired` drops here, releasing the semaphore.
    }
}

fn run_and_mark(state: &State, index: usize, log: &Log) -> Result<(), Failure> {
    log.line("Task started");
    state.set_started(index, epoch_now());
    state.set_status(index, Status::Running);
    run_task_body(state, index, log)?;
    log.line("Task success");
    state.set_status(index, Status::Success);
    Ok(())
}

fn wait_for_tasks(state: &State, index: usize, log: &Log) -> Result<(), TaskError> {
    let decl = &state.decls[index];
    if decl.run_after.is_empty() {
        return Ok(());
    }

    state.set_status(index, Status::WaitingForTask);
    let dependencies = decl
        .run_after
        .iter()
        .map(|name| state.task_index[name])
        .collect::<Vec<_>>();

    for &dependency in &dependencies {
        if !state.completed[dependency].is_set() {
            log.line(&format!("Waiting for task: {}", state.decls[dependency].name));
        }
        state.completed[dependency].wait();
    }
    for &dependency in &dependencies {
        if state.task_status(dependency) != Status::Success && !decl.run_always {
            // Let the dependency's final log lines land first.
            thread::sleep(Duration::from_millis(200));
            log.line(&format!(
                "Dependent task did not succeed: {}",
                state.decls[dependency].name,
            ));
            return Err(TaskError::Skipped);
        }
    }
    log.line(&format!(
        "Finished waiting for tasks: {}",
        decl.run_after.join(", "),
    ));
    state.set_status(index, Status::Running);
    Ok(())
}

// Build the declared executor and run the task's body through it. The
// executor is closed on every path; a body failure wins over a close
// failure.
fn run_task_body(state: &State, index: usize, log: &Log) -> Result<(), Failure> {
    let decl = &state.decls[index];
    let substitutions = Substitutions {
        commit: &state.info.commit,
        branch: &state.info.branch,
        identifier: &state.info.identifier,
        repo_name: &state.info.repo_name,
        log_url: &state.info.log_url,
    };
    let kill_signal = state.kill_signal.clone();

    let mut executor: Box<dyn Executor> = match decl.executor {
        ExecutorKind::Local => Box::new(executor::Local::open(
            None,
            decl.temp_path,
            kill_signal,
            log.clone(),
        )?),
        ExecutorKind::Container => Box::new(executor::LocalContainer::open(
            &taskfile::substitute(&decl.image, &substitutions),
            decl.mount_docker,
            None,
            decl.temp_path,
            kill_signal,
            log.clone(),
        )?),
        ExecutorKind::Ssh => Box::new(executor::Ssh::open(
            &taskfile::substitute(&required_host(decl)?, &substitutions),
            None,
            decl.temp_path,
            kill_signal,
            log.clone(),
        )?),
        ExecutorKind::Forwarded => Box::new(executor::ForwardedDockerSock::open(
            &taskfile::substitute(&required_host(decl)?, &substitutions),
            None,
            decl.temp_path,
            kill_signal,
            log.clone(),
        )?),
    };

    let result = run_steps(executor.as_mut(), state, index, &substitutions);
    let close_result = executor.close();
    result?;
    close_result
}

fn required_host(decl: &Task) -> Result<String, Failure> {
    let substituted = decl.host.as_ref().ok_or_else(|| {
        Failure::Config(format!("Task {} has no host.", decl.name))
    })?;
    Ok(substituted.clone())
}

fn run_steps(
    executor: &mut dyn Executor,
    state: &State,
    index: usize,
    substitutions: &Substitutions,
) -> Result<(), Failure> {
    let decl = &state.decls[index];

    if decl.unstash_source {
        let source = state.source().ok_or_else(|| {
            Failure::Config(format!(
                "Task {} wants the source stash, but there is none.",
                decl.name,
            ))
        })?;
        executor.unstash(&source, None)?;
    }

    if let Some(script) = &decl.script {
        // Censored variables are exported to the script and masked in all
        // output.
        let mut censor = vec![];
        let mut script_env = vec![];
        for name in &decl.censor {
            if let Ok(value) = env::var(name) {
                censor.push(value.clone());
                script_env.push((name.clone(), value));
            }
        }
        executor.sh(
            &taskfile::substitute(script, substitutions),
            ShOptions {
                censor,
                timeout: decl.timeout,
                env: script_env,
                kill_signal: None,
            },
        )?;
    }

    if let Some(glob) = &decl.stash {
        let stash = executor.stash(glob)?;
        state.store_artifact(&decl.name, stash);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{
        config::STATE_FILE,
        event::Event,
        runlog::Log,
        scheduler::{run_tasks, RunInfo, State},
        state::{StateSnapshot, Status},
        taskfile::Task,
    };
    use std::{fs, sync::Arc};

    fn run_info(logdir: &std::path::Path) -> RunInfo {
        RunInfo {
            commit: "0000000000000000000000000000000000000000".to_owned(),
            branch: "main".to_owned(),
            repo_name: "testing".to_owned(),
            log_url: "http://localhost/logs/1_x".to_owned(),
            identifier: "1_x".to_owned(),
            logdir: logdir.to_owned(),
        }
    }

    fn script_task(name: &str, run_after: &[&str], script: &str) -> Task {
        Task {
            run_after: run_after.iter().map(|s| (*s).to_owned()).collect(),
            script: Some(script.to_owned()),
            ..Task::synthetic(name)
        }
    }

    fn run(decls: Vec<Task>, logdir: &std::path::Path) -> Arc<State> {
        let state = Arc::new(State::new(
            run_info(logdir),
            decls,
            Event::new(),
            Log::open(logdir).unwrap(),
        ));
        run_tasks(&state);
        state.finish_run();
        state
    }

    #[test]
    fn dag_ordering_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let order = dir.path().join("order.txt");
        let append = |letter: &str| format!("echo -n {} >> {}", letter, order.to_string_lossy());

        // A <- B <- C, C -> {D, E, F, G}, {D, E, F, G} -> H.
        let decls = vec![
            script_task("A", &[], &append("A")),
            script_task("B", &["A"], &append("B")),
            script_task("C", &["B"], &append("C")),
            script_task("D", &["C"], &append("-")),
            script_task("E", &["C"], &append("-")),
            script_task("F", &["C"], &append("-")),
            script_task("G", &["C"], &append("-")),
            script_task("H", &["D", "E", "F", "G"], &append("H")),
        ];

        let state = run(decls, dir.path());
        assert_eq!(fs::read_to_string(&order).unwrap(), "ABC----H");
        assert_eq!(state.status(), Status::Success);

        // Dependency edges hold on the recorded timestamps too.
        let snapshot = state.snapshot();
        let by_name = |name: &str| {
            snapshot
                .tasks
                .iter()
                .find(|task| task.name == name)
                .unwrap()
                .clone()
        };
        assert!(by_name("B").started.unwrap() >= by_name("A").finished.unwrap());
        assert!(by_name("H").started.unwrap() >= by_name("D").finished.unwrap());
    }

    #[test]
    fn failure_skips_dependents_unless_run_always() {
        let dir = tempfile::tempdir().unwrap();
        let decls = vec![
            script_task("A", &[], "exit 1"),
            script_task("B", &["A"], "true"),
            Task {
                run_always: true,
                ..script_task("C", &["A"], "true")
            },
        ];

        let state = run(decls, dir.path());
        assert_eq!(state.task_status(0), Status::Failed);
        assert_eq!(state.task_status(1), Status::Skipped);
        assert_eq!(state.task_status(2), Status::Success);
        assert_eq!(state.status(), Status::Failed);
    }

    #[test]
    fn empty_task_list_is_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let state = run(vec![], dir.path());
        assert_eq!(state.status(), Status::NotStarted);
    }

    #[test]
    fn snapshot_file_tracks_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let decls = vec![script_task("only", &[], "true")];
        let state = run(decls, dir.path());

        let snapshot = StateSnapshot::load(&dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(snapshot.identifier, state.info.identifier);
        assert_eq!(snapshot.status, Status::Success);
        assert!(snapshot.finished.is_some());
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].name, "only");
        assert_eq!(snapshot.tasks[0].status, Status::Success);
        assert!(snapshot.tasks[0].finished.unwrap() >= snapshot.tasks[0].started.unwrap());
    }

    #[test]
    fn task_failure_records_failed_status_and_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let decls = vec![
            script_task("bad", &[], "exit 7"),
            script_task("good", &[], "true"),
        ];
        let state = run(decls, dir.path());
        assert_eq!(state.task_status(0), Status::Failed);
        assert_eq!(state.task_status(1), Status::Success);
        assert_eq!(state.status(), Status::Failed);

        // The failure is visible in the log.
        let log = fs::read_to_string(dir.path().join("output.log")).unwrap();
        assert!(log.contains("Task failed: Exit code: 7"));
    }
}
