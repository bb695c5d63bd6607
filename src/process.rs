use crate::{
    event::Event,
    failure::ProcessError,
    runlog,
    runlog::Log,
};
use crossbeam::channel::Sender;
use std::{
    io::{BufRead, BufReader, Read},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

// Where the line streams of a child process go. Queue mode feeds the live
// stream; in that mode the stderr stream is discarded.
#[derive(Clone)]
pub enum Output {
    Log(Log),
    Queue(Sender<String>),
    Discard,
}

pub struct RunOptions {
    pub output: Output,
    pub censor: Vec<String>,
    pub kill_signal: Event,
    pub timeout: Option<u64>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(kill_signal: Event, output: Output) -> Self {
        RunOptions {
            output,
            censor: vec![],
            kill_signal,
            timeout: None,
            env: vec![],
            cwd: None,
        }
    }
}

// Send a signal to a whole process group.
fn signal_group(pid: i32, signal: i32) {
    unsafe {
        libc::kill(-pid, signal);
    }
}

// Send a signal to a single process.
pub fn signal_pid(pid: i32, signal: i32) {
    unsafe {
        libc::kill(pid, signal);
    }
}

fn waiter_log(log: &Option<Log>, message: &str) {
    match log {
        Some(log) => log.line(message),
        None => debug!("{}", message),
    }
}

// Block until the process exits, the kill signal fires, or the timeout
// elapses. If the process is still running at that point, escalate:
// SIGTERM, wait 10 seconds, SIGKILL, wait another 10 seconds. The `delay` is
// used by the docker exec front-end waiter, which must give the in-container
// kill path time to act first.
#[allow(clippy::too_many_arguments)]
fn kill_waiter(
    term: Box<dyn Fn() + Send>,
    kill: Box<dyn Fn() + Send>,
    exited: Event,
    kill_signal: Event,
    timeout: Option<u64>,
    delay: u64,
    log: Option<Log>,
) {
    let start = Instant::now();
    loop {
        if exited.is_set() {
            return;
        }
        if kill_signal.is_set() {
            break;
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= Duration::from_secs(timeout) {
                waiter_log(&log, &format!("Process timed out after: {} seconds", timeout));
                break;
            }
        }
        kill_signal.wait_timeout(Duration::from_secs(1));
    }
    if delay > 0 && exited.wait_timeout(Duration::from_secs(delay)) {
        return;
    }
    if exited.is_set() {
        return;
    }
    waiter_log(&log, "Killing process with SIGTERM");
    term();
    if exited.wait_timeout(Duration::from_secs(10)) {
        return;
    }
    waiter_log(&log, "Process still running: Killing process with SIGKILL");
    kill();
    if !exited.wait_timeout(Duration::from_secs(10)) {
        waiter_log(&log, "Failed to kill process with SIGKILL");
    }
}

// Drain a stream line by line. Each line is censored, stripped of embedded
// carriage returns, and either enqueued or logged. The raw bytes are
// collected and returned in full.
fn read_stream<R: Read>(stream: R, sink: &Output, censor: &[String]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                collected.extend_from_slice(&buffer);
                let line = String::from_utf8_lossy(&buffer);
                let line = runlog::clean_line(line.trim_end(), censor);
                match sink {
                    Output::Log(log) => log.line(&line),
                    Output::Queue(sender) => {
                        let _ = sender.send(line);
                    }
                    Output::Discard => {}
                }
            }
        }
    }
    collected
}

fn stderr_sink(output: &Output) -> Output {
    match output {
        // Queue mode only wants the stdout lines; stderr would otherwise be
        // interleaved into the stream without ordering.
        Output::Queue(_) => Output::Discard,
        other => other.clone(),
    }
}

// Run a command vector and return its stdout bytes. The child is spawned in
// a new session so that one signal terminates all descendants. The stream
// readers are awaited before the exit code is reported, so captured output
// is complete even when the process was killed.
pub fn run_command(command: &[String], options: RunOptions) -> Result<Vec<u8>, ProcessError> {
    if options.kill_signal.is_set() {
        return Err(ProcessError::cancelled("Process start cancelled"));
    }

    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    unsafe {
        // A new session makes the child a process group leader, so the group
        // id equals the child pid and `kill(-pid)` reaches every descendant.
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        ProcessError::cancelled(format!("Unable to spawn {}: {}", command[0], e))
    })?;
    let pid = child.id() as i32;

    let exited = Event::new();
    {
        let exited = exited.clone();
        let kill_signal = options.kill_signal.clone();
        let timeout = options.timeout;
        let log = match &options.output {
            Output::Log(log) => Some(log.clone()),
            _ => None,
        };
        thread::spawn(move || {
            kill_waiter(
                Box::new(move || signal_group(pid, libc::SIGTERM)),
                Box::new(move || signal_group(pid, libc::SIGKILL)),
                exited,
                kill_signal,
                timeout,
                0,
                log,
            );
        });
    }

    let stdout = child.stdout.take().unwrap(); // Safe: stdout is piped
    let stderr = child.stderr.take().unwrap(); // Safe: stderr is piped
    let stdout_output = options.output.clone();
    let stderr_output = stderr_sink(&options.output);
    let stdout_censor = options.censor.clone();
    let stderr_censor = options.censor.clone();
    let stdout_reader =
        thread::spawn(move || read_stream(stdout, &stdout_output, &stdout_censor));
    let stderr_reader =
        thread::spawn(move || read_stream(stderr, &stderr_output, &stderr_censor));

    let stdout_bytes = stdout_reader.join().unwrap_or_default();
    let stderr_bytes = stderr_reader.join().unwrap_or_default();
    let status = child.wait();
    exited.set();

    let status = status
        .map_err(|e| ProcessError::cancelled(format!("Unable to wait for process: {}", e)))?;
    if status.success() {
        Ok(stdout_bytes)
    } else {
        Err(ProcessError {
            message: match status.code() {
                Some(code) => format!("Exit code: {}", code),
                None => "Process terminated by signal".to_owned(),
            },
            exit_code: status.code(),
            stdout: stdout_bytes,
            stderr: stderr_bytes,
        })
    }
}

// Run a command inside a container with `docker exec`.
//
// A signal sent to the `docker exec` front-end does not reach the
// in-container process, so the command is wrapped to first print its
// in-container pid, and the kill path becomes
// `docker exec <container> kill -SIG -- -<pid>` (negative pid: the whole
// process group). A second waiter signals the front-end itself after 25
// seconds as a last resort. The signalling commands get fresh kill events so
// they are not re-cancelled by the signal that triggered them.
pub fn run_docker_exec_command(
    command: &str,
    container_name: &str,
    exec_options: &[String],
    options: RunOptions,
) -> Result<Vec<u8>, ProcessError> {
    if options.kill_signal.is_set() {
        return Err(ProcessError::cancelled("Process start cancelled"));
    }

    let mut full_command = vec!["docker".to_owned(), "exec".to_owned()];
    full_command.extend(exec_options.iter().cloned());
    full_command.push(container_name.to_owned());
    full_command.extend([
        "/bin/bash".to_owned(),
        "-ce".to_owned(),
        format!("echo MAGICSTRING $$\n{}", command),
    ]);

    let mut cmd = Command::new(&full_command[0]);
    cmd.args(&full_command[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::cancelled(format!("Unable to spawn docker exec: {}", e)))?;
    let front_pid = child.id() as i32;

    let exited = Event::new();
    let waiter_log_handle = match &options.output {
        Output::Log(log) => Some(log.clone()),
        _ => None,
    };

    // Last resort: signal the front-end after the in-container path has had
    // its chance.
    {
        let exited = exited.clone();
        let kill_signal = options.kill_signal.clone();
        let timeout = options.timeout;
        let log = waiter_log_handle.clone();
        thread::spawn(move || {
            kill_waiter(
                Box::new(move || signal_pid(front_pid, libc::SIGTERM)),
                Box::new(move || signal_pid(front_pid, libc::SIGKILL)),
                exited,
                kill_signal,
                timeout,
                25,
                log,
            );
        });
    }

    // Extract the in-container pid from the first line of output.
    let stdout = child.stdout.take().unwrap(); // Safe: stdout is piped
    let mut stdout_reader = BufReader::new(stdout);
    let mut first_line = String::new();
    let _ = stdout_reader.read_line(&mut first_line);
    let pid = {
        let mut tokens = first_line.split_whitespace();
        match (tokens.next(), tokens.next().and_then(|t| t.parse::<i32>().ok())) {
            (Some("MAGICSTRING"), Some(pid)) => pid,
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                exited.set();
                return Err(ProcessError::cancelled(format!(
                    "Error parsing pid from first line: {}",
                    first_line,
                )));
            }
        }
    };

    // Kill path through the container, targeting the process group.
    {
        let exited = exited.clone();
        let kill_signal = options.kill_signal.clone();
        let timeout = options.timeout;
        let log = waiter_log_handle;
        let term_command = docker_kill_command(container_name, "-SIGTERM", pid);
        let kill_command = docker_kill_command(container_name, "-SIGKILL", pid);
        thread::spawn(move || {
            kill_waiter(
                Box::new(move || {
                    let _ = run_command(
                        &term_command,
                        RunOptions::new(Event::new(), Output::Discard),
                    );
                }),
                Box::new(move || {
                    let _ = run_command(
                        &kill_command,
                        RunOptions::new(Event::new(), Output::Discard),
                    );
                }),
                exited,
                kill_signal,
                timeout,
                0,
                log,
            );
        });
    }

    let stderr = child.stderr.take().unwrap(); // Safe: stderr is piped
    let stdout_output = options.output.clone();
    let stderr_output = stderr_sink(&options.output);
    let stdout_censor = options.censor.clone();
    let stderr_censor = options.censor.clone();
    let stdout_handle =
        thread::spawn(move || read_stream(stdout_reader, &stdout_output, &stdout_censor));
    let stderr_handle =
        thread::spawn(move || read_stream(stderr, &stderr_output, &stderr_censor));

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();
    let status = child.wait();
    exited.set();

    let status = status
        .map_err(|e| ProcessError::cancelled(format!("Unable to wait for process: {}", e)))?;
    if status.success() {
        Ok(stdout_bytes)
    } else {
        Err(ProcessError {
            message: match status.code() {
                Some(code) => format!("Exit code: {}", code),
                None => "Process terminated by signal".to_owned(),
            },
            exit_code: status.code(),
            stdout: stdout_bytes,
            stderr: stderr_bytes,
        })
    }
}

fn docker_kill_command(container_name: &str, signal: &str, pid: i32) -> Vec<String> {
    vec![
        "docker".to_owned(),
        "exec".to_owned(),
        container_name.to_owned(),
        "kill".to_owned(),
        signal.to_owned(),
        "--".to_owned(),
        format!("-{}", pid),
    ]
}

#[cfg(test)]
mod tests {
    use crate::{
        event::Event,
        process::{run_command, Output, RunOptions},
    };
    use crossbeam::channel::unbounded;
    use std::time::{Duration, Instant};

    fn command(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn captures_stdout() {
        let output = run_command(
            &command(&["/bin/echo", "hello"]),
            RunOptions::new(Event::new(), Output::Discard),
        )
        .unwrap();

        assert_eq!(output, b"hello\n");
    }

    #[test]
    fn nonzero_exit_code() {
        let error = run_command(
            &command(&["/bin/bash", "-c", "echo out; echo err >&2; exit 3"]),
            RunOptions::new(Event::new(), Output::Discard),
        )
        .unwrap_err();

        assert_eq!(error.exit_code, Some(3));
        assert_eq!(error.stdout, b"out\n");
        assert_eq!(error.stderr, b"err\n");
        assert_eq!(error.message, "Exit code: 3");
    }

    #[test]
    fn cancelled_before_start() {
        let kill_signal = Event::new();
        kill_signal.set();
        let error = run_command(
            &command(&["/bin/echo", "hello"]),
            RunOptions::new(kill_signal, Output::Discard),
        )
        .unwrap_err();

        assert_eq!(error.message, "Process start cancelled");
        assert!(error.exit_code.is_none());
    }

    #[test]
    fn kill_signal_terminates_process_tree() {
        let kill_signal = Event::new();
        let killer = kill_signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            killer.set();
        });

        let start = Instant::now();
        let error = run_command(
            &command(&["/bin/bash", "-c", "sleep 30"]),
            RunOptions::new(kill_signal, Output::Discard),
        )
        .unwrap_err();

        // Killed by signal, so there is no exit code, and it happened long
        // before the sleep could finish.
        assert!(error.exit_code.is_none());
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn timeout_terminates_process() {
        let start = Instant::now();
        let error = run_command(
            &command(&["/bin/bash", "-c", "sleep 30"]),
            RunOptions {
                timeout: Some(1),
                ..RunOptions::new(Event::new(), Output::Discard)
            },
        )
        .unwrap_err();

        assert!(error.exit_code.is_none());
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn trapped_sigterm_exit_code_is_reported() {
        let kill_signal = Event::new();
        let killer = kill_signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            killer.set();
        });

        // The child catches the termination signal and chooses its own exit
        // code, which must come back intact.
        let error = run_command(
            &command(&[
                "/bin/bash",
                "-c",
                "trap 'exit 101' TERM; while true; do sleep 0.2; done",
            ]),
            RunOptions::new(kill_signal, Output::Discard),
        )
        .unwrap_err();

        assert_eq!(error.exit_code, Some(101));
        assert_eq!(error.message, "Exit code: 101");
    }

    #[test]
    fn no_descendants_survive_cancellation() {
        let kill_signal = Event::new();
        let killer = kill_signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            killer.set();
        });

        // The command prints the pid of a grandchild, then blocks on it.
        let (sender, receiver) = unbounded();
        let _ = run_command(
            &command(&["/bin/bash", "-c", "sleep 30 & echo $!; wait"]),
            RunOptions::new(kill_signal, Output::Queue(sender)),
        );

        let grandchild = receiver.recv().unwrap().parse::<i32>().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let alive = unsafe { libc::kill(grandchild, 0) } == 0;
            if !alive {
                break;
            }
            assert!(Instant::now() < deadline, "grandchild outlived the kill");
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[test]
    fn queue_mode_receives_censored_lines() {
        let (sender, receiver) = unbounded();
        run_command(
            &command(&["/bin/bash", "-c", "echo token is hunter2"]),
            RunOptions {
                censor: vec!["hunter2".to_owned()],
                ..RunOptions::new(Event::new(), Output::Queue(sender))
            },
        )
        .unwrap();

        assert_eq!(receiver.recv().unwrap(), "token is ********");
    }
}
