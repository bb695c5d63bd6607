use crate::{
    event::Event,
    executor::shell_escape,
    failure,
    failure::Failure,
    process::{run_command, signal_pid, Output, RunOptions},
    queue,
    runlog::Log,
    stash,
};
use crossbeam::channel::unbounded;
use std::{
    io::{BufRead, BufReader, Read},
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

// Anything that can be acquired (blocking) and hands back a guard that
// releases on drop. Both in-process locks and subprocess-backed semaphore
// queues fit this shape, which is what lets the either-lock combinator treat
// them uniformly.
pub trait Lock: Send {
    fn acquire(&self) -> Result<Box<dyn Send>, Failure>;
}

// A semaphore endpoint is either a local path or `user@host:path` naming a
// JSON queue file. Acquisition spawns a queue-helper program next to the
// file: locally this binary itself, remotely a copy of it shipped over
// `scp`. The helper announces acquisition with a magic stdout line and is
// respawned after a 10 second pause if it dies first; the queue file is
// self-healing, so a crashed helper leaves no trace beyond one liveness
// pass.
pub struct SemaphoreQueue {
    endpoint: String,
    self_description: String,
    kill_signal: Event,
    log: Log,
}

// Where the helper runs, and how to reach the queue file from there.
enum Endpoint {
    Local(String),
    Remote { host: String, filename: String },
}

fn parse_endpoint(endpoint: &str) -> Endpoint {
    match endpoint.split_once(':') {
        Some((host, filename)) => Endpoint::Remote {
            host: host.to_owned(),
            filename: filename.to_owned(),
        },
        None => Endpoint::Local(endpoint.to_owned()),
    }
}

// A running helper process, plus the remote binary to clean up afterwards.
struct Helper {
    child: Child,
    remote_binary: Option<(String, PathBuf)>,
}

impl Helper {
    fn cleanup(&mut self) {
        if let Some((host, path)) = self.remote_binary.take() {
            if stash::assert_path_in_tmp(&path).is_err() {
                return;
            }
            let command = vec![
                "ssh".to_owned(),
                host,
                format!("rm {}", shell_escape(&path.to_string_lossy())),
            ];
            let _ = run_command(&command, RunOptions::new(Event::new(), Output::Discard));
        }
    }
}

// The guard held while the semaphore is ours. Dropping it terminates the
// helper, whose shutdown path prunes its own entry from the queue file.
pub struct SemaphoreGuard {
    helper: Option<Helper>,
    done: Event,
    log: Log,
    endpoint: String,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.log.line(&format!("Semaphore released {}", self.endpoint));
        if let Some(mut helper) = self.helper.take() {
            signal_pid(helper.child.id() as i32, libc::SIGTERM);
            let _ = helper.child.wait();
            self.done.set();
            helper.cleanup();
        }
    }
}

impl SemaphoreQueue {
    pub fn new(endpoint: &str, self_description: &str, kill_signal: Event, log: Log) -> Self {
        SemaphoreQueue {
            endpoint: endpoint.to_owned(),
            self_description: self_description.to_owned(),
            kill_signal,
            log,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn spawn_helper(&self, read_mode: bool) -> Result<Helper, Failure> {
        let exe = std::env::current_exe()
            .map_err(failure::system("Unable to determine own executable."))?;

        match parse_endpoint(&self.endpoint) {
            Endpoint::Local(filename) => {
                let mut command = Command::new(exe);
                command
                    .arg("--semaphore")
                    .arg(&filename)
                    .arg(format!("--self-description={}", self.self_description));
                if read_mode {
                    command.arg("--read");
                }
                let child = command
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(failure::system("Unable to spawn semaphore helper."))?;
                Ok(Helper {
                    child,
                    remote_binary: None,
                })
            }
            Endpoint::Remote { host, filename } => {
                // The helper must run where the queue file and its pids live,
                // so ship this binary there first. `scp` preserves the
                // executable bit.
                let helper_path = stash::random_tmp_path();
                let scp = vec![
                    "scp".to_owned(),
                    exe.to_string_lossy().into_owned(),
                    format!("{}:{}", host, helper_path.to_string_lossy()),
                ];
                run_command(
                    &scp,
                    RunOptions::new(self.kill_signal.clone(), Output::Discard),
                )
                .map_err(Failure::Process)?;

                let mut remote_command = format!(
                    "{} --semaphore {} --self-description={}",
                    shell_escape(&helper_path.to_string_lossy()),
                    shell_escape(&filename),
                    shell_escape(&self.self_description),
                );
                if read_mode {
                    remote_command.push_str(" --read");
                }
                let child = Command::new("ssh")
                    .arg(&host)
                    .arg(&remote_command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(failure::system("Unable to spawn ssh for semaphore helper."))?;
                Ok(Helper {
                    child,
                    remote_binary: Some((host, helper_path)),
                })
            }
        }
    }

    // Watch the kill signal while a helper runs, and terminate the helper
    // when it fires. The helper's own shutdown prunes its queue entry.
    fn spawn_helper_killer(&self, pid: i32, done: &Event) {
        let kill_signal = self.kill_signal.clone();
        let done = done.clone();
        thread::spawn(move || {
            loop {
                if done.is_set() {
                    return;
                }
                if kill_signal.is_set() {
                    break;
                }
                kill_signal.wait_timeout(Duration::from_secs(5));
            }
            if !done.is_set() {
                signal_pid(pid, libc::SIGTERM);
            }
        });
    }

    fn acquire_guard(&self) -> Result<SemaphoreGuard, Failure> {
        loop {
            if self.kill_signal.is_set() {
                return Err(Failure::Interrupted);
            }

            let mut helper = self.spawn_helper(false)?;
            let done = Event::new();
            self.spawn_helper_killer(helper.child.id() as i32, &done);

            let stdout = helper.child.stdout.take().unwrap(); // Safe: stdout is piped
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = line.trim_end();
                        if let Some(message) = line.strip_prefix(queue::MESSAGE_PREFIX) {
                            self.log.line(message);
                        }
                        if line == queue::ACQUIRED_LINE {
                            self.log
                                .line(&format!("Semaphore acquired {}", self.endpoint));
                            return Ok(SemaphoreGuard {
                                helper: Some(helper),
                                done,
                                log: self.log.clone(),
                                endpoint: self.endpoint.clone(),
                            });
                        }
                    }
                }
            }

            // The helper exited before acquiring.
            let status = helper.child.wait();
            done.set();
            helper.cleanup();
            if self.kill_signal.is_set() {
                return Err(Failure::Interrupted);
            }
            if matches!(&status, Ok(status) if status.success()) {
                // A clean exit without acquisition means the helper was
                // terminated underneath us.
                return Err(Failure::System(
                    "Killed while waiting for semaphore".to_owned(),
                    None,
                ));
            }
            self.log.line("Semaphore process crashed");
            if self.kill_signal.wait_timeout(Duration::from_secs(10)) {
                return Err(Failure::Interrupted);
            }
            self.log.line("Retrying semaphore");
        }
    }
}

impl Lock for SemaphoreQueue {
    fn acquire(&self) -> Result<Box<dyn Send>, Failure> {
        Ok(Box::new(self.acquire_guard()?))
    }
}

// Read a queue endpoint without joining it: `(concurrency, entries)`.
pub fn read_queue(
    endpoint: &str,
    kill_signal: Event,
    log: Log,
) -> Result<(usize, Vec<queue::QueueEntry>), Failure> {
    let semaphore = SemaphoreQueue::new(endpoint, "", kill_signal, log);
    let mut helper = semaphore.spawn_helper(true)?;

    let mut output = String::new();
    if let Some(mut stdout) = helper.child.stdout.take() {
        let _ = stdout.read_to_string(&mut output);
    }
    let _ = helper.child.wait();
    helper.cleanup();

    serde_json::from_str(output.trim()).map_err(failure::system(format!(
        "Unable to parse queue contents: {}",
        output.trim(),
    )))
}

// The lock that won, and the release events of all the others. Dropping it
// releases the winner; everything else was released the moment the winner
// was chosen, or will be the moment it is belatedly acquired.
pub struct AcquiredLock {
    index: usize,
    release_events: Vec<Event>,
}

impl AcquiredLock {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for AcquiredLock {
    fn drop(&mut self) {
        self.release_events[self.index].set();
    }
}

// Acquire exactly one of the given locks: first to acquire wins, all others
// are released immediately upon acquisition. Each lock gets a helper thread
// that blocks on acquiring it, reports on a shared channel, and then holds
// the lock until its release event fires.
pub fn acquire_either(locks: Vec<Box<dyn Lock>>) -> Result<AcquiredLock, Failure> {
    if locks.is_empty() {
        return Err(Failure::User("No locks provided.".to_owned(), None));
    }

    let release_events = locks.iter().map(|_| Event::new()).collect::<Vec<_>>();
    let (sender, receiver) = unbounded::<(usize, Result<(), Failure>)>();

    for (index, lock) in locks.into_iter().enumerate() {
        let sender = sender.clone();
        let release = release_events[index].clone();
        thread::spawn(move || match lock.acquire() {
            Ok(guard) => {
                let _ = sender.send((index, Ok(())));
                release.wait();
                drop(guard);
            }
            Err(e) => {
                let _ = sender.send((index, Err(e)));
            }
        });
    }
    drop(sender);

    match receiver.recv() {
        Ok((index, Ok(()))) => {
            for (i, event) in release_events.iter().enumerate() {
                if i != index {
                    event.set();
                }
            }
            Ok(AcquiredLock {
                index,
                release_events,
            })
        }
        Ok((_, Err(e))) => {
            for event in &release_events {
                event.set();
            }
            Err(e)
        }
        Err(_) => {
            for event in &release_events {
                event.set();
            }
            Err(Failure::System("Error getting lock.".to_owned(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        failure::Failure,
        semaphore::{acquire_either, Lock},
    };
    use crossbeam::channel::{bounded, Receiver, Sender};
    use std::{thread, time::Duration};

    // An in-process single-holder lock: a bounded channel holding one token.
    #[derive(Clone)]
    struct TestLock {
        sender: Sender<()>,
        receiver: Receiver<()>,
    }

    impl TestLock {
        fn new() -> TestLock {
            let (sender, receiver) = bounded(1);
            sender.send(()).unwrap();
            TestLock { sender, receiver }
        }
    }

    struct Token {
        sender: Sender<()>,
    }

    impl Drop for Token {
        fn drop(&mut self) {
            let _ = self.sender.send(());
        }
    }

    impl Lock for TestLock {
        fn acquire(&self) -> Result<Box<dyn Send>, Failure> {
            self.receiver
                .recv()
                .map_err(|_| Failure::System("Lock is gone.".to_owned(), None))?;
            Ok(Box::new(Token {
                sender: self.sender.clone(),
            }))
        }
    }

    struct FailingLock;

    impl Lock for FailingLock {
        fn acquire(&self) -> Result<Box<dyn Send>, Failure> {
            Err(Failure::System("Broken lock.".to_owned(), None))
        }
    }

    #[test]
    fn empty_lock_list_fails() {
        assert!(acquire_either(vec![]).is_err());
    }

    #[test]
    fn single_lock_is_acquired_and_released() {
        let lock = TestLock::new();
        {
            let acquired = acquire_either(vec![Box::new(lock.clone())]).unwrap();
            assert_eq!(acquired.index(), 0);
        }
        // Dropping the guard released the token back to the channel.
        assert!(lock.receiver.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn failing_lock_propagates_error() {
        assert!(acquire_either(vec![Box::new(FailingLock)]).is_err());
    }

    #[test]
    fn ten_callers_split_two_locks_evenly() {
        let a = TestLock::new();
        let b = TestLock::new();

        let handles = (0..10)
            .map(|_| {
                let a = a.clone();
                let b = b.clone();
                thread::spawn(move || {
                    let acquired =
                        acquire_either(vec![Box::new(a) as Box<dyn Lock>, Box::new(b)]).unwrap();
                    let index = acquired.index();
                    thread::sleep(Duration::from_millis(200));
                    drop(acquired);
                    index
                })
            })
            .collect::<Vec<_>>();

        let mut counts = [0usize; 2];
        for handle in handles {
            counts[handle.join().unwrap()] += 1;
        }

        assert_eq!(counts[0], 5);
        assert_eq!(counts[1], 5);
    }
}
