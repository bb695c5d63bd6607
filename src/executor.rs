use crate::{
    event::Event,
    failure,
    failure::Failure,
    process::{run_command, run_docker_exec_command, signal_pid, Output, RunOptions},
    runlog::Log,
    stash,
    stash::Stash,
};
use std::{
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};

// Escape a string for shell interpolation.
pub fn shell_escape(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

fn random_container_name() -> String {
    format!("exe_{}", hex::encode(rand::random::<[u8; 16]>()))
}

// Per-call options for `sh`. A `kill_signal` here overrides the executor's
// own signal; cleanup paths pass a fresh, never-set event so that global
// cancellation cannot prevent them from running.
#[derive(Default)]
pub struct ShOptions {
    pub censor: Vec<String>,
    pub kill_signal: Option<Event>,
    pub timeout: Option<u64>,
    pub env: Vec<(String, String)>,
}

impl ShOptions {
    fn fresh_kill() -> ShOptions {
        ShOptions {
            kill_signal: Some(Event::new()),
            ..ShOptions::default()
        }
    }
}

// A scoped handle that executes shell commands in a chosen location and
// transfers file trees via stashes. Every variant guarantees `close` runs
// its cleanup exactly once; `Drop` is the backstop for early returns.
pub trait Executor: Send {
    fn sh(&mut self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure>;
    fn stash(&mut self, path_glob: &str) -> Result<Stash, Failure>;
    fn unstash(&mut self, stash: &Stash, specific_file: Option<&str>) -> Result<(), Failure>;
    fn close(&mut self) -> Result<(), Failure>;

    // Archive the paths matching a glob into a fresh `/tmp` tar on this
    // executor's side. The glob is expanded by the executor's shell.
    fn tar_to_tmp(&mut self, path_glob: &str) -> Result<PathBuf, Failure> {
        let stash_path = stash::random_tmp_path();
        self.sh(
            &format!(
                "tar --gzip --create --file {} {}",
                shell_escape(&stash_path.to_string_lossy()),
                path_glob,
            ),
            ShOptions::default(),
        )?;
        Ok(stash_path)
    }

    fn untar_to_cwd(&mut self, tar_path: &Path, specific_file: Option<&str>) -> Result<(), Failure> {
        let mut command = format!(
            "tar --extract --gzip --file {}",
            shell_escape(&tar_path.to_string_lossy()),
        );
        if let Some(file) = specific_file {
            command.push_str(&format!(" {}", shell_escape(file)));
        }
        self.sh(&command, ShOptions::default())?;
        Ok(())
    }

    fn safe_del_tmp_file(&mut self, path: &Path) -> Result<(), Failure> {
        stash::assert_path_in_tmp(path)?;
        self.sh(
            &format!("rm {}", shell_escape(&path.to_string_lossy())),
            ShOptions::fresh_kill(),
        )?;
        Ok(())
    }

    fn safe_del_tmp_dir(&mut self, path: &Path) -> Result<(), Failure> {
        stash::assert_path_in_tmp(path)?;
        self.sh(
            &format!("rm -r {}", shell_escape(&path.to_string_lossy())),
            ShOptions::fresh_kill(),
        )?;
        Ok(())
    }

    fn mk_temp_dir(&mut self) -> Result<PathBuf, Failure> {
        let temp_dir = stash::random_tmp_path();
        self.sh(
            &format!("mkdir {}", shell_escape(&temp_dir.to_string_lossy())),
            ShOptions::fresh_kill(),
        )?;
        Ok(temp_dir)
    }
}

// Run a command through the local `/bin/bash -ce`, with the working
// directory set via `cd`. The command is echoed to the log, censored, before
// it runs.
fn local_shell(
    command: &str,
    path: &Path,
    options: ShOptions,
    default_kill: &Event,
    log: &Log,
) -> Result<Vec<u8>, Failure> {
    log.command(command, &options.censor);
    let full_command = vec![
        "/bin/bash".to_owned(),
        "-ce".to_owned(),
        format!(
            "cd {} && /bin/bash -ce {}",
            shell_escape(&path.to_string_lossy()),
            shell_escape(command),
        ),
    ];
    run_command(
        &full_command,
        RunOptions {
            censor: options.censor,
            timeout: options.timeout,
            env: options.env,
            ..RunOptions::new(
                options.kill_signal.unwrap_or_else(|| default_kill.clone()),
                Output::Log(log.clone()),
            )
        },
    )
    .map_err(Failure::Process)
}

// Same as `local_shell`, but prefixed with `ssh <host>`.
fn ssh_shell(
    host: &str,
    command: &str,
    path: &Path,
    options: ShOptions,
    default_kill: &Event,
    log: &Log,
) -> Result<Vec<u8>, Failure> {
    log.command(command, &options.censor);
    let full_command = vec![
        "ssh".to_owned(),
        host.to_owned(),
        format!(
            "cd {} && /bin/bash -ce {}",
            shell_escape(&path.to_string_lossy()),
            shell_escape(command),
        ),
    ];
    run_command(
        &full_command,
        RunOptions {
            censor: options.censor,
            timeout: options.timeout,
            env: options.env,
            ..RunOptions::new(
                options.kill_signal.unwrap_or_else(|| default_kill.clone()),
                Output::Log(log.clone()),
            )
        },
    )
    .map_err(Failure::Process)
}

// The local shell.
pub struct Local {
    path: PathBuf,
    temp_path: bool,
    kill_signal: Event,
    log: Log,
    closed: bool,
}

impl Local {
    pub fn open(
        path: Option<PathBuf>,
        temp_path: bool,
        kill_signal: Event,
        log: Log,
    ) -> Result<Local, Failure> {
        if path.is_some() && temp_path {
            return Err(Failure::User(
                "An executor takes either a path or a temp path, not both.".to_owned(),
                None,
            ));
        }
        let mut executor = Local {
            path: path.unwrap_or_else(|| PathBuf::from(".")),
            temp_path,
            kill_signal,
            log,
            closed: false,
        };
        if temp_path {
            executor.path = executor.mk_temp_dir()?;
        }
        Ok(executor)
    }

    // A stash of a commit's tree, straight out of the object database.
    pub fn stash_from_git_archive(&mut self, commit: &str) -> Result<Stash, Failure> {
        let stash_path = stash::random_tmp_path();
        self.sh(
            &format!(
                "git archive {} -o {} --format tar.gz",
                shell_escape(commit),
                shell_escape(&stash_path.to_string_lossy()),
            ),
            ShOptions::default(),
        )?;
        stash::register_tmp_file_cleanup(&stash_path)?;
        Ok(Stash::from_path(stash_path))
    }
}

impl Executor for Local {
    fn sh(&mut self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure> {
        local_shell(command, &self.path, options, &self.kill_signal, &self.log)
    }

    fn stash(&mut self, path_glob: &str) -> Result<Stash, Failure> {
        let stash_path = self.tar_to_tmp(path_glob)?;
        stash::register_tmp_file_cleanup(&stash_path)?;
        Ok(Stash::from_path(stash_path))
    }

    fn unstash(&mut self, stash: &Stash, specific_file: Option<&str>) -> Result<(), Failure> {
        self.untar_to_cwd(stash.path(), specific_file)
    }

    fn close(&mut self) -> Result<(), Failure> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.temp_path {
            let path = self.path.clone();
            self.safe_del_tmp_dir(&path)?;
        }
        Ok(())
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

// A remote shell over SSH. Stashes travel via `scp`.
pub struct Ssh {
    host: String,
    path: PathBuf,
    temp_path: bool,
    kill_signal: Event,
    log: Log,
    closed: bool,
}

impl Ssh {
    pub fn open(
        host: &str,
        path: Option<PathBuf>,
        temp_path: bool,
        kill_signal: Event,
        log: Log,
    ) -> Result<Ssh, Failure> {
        if path.is_some() && temp_path {
            return Err(Failure::User(
                "An executor takes either a path or a temp path, not both.".to_owned(),
                None,
            ));
        }
        let mut executor = Ssh {
            host: host.to_owned(),
            path: path.unwrap_or_else(|| PathBuf::from(".")),
            temp_path,
            kill_signal,
            log,
            closed: false,
        };
        if temp_path {
            executor.path = executor.mk_temp_dir()?;
        }
        Ok(executor)
    }

    // Run a command on the local side of this executor, e.g. `scp`.
    fn local(&self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure> {
        local_shell(
            command,
            Path::new("."),
            options,
            &self.kill_signal,
            &self.log,
        )
    }
}

impl Executor for Ssh {
    fn sh(&mut self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure> {
        ssh_shell(
            &self.host,
            command,
            &self.path,
            options,
            &self.kill_signal,
            &self.log,
        )
    }

    fn stash(&mut self, path_glob: &str) -> Result<Stash, Failure> {
        let remote_stash_path = self.tar_to_tmp(path_glob)?;
        let local_stash_path = stash::random_tmp_path();
        let result = self.local(
            &format!(
                "scp {} {}",
                shell_escape(&format!(
                    "{}:{}",
                    self.host,
                    remote_stash_path.to_string_lossy(),
                )),
                shell_escape(&local_stash_path.to_string_lossy()),
            ),
            ShOptions::default(),
        );
        let delete_result = self.safe_del_tmp_file(&remote_stash_path);
        result?;
        delete_result?;
        stash::register_tmp_file_cleanup(&local_stash_path)?;
        Ok(Stash::from_path(local_stash_path))
    }

    fn unstash(&mut self, stash: &Stash, specific_file: Option<&str>) -> Result<(), Failure> {
        let remote_tmp_path = stash::random_tmp_path();
        self.local(
            &format!(
                "scp {} {}",
                shell_escape(&stash.path().to_string_lossy()),
                shell_escape(&format!(
                    "{}:{}",
                    self.host,
                    remote_tmp_path.to_string_lossy(),
                )),
            ),
            ShOptions::default(),
        )?;
        let result = self.untar_to_cwd(&remote_tmp_path, specific_file);
        let delete_result = self.safe_del_tmp_file(&remote_tmp_path);
        result?;
        delete_result
    }

    fn close(&mut self) -> Result<(), Failure> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.temp_path {
            let path = self.path.clone();
            self.safe_del_tmp_dir(&path)?;
        }
        Ok(())
    }
}

impl Drop for Ssh {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

// A shell inside a locally launched container. The container is started with
// `/bin/bash -c cat` as its keepalive and removed on close; commands run in
// it via the docker exec variant of the process runner, which signals the
// in-container process group on cancellation.
pub struct LocalContainer {
    image: String,
    mount_docker: bool,
    container_name: String,
    path: PathBuf,
    temp_path: bool,
    kill_signal: Event,
    log: Log,
    closed: bool,
}

impl LocalContainer {
    pub fn open(
        image: &str,
        mount_docker: bool,
        path: Option<PathBuf>,
        temp_path: bool,
        kill_signal: Event,
        log: Log,
    ) -> Result<LocalContainer, Failure> {
        if path.is_some() && temp_path {
            return Err(Failure::User(
                "An executor takes either a path or a temp path, not both.".to_owned(),
                None,
            ));
        }
        let mut executor = LocalContainer {
            image: image.to_owned(),
            mount_docker,
            container_name: random_container_name(),
            path: path.unwrap_or_else(|| PathBuf::from(".")),
            temp_path,
            kill_signal,
            log,
            closed: false,
        };

        // Starting the container must succeed even when cancellation is
        // already pending, otherwise close could not remove it.
        let command = format!(
            "docker run --rm --name {} {} -t -d {} /bin/bash -c cat",
            shell_escape(&executor.container_name),
            if mount_docker {
                "-v /var/run/docker.sock:/var/run/docker.sock"
            } else {
                ""
            },
            shell_escape(&executor.image),
        );
        local_shell(
            &command,
            Path::new("."),
            ShOptions::fresh_kill(),
            &executor.kill_signal,
            &executor.log,
        )?;

        if temp_path {
            executor.path = executor.mk_temp_dir()?;
        }
        Ok(executor)
    }

    // `docker cp` writes files as root; hand them to the image's default
    // user so the task can read and delete them.
    fn chown_file_to_docker_user(&mut self, container_path: &Path) -> Result<(), Failure> {
        let docker_user = String::from_utf8_lossy(&self.sh("whoami", ShOptions::default())?)
            .trim()
            .to_owned();
        let command = format!(
            "chown {0}:{0} {1}",
            shell_escape(&docker_user),
            shell_escape(&container_path.to_string_lossy()),
        );
        self.log.command(&command, &[]);
        let full_command = vec![
            "docker".to_owned(),
            "exec".to_owned(),
            "--user".to_owned(),
            "root".to_owned(),
            self.container_name.clone(),
            "/bin/bash".to_owned(),
            "-ce".to_owned(),
            command,
        ];
        run_command(
            &full_command,
            RunOptions::new(self.kill_signal.clone(), Output::Log(self.log.clone())),
        )
        .map_err(Failure::Process)?;
        Ok(())
    }

    // Run a command on the local side of this executor, e.g. `docker cp`.
    fn local(&self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure> {
        local_shell(
            command,
            Path::new("."),
            options,
            &self.kill_signal,
            &self.log,
        )
    }
}

impl Executor for LocalContainer {
    fn sh(&mut self, command: &str, options: ShOptions) -> Result<Vec<u8>, Failure> {
        self.log.command(command, &options.censor);
        let exec_options = if self.path == Path::new(".") {
            vec![]
        } else {
            vec![
                "--workdir".to_owned(),
                self.path.to_string_lossy().into_owned(),
            ]
        };
        run_docker_exec_command(
            command,
            &self.container_name,
            &exec_options,
            RunOptions {
                censor: options.censor,
                timeout: options.timeout,
                env: options.env,
                ..RunOptions::new(
                    options.kill_signal.unwrap_or_else(|| self.kill_signal.clone()),
                    Output::Log(self.log.clone()),
                )
            },
        )
        .map_err(Failure::Process)
    }

    fn stash(&mut self, path_glob: &str) -> Result<Stash, Failure> {
        let container_stash_path = self.tar_to_tmp(path_glob)?;
        let local_stash_path = stash::random_tmp_path();
        let result = self.local(
            &format!(
                "docker cp {}:{} {}",
                shell_escape(&self.container_name),
                shell_escape(&container_stash_path.to_string_lossy()),
                shell_escape(&local_stash_path.to_string_lossy()),
            ),
            ShOptions::default(),
        );
        let delete_result = self.safe_del_tmp_file(&container_stash_path);
        result?;
        delete_result?;
        stash::register_tmp_file_cleanup(&local_stash_path)?;
        Ok(Stash::from_path(local_stash_path))
    }

    fn unstash(&mut self, stash: &Stash, specific_file: Option<&str>) -> Result<(), Failure> {
        let container_tmp_path = stash::random_tmp_path();
        self.local(
            &format!(
                "docker cp {} {}:{}",
                shell_escape(&stash.path().to_string_lossy()),
                shell_escape(&self.container_name),
                shell_escape(&container_tmp_path.to_string_lossy()),
            ),
            ShOptions::default(),
        )?;
        self.chown_file_to_docker_user(&container_tmp_path)?;
        let result = self.untar_to_cwd(&container_tmp_path, specific_file);
        let delete_result = self.safe_del_tmp_file(&container_tmp_path);
        result?;
        delete_result
    }

    fn close(&mut self) -> Result<(), Failure> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.temp_path {
            let path = self.path.clone();
            let _ = self.safe_del_tmp_dir(&path);
        }
        self.local(
            &format!("docker rm -f {}", shell_escape(&self.container_name)),
            ShOptions::fresh_kill(),
        )?;
        Ok(())
    }
}

impl Drop for LocalContainer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

// The local shell, with a remote host's docker socket forwarded over SSH.
// Any docker client invoked through this executor sees the remote daemon.
pub struct ForwardedDockerSock {
    host: String,
    forwarded_socket: PathBuf,
    process: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    path: PathBuf,
    temp_path: bool,
    kill_signal: Event,
    log: Log,
    closed: bool,
}

impl ForwardedDockerSock {
    pub fn open(
        host: &str,
        path: Option<PathBuf>,
        temp_path: bool,
        kill_signal: Event,
        log: Log,
    ) -> Result<ForwardedDockerSock, Failure> {
        if path.is_some() && temp_path {
            return Err(Failure::User(
                "An executor takes either a path or a temp path, not both.".to_owned(),
                None,
            ));
        }
        let base = stash::random_tmp_path();
        let forwarded_socket = PathBuf::from(format!("{}.sock", base.to_string_lossy()));

        let command = vec![
            "ssh".to_owned(),
            "-tt".to_owned(),
            "-L".to_owned(),
            format!("{}:/var/run/docker.sock", forwarded_socket.to_string_lossy()),
            "-o".to_owned(),
            "PasswordAuthentication no".to_owned(),
            host.to_owned(),
            "echo 'ready' && cat".to_owned(),
        ];
        log.command(&command.join(" "), &[]);
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failure::system("Unable to spawn ssh."))?;

        // Block until the remote end confirms the tunnel. EOF first means the
        // forwarding failed; relay stderr so the operator sees why.
        let mut reader = BufReader::new(child.stdout.take().unwrap()); // Safe: stdout is piped
        let mut ready = false;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if line.trim_end() == "ready" {
                        ready = true;
                        break;
                    }
                }
            }
        }
        if !ready {
            if let Some(stderr) = child.stderr.take() {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log.line(line.trim_end());
                }
            }
            let _ = child.kill();
            let _ = child.wait();
            return Err(Failure::System("Forwarding failed".to_owned(), None));
        }

        let mut executor = ForwardedDockerSock {
            host: host.to_owned(),
            forwarded_socket,
            process: Some(child),
            stdout: Some(reader),
            path: path.unwrap_or_else(|| PathBuf::from(".")),
            temp_path,
            kill_signal,
            log,
            closed: false,
        };
        if temp_path {
            executor.path = executor.mk_temp_dir()?;
        }
        Ok(executor)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn forwarded_socket(&self) -> &Path {
        &self.forwarded_socket
    }
}

impl Executor for ForwardedDockerSock {
    fn sh(&mut self, command: &str, mut options: ShOptions) -> Result<Vec<u8>, Failure> {
        options.env.push((
            "DOCKER_HOST".to_owned(),
            format!("unix://{}", self.forwarded_socket.to_string_lossy()),
        ));
        local_shell(command, &self.path, options, &self.kill_signal, &self.log)
    }

    fn stash(&mut self, path_glob: &str) -> Result<Stash, Failure> {
        let stash_path = self.tar_to_tmp(path_glob)?;
        stash::register_tmp_file_cleanup(&stash_path)?;
        Ok(Stash::from_path(stash_path))
    }

    fn unstash(&mut self, stash: &Stash, specific_file: Option<&str>) -> Result<(), Failure> {
        self.untar_to_cwd(stash.path(), specific_file)
    }

    fn close(&mut self) -> Result<(), Failure> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut child) = self.process.take() {
            signal_pid(child.id() as i32, libc::SIGTERM);
            let _ = child.wait();
        }
        self.stdout.take();
        let socket = self.forwarded_socket.clone();
        let _ = self.safe_del_tmp_file(&socket);
        if self.temp_path {
            let path = self.path.clone();
            self.safe_del_tmp_dir(&path)?;
        }
        Ok(())
    }
}

impl Drop for ForwardedDockerSock {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        event::Event,
        executor::{shell_escape, Executor, Local, ShOptions},
        runlog::Log,
    };
    use std::{fs, path::PathBuf};

    #[test]
    fn shell_escape_empty() {
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn shell_escape_word() {
        assert_eq!(shell_escape("foo"), "'foo'");
    }

    #[test]
    fn shell_escape_single_quote() {
        assert_eq!(shell_escape("f'o'o"), "'f'\\''o'\\''o'");
    }

    #[test]
    fn local_sh_returns_stdout() {
        let mut exe = Local::open(None, false, Event::new(), Log::plain()).unwrap();
        let output = exe.sh("echo hello", ShOptions::default()).unwrap();
        assert_eq!(output, b"hello\n");
        exe.close().unwrap();
    }

    #[test]
    fn local_sh_runs_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut exe = Local::open(
            Some(dir.path().to_owned()),
            false,
            Event::new(),
            Log::plain(),
        )
        .unwrap();
        let output = exe.sh("pwd", ShOptions::default()).unwrap();
        let reported = PathBuf::from(String::from_utf8_lossy(&output).trim().to_owned());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap(),
        );
        exe.close().unwrap();
    }

    #[test]
    fn temp_path_is_created_and_removed() {
        let mut exe = Local::open(None, true, Event::new(), Log::plain()).unwrap();
        let output = exe.sh("pwd", ShOptions::default()).unwrap();
        let temp_dir = PathBuf::from(String::from_utf8_lossy(&output).trim().to_owned());
        assert!(temp_dir.starts_with("/tmp"));
        assert!(temp_dir.is_dir());
        exe.close().unwrap();
        assert!(!temp_dir.exists());
    }

    #[test]
    fn stash_round_trip_preserves_bytes() {
        let source_dir = tempfile::tempdir().unwrap();
        fs::write(source_dir.path().join("artifact.txt"), b"precious bytes\n").unwrap();

        let stash = {
            let mut exe = Local::open(
                Some(source_dir.path().to_owned()),
                false,
                Event::new(),
                Log::plain(),
            )
            .unwrap();
            let stash = exe.stash("artifact.txt").unwrap();
            exe.close().unwrap();
            stash
        };

        let target_dir = tempfile::tempdir().unwrap();
        let mut exe = Local::open(
            Some(target_dir.path().to_owned()),
            false,
            Event::new(),
            Log::plain(),
        )
        .unwrap();
        exe.unstash(&stash, None).unwrap();
        exe.close().unwrap();

        assert_eq!(
            fs::read(target_dir.path().join("artifact.txt")).unwrap(),
            b"precious bytes\n",
        );
        assert_eq!(stash.read_text("artifact.txt").unwrap(), "precious bytes");
    }

    #[test]
    fn unstash_specific_file_extracts_one_member() {
        let source_dir = tempfile::tempdir().unwrap();
        fs::write(source_dir.path().join("one.txt"), b"1").unwrap();
        fs::write(source_dir.path().join("two.txt"), b"2").unwrap();

        let stash = {
            let mut exe = Local::open(
                Some(source_dir.path().to_owned()),
                false,
                Event::new(),
                Log::plain(),
            )
            .unwrap();
            let stash = exe.stash("*.txt").unwrap();
            exe.close().unwrap();
            stash
        };

        let target_dir = tempfile::tempdir().unwrap();
        let mut exe = Local::open(
            Some(target_dir.path().to_owned()),
            false,
            Event::new(),
            Log::plain(),
        )
        .unwrap();
        exe.unstash(&stash, Some("one.txt")).unwrap();
        exe.close().unwrap();

        assert!(target_dir.path().join("one.txt").exists());
        assert!(!target_dir.path().join("two.txt").exists());
    }
}
