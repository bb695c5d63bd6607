use crate::{
    config::{Config, KEEP_WORKSPACE_SECONDS, STATE_FILE},
    event::Event,
    failure,
    failure::Failure,
    format::CodeStr,
    process::{run_command, Output, RunOptions},
    runlog::Log,
    state::{epoch_now, StateSnapshot, Status},
};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

// The build supervisor: it fetches git, launches one containerized
// taskrunner per new `(branch, commit)` pair, and carries the shared toggles
// the HTTP surface flips.
pub struct Supervisor {
    pub config: Config,
    pub inhibited: AtomicBool,
    pub scan_trigger: Event,
    pub kill_signal: Event,
    pub log: Log,
}

// What happened when a run was asked to die.
pub enum KillOutcome {
    Signalled,
    MarkedFailed,
    NotRunning,
}

// Replace anything docker would reject in a container name.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// Parse `git show-ref` output into `(branch, commit)` pairs for remote
// branches, skipping `HEAD`.
pub fn parse_remote_branches(show_ref: &str) -> HashSet<(String, String)> {
    let mut branches = HashSet::new();
    for line in show_ref.lines() {
        let mut tokens = line.split_whitespace();
        if let (Some(commit), Some(reference)) = (tokens.next(), tokens.next()) {
            let prefix = "refs/remotes/origin/";
            if let Some(branch) = reference.strip_prefix(prefix) {
                if !reference.ends_with("HEAD") {
                    branches.insert((branch.to_owned(), commit.to_owned()));
                }
            }
        }
    }
    branches
}

// Parse `git show-ref` output into a commit → tags map.
pub fn parse_tags(show_ref: &str) -> HashMap<String, Vec<String>> {
    let mut tags: HashMap<String, Vec<String>> = HashMap::new();
    for line in show_ref.lines() {
        let mut tokens = line.split_whitespace();
        if let (Some(commit), Some(reference)) = (tokens.next(), tokens.next()) {
            if let Some(tag) = reference.strip_prefix("refs/tags/") {
                tags.entry(commit.to_owned()).or_default().push(tag.to_owned());
            }
        }
    }
    tags
}

impl Supervisor {
    pub fn new(config: Config, kill_signal: Event) -> Supervisor {
        Supervisor {
            config,
            inhibited: AtomicBool::new(false),
            scan_trigger: Event::new(),
            kill_signal,
            log: Log::plain(),
        }
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibited.load(Ordering::SeqCst)
    }

    pub fn set_inhibited(&self, inhibited: bool) {
        self.inhibited.store(inhibited, Ordering::SeqCst);
    }

    // Run a git command against the working clone and capture its output.
    fn git(&self, args: &[&str]) -> Result<Vec<u8>, Failure> {
        let mut command = vec![
            "git".to_owned(),
            "-C".to_owned(),
            self.config.repo_path().to_string_lossy().into_owned(),
        ];
        command.extend(args.iter().map(|s| (*s).to_owned()));
        run_command(
            &command,
            RunOptions::new(self.kill_signal.clone(), Output::Discard),
        )
        .map_err(Failure::Process)
    }

    // Prepare the data directory, the SSH identity, and the working clone.
    pub fn init(&self) -> Result<(), Failure> {
        fs::create_dir_all(self.config.logs_path())
            .map_err(failure::system("Unable to create logs directory."))?;
        fs::create_dir_all(self.config.work_path())
            .map_err(failure::system("Unable to create workspaces directory."))?;

        // Generate an SSH identity on first boot so remote executors and
        // semaphore hosts can be reached; the operator needs the public key.
        let ssh_path = crate::config::home_dir().join(".ssh");
        fs::create_dir_all(&ssh_path)
            .map_err(failure::system("Unable to create ~/.ssh."))?;
        let empty = ssh_path
            .read_dir()
            .map_err(failure::system("Unable to read ~/.ssh."))?
            .next()
            .is_none();
        if empty {
            let keygen = vec![
                "ssh-keygen".to_owned(),
                "-f".to_owned(),
                ssh_path.join("id_rsa").to_string_lossy().into_owned(),
                "-P".to_owned(),
                String::new(),
            ];
            run_command(
                &keygen,
                RunOptions::new(self.kill_signal.clone(), Output::Log(self.log.clone())),
            )
            .map_err(Failure::Process)?;
            let public_key = fs::read_to_string(ssh_path.join("id_rsa.pub"))
                .map_err(failure::system("Unable to read generated public key."))?;
            info!("Generated SSH identity:\n\n{}", public_key);
            fs::write(
                ssh_path.join("config"),
                "Host *\n  StrictHostKeyChecking=accept-new",
            )
            .map_err(failure::system("Unable to write SSH config."))?;
        }

        // Clone the repository if the working clone is absent.
        if !self.config.repo_path().join(".git").is_dir() {
            let clone = vec![
                "git".to_owned(),
                "clone".to_owned(),
                self.config.repo_url.clone(),
                self.config.repo_path().to_string_lossy().into_owned(),
            ];
            run_command(
                &clone,
                RunOptions::new(self.kill_signal.clone(), Output::Log(self.log.task("git"))),
            )
            .map_err(Failure::Process)?;
        }

        // The clone must track exactly the configured remote.
        let remotes = String::from_utf8_lossy(&self.git(&["remote"])?).trim().to_owned();
        if remotes != "origin" {
            return Err(Failure::Config(format!(
                "Expected git remote to be exactly origin, found: {}",
                remotes,
            )));
        }
        let origin_url =
            String::from_utf8_lossy(&self.git(&["remote", "get-url", "origin"])?)
                .trim()
                .to_owned();
        if origin_url != self.config.repo_url {
            return Err(Failure::Config(format!(
                "Git remote origin points at {}, expected {}.",
                origin_url, self.config.repo_url,
            )));
        }

        // Surface unreadable snapshots once, on boot.
        self.state_snapshots(None, true);
        Ok(())
    }

    pub fn fetch(&self) -> Result<(), Failure> {
        info!("Fetching updates from remote");
        let command = vec![
            "git".to_owned(),
            "-C".to_owned(),
            self.config.repo_path().to_string_lossy().into_owned(),
            "fetch".to_owned(),
            "--prune".to_owned(),
            "--prune-tags".to_owned(),
            "-v".to_owned(),
        ];
        run_command(
            &command,
            RunOptions::new(self.kill_signal.clone(), Output::Log(self.log.task("git"))),
        )
        .map_err(Failure::Process)?;
        Ok(())
    }

    // Load every run's snapshot, newest first.
    pub fn state_snapshots(
        &self,
        limit: Option<usize>,
        print_errors: bool,
    ) -> Vec<(PathBuf, StateSnapshot)> {
        let mut directories = match fs::read_dir(self.config.logs_path()) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .collect::<Vec<_>>(),
            Err(_) => return vec![],
        };
        directories.sort();
        directories.reverse();

        let mut snapshots = vec![];
        for directory in directories {
            if let Some(limit) = limit {
                if snapshots.len() >= limit {
                    break;
                }
            }
            let statefile = directory.join(STATE_FILE);
            if statefile.is_file() {
                match StateSnapshot::load(&statefile) {
                    Ok(snapshot) => snapshots.push((statefile, snapshot)),
                    Err(e) => {
                        if print_errors {
                            error!("Failed to load {}: {}", statefile.to_string_lossy(), e);
                        }
                    }
                }
            } else if print_errors {
                error!(
                    "{} not found in {}",
                    STATE_FILE,
                    directory.to_string_lossy(),
                );
            }
        }
        snapshots
    }

    pub fn remote_branches(&self) -> Result<HashSet<(String, String)>, Failure> {
        let output = self.git(&["show-ref"])?;
        Ok(parse_remote_branches(&String::from_utf8_lossy(&output)))
    }

    pub fn tags(&self) -> Result<HashMap<String, Vec<String>>, Failure> {
        let output = self.git(&["show-ref"])?;
        Ok(parse_tags(&String::from_utf8_lossy(&output)))
    }

    // New work is whatever the remote has that no local run has picked up.
    pub fn new_branches(&self) -> Result<HashSet<(String, String)>, Failure> {
        let local = self
            .state_snapshots(None, false)
            .into_iter()
            .map(|(_, snapshot)| (snapshot.branch, snapshot.commit))
            .collect::<HashSet<_>>();
        Ok(self
            .remote_branches()?
            .difference(&local)
            .cloned()
            .collect())
    }

    // Populate a workspace with a detached checkout of the commit.
    fn checkout_repo(&self, workdir: &Path, commit: &str) -> Result<(), Failure> {
        let not_empty = workdir
            .read_dir()
            .map_err(failure::system("Unable to read workspace."))?
            .next()
            .is_some();
        if not_empty {
            return Err(Failure::Config(format!(
                "Workspace {} is not empty.",
                workdir.to_string_lossy(),
            )));
        }
        let copy = vec![
            "cp".to_owned(),
            "-r".to_owned(),
            self.config.repo_path().join(".git").to_string_lossy().into_owned(),
            workdir.to_string_lossy().into_owned(),
        ];
        run_command(
            &copy,
            RunOptions::new(self.kill_signal.clone(), Output::Discard),
        )
        .map_err(Failure::Process)?;
        let checkout = vec![
            "git".to_owned(),
            "checkout".to_owned(),
            commit.to_owned(),
            "-f".to_owned(),
        ];
        run_command(
            &checkout,
            RunOptions {
                cwd: Some(workdir.to_owned()),
                ..RunOptions::new(self.kill_signal.clone(), Output::Discard)
            },
        )
        .map_err(Failure::Process)?;
        Ok(())
    }

    // Launch one containerized taskrunner for a `(commit, branch)` pair and
    // return its identifier.
    pub fn launch_run(&self, commit: &str, branch: &str) -> Result<String, Failure> {
        if self.is_inhibited() {
            return Err(Failure::Config(
                "Tried to start a run while inhibited.".to_owned(),
            ));
        }

        // The identifier doubles as directory and container name, so walk
        // the clock forward until it is unique.
        let mut identifier = format!("{}_{}", epoch_now() as u64, commit);
        let mut logdir = self.config.logs_path().join(&identifier);
        while logdir.is_dir() {
            std::thread::sleep(Duration::from_secs(1));
            identifier = format!("{}_{}", epoch_now() as u64, commit);
            logdir = self.config.logs_path().join(&identifier);
        }
        let workdir = self.config.work_path().join(&identifier);

        fs::create_dir_all(&logdir)
            .map_err(failure::system("Unable to create log directory."))?;
        fs::create_dir_all(&workdir)
            .map_err(failure::system("Unable to create workspace."))?;
        self.checkout_repo(&workdir, commit)?;

        let log_url = format!(
            "{}/logs/{}",
            self.config.base_url.trim_end_matches('/'),
            identifier,
        );

        // An empty snapshot marks the pair as picked up even if the
        // container never comes to life.
        StateSnapshot {
            commit: commit.to_owned(),
            branch: branch.to_owned(),
            repo_name: self.config.repo_name.clone(),
            log_url: log_url.clone(),
            identifier: identifier.clone(),
            status: Status::NotStarted,
            started: epoch_now(),
            finished: None,
            tasks: vec![],
        }
        .save(&logdir.join(STATE_FILE))?;

        let external_logdir = self.config.external_data_path.join("logs").join(&identifier);
        let external_workdir = self
            .config
            .external_data_path
            .join("workspaces")
            .join(&identifier);

        let mut command = vec![
            "docker".to_owned(),
            "run".to_owned(),
            "--rm".to_owned(),
            "-d".to_owned(),
            "--name".to_owned(),
            safe_name(&identifier),
            "-v".to_owned(),
            "/var/run/docker.sock:/var/run/docker.sock".to_owned(),
            "-v".to_owned(),
            format!(
                "{}:/root/.ssh:ro",
                self.config.external_ssh_path.to_string_lossy(),
            ),
            "-v".to_owned(),
            format!("{}:/logdir", external_logdir.to_string_lossy()),
            "-v".to_owned(),
            format!("{}:/workdir", external_workdir.to_string_lossy()),
            "--workdir".to_owned(),
            "/workdir".to_owned(),
        ];
        for mount in &self.config.additional_mounts {
            command.push("-v".to_owned());
            command.push(mount.clone());
        }
        command.extend([
            self.config.taskrunner_image.clone(),
            "griddle".to_owned(),
            "--taskrunner".to_owned(),
            "--commit".to_owned(),
            commit.to_owned(),
            "--branch".to_owned(),
            branch.to_owned(),
            "--identifier".to_owned(),
            identifier.clone(),
            "--repo-name".to_owned(),
            self.config.repo_name.clone(),
            "--log-url".to_owned(),
            log_url,
            "--logdir".to_owned(),
            "/logdir".to_owned(),
            "--file".to_owned(),
            self.config.tasks_file.clone(),
        ]);
        run_command(
            &command,
            RunOptions::new(self.kill_signal.clone(), Output::Discard),
        )
        .map_err(Failure::Process)?;

        info!(
            "Started commit {}[{}] in container {}",
            commit.code_str(),
            branch.code_str(),
            identifier.code_str(),
        );
        Ok(identifier)
    }

    // SIGTERM a run's container. If docker reports it gone but the snapshot
    // says unfinished, the container died without writing its ending: mark
    // the run failed so it stops looking live.
    pub fn kill_run(&self, identifier: &str) -> Result<Option<KillOutcome>, Failure> {
        for (state_path, snapshot) in self.state_snapshots(None, false) {
            if snapshot.identifier != identifier {
                continue;
            }
            let command = vec![
                "docker".to_owned(),
                "kill".to_owned(),
                "-s".to_owned(),
                "SIGTERM".to_owned(),
                identifier.to_owned(),
            ];
            let result = run_command(&command, RunOptions::new(Event::new(), Output::Discard));
            if result.is_ok() {
                return Ok(Some(KillOutcome::Signalled));
            }
            // Reload to lower the likelihood of racing the runner's own
            // final write.
            let mut updated = StateSnapshot::load(&state_path)?;
            if updated.finished.is_none() {
                updated.finished = Some(epoch_now());
                updated.status = Status::Failed;
                updated.save(&state_path)?;
                return Ok(Some(KillOutcome::MarkedFailed));
            }
            return Ok(Some(KillOutcome::NotRunning));
        }
        Ok(None)
    }

    // Launch a fresh run of the same commit and branch.
    pub fn rerun(&self, identifier: &str) -> Result<Option<String>, Failure> {
        for (_, snapshot) in self.state_snapshots(None, false) {
            if snapshot.identifier == identifier {
                return self
                    .launch_run(&snapshot.commit, &snapshot.branch)
                    .map(Some);
            }
        }
        Ok(None)
    }

    // Remove workspaces of runs that finished a while ago.
    pub fn workspace_cleanup(&self) {
        let snapshots = self.state_snapshots(None, false);
        let workspaces = match fs::read_dir(self.config.work_path()) {
            Ok(entries) => entries.filter_map(Result::ok),
            Err(_) => return,
        };
        for workspace in workspaces {
            let name = workspace.file_name().to_string_lossy().into_owned();
            for (_, snapshot) in &snapshots {
                if snapshot.identifier == name {
                    if let Some(finished) = snapshot.finished {
                        if epoch_now() - finished > KEEP_WORKSPACE_SECONDS as f64 {
                            info!("Deleting workspace {}", name.code_str());
                            if let Err(e) = fs::remove_dir_all(workspace.path()) {
                                error!("Error deleting old workspace {}: {}", name, e);
                            }
                        }
                    }
                }
            }
        }
    }

    // One scan: fetch, launch whatever is new, sweep old workspaces.
    fn scan(&self) -> Result<(), Failure> {
        self.fetch()?;
        for (branch, commit) in self.new_branches()? {
            if self.is_inhibited() {
                break;
            }
            self.launch_run(&commit, &branch)?;
        }
        self.workspace_cleanup();
        Ok(())
    }
}

// The background worker: waits for the scan trigger, scans, and keeps going
// no matter what a single iteration did.
pub fn scan_loop(supervisor: &Arc<Supervisor>) {
    loop {
        if supervisor.kill_signal.is_set() {
            return;
        }
        if !supervisor.scan_trigger.wait_timeout(Duration::from_secs(1)) {
            continue;
        }
        supervisor.scan_trigger.clear();
        if let Err(e) = supervisor.scan() {
            error!("Background scan failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::{Config, STATE_FILE},
        event::Event,
        state::{epoch_now, StateSnapshot, Status},
        supervisor::{parse_remote_branches, parse_tags, safe_name, Supervisor},
    };
    use std::fs;

    fn test_config(data_path: &std::path::Path) -> Config {
        Config {
            repo_url: ".".to_owned(),
            repo_name: "testing".to_owned(),
            base_url: "http://localhost".to_owned(),
            tasks_file: "griddle.yml".to_owned(),
            taskrunner_image: "griddle".to_owned(),
            additional_mounts: vec![],
            listen_addr: "127.0.0.1:0".to_owned(),
            data_path: data_path.to_owned(),
            external_data_path: data_path.to_owned(),
            external_ssh_path: data_path.join("ssh"),
        }
    }

    fn snapshot(identifier: &str, finished: Option<f64>) -> StateSnapshot {
        StateSnapshot {
            commit: "f".repeat(40),
            branch: "main".to_owned(),
            repo_name: "testing".to_owned(),
            log_url: format!("http://localhost/logs/{}", identifier),
            identifier: identifier.to_owned(),
            status: Status::Success,
            started: epoch_now() - 100.0,
            finished,
            tasks: vec![],
        }
    }

    #[test]
    fn safe_name_passes_legal_characters() {
        assert_eq!(safe_name("1234_abcDEF-x"), "1234_abcDEF-x");
    }

    #[test]
    fn safe_name_replaces_illegal_characters() {
        assert_eq!(safe_name("feature/new stuff"), "feature_new_stuff");
    }

    #[test]
    fn parse_remote_branches_skips_head_and_tags() {
        let show_ref = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa refs/heads/main
bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb refs/remotes/origin/HEAD
cccccccccccccccccccccccccccccccccccccccc refs/remotes/origin/main
dddddddddddddddddddddddddddddddddddddddd refs/remotes/origin/feature/x
eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee refs/tags/v1.0
";
        let branches = parse_remote_branches(show_ref);
        assert_eq!(branches.len(), 2);
        assert!(branches.contains(&("main".to_owned(), "c".repeat(40))));
        assert!(branches.contains(&("feature/x".to_owned(), "d".repeat(40))));
    }

    #[test]
    fn parse_tags_groups_by_commit() {
        let show_ref = "\
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa refs/tags/v1.0
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa refs/tags/stable
bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb refs/remotes/origin/main
";
        let tags = parse_tags(show_ref);
        assert_eq!(
            tags[&"a".repeat(40)],
            vec!["v1.0".to_owned(), "stable".to_owned()],
        );
        assert!(!tags.contains_key(&"b".repeat(40)));
    }

    #[test]
    fn state_snapshots_sorted_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path()), Event::new());
        for identifier in ["100_a", "300_c", "200_b"] {
            let logdir = supervisor.config.logs_path().join(identifier);
            fs::create_dir_all(&logdir).unwrap();
            snapshot(identifier, None)
                .save(&logdir.join(STATE_FILE))
                .unwrap();
        }

        let all = supervisor.state_snapshots(None, false);
        assert_eq!(
            all.iter()
                .map(|(_, s)| s.identifier.clone())
                .collect::<Vec<_>>(),
            vec!["300_c", "200_b", "100_a"],
        );

        let limited = supervisor.state_snapshots(Some(2), false);
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn unparseable_snapshots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path()), Event::new());
        let logdir = supervisor.config.logs_path().join("100_a");
        fs::create_dir_all(&logdir).unwrap();
        fs::write(logdir.join(STATE_FILE), "not json").unwrap();

        assert!(supervisor.state_snapshots(None, false).is_empty());
    }

    #[test]
    fn workspace_cleanup_removes_only_old_finished_runs() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path()), Event::new());

        // One finished long ago, one still running.
        for (identifier, finished) in
            [("100_old", Some(epoch_now() - 100.0)), ("200_live", None)]
        {
            let logdir = supervisor.config.logs_path().join(identifier);
            fs::create_dir_all(&logdir).unwrap();
            snapshot(identifier, finished)
                .save(&logdir.join(STATE_FILE))
                .unwrap();
            fs::create_dir_all(supervisor.config.work_path().join(identifier)).unwrap();
        }

        supervisor.workspace_cleanup();
        assert!(!supervisor.config.work_path().join("100_old").exists());
        assert!(supervisor.config.work_path().join("200_live").exists());
    }

    #[test]
    fn kill_run_marks_vanished_container_failed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path()), Event::new());
        let logdir = supervisor.config.logs_path().join("100_gone");
        fs::create_dir_all(&logdir).unwrap();
        snapshot("100_gone", None)
            .save(&logdir.join(STATE_FILE))
            .unwrap();

        // No such container, so the snapshot is marked failed.
        let outcome = supervisor.kill_run("100_gone").unwrap();
        assert!(matches!(
            outcome,
            Some(crate::supervisor::KillOutcome::MarkedFailed)
        ));
        let updated = StateSnapshot::load(&logdir.join(STATE_FILE)).unwrap();
        assert_eq!(updated.status, Status::Failed);
        assert!(updated.finished.is_some());
    }

    #[test]
    fn kill_run_unknown_identifier_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path()), Event::new());
        fs::create_dir_all(supervisor.config.logs_path()).unwrap();
        assert!(supervisor.kill_run("42_missing").unwrap().is_none());
    }
}
