use crate::{failure::Failure, format::CodeStr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Which executor a task's body runs through.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Local,
    Container,
    Ssh,
    Forwarded,
}

// This struct represents a task declaration. Declaration order in the file
// is the order tasks appear in snapshots; execution order is governed purely
// by `run_after`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub name: String,

    #[serde(default)]
    pub run_after: Vec<String>,

    #[serde(default)]
    pub run_always: bool,

    #[serde(default)]
    pub acquire_semaphore: Vec<String>,

    #[serde(default = "default_task_executor")]
    pub executor: ExecutorKind,

    #[serde(default = "default_task_image")]
    pub image: String,

    pub host: Option<String>,

    #[serde(default)]
    pub mount_docker: bool,

    #[serde(default)]
    pub temp_path: bool,

    #[serde(default)]
    pub unstash_source: bool,

    pub script: Option<String>,

    pub stash: Option<String>,

    #[serde(default)]
    pub censor: Vec<String>,

    pub timeout: Option<u64>,
}

fn default_task_executor() -> ExecutorKind {
    ExecutorKind::Local
}

fn default_task_image() -> String {
    "debian".to_owned()
}

impl Task {
    // A bare task carrying nothing but a name. Used for the synthetic task
    // that records a task file which could not be loaded.
    pub fn synthetic(name: &str) -> Task {
        Task {
            name: name.to_owned(),
            run_after: vec![],
            run_always: false,
            acquire_semaphore: vec![],
            executor: ExecutorKind::Local,
            image: default_task_image(),
            host: None,
            mount_docker: false,
            temp_path: false,
            unstash_source: false,
            script: None,
            stash: None,
            censor: vec![],
            timeout: None,
        }
    }
}

// This struct represents a task file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Taskfile {
    pub tasks: Vec<Task>,
}

// Parse task file data.
pub fn parse(taskfile_data: &str) -> Result<Taskfile, Failure> {
    let taskfile: Taskfile =
        serde_yaml::from_str(taskfile_data).map_err(|e| Failure::User(format!("{}", e), None))?;

    check_duplicates(&taskfile)?;
    check_dependencies(&taskfile)?;
    check_hosts(&taskfile)?;

    Ok(taskfile)
}

// Build a map from task name to task position.
pub fn index(taskfile: &Taskfile) -> HashMap<String, usize> {
    taskfile
        .tasks
        .iter()
        .enumerate()
        .map(|(i, task)| (task.name.clone(), i))
        .collect()
}

fn check_duplicates(taskfile: &Taskfile) -> Result<(), Failure> {
    let mut seen = HashMap::new();
    for task in &taskfile.tasks {
        if seen.insert(task.name.clone(), ()).is_some() {
            return Err(Failure::User(
                format!("Duplicate task name: {}.", task.name.code_str()),
                None,
            ));
        }
    }
    Ok(())
}

// Dependencies must name tasks declared in the file. Cycles are the
// author's responsibility; a cycle deadlocks its own tasks but nothing else.
fn check_dependencies(taskfile: &Taskfile) -> Result<(), Failure> {
    let names = index(taskfile);
    for task in &taskfile.tasks {
        for dependency in &task.run_after {
            if !names.contains_key(dependency) {
                return Err(Failure::User(
                    format!(
                        "Task {} runs after unknown task {}.",
                        task.name.code_str(),
                        dependency.code_str(),
                    ),
                    None,
                ));
            }
        }
    }
    Ok(())
}

fn check_hosts(taskfile: &Taskfile) -> Result<(), Failure> {
    for task in &taskfile.tasks {
        if matches!(task.executor, ExecutorKind::Ssh | ExecutorKind::Forwarded)
            && task.host.is_none()
        {
            return Err(Failure::User(
                format!("Task {} needs a {}.", task.name.code_str(), "host".code_str()),
                None,
            ));
        }
    }
    Ok(())
}

// The run attributes tasks can reference in their `image`, `host`, and
// `script` fields.
pub struct Substitutions<'a> {
    pub commit: &'a str,
    pub branch: &'a str,
    pub identifier: &'a str,
    pub repo_name: &'a str,
    pub log_url: &'a str,
}

pub fn substitute(text: &str, substitutions: &Substitutions) -> String {
    text.replace("{{commit}}", substitutions.commit)
        .replace("{{branch}}", substitutions.branch)
        .replace("{{identifier}}", substitutions.identifier)
        .replace("{{repo_name}}", substitutions.repo_name)
        .replace("{{log_url}}", substitutions.log_url)
}

#[cfg(test)]
mod tests {
    use crate::taskfile::{
        index, parse, substitute, ExecutorKind, Substitutions, Task, Taskfile,
    };

    #[test]
    fn parse_empty() {
        let input = r#"
tasks: []
    "#
        .trim();

        assert_eq!(parse(input).unwrap(), Taskfile { tasks: vec![] });
    }

    #[test]
    fn parse_minimal_task() {
        let input = r#"
tasks:
  - name: build
    "#
        .trim();

        let taskfile = Taskfile {
            tasks: vec![Task::synthetic("build")],
        };

        assert_eq!(parse(input).unwrap(), taskfile);
    }

    #[test]
    fn parse_comprehensive_task() {
        let input = r#"
tasks:
  - name: setup
  - name: test
    run_after:
      - setup
    run_always: false
    acquire_semaphore:
      - ci@build-host:/tmp/ci.queue
    executor: container
    image: "test:{{commit}}"
    mount_docker: true
    temp_path: true
    unstash_source: true
    script: |
      make test
    stash: "report/*"
    censor:
      - DEPLOY_TOKEN
    timeout: 3600
    "#
        .trim();

        let taskfile = parse(input).unwrap();
        assert_eq!(taskfile.tasks.len(), 2);

        let task = &taskfile.tasks[1];
        assert_eq!(task.name, "test");
        assert_eq!(task.run_after, vec!["setup".to_owned()]);
        assert!(!task.run_always);
        assert_eq!(
            task.acquire_semaphore,
            vec!["ci@build-host:/tmp/ci.queue".to_owned()],
        );
        assert_eq!(task.executor, ExecutorKind::Container);
        assert_eq!(task.image, "test:{{commit}}");
        assert!(task.mount_docker);
        assert!(task.temp_path);
        assert!(task.unstash_source);
        assert_eq!(task.script.as_deref(), Some("make test\n"));
        assert_eq!(task.stash.as_deref(), Some("report/*"));
        assert_eq!(task.censor, vec!["DEPLOY_TOKEN".to_owned()]);
        assert_eq!(task.timeout, Some(3600));
    }

    #[test]
    fn parse_rejects_duplicate_names() {
        let input = r#"
tasks:
  - name: build
  - name: build
    "#
        .trim();

        assert!(parse(input).is_err());
    }

    #[test]
    fn parse_rejects_unknown_dependency() {
        let input = r#"
tasks:
  - name: build
    run_after:
      - bootstrap
    "#
        .trim();

        assert!(parse(input).is_err());
    }

    #[test]
    fn parse_rejects_ssh_without_host() {
        let input = r#"
tasks:
  - name: deploy
    executor: ssh
    "#
        .trim();

        assert!(parse(input).is_err());
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let input = r#"
tasks:
  - name: build
    cache: true
    "#
        .trim();

        assert!(parse(input).is_err());
    }

    #[test]
    fn index_preserves_declaration_order() {
        let input = r#"
tasks:
  - name: one
  - name: two
  - name: three
    "#
        .trim();

        let taskfile = parse(input).unwrap();
        let task_index = index(&taskfile);
        assert_eq!(task_index["one"], 0);
        assert_eq!(task_index["two"], 1);
        assert_eq!(task_index["three"], 2);
    }

    #[test]
    fn substitute_replaces_run_attributes() {
        let substitutions = Substitutions {
            commit: "abc123",
            branch: "main",
            identifier: "1_abc",
            repo_name: "widget",
            log_url: "http://localhost/logs/1_abc",
        };

        assert_eq!(
            substitute("docker build . -t {{repo_name}}:{{commit}}", &substitutions),
            "docker build . -t widget:abc123",
        );
        assert_eq!(substitute("no placeholders", &substitutions), "no placeholders");
    }
}
