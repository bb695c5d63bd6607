use crate::failure::Failure;
use std::{env, path::PathBuf};

// Names of the files kept in every run's log directory. The existence of the
// state file is the ground truth that a `(branch, commit)` pair has been
// picked up.
pub const STATE_FILE: &str = "state.json";
pub const LOG_FILE: &str = "output.log";

// Workspaces of finished runs are kept around for this long before the
// supervisor removes them.
pub const KEEP_WORKSPACE_SECONDS: u64 = 10;

// The supervisor's configuration, loaded from the environment once at
// startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub repo_url: String,
    pub repo_name: String,
    pub base_url: String,
    pub tasks_file: String,
    pub taskrunner_image: String,
    pub additional_mounts: Vec<String>,
    pub listen_addr: String,
    pub data_path: PathBuf,
    pub external_data_path: PathBuf,
    pub external_ssh_path: PathBuf,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

impl Config {
    pub fn from_env() -> Result<Config, Failure> {
        let data_path = PathBuf::from(var_or("DATA_PATH", "./data"));

        // The mounts handed to `docker run` must be host-side paths. When the
        // supervisor itself runs in a container, the host paths differ from
        // the paths the supervisor sees, so they are configurable separately.
        let external_data_path = env::var("EXTERNAL_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_path.clone());
        let external_ssh_path = env::var("EXTERNAL_SSH_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".ssh"));

        let additional_mounts = var_or("ADDITIONAL_MOUNTS", "")
            .split(',')
            .map(str::trim)
            .filter(|mount| !mount.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();

        Ok(Config {
            repo_url: var_or("REPO_URL", "."),
            repo_name: var_or("REPO_NAME", "testing"),
            base_url: var_or("BASE_URL", "http://localhost"),
            tasks_file: var_or("TASKS_FILE", "griddle.yml"),
            taskrunner_image: var_or("TASKRUNNER_IMAGE", "griddle"),
            additional_mounts,
            listen_addr: var_or("LISTEN_ADDR", "0.0.0.0:8000"),
            data_path,
            external_data_path,
            external_ssh_path,
        })
    }

    pub fn repo_path(&self) -> PathBuf {
        self.data_path.join("repo")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.data_path.join("logs")
    }

    pub fn work_path(&self) -> PathBuf {
        self.data_path.join("workspaces")
    }
}

pub fn home_dir() -> PathBuf {
    PathBuf::from(var_or("HOME", "/root"))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    // The environment is process-global, so this test covers the defaults
    // and the mount parsing in one pass to avoid races between tests.
    #[test]
    fn from_env_defaults_and_mounts() {
        std::env::remove_var("REPO_URL");
        std::env::set_var("ADDITIONAL_MOUNTS", "/a:/b, /c:/d:ro ,");
        let config = Config::from_env().unwrap();

        assert_eq!(config.repo_url, ".");
        assert_eq!(config.tasks_file, "griddle.yml");
        assert_eq!(
            config.additional_mounts,
            vec!["/a:/b".to_owned(), "/c:/d:ro".to_owned()],
        );
        assert_eq!(config.repo_path(), config.data_path.join("repo"));
        std::env::remove_var("ADDITIONAL_MOUNTS");
    }
}
