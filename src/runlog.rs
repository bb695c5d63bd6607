use crate::{config::LOG_FILE, failure, failure::Failure};
use chrono::Utc;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

// Replacement text for censored substrings.
pub const CENSORED: &str = "********";

// Every line of task output is timestamped, prefixed with a 20-column task
// name, appended to the run's `output.log` under a mutex, and mirrored to
// stdout. The second whitespace-delimited token of a line is therefore always
// the task name, which is what the live stream uses as its stage field.
#[derive(Clone)]
pub struct Log {
    file: Option<Arc<Mutex<File>>>,
    task: String,
}

impl Log {
    // Open the append-only log for a run directory.
    pub fn open(logdir: &Path) -> Result<Log, Failure> {
        let path = logdir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(failure::system(format!(
                "Unable to open log file {}.",
                path.to_string_lossy(),
            )))?;

        Ok(Log {
            file: Some(Arc::new(Mutex::new(file))),
            task: "taskrunner".to_owned(),
        })
    }

    // A log that only mirrors to stdout. Used by the supervisor, whose own
    // stdout is the place operators look.
    pub fn plain() -> Log {
        Log {
            file: None,
            task: "griddle".to_owned(),
        }
    }

    // A handle carrying a different task name in its context.
    pub fn task(&self, name: &str) -> Log {
        Log {
            file: self.file.clone(),
            task: name.to_owned(),
        }
    }

    pub fn line(&self, message: &str) {
        let line = format!(
            "{} {:<20} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
            self.task,
            message,
        );
        {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            let _ = handle.write_all(line.as_bytes());
            let _ = handle.flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(line.as_bytes());
        }
    }

    // Echo a command the way a shell trace would: a yellow `+ ` on the first
    // line and two spaces of continuation, after censoring.
    pub fn command(&self, command: &str, censor: &[String]) {
        let mut censored = command.to_owned();
        for item in censor {
            censored = censored.replace(item, CENSORED);
        }
        for (i, line) in censored.trim().lines().enumerate() {
            let indent = if i == 0 { "+ " } else { "  " };
            self.line(&yellow(&format!("{}{}", indent, line.trim())));
        }
    }
}

// Raw ANSI yellow. The run log always carries the escape codes so that the
// streaming clients can map them to colors; terminal detection is
// deliberately not involved here.
pub fn yellow(text: &str) -> String {
    format!("\u{1b}[33m{}\u{1b}[0m", text)
}

// Remove censored substrings and embedded carriage returns from a line of
// process output. Progress-bar output such as apt-get embeds `\r`.
pub fn clean_line(line: &str, censor: &[String]) -> String {
    let mut cleaned = line.to_owned();
    for item in censor {
        cleaned = cleaned.replace(item, CENSORED);
    }
    cleaned.replace('\r', "")
}

#[cfg(test)]
mod tests {
    use crate::runlog::{clean_line, yellow, Log};
    use std::fs;

    #[test]
    fn clean_line_censors() {
        assert_eq!(
            clean_line("token=hunter2 ok", &["hunter2".to_owned()]),
            "token=******** ok",
        );
    }

    #[test]
    fn clean_line_strips_carriage_returns() {
        assert_eq!(clean_line("12%\r34%\r", &[]), "12%34%");
    }

    #[test]
    fn yellow_wraps_with_escape_codes() {
        assert_eq!(yellow("hi"), "\u{1b}[33mhi\u{1b}[0m");
    }

    #[test]
    fn line_format_has_task_column() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path()).unwrap();
        log.task("build").line("hello");

        let contents = fs::read_to_string(dir.path().join("output.log")).unwrap();
        let line = contents.lines().next().unwrap();
        let mut tokens = line.split_whitespace();
        tokens.next().unwrap(); // Timestamp
        assert_eq!(tokens.next().unwrap(), "build");
        assert_eq!(tokens.next().unwrap(), "hello");

        // The task column is padded to 20 characters.
        assert!(line.contains("build                hello"));
    }

    #[test]
    fn command_echo_is_censored_and_indented() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(dir.path()).unwrap();
        log.task("deploy")
            .command("echo secret\nls", &["secret".to_owned()]);

        let contents = fs::read_to_string(dir.path().join("output.log")).unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert!(lines[0].contains("+ echo ********"));
        assert!(lines[1].contains("  ls"));
    }
}
