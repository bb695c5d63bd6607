use std::{error, fmt};

// An error produced by a spawned child process: it exited with a non-zero
// code or was cancelled before or during execution. The captured output is
// complete even when the process was killed, because the stream readers are
// always drained before the exit code is reported.
#[derive(Debug)]
pub struct ProcessError {
    pub message: String,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessError {
    // Construct an error for a process that was never allowed to start or
    // never produced an exit code.
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        ProcessError {
            message: message.into(),
            exit_code: None,
            stdout: vec![],
            stderr: vec![],
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl error::Error for ProcessError {}

// We distinguish between five kinds of failures:
// 1. The user or the supervisor interrupted the program
// 2. A spawned child process failed or was cancelled
// 3. The program was misconfigured (bad identifier, bad state file, ...)
// 4. Some system operation (e.g., creating a directory) failed
// 5. There was a problem with the user's input (e.g., a bad task file)
#[derive(Debug)]
pub enum Failure {
    Interrupted, // E.g., by SIGINT or SIGTERM
    Process(ProcessError),
    Config(String),
    System(String, Option<Box<dyn error::Error + Send + Sync + 'static>>),
    User(String, Option<Box<dyn error::Error + Send + Sync + 'static>>),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::Interrupted => write!(f, "Interrupted."),
            Failure::Process(e) => write!(f, "{}", e),
            Failure::Config(message) => write!(f, "{}", message),
            Failure::System(message, None) | Failure::User(message, None) => {
                write!(f, "{}", message)
            }
            Failure::System(message, Some(source)) | Failure::User(message, Some(source)) => {
                write!(f, "{} Reason: {}", message, source)
            }
        }
    }
}

impl error::Error for Failure {
    fn source<'a>(&'a self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Failure::Interrupted | Failure::Config(_) => None,
            Failure::Process(e) => Some(e),
            Failure::System(_, source) | Failure::User(_, source) => {
                source.as_deref().map(|e| e as &(dyn error::Error + 'static))
            }
        }
    }
}

impl From<ProcessError> for Failure {
    fn from(error: ProcessError) -> Self {
        Failure::Process(error)
    }
}

// This is a helper function to convert a `std::error::Error` into a system
// failure. It's written in a curried style so it can be used in a
// higher-order fashion, e.g., `foo.map_err(failure::system("Error doing foo."))`.
pub fn system<S: Into<String>, E: error::Error + Send + Sync + 'static>(
    message: S,
) -> impl FnOnce(E) -> Failure {
    let message = message.into();
    move |error: E| Failure::System(message, Some(Box::new(error)))
}

// Same as above, but for user failures.
pub fn user<S: Into<String>, E: error::Error + Send + Sync + 'static>(
    message: S,
) -> impl FnOnce(E) -> Failure {
    let message = message.into();
    move |error: E| Failure::User(message, Some(Box::new(error)))
}

#[cfg(test)]
mod tests {
    use crate::failure::{Failure, ProcessError};

    #[test]
    fn display_process_error() {
        let error = ProcessError {
            message: "Exit code: 42".to_owned(),
            exit_code: Some(42),
            stdout: vec![],
            stderr: vec![],
        };

        assert_eq!(format!("{}", Failure::Process(error)), "Exit code: 42");
    }

    #[test]
    fn display_config() {
        assert_eq!(
            format!("{}", Failure::Config("Bad identifier.".to_owned())),
            "Bad identifier.",
        );
    }

    #[test]
    fn display_system_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let failure = Failure::System("Unable to write file.".to_owned(), Some(Box::new(source)));

        assert_eq!(
            format!("{}", failure),
            "Unable to write file. Reason: disk on fire",
        );
    }
}
