use crate::{event::Event, failure, failure::Failure};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::Path,
    process::Command,
    time::Duration,
};

// The magic stdout lines of the queue-helper protocol. The spelling of the
// acquisition line is historical and is part of the wire format; helpers of
// different vintages share queue files.
pub const ACQUIRED_LINE: &str = "SEMAPHORE_AQUIRED";
pub const MESSAGE_PREFIX: &str = "MESSAGE:";

const INITIAL_QUEUE: &str = "{\"concurrency\": 1, \"queue\": []}";

// One waiter or holder in the queue file. An entry holds its position; the
// first `concurrency` entries are holders, the rest are waiters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueEntry {
    pub pid: i32,
    pub description: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
struct QueueFile {
    concurrency: usize,
    queue: Vec<QueueEntry>,
}

// Probe which of the listed pids are alive and not zombies.
fn running_pids(entries: &[QueueEntry]) -> Vec<i32> {
    if entries.is_empty() {
        return vec![];
    }
    let output = Command::new("ps")
        .arg("-o")
        .arg("pid,state")
        .args(entries.iter().map(|entry| entry.pid.to_string()))
        .output();
    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                let pid = tokens.next()?.parse::<i32>().ok()?;
                let state = tokens.next()?;
                if state.starts_with('Z') {
                    None // Zombie process
                } else {
                    Some(pid)
                }
            })
            .collect(),
        _ => vec![],
    }
}

// Take an exclusive lock on the queue file, prune entries whose pid is dead,
// optionally add or remove our own entry, and write the file back in place.
// The advisory lock covers the whole read-modify-write, so the file is
// authoritative and unambiguous after every pass.
pub fn read_and_update_queue(
    path: &Path,
    add_self: bool,
    remove_self: bool,
    self_description: &str,
) -> Result<(usize, Vec<QueueEntry>), Failure> {
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(failure::system(format!(
            "Unable to open queue file {}.",
            path.to_string_lossy(),
        )))?;
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
        return Err(Failure::System(
            format!("Unable to lock queue file {}.", path.to_string_lossy()),
            None,
        ));
    }

    let mut raw_data = String::new();
    file.read_to_string(&mut raw_data)
        .map_err(failure::system("Unable to read queue file."))?;
    let data: QueueFile = serde_json::from_str(&raw_data)
        .map_err(failure::system(format!("Queue parse error: {}", raw_data)))?;

    let alive = running_pids(&data.queue);
    let mut verified_queue = data
        .queue
        .iter()
        .filter(|entry| alive.contains(&entry.pid))
        .cloned()
        .collect::<Vec<_>>();

    let self_pid = std::process::id() as i32;
    if add_self && !verified_queue.iter().any(|entry| entry.pid == self_pid) {
        verified_queue.push(QueueEntry {
            pid: self_pid,
            description: self_description.to_owned(),
        });
    }
    if remove_self {
        verified_queue.retain(|entry| entry.pid != self_pid);
    }

    if verified_queue != data.queue {
        let new_data = serde_json::to_string_pretty(&QueueFile {
            concurrency: data.concurrency,
            queue: verified_queue.clone(),
        })
        .map_err(failure::system("Unable to serialize queue."))?;
        file.seek(SeekFrom::Start(0))
            .map_err(failure::system("Unable to seek queue file."))?;
        file.write_all(new_data.as_bytes())
            .map_err(failure::system("Unable to write queue file."))?;
        file.set_len(new_data.len() as u64)
            .map_err(failure::system("Unable to truncate queue file."))?;
    }

    Ok((data.concurrency, verified_queue))
}

// Write a protocol line, unbuffered. The caller reads our stdout through a
// pipe; a write failure means the parent is gone, and the helper must not
// keep holding its queue position.
fn emit(line: &str) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", line)?;
    handle.flush()
}

// Join the queue and block until our entry sits within the concurrency
// window, heartbeating so we exit promptly when the parent dies. Announces
// acquisition with the magic line, then heartbeats until terminated. Always
// prunes our own entry on the way out, including after SIGTERM.
pub fn wait_in_queue(path: &Path, self_description: &str, stop: &Event) -> Result<(), Failure> {
    if !path.is_file() {
        // Create the queue on first use for ease of use.
        fs::write(path, INITIAL_QUEUE)
            .map_err(failure::system("Unable to create queue file."))?;
    }

    let self_pid = std::process::id() as i32;
    let mut last_message = String::new();
    let mut acquired = false;
    let wait_result = loop {
        if stop.is_set() {
            break Ok(());
        }
        let (concurrency, queue) = match read_and_update_queue(path, true, false, self_description)
        {
            Ok(result) => result,
            Err(e) => break Err(e),
        };
        if let Some(index) = queue.iter().position(|entry| entry.pid == self_pid) {
            if index < concurrency {
                acquired = true;
                break Ok(());
            }
            let message = format!(
                "{}Position in queue: {} (concurrency {})",
                MESSAGE_PREFIX, index, concurrency,
            );
            if message != last_message {
                if emit(&message).is_err() {
                    break Ok(()); // Parent is gone
                }
                last_message = message;
            } else if emit("").is_err() {
                break Ok(()); // Parent is gone
            }
        }
        stop.wait_timeout(Duration::from_secs(1));
    };

    if acquired && emit(ACQUIRED_LINE).is_ok() {
        loop {
            if stop.wait_timeout(Duration::from_secs(1)) {
                break;
            }
            if emit("").is_err() {
                break; // Parent is gone
            }
        }
    }

    // Remove ourselves from the queue on every exit path.
    let prune_result = read_and_update_queue(path, false, true, "").map(|_| ());
    wait_result.and(prune_result)
}

// Print `[concurrency, queue]` as JSON, without joining the queue. Dead
// entries are still pruned, as on any other pass.
pub fn print_queue(path: &Path) -> Result<(), Failure> {
    let (concurrency, queue) = read_and_update_queue(path, false, false, "")?;
    let output = serde_json::to_string(&(concurrency, queue))
        .map_err(failure::system("Unable to serialize queue."))?;
    emit(&output).map_err(failure::system("Unable to write queue to stdout."))
}

#[cfg(test)]
mod tests {
    use crate::queue::{read_and_update_queue, QueueEntry};
    use std::fs;

    #[test]
    fn creates_nothing_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.queue");
        assert!(read_and_update_queue(&path, false, false, "").is_err());
    }

    #[test]
    fn adds_self_and_prunes_dead_pids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semaphore.queue");
        fs::write(
            &path,
            "{\"concurrency\": 2, \"queue\": [{\"pid\": 999999999, \"description\": \"stale\"}]}",
        )
        .unwrap();

        let (concurrency, queue) = read_and_update_queue(&path, true, false, "me").unwrap();
        assert_eq!(concurrency, 2);
        assert_eq!(
            queue,
            vec![QueueEntry {
                pid: std::process::id() as i32,
                description: "me".to_owned(),
            }],
        );

        // The rewrite is visible to the next reader.
        let reread = fs::read_to_string(&path).unwrap();
        assert!(reread.contains(&std::process::id().to_string()));
        assert!(!reread.contains("999999999"));
    }

    #[test]
    fn remove_self_leaves_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semaphore.queue");
        fs::write(&path, "{\"concurrency\": 1, \"queue\": []}").unwrap();

        read_and_update_queue(&path, true, false, "me").unwrap();
        let (_, queue) = read_and_update_queue(&path, false, true, "").unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semaphore.queue");
        fs::write(&path, "{\"concurrency\": 1, \"queue\": []}").unwrap();

        read_and_update_queue(&path, true, false, "me").unwrap();
        let (_, queue) = read_and_update_queue(&path, true, false, "me").unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semaphore.queue");
        fs::write(&path, "not json").unwrap();
        assert!(read_and_update_queue(&path, false, false, "").is_err());
    }
}
