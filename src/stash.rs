use crate::{
    event::Event,
    failure,
    failure::Failure,
    process::{run_command, Output, RunOptions},
};
use flate2::read::GzDecoder;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tar::Archive;

// A stash is an immutable gzipped tar archive under `/tmp`, used to move
// file trees between executors. It is referenced by path only; the archive
// itself is created by `tar` on whichever side of an executor the files live.
#[derive(Clone, Debug)]
pub struct Stash {
    path: PathBuf,
}

lazy_static! {
    // Local stash files registered for removal at clean shutdown.
    static ref CLEANUP_REGISTRY: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
}

// A random scratch path of the form `/tmp/exe_<32-hex>`.
pub fn random_tmp_path() -> PathBuf {
    PathBuf::from("/tmp").join(format!("exe_{}", hex::encode(rand::random::<[u8; 16]>())))
}

// Every file path passed to a delete operation must live directly under
// `/tmp`. This is a hard safety invariant: it bounds the blast radius of
// every `rm` this program ever issues, local or remote.
pub fn assert_path_in_tmp(path: &Path) -> Result<(), Failure> {
    if !path.is_absolute() {
        return Err(Failure::System(
            format!("Temp path is not absolute: {}", path.to_string_lossy()),
            None,
        ));
    }
    if path.parent() != Some(Path::new("/tmp")) {
        return Err(Failure::System(
            format!(
                "Temp path does not start with '/tmp/': {}",
                path.to_string_lossy(),
            ),
            None,
        ));
    }
    Ok(())
}

pub fn safe_del_tmp_file(path: &Path) -> Result<(), Failure> {
    assert_path_in_tmp(path)?;
    std::fs::remove_file(path).map_err(failure::system(format!(
        "Unable to remove temp file {}.",
        path.to_string_lossy(),
    )))
}

// Register a local temp file for removal at clean shutdown.
pub fn register_tmp_file_cleanup(path: &Path) -> Result<(), Failure> {
    assert_path_in_tmp(path)?;
    CLEANUP_REGISTRY.lock().unwrap().push(path.to_owned());
    Ok(())
}

// Best-effort removal of every registered temp file.
pub fn remove_registered_tmp_files() {
    let paths = std::mem::take(&mut *CLEANUP_REGISTRY.lock().unwrap());
    for path in paths {
        if let Err(e) = safe_del_tmp_file(&path) {
            debug!("{}", e);
        }
    }
}

impl Stash {
    pub fn from_path(path: PathBuf) -> Stash {
        Stash { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // An empty archive, for callers that need a stash-shaped placeholder.
    pub fn empty() -> Result<Stash, Failure> {
        let path = random_tmp_path();
        let command = vec![
            "tar".to_owned(),
            "--create".to_owned(),
            "--gzip".to_owned(),
            "--file".to_owned(),
            path.to_string_lossy().into_owned(),
            "--files-from".to_owned(),
            "/dev/null".to_owned(),
        ];
        run_command(&command, RunOptions::new(Event::new(), Output::Discard))
            .map_err(Failure::Process)?;
        register_tmp_file_cleanup(&path)?;
        Ok(Stash { path })
    }

    // Extract a single member into memory.
    pub fn read_bytes(&self, member: &str) -> Result<Vec<u8>, Failure> {
        let file = File::open(&self.path).map_err(failure::system(format!(
            "Unable to open stash {}.",
            self.path.to_string_lossy(),
        )))?;
        let mut archive = Archive::new(GzDecoder::new(file));
        let entries = archive.entries().map_err(failure::system(format!(
            "Unable to read stash {}.",
            self.path.to_string_lossy(),
        )))?;

        let wanted = member.trim_start_matches("./");
        for entry in entries {
            let mut entry = entry.map_err(failure::system(format!(
                "Unable to read stash {}.",
                self.path.to_string_lossy(),
            )))?;
            let matches = entry
                .path()
                .map(|path| path.to_string_lossy().trim_start_matches("./") == wanted)
                .unwrap_or(false);
            if matches {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).map_err(failure::system(
                    format!("Unable to extract {} from stash.", member),
                ))?;
                return Ok(contents);
            }
        }

        Err(Failure::User(
            format!(
                "No member {} in stash {}.",
                member,
                self.path.to_string_lossy(),
            ),
            None,
        ))
    }

    pub fn read_text(&self, member: &str) -> Result<String, Failure> {
        let bytes = self.read_bytes(member)?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use crate::stash::{assert_path_in_tmp, random_tmp_path, safe_del_tmp_file, Stash};
    use flate2::{write::GzEncoder, Compression};
    use std::{fs::File, io::Write, path::Path};

    #[test]
    fn random_tmp_path_shape() {
        let path = random_tmp_path();
        assert_eq!(path.parent(), Some(Path::new("/tmp")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("exe_"));
        assert_eq!(name.len(), "exe_".len() + 32);
    }

    #[test]
    fn tmp_assertion_accepts_tmp_children() {
        assert!(assert_path_in_tmp(Path::new("/tmp/exe_abc")).is_ok());
    }

    #[test]
    fn tmp_assertion_rejects_relative_paths() {
        assert!(assert_path_in_tmp(Path::new("exe_abc")).is_err());
    }

    #[test]
    fn tmp_assertion_rejects_other_directories() {
        assert!(assert_path_in_tmp(Path::new("/etc/passwd")).is_err());
        assert!(assert_path_in_tmp(Path::new("/tmp/nested/file")).is_err());
    }

    #[test]
    fn empty_stash_is_created_under_tmp() {
        let stash = Stash::empty().unwrap();
        assert!(stash.path().exists());
        assert_eq!(stash.path().parent(), Some(Path::new("/tmp")));
        safe_del_tmp_file(stash.path()).unwrap();
    }

    #[test]
    fn read_bytes_and_text_extract_members() {
        let path = random_tmp_path();
        {
            let file = File::create(&path).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"hello stash\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "dir/greeting.txt", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        }

        let stash = Stash::from_path(path.clone());
        assert_eq!(stash.read_bytes("dir/greeting.txt").unwrap(), b"hello stash\n");
        assert_eq!(stash.read_text("dir/greeting.txt").unwrap(), "hello stash");
        assert!(stash.read_bytes("missing.txt").is_err());
        safe_del_tmp_file(&path).unwrap();
    }
}
