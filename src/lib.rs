#![cfg(any(unix, target_os = "redox"))]

//! Determines the MIME type of a file by combining two independent
//! resolution strategies from the [freedesktop.org shared-mime-info
//! spec][xdg-mime]: filename-pattern (glob) matching and content-based
//! (magic) matching.
//!
//! The two matching engines are the interesting part of this crate:
//!
//!  - [`glob`] dispatches suffix patterns (`*.txt`) through a hash index and
//!    falls back to general shell-glob matching for anything else.
//!  - [`magic`] parses a binary rules file into an indented tree of
//!    byte-pattern predicates and evaluates them against file contents with
//!    masked comparison and sliding-range search.
//!
//! [`MimeResolver`] composes the two: glob first (case-sensitive, then
//! case-insensitive), falling back to magic only when glob yields nothing
//! usable.
//!
//! Locating the two database files on disk is not this crate's job in the
//! general case — [`MimeResolver::new`] takes explicit paths — but
//! [`MimeResolver::open_xdg`] is provided as a convenience for the common
//! case of loading the system's shared-mime-info database from the
//! [XDG base directories][xdg-basedir].
//!
//! [xdg-mime]: https://specifications.freedesktop.org/shared-mime-info-spec/shared-mime-info-spec-latest.html
//! [xdg-basedir]: https://specifications.freedesktop.org/basedir-spec/latest/

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use mime::Mime;

pub mod error;
mod glob;
mod magic;

use error::{GlobError, InitError, MagicError};

/// The shared MIME info resolver: a glob engine and a magic engine, either
/// of which may be absent if its database failed to load.
pub struct MimeResolver {
    globs: Option<glob::GlobDatabase>,
    magic: Option<magic::MagicDatabase>,
}

impl MimeResolver {
    /// Loads a resolver from explicit paths to a globs database and a magic
    /// database. Fails only if *neither* database could be loaded.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        globs_path: P,
        magic_path: Q,
    ) -> Result<MimeResolver, InitError> {
        let globs_result = glob::GlobDatabase::parse(globs_path.as_ref());
        let magic_result = magic::MagicDatabase::parse(magic_path.as_ref());
        Self::from_results(globs_result, magic_result)
    }

    /// Loads a resolver from the [XDG base directories][xdg-basedir]: the
    /// first `<dir>/mime/globs2` and `<dir>/mime/magic` found, searching
    /// `$XDG_DATA_HOME` (or `~/.local/share`) before `$XDG_DATA_DIRS` (or
    /// `/usr/local/share:/usr/share`), in that order.
    ///
    /// [xdg-basedir]: https://specifications.freedesktop.org/basedir-spec/latest/
    pub fn open_xdg() -> Result<MimeResolver, InitError> {
        let dirs = xdg_data_dirs();
        let globs_result = find_database(&dirs, "globs2", |p| glob::GlobDatabase::parse(p));
        let magic_result = find_database(&dirs, "magic", |p| magic::MagicDatabase::parse(p));
        Self::from_results(globs_result, magic_result)
    }

    fn from_results(
        globs_result: Result<glob::GlobDatabase, GlobError>,
        magic_result: Result<magic::MagicDatabase, MagicError>,
    ) -> Result<MimeResolver, InitError> {
        match (globs_result, magic_result) {
            (Err(glob_error), Err(magic_error)) => Err(InitError::NoDatabases {
                glob_error,
                magic_error,
            }),
            (globs_result, magic_result) => {
                if let Err(ref e) = globs_result {
                    tracing::warn!(error = %e, "globs database unavailable, falling back to magic only");
                }
                if let Err(ref e) = magic_result {
                    tracing::warn!(error = %e, "magic database unavailable, falling back to globs only");
                }

                Ok(MimeResolver {
                    globs: globs_result.ok(),
                    magic: magic_result.ok(),
                })
            }
        }
    }

    /// Retrieves the best-guess MIME type for `path`: glob on the file name
    /// (case-sensitive, then case-insensitive), falling back to opening the
    /// file and running it through the magic engine.
    pub fn get_type<P: AsRef<Path>>(&self, path: P) -> Option<Mime> {
        let path = path.as_ref();
        let file_name = path.file_name().and_then(|name| name.to_str());

        if let (Some(globs), Some(file_name)) = (&self.globs, file_name) {
            if let Some(mime) = globs.lookup(file_name, false).mime() {
                return Some(mime);
            }
            if let Some(mime) = globs.lookup(file_name, true).mime() {
                return Some(mime);
            }
        }

        let magic = self.magic.as_ref()?;
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(source) => {
                tracing::warn!(error = %source, path = %path.display(), "could not open file for magic lookup");
                return None;
            }
        };
        magic.lookup(&mut file)
    }
}

fn xdg_data_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(data_home) = dirs_next::data_dir() {
        dirs.push(data_home);
    }

    match env::var_os("XDG_DATA_DIRS") {
        Some(v) => dirs.extend(env::split_paths(&v)),
        None => {
            dirs.push(PathBuf::from("/usr/local/share"));
            dirs.push(PathBuf::from("/usr/share"));
        }
    }

    dirs
}

fn find_database<T, E>(
    dirs: &[PathBuf],
    relative: &str,
    parse: impl Fn(&Path) -> Result<T, E>,
) -> Result<T, E> {
    let mut last_err = None;
    for dir in dirs {
        let path = dir.join("mime").join(relative);
        match parse(&path) {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("xdg_data_dirs always yields at least one directory"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn simple_suffix_end_to_end() {
        let dir = TempDir::new().unwrap();
        let globs = write_file(&dir, "globs2", b"50:text/plain:*.txt\n");
        let magic = write_file(&dir, "magic", b"MIME-Magic\0\n");
        let resolver = MimeResolver::new(&globs, &magic).unwrap();

        let notes = write_file(&dir, "notes.txt", b"hello world");
        assert_eq!(resolver.get_type(&notes), Some("text/plain".parse().unwrap()));
    }

    #[test]
    fn ambiguous_glob_falls_back_to_magic() {
        let dir = TempDir::new().unwrap();
        let globs = write_file(
            &dir,
            "globs2",
            b"50:image/x-a:*.dat\n50:image/x-b:*.dat\n",
        );

        let mut magic_bytes = b"MIME-Magic\0\n".to_vec();
        magic_bytes.extend(b"[50:image/x-b]\n".to_vec());
        magic_bytes.push(b'>');
        magic_bytes.extend(b"0=".to_vec());
        magic_bytes.extend(3u16.to_be_bytes());
        magic_bytes.extend(b"AB\0".to_vec());
        magic_bytes.push(b'\n');
        let magic = write_file(&dir, "magic", &magic_bytes);

        let resolver = MimeResolver::new(&globs, &magic).unwrap();

        let sample = write_file(&dir, "sample.dat", b"AB\0rest-of-file");
        assert_eq!(resolver.get_type(&sample), Some("image/x-b".parse().unwrap()));
    }

    #[test]
    fn missing_globs_still_resolves_via_magic() {
        let dir = TempDir::new().unwrap();
        let mut magic_bytes = b"MIME-Magic\0\n".to_vec();
        magic_bytes.extend(b"[50:image/x-a]\n".to_vec());
        magic_bytes.push(b'>');
        magic_bytes.extend(b"0=".to_vec());
        magic_bytes.extend(2u16.to_be_bytes());
        magic_bytes.extend(b"AB".to_vec());
        magic_bytes.push(b'\n');
        let magic = write_file(&dir, "magic", &magic_bytes);

        let resolver = MimeResolver::new(dir.path().join("does-not-exist"), &magic).unwrap();

        let sample = write_file(&dir, "sample.bin", b"ABrest");
        assert_eq!(resolver.get_type(&sample), Some("image/x-a".parse().unwrap()));
    }

    #[test]
    fn neither_database_is_a_fatal_init_error() {
        let dir = TempDir::new().unwrap();
        let result = MimeResolver::new(
            dir.path().join("no-globs"),
            dir.path().join("no-magic"),
        );
        assert!(matches!(result, Err(InitError::NoDatabases { .. })));
    }

    #[test]
    fn unmatched_file_returns_none() {
        let dir = TempDir::new().unwrap();
        let globs = write_file(&dir, "globs2", b"50:text/plain:*.txt\n");
        let magic = write_file(&dir, "magic", b"MIME-Magic\0\n");
        let resolver = MimeResolver::new(&globs, &magic).unwrap();

        let unknown = write_file(&dir, "mystery.bin", b"whatever");
        assert_eq!(resolver.get_type(&unknown), None);
    }
}
