//! Task identifiers and the request/response/status file triple.
//!
//! A transaction is named after its request file
//! `<task-name>[--<option1>[-<optionN>]]--<unique-id>.run`; the response
//! (`.out`) and status (`.err`) artifacts are its siblings. The logical
//! state of a transaction is derived from which of them exist.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AdmindError, Result};
use crate::layout::remove_if_exists;

pub const REQUEST_SUFFIX: &str = ".run";
pub const RESPONSE_SUFFIX: &str = ".out";
pub const STATUS_SUFFIX: &str = ".err";
/// Never published; status content is written here and renamed into place.
pub const SCRATCH_SUFFIX: &str = ".tmp";

const FIELD_SEPARATOR: &str = "--";
const OPTION_SEPARATOR: char = '-';

/// Parsed form of a transaction base name.
///
/// Examples of valid identifiers:
/// `echo--12345`, `a.b.c.uppercase--123xyz456`,
/// `_odd-name-with-dashes--xml-ordered-utf8--1bf89c33`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskIdentifier {
    name: String,
    options: Vec<String>,
    id: String,
}

impl TaskIdentifier {
    pub fn new<S: AsRef<str>>(name: &str, options: &[S], id: &str) -> Result<Self> {
        validate_name(name)?;
        for option in options {
            validate_option(option.as_ref())?;
        }
        validate_id(id)?;

        Ok(Self {
            name: name.to_string(),
            options: options.iter().map(|o| o.as_ref().to_string()).collect(),
            id: id.to_string(),
        })
    }

    /// Parses `<name>--<id>` or `<name>--<opt>[-<opt>]*--<id>`.
    pub fn parse(identifier: &str) -> Result<Self> {
        let fields: Vec<&str> = identifier.split(FIELD_SEPARATOR).collect();

        match fields.as_slice() {
            [name, id] => Self::new::<&str>(name, &[], id),
            [name, options, id] => {
                let options: Vec<&str> = options.split(OPTION_SEPARATOR).collect();
                Self::new(name, &options, id)
            }
            _ => Err(AdmindError::InvalidIdentifier(identifier.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request file for this identifier inside `dir`.
    pub fn request_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{}", self, REQUEST_SUFFIX))
    }
}

impl fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.options.is_empty() {
            write!(f, "{}{}", FIELD_SEPARATOR, self.options.join("-"))?;
        }
        write!(f, "{}{}", FIELD_SEPARATOR, self.id)
    }
}

impl FromStr for TaskIdentifier {
    type Err = AdmindError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(field: &str, value: &str) -> AdmindError {
    AdmindError::InvalidIdentifier(format!("{} '{}'", field, value))
}

fn is_word_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}

fn validate_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && !name.contains(FIELD_SEPARATOR)
        && !name.starts_with(OPTION_SEPARATOR)
        && !name.ends_with(OPTION_SEPARATOR)
        && name.chars().all(|ch| is_word_char(ch) || ch == OPTION_SEPARATOR);

    if well_formed {
        Ok(())
    } else {
        Err(invalid("task name", name))
    }
}

fn validate_option(option: &str) -> Result<()> {
    if !option.is_empty() && option.chars().all(is_word_char) {
        Ok(())
    } else {
        Err(invalid("option", option))
    }
}

fn validate_id(id: &str) -> Result<()> {
    if !id.is_empty() && id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(invalid("unique id", id))
    }
}

/// Logical state of a transaction as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsyncStatus {
    /// Finished with a non-empty status artifact.
    Error,
    /// Request written, not yet claimed.
    Pending,
    /// Claimed by an execution unit, not finished.
    Running,
    /// Finished with an empty status artifact.
    Ready,
    /// No artifact left.
    Gone,
}

impl AsyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncStatus::Error => "error",
            AsyncStatus::Pending => "pending",
            AsyncStatus::Running => "running",
            AsyncStatus::Ready => "ready",
            AsyncStatus::Gone => "gone",
        }
    }

    /// Ready, Error and Gone: the server has nothing left to do.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AsyncStatus::Error | AsyncStatus::Ready | AsyncStatus::Gone
        )
    }
}

impl fmt::Display for AsyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths of the artifacts belonging to one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transaction {
    request: PathBuf,
    base: String,
}

impl Transaction {
    pub fn new(request: impl Into<PathBuf>) -> Self {
        let request = request.into();
        let full = request.to_string_lossy();
        let base = full
            .strip_suffix(REQUEST_SUFFIX)
            .unwrap_or(&full)
            .to_string();
        Self { request, base }
    }

    /// True for paths carrying the request suffix.
    pub fn is_request(path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().ends_with(REQUEST_SUFFIX))
            .unwrap_or(false)
    }

    pub fn request(&self) -> &Path {
        &self.request
    }

    pub fn response(&self) -> PathBuf {
        self.sibling(RESPONSE_SUFFIX)
    }

    pub fn status_file(&self) -> PathBuf {
        self.sibling(STATUS_SUFFIX)
    }

    pub fn scratch(&self) -> PathBuf {
        self.sibling(SCRATCH_SUFFIX)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.base, suffix))
    }

    /// Request file name without its suffix.
    pub fn identifier_str(&self) -> String {
        let name = self
            .request
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.strip_suffix(REQUEST_SUFFIX)
            .map(str::to_string)
            .unwrap_or(name)
    }

    pub fn identifier(&self) -> Result<TaskIdentifier> {
        TaskIdentifier::parse(&self.identifier_str())
    }

    /// Derives the state from the artifacts, in fixed precedence:
    /// status, then response, then request.
    pub fn observe(&self) -> AsyncStatus {
        if let Ok(meta) = fs::metadata(self.status_file()) {
            return if meta.len() == 0 {
                AsyncStatus::Ready
            } else {
                AsyncStatus::Error
            };
        }

        if self.response().exists() {
            AsyncStatus::Running
        } else if self.request.exists() {
            AsyncStatus::Pending
        } else {
            AsyncStatus::Gone
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status_file().exists()
    }

    /// Deletes request, response and status; missing artifacts are fine.
    pub fn remove(&self) -> io::Result<()> {
        remove_if_exists(&self.request)?;
        remove_if_exists(&self.response())?;
        remove_if_exists(&self.status_file())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_plain_identifier() {
        let id = TaskIdentifier::parse("echo--12345").unwrap();
        assert_eq!(id.name(), "echo");
        assert!(id.options().is_empty());
        assert_eq!(id.id(), "12345");
    }

    #[test]
    fn test_parse_identifier_with_options() {
        let id = TaskIdentifier::parse("_odd-name-with-dashes--xml-ordered-utf8--1bf89c33").unwrap();
        assert_eq!(id.name(), "_odd-name-with-dashes");
        assert_eq!(id.options(), ["xml", "ordered", "utf8"]);
        assert_eq!(id.id(), "1bf89c33");
        assert_eq!(
            id.to_string(),
            "_odd-name-with-dashes--xml-ordered-utf8--1bf89c33"
        );
    }

    #[test]
    fn test_parse_dotted_name() {
        let id: TaskIdentifier = "a.b.c.uppercase--123xyz456".parse().unwrap();
        assert_eq!(id.name(), "a.b.c.uppercase");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "echo",
            "--123",
            "echo--",
            "echo--a--b--c",
            "echo---123",
            "echo--opt--12-3",
            "ec ho--123",
            "echo--opt--",
            "echo--a--1/2",
        ] {
            assert!(TaskIdentifier::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_new_rejects_dashed_option() {
        assert!(TaskIdentifier::new("echo", &["xml-ordered"], "1").is_err());
        assert!(TaskIdentifier::new("echo", &["xml", "ordered"], "1").is_ok());
    }

    #[test]
    fn test_transaction_paths() {
        let tx = Transaction::new("/tmp/admind/echo--abc.run");
        assert_eq!(tx.response(), PathBuf::from("/tmp/admind/echo--abc.out"));
        assert_eq!(tx.status_file(), PathBuf::from("/tmp/admind/echo--abc.err"));
        assert_eq!(tx.scratch(), PathBuf::from("/tmp/admind/echo--abc.tmp"));
        assert_eq!(tx.identifier_str(), "echo--abc");
        assert!(Transaction::is_request(tx.request()));
        assert!(!Transaction::is_request(&tx.response()));
    }

    #[test]
    fn test_observe_precedence() {
        let temp = TempDir::new().unwrap();
        let tx = Transaction::new(temp.path().join("echo--1.run"));
        assert_eq!(tx.observe(), AsyncStatus::Gone);

        fs::write(tx.request(), b"hello").unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Pending);

        fs::write(tx.response(), b"").unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Running);

        fs::write(tx.status_file(), b"").unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Ready);
        assert!(tx.is_finished());

        fs::write(tx.status_file(), b"boom").unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Error);

        // Status wins even when the request is already gone
        fs::remove_file(tx.request()).unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Error);

        tx.remove().unwrap();
        assert_eq!(tx.observe(), AsyncStatus::Gone);
        tx.remove().unwrap();
    }
}
