//! Error taxonomy shared by the local object store and the capability IPC core.
//!
//! Follows the same shape the rest of this stack uses: one top-level
//! [`Error`] wrapping a family enum per subsystem (storage, file,
//! IPC, cache), plus a `Message` catch-all for ad-hoc context. Lower
//! layers translate `std::io::Error` and `serde_json::Error` into the
//! closest taxonomy member at the boundary where the failure occurs,
//! the way the version-file parser turns any `open_existing` failure
//! into `Storage::ObjFileParsing`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use err_derive::Error as DeriveError;

/// Top-level error type returned by every fallible operation in this workspace.
#[derive(Debug, DeriveError)]
pub enum Error {
	#[error(display = "{}", _0)]
	Message(String),

	#[error(display = "{}", _0)]
	Storage(#[error(source)] StorageError),

	#[error(display = "{}", _0)]
	File(#[error(source)] FileError),

	#[error(display = "{}", _0)]
	Ipc(#[error(source)] IpcError),

	#[error(display = "{}", _0)]
	Cache(#[error(source)] CacheError),

	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] io::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),
}

impl Error {
	pub fn message<S: Into<String>>(msg: S) -> Self {
		Error::Message(msg.into())
	}

	/// True if this error carries one of the "not found" variants from any subsystem.
	pub fn is_not_found(&self) -> bool {
		matches!(
			self,
			Error::Storage(StorageError::NotFound)
				| Error::File(FileError::NotFound(_))
				| Error::Cache(CacheError::NotFound)
				| Error::Ipc(IpcError::ObjectNotFound)
		)
	}
}

/// Extension trait used to attach a message to an `Option::None`, mirroring
/// the `ok_or_message` helper the rest of this codebase leans on instead of
/// `.unwrap()`/`.expect()` outside of tests.
pub trait OkOrMessage<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(msg.into()))
	}
}

impl<T, E: fmt::Display> OkOrMessage<T> for Result<T, E> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", msg.into(), e)))
	}
}

/// *Storage* error kind (spec §7): failures intrinsic to the local object store.
#[derive(Debug, DeriveError)]
pub enum StorageError {
	#[error(display = "object not found")]
	NotFound,
	#[error(display = "object already exists")]
	AlreadyExists,
	#[error(display = "concurrent transaction on this object")]
	ConcurrentTransaction,
	#[error(display = "version file at {:?} failed to parse: {}", path, msg)]
	ObjFileParsing { path: PathBuf, msg: String },
}

/// *File* error kind (spec §7): failures from raw filesystem operations,
/// with paths masked to avoid leaking absolute device paths past the
/// boundary where the original root prefix is known.
#[derive(Debug, DeriveError)]
pub enum FileError {
	#[error(display = "file not found: {}", _0)]
	NotFound(MaskedPath),
	#[error(display = "file already exists: {}", _0)]
	AlreadyExists(MaskedPath),
	#[error(display = "not a directory: {}", _0)]
	NotDirectory(MaskedPath),
	#[error(display = "not a file: {}", _0)]
	NotFile(MaskedPath),
	#[error(display = "is a directory: {}", _0)]
	IsDirectory(MaskedPath),
	#[error(display = "unexpected end of file")]
	EndOfFile,
	#[error(display = "parsing error: {}", _0)]
	ParsingError(String),
	#[error(display = "directory not empty: {}", _0)]
	NotEmpty(MaskedPath),
}

/// A path with everything before `root` elided, so error messages surfaced
/// to sandboxed application code never reveal absolute on-device paths.
#[derive(Debug, Clone)]
pub struct MaskedPath(pub String);

impl MaskedPath {
	pub fn new(path: &Path, root: &Path) -> Self {
		match path.strip_prefix(root) {
			Ok(rel) => MaskedPath(format!(".../{}", rel.display())),
			Err(_) => MaskedPath(format!(".../{}", path.display())),
		}
	}
}

impl fmt::Display for MaskedPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// *IPC* error kind (spec §7).
#[derive(Debug, DeriveError)]
pub enum IpcError {
	#[error(display = "duplicate fn_call_num")]
	DuplicateFnCallNum,
	#[error(display = "object not found")]
	ObjectNotFound,
	#[error(display = "call function not found at path")]
	CallFnNotFound,
	#[error(display = "invalid call number")]
	InvalidCallNum,
	#[error(display = "invalid path")]
	InvalidPath,
	#[error(display = "invalid message type")]
	InvalidType,
	#[error(display = "invalid reference")]
	InvalidReference,
	#[error(display = "missing body bytes")]
	MissingBodyBytes,
	#[error(display = "bad reply")]
	BadReply,
	#[error(display = "stopped from other side")]
	StopFromOtherSide,
	#[error(display = "connector stopped")]
	ConnectorStop,
	#[error(display = "ipc not connected")]
	IpcNotConnected,
	#[error(display = "invalid number in body")]
	InvalidNumInBody,
}

/// *Cache* error kind (spec §7), used by the object files manager.
#[derive(Debug, DeriveError)]
pub enum CacheError {
	#[error(display = "not found in cache")]
	NotFound,
	#[error(display = "already exists in cache")]
	AlreadyExist,
	#[error(display = "concurrent transaction on cache entry")]
	ConcurrentTransaction,
}

pub fn unexpected_message(what: &str) -> Error {
	Error::Message(format!("unexpected message: {}", what))
}
