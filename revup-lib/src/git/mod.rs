//! Tools for interfacing with the Git repository.

mod index;
mod object;
mod oid;
mod reference;
mod repo;
mod run;

pub use index::{
    FileMode, IndexEntry, MergedTree, Stage, TransientIndex, UnmergedEntry, UpdateIndexCommand,
};
pub use object::{Commit, Error as ObjectError, Signature, Time};
pub use oid::{MaybeZeroOid, NonZeroOid, ParseOidError, SHORT_OID_LEN};
pub use reference::ReferenceName;
pub use repo::{
    Error as RepoError, PatchId, PushSpec, Repo, RepoOptions, Result as RepoResult,
};
pub use run::{GitRunInfo, GitRunOpts, GitRunResult, RunError};
