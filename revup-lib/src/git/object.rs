use std::str::FromStr;

use bstr::{BString, ByteSlice};
use thiserror::Error;

use super::oid::{NonZeroOid, ParseOidError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not decode commit object for {oid}: field {field} was not UTF-8")]
    DecodeUtf8 { oid: NonZeroOid, field: &'static str },

    #[error("could not parse OID in commit object for {oid}: {source}")]
    ParseOid {
        oid: NonZeroOid,
        #[source]
        source: ParseOidError,
    },

    #[error("malformed commit object for {oid}: {reason}")]
    Malformed { oid: NonZeroOid, reason: String },

    #[error("malformed signature: {0:?}")]
    MalformedSignature(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A timestamp as recorded in a commit object: seconds since the epoch plus
/// a UTC offset in minutes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Time {
    /// Seconds since the Unix epoch.
    pub seconds: i64,

    /// Offset from UTC, in minutes.
    pub offset_minutes: i32,
}

impl Time {
    /// Render in the `<epoch> <±HHMM>` form used by git environment
    /// variables and commit headers.
    pub fn to_git_format(&self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let offset = self.offset_minutes.abs();
        format!(
            "{} {}{:02}{:02}",
            self.seconds,
            sign,
            offset / 60,
            offset % 60
        )
    }
}

/// An author or committer identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// The person's name.
    pub name: String,

    /// The person's email address.
    pub email: String,

    /// The recorded timestamp.
    pub time: Time,
}

impl Signature {
    /// Parse the `Name <email> epoch offset` form used in commit headers.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || Error::MalformedSignature(raw.to_owned());
        let (name, rest) = raw.split_once('<').ok_or_else(malformed)?;
        let (email, timestamp) = rest.split_once('>').ok_or_else(malformed)?;
        let mut fields = timestamp.split_whitespace();
        let seconds: i64 = fields
            .next()
            .and_then(|seconds| seconds.parse().ok())
            .ok_or_else(malformed)?;
        let offset = fields.next().ok_or_else(malformed)?;
        let offset_minutes = parse_offset(offset).ok_or_else(malformed)?;
        Ok(Signature {
            name: name.trim().to_owned(),
            email: email.to_owned(),
            time: Time {
                seconds,
                offset_minutes,
            },
        })
    }

    /// The local part of the email address (everything before `@`).
    pub fn email_local_part(&self) -> &str {
        match self.email.split_once('@') {
            Some((local, _)) => local,
            None => &self.email,
        }
    }
}

fn parse_offset(offset: &str) -> Option<i32> {
    let (sign, digits) = if let Some(digits) = offset.strip_prefix('+') {
        (1, digits)
    } else if let Some(digits) = offset.strip_prefix('-') {
        (-1, digits)
    } else {
        return None;
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

/// Represents a commit object in the Git object database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    oid: NonZeroOid,
    tree_oid: NonZeroOid,
    parent_oids: Vec<NonZeroOid>,
    author: Signature,
    committer: Signature,
    message: String,
}

impl Commit {
    /// Parse the raw contents of a commit object, as printed by
    /// `git cat-file commit`.
    pub fn parse(oid: NonZeroOid, raw: &[u8]) -> Result<Self> {
        let raw = BString::from(raw);
        let (headers, message) = match raw.find(b"\n\n") {
            Some(index) => (&raw[..index], &raw[index + 2..]),
            None => (&raw[..], &b""[..]),
        };

        let mut tree_oid = None;
        let mut parent_oids = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in headers.lines() {
            // Continuation lines (e.g. inside `gpgsig`) start with a space.
            if line.starts_with(b" ") {
                continue;
            }
            let (key, value) = match line.split_once_str(b" ") {
                Some((key, value)) => (key, value),
                None => continue,
            };
            let value_str = || -> Result<&str> {
                value.to_str().map_err(|_| Error::DecodeUtf8 {
                    oid,
                    field: "header",
                })
            };
            match key {
                b"tree" => {
                    tree_oid = Some(
                        NonZeroOid::from_str(value_str()?)
                            .map_err(|source| Error::ParseOid { oid, source })?,
                    );
                }
                b"parent" => {
                    parent_oids.push(
                        NonZeroOid::from_str(value_str()?)
                            .map_err(|source| Error::ParseOid { oid, source })?,
                    );
                }
                b"author" => {
                    author = Some(Signature::parse(value_str()?)?);
                }
                b"committer" => {
                    committer = Some(Signature::parse(value_str()?)?);
                }
                _ => {
                    // Unknown header (gpgsig, mergetag, etc.); not needed.
                }
            }
        }

        let message = message.to_str_lossy().into_owned();
        Ok(Commit {
            oid,
            tree_oid: tree_oid.ok_or_else(|| Error::Malformed {
                oid,
                reason: "missing tree header".to_owned(),
            })?,
            parent_oids,
            author: author.ok_or_else(|| Error::Malformed {
                oid,
                reason: "missing author header".to_owned(),
            })?,
            committer: committer.ok_or_else(|| Error::Malformed {
                oid,
                reason: "missing committer header".to_owned(),
            })?,
            message,
        })
    }

    /// Get the object ID of the commit.
    pub fn get_oid(&self) -> NonZeroOid {
        self.oid
    }

    /// Get the OID of the tree object associated with this commit.
    pub fn get_tree_oid(&self) -> NonZeroOid {
        self.tree_oid
    }

    /// Get the object IDs of the parents of this commit.
    pub fn get_parent_oids(&self) -> &[NonZeroOid] {
        &self.parent_oids
    }

    /// Get the parent OID of this commit if there is exactly one parent, or
    /// `None` otherwise.
    pub fn get_only_parent_oid(&self) -> Option<NonZeroOid> {
        match self.parent_oids.as_slice() {
            [only_parent_oid] => Some(*only_parent_oid),
            [] | [_, _, ..] => None,
        }
    }

    /// Get the author of this commit.
    pub fn get_author(&self) -> &Signature {
        &self.author
    }

    /// Get the committer of this commit.
    pub fn get_committer(&self) -> &Signature {
        &self.committer
    }

    /// Get the full commit message.
    pub fn get_message(&self) -> &str {
        &self.message
    }

    /// Get the summary (first line) of the commit message.
    pub fn get_summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// Get the message body: everything after the summary, with the
    /// separating blank lines removed.
    pub fn get_body(&self) -> &str {
        match self.message.split_once('\n') {
            None => "",
            Some((_summary, rest)) => rest.trim_start_matches('\n'),
        }
    }

    /// A one-line description of this commit for error messages.
    pub fn friendly_describe(&self) -> String {
        format!("{} {}", self.oid.to_short_hex(), self.get_summary())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn oid(hex_char: char) -> NonZeroOid {
        NonZeroOid::from_str(&hex_char.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn test_parse_signature() {
        let signature = Signature::parse("Jane Doe <jane.doe@example.com> 1700000000 -0500")
            .expect("parsing signature");
        assert_eq!(signature.name, "Jane Doe");
        assert_eq!(signature.email, "jane.doe@example.com");
        assert_eq!(signature.time.seconds, 1700000000);
        assert_eq!(signature.time.offset_minutes, -300);
        assert_eq!(signature.email_local_part(), "jane.doe");
        assert_eq!(signature.time.to_git_format(), "1700000000 -0500");
    }

    #[test]
    fn test_parse_commit_object() {
        let raw = format!(
            "tree {tree}\nparent {parent}\nauthor A U Thor <author@example.com> 1700000000 +0000\ncommitter C O Mitter <committer@example.com> 1700000001 +0130\n\nSubject line\n\nBody first line.\nTopic: foo\n",
            tree = "a".repeat(40),
            parent = "b".repeat(40),
        );
        let commit = Commit::parse(oid('c'), raw.as_bytes()).expect("parsing commit");
        assert_eq!(commit.get_tree_oid(), oid('a'));
        assert_eq!(commit.get_parent_oids(), &[oid('b')]);
        assert_eq!(commit.get_only_parent_oid(), Some(oid('b')));
        assert_eq!(commit.get_summary(), "Subject line");
        assert_eq!(commit.get_body(), "Body first line.\nTopic: foo\n");
        assert_eq!(commit.get_author().name, "A U Thor");
        assert_eq!(commit.get_committer().time.offset_minutes, 90);
    }

    #[test]
    fn test_parse_commit_with_gpgsig_continuation() {
        let raw = format!(
            "tree {tree}\nauthor A <a@example.com> 1 +0000\ncommitter A <a@example.com> 1 +0000\ngpgsig -----BEGIN PGP SIGNATURE-----\n abcdef\n -----END PGP SIGNATURE-----\n\nRoot commit\n",
            tree = "a".repeat(40),
        );
        let commit = Commit::parse(oid('d'), raw.as_bytes()).expect("parsing commit");
        assert_eq!(commit.get_parent_oids(), &[]);
        assert_eq!(commit.get_only_parent_oid(), None);
        assert_eq!(commit.get_summary(), "Root commit");
        assert_eq!(commit.get_body(), "");
    }
}
