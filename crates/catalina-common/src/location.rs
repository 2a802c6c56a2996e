//! Object store addressing
//!
//! [`S3Location`] is an immutable `(bucket, key)` pair with a single canonical
//! rendering, `s3://bucket/key`. Three input forms are accepted:
//!
//! - `s3://bucket/folder/file.csv`
//! - `bucket/folder` (no scheme)
//! - `https://s3.eu-west-1.amazonaws.com/bucket/folder` (HTTP endpoint)
//!
//! Ports, credentials and `//` inside the path are rejected. Equality and
//! hashing follow the canonical form, so locations can key maps and sets.
//!
//! # Example
//!
//! ```
//! use catalina_common::S3Location;
//!
//! let root: S3Location = "s3://tv-type-test/".parse().unwrap();
//! let file = root.join(["TCL-data", "day=20220512", "TV_Final.csv"]).unwrap();
//!
//! assert_eq!(file.bucket(), "tv-type-test");
//! assert_eq!(file.file_name(), Some("TV_Final.csv"));
//! assert_eq!(file.prefix(), Some("TCL-data/day=20220512"));
//! assert_eq!(file.to_string(), "s3://tv-type-test/TCL-data/day=20220512/TV_Final.csv");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LocationError;

/// A validated location in the object store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct S3Location {
    bucket: String,
    key: String,
}

impl S3Location {
    /// Parse a location, rejecting `//` inside `bucket/key`.
    pub fn parse(value: &str) -> Result<Self, LocationError> {
        Self::parse_with(value, false)
    }

    /// Parse a location, optionally accepting `//` inside the key.
    ///
    /// Double slashes are valid in S3 keys but usually come from a bad join.
    pub fn parse_with(value: &str, allow_double_slash: bool) -> Result<Self, LocationError> {
        let (bucket, key) = match value.split_once("://") {
            Some((scheme, rest)) => {
                let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
                check_authority(authority, value)?;

                match scheme.to_ascii_lowercase().as_str() {
                    "s3" => (authority, path),
                    "http" | "https" => {
                        let host = authority.to_ascii_lowercase();
                        if !(host.starts_with("s3") && host.ends_with(".amazonaws.com")) {
                            return Err(LocationError::InvalidEndpoint(value.to_string()));
                        }
                        path.split_once('/').unwrap_or((path, ""))
                    },
                    _ => return Err(LocationError::UnsupportedScheme(value.to_string())),
                }
            },
            None => {
                if value.starts_with('/') {
                    return Err(LocationError::LeadingSlash(value.to_string()));
                }
                value.split_once('/').unwrap_or((value, ""))
            },
        };

        if bucket.is_empty() {
            return Err(LocationError::MissingBucket(value.to_string()));
        }

        if !allow_double_slash && format!("{bucket}/{key}").contains("//") {
            return Err(LocationError::DoubleSlash(value.to_string()));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Build a location from a bucket and an optional key.
    pub fn from_parts(bucket: &str, key: Option<&str>) -> Result<Self, LocationError> {
        Self::parse(&format!("s3://{}/{}", bucket, key.unwrap_or("")))
    }

    /// Append path segments, leaving exactly one `/` between the current key
    /// and the appended part.
    pub fn join<I, S>(&self, segments: I) -> Result<Self, LocationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tail = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        let tail = tail.trim_start_matches('/');

        let base = self.to_string();
        let joined = if base.ends_with('/') {
            format!("{base}{tail}")
        } else {
            format!("{base}/{tail}")
        };

        Self::parse(&joined)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The object key, `None` for a bare bucket.
    pub fn key(&self) -> Option<&str> {
        non_empty(&self.key)
    }

    /// The object key, empty for a bare bucket. Handy for SDK calls.
    pub fn path(&self) -> &str {
        &self.key
    }

    /// Last key segment, `None` when the key is empty or ends in `/`.
    pub fn file_name(&self) -> Option<&str> {
        self.key.rsplit('/').next().and_then(non_empty)
    }

    /// All key segments but the last, `None` when there are none.
    pub fn prefix(&self) -> Option<&str> {
        self.key
            .rsplit_once('/')
            .and_then(|(prefix, _)| non_empty(prefix))
    }

    /// The key as a listing prefix: empty or ending in exactly one `/`.
    pub fn dir_key(&self) -> String {
        match self.key.trim_end_matches('/') {
            "" => String::new(),
            key => format!("{key}/"),
        }
    }

    /// Canonical form ending in `/`, the shape catalogs expect for table
    /// and partition locations.
    pub fn dir_url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.dir_key())
    }

    /// Strip this location's directory prefix from a full key in the same
    /// bucket, as returned by a listing.
    pub fn relative_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.dir_key().as_str())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Ports and credentials have no meaning in an S3 location.
fn check_authority(authority: &str, value: &str) -> Result<(), LocationError> {
    let (userinfo, host) = match authority.rsplit_once('@') {
        Some((userinfo, host)) => (Some(userinfo), host),
        None => (None, authority),
    };

    if host.contains(':') {
        return Err(LocationError::Port(value.to_string()));
    }

    match userinfo {
        Some(info) if info.contains(':') => Err(LocationError::Password(value.to_string())),
        Some(_) => Err(LocationError::Username(value.to_string())),
        None => Ok(()),
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl fmt::Debug for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S3Location(\"{}\")", self)
    }
}

impl FromStr for S3Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for S3Location {
    type Error = LocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<S3Location> for String {
    fn from(location: S3Location) -> Self {
        location.to_string()
    }
}
