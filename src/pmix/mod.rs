use std::fmt;

pub mod client;
pub mod env;
pub mod info;
pub mod module;
pub mod server;
pub mod status;
pub mod value;

pub use status::{PmixError, PmixStatus};
pub use value::{DataType, Scope, Value};

/// Maximum namespace length in bytes.
pub const MAX_NSLEN: usize = 255;
/// Maximum key length in bytes.
pub const MAX_KEYLEN: usize = 511;
/// Selects every rank of a namespace.
pub const RANK_WILDCARD: u32 = u32::MAX;

pub fn get_version_str() -> &'static str {
    concat!("pmix-exchange ", env!("CARGO_PKG_VERSION"))
}

pub fn check_nspace(nspace: &str) -> Result<(), PmixError> {
    if nspace.is_empty() || nspace.len() > MAX_NSLEN {
        return Err(PmixError::BadParam);
    }
    Ok(())
}

pub fn check_key(key: &str) -> Result<(), PmixError> {
    if key.is_empty() || key.len() > MAX_KEYLEN {
        return Err(PmixError::BadParam);
    }
    Ok(())
}

/// A process, identified by namespace and rank.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Proc {
    pub nspace: String,
    pub rank: u32,
}

impl Proc {
    pub fn new(nspace: impl Into<String>, rank: u32) -> Self {
        Self {
            nspace: nspace.into(),
            rank,
        }
    }
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank == RANK_WILDCARD {
            write!(f, "{}:*", self.nspace)
        } else {
            write!(f, "{}:{}", self.nspace, self.rank)
        }
    }
}

/// A set of ranks within one namespace. No ranks means the whole namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Range {
    pub nspace: String,
    pub ranks: Vec<u32>,
}

impl Range {
    pub fn new(nspace: impl Into<String>, ranks: impl IntoIterator<Item = u32>) -> Self {
        Self {
            nspace: nspace.into(),
            ranks: ranks.into_iter().collect(),
        }
    }

    pub fn whole(nspace: impl Into<String>) -> Self {
        Self::new(nspace, [])
    }
}
