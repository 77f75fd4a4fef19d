use thiserror::Error;

/// Raw status code as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PmixStatus(pub i32);

impl PmixStatus {
    pub const SUCCESS: Self = PmixStatus(0);
    pub const ERROR: Self = PmixStatus(-1);
    pub const ERR_INVALID_CRED: Self = PmixStatus(-12);
    pub const ERR_INVALID_SCOPE: Self = PmixStatus(-13);
    pub const ERR_TIMEOUT: Self = PmixStatus(-24);
    pub const ERR_UNREACH: Self = PmixStatus(-25);
    pub const ERR_BAD_PARAM: Self = PmixStatus(-27);
    pub const ERR_NOT_FOUND: Self = PmixStatus(-46);
    pub const ERR_NOT_SUPPORTED: Self = PmixStatus(-47);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn check(self) -> Result<(), PmixError> {
        match self {
            Self::SUCCESS => Ok(()),
            Self::ERROR => Err(PmixError::Error),
            Self::ERR_INVALID_CRED => Err(PmixError::AuthFailed),
            Self::ERR_INVALID_SCOPE => Err(PmixError::InvalidScope),
            Self::ERR_TIMEOUT => Err(PmixError::Timeout),
            Self::ERR_UNREACH => Err(PmixError::Unreachable),
            Self::ERR_BAD_PARAM => Err(PmixError::BadParam),
            Self::ERR_NOT_FOUND => Err(PmixError::NotFound),
            Self::ERR_NOT_SUPPORTED => Err(PmixError::NotSupported),
            PmixStatus(code) => Err(PmixError::Unknown(code)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SUCCESS => "PMIX_SUCCESS",
            Self::ERROR => "PMIX_ERROR",
            Self::ERR_INVALID_CRED => "PMIX_ERR_INVALID_CRED",
            Self::ERR_INVALID_SCOPE => "PMIX_ERR_INVALID_SCOPE",
            Self::ERR_TIMEOUT => "PMIX_ERR_TIMEOUT",
            Self::ERR_UNREACH => "PMIX_ERR_UNREACH",
            Self::ERR_BAD_PARAM => "PMIX_ERR_BAD_PARAM",
            Self::ERR_NOT_FOUND => "PMIX_ERR_NOT_FOUND",
            Self::ERR_NOT_SUPPORTED => "PMIX_ERR_NOT_SUPPORTED",
            _ => "PMIX_ERR_UNKNOWN",
        }
    }
}

impl From<PmixError> for PmixStatus {
    fn from(e: PmixError) -> Self {
        match e {
            PmixError::Error => PmixStatus::ERROR,
            PmixError::AuthFailed => PmixStatus::ERR_INVALID_CRED,
            PmixError::InvalidScope => PmixStatus::ERR_INVALID_SCOPE,
            PmixError::NotFound => PmixStatus::ERR_NOT_FOUND,
            PmixError::Timeout => PmixStatus::ERR_TIMEOUT,
            PmixError::BadParam => PmixStatus::ERR_BAD_PARAM,
            PmixError::NotSupported => PmixStatus::ERR_NOT_SUPPORTED,
            PmixError::Unreachable => PmixStatus::ERR_UNREACH,
            PmixError::Unknown(code) => PmixStatus(code),
        }
    }
}

impl From<Result<(), PmixError>> for PmixStatus {
    fn from(r: Result<(), PmixError>) -> Self {
        r.map_or_else(PmixStatus::from, |()| PmixStatus::SUCCESS)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmixError {
    #[error("PMIx operation failed")]
    Error,
    #[error("authentication failed")]
    AuthFailed,
    #[error("invalid scope")]
    InvalidScope,
    #[error("not found")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
    #[error("bad parameter")]
    BadParam,
    #[error("not supported")]
    NotSupported,
    #[error("peer unreachable")]
    Unreachable,
    #[error("unknown PMIx status {0}")]
    Unknown(i32),
}
