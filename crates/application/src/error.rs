use domain::{DomainError, PermissionKey, RepositoryError};
use thiserror::Error;

use crate::presence::TransportError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("directory error: {0}")]
    Directory(#[from] RepositoryError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// 操作者缺少所需权限，或不是群组成员
    #[error("authorization failed: missing {0}")]
    Authorization(PermissionKey),
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;
