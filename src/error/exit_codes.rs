use crate::error::QuotaLockError;

pub fn get_exit_code(error: &QuotaLockError) -> i32 {
    match error {
        QuotaLockError::InvalidPersistenceType(_)
        | QuotaLockError::InvalidClientType(_)
        | QuotaLockError::InvalidOriginScope(_)
        | QuotaLockError::InvalidCategory(_) => 2,

        QuotaLockError::ConfigError(_) => 3,

        QuotaLockError::ScenarioError(_) => 4,

        QuotaLockError::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied => 13,

        QuotaLockError::Io(err) if err.kind() == std::io::ErrorKind::NotFound => 66, // EX_NOINPUT

        _ => 1,
    }
}
