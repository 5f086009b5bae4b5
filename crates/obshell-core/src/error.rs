// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for obshell-core.
//!
//! Every failure carried through the engine, the coordinator and peer RPC is
//! an [`Error`]: a kind from the closed [`ErrorKind`] set plus positional
//! arguments interpolated into the kind's message template.

use std::fmt;

use obshell_security::SecurityError;
use serde::{Deserialize, Serialize};

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! error_kinds {
    ($($variant:ident => ($code:literal, $status:literal, $template:literal),)+) => {
        /// Closed set of error kinds.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum ErrorKind {
            $($variant,)+
        }

        impl ErrorKind {
            /// Every kind, in declaration order.
            pub const ALL: &'static [ErrorKind] = &[$(ErrorKind::$variant,)+];

            /// Stable code string.
            pub fn code(&self) -> &'static str {
                match self {
                    $(ErrorKind::$variant => $code,)+
                }
            }

            /// HTTP status the kind maps to.
            pub fn http_status(&self) -> u16 {
                match self {
                    $(ErrorKind::$variant => $status,)+
                }
            }

            /// English message template with `{}` placeholders.
            pub fn template(&self) -> &'static str {
                match self {
                    $(ErrorKind::$variant => $template,)+
                }
            }

            /// Look a kind up by its code.
            pub fn from_code(code: &str) -> Option<ErrorKind> {
                match code {
                    $($code => Some(ErrorKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

error_kinds! {
    CommonBadRequest => ("COMMON_BAD_REQUEST", 400, "Bad request: {}"),
    CommonIllegalArgument => ("COMMON_ILLEGAL_ARGUMENT", 400, "Illegal argument: {}"),
    CommonUnauthorized => ("COMMON_UNAUTHORIZED", 401, "Unauthorized"),
    CommonNotFound => ("COMMON_NOT_FOUND", 404, "{} not found"),
    CommonUnexpected => ("COMMON_UNEXPECTED", 500, "Unexpected error: {}"),

    AgentIdentifyNotSupport => ("AGENT_IDENTIFY_NOT_SUPPORT", 400, "Agent identity {} does not support this operation"),
    AgentNoMaster => ("AGENT_NO_MASTER", 500, "No master agent found in the cluster"),
    AgentUnavailable => ("AGENT_UNAVAILABLE", 503, "Agent is unavailable: {}"),
    AgentMaintainerNotActive => ("AGENT_MAINTAINER_NOT_ACTIVE", 503, "Maintainer is not active"),
    AgentRpcFailed => ("AGENT_RPC_FAILED", 500, "Request to agent {} failed: {}"),
    AgentRpcError => ("AGENT_RPC_ERROR", 500, "{} {} on agent {} returned error: {}"),
    AgentAlreadyExists => ("AGENT_ALREADY_EXISTS", 400, "Agent {} already exists"),
    AgentNotExist => ("AGENT_NOT_EXIST", 404, "Agent {} does not exist"),
    AgentPackageNotFound => ("AGENT_PACKAGE_NOT_FOUND", 404, "Package for version {} not found"),
    AgentUpgradeToLower => ("AGENT_UPGRADE_TO_LOWER", 400, "Cannot upgrade from {} to lower version {}"),

    SecurityPermissionDenied => ("SECURITY_PERMISSION_DENIED", 403, "Permission denied: {}"),
    SecurityHeaderDecrypt => ("SECURITY_HEADER_DECRYPT", 401, "Failed to decrypt header: {}"),
    SecurityUriMismatch => ("SECURITY_URI_MISMATCH", 401, "Header uri {} does not match request uri {}"),
    SecurityTokenInvalid => ("SECURITY_TOKEN_INVALID", 401, "Token is invalid"),
    SecuritySessionInvalid => ("SECURITY_SESSION_INVALID", 401, "Session is invalid"),
    SecuritySessionExpired => ("SECURITY_SESSION_EXPIRED", 401, "Session has expired"),
    SecurityFileSha256Mismatch => ("SECURITY_FILE_SHA256_MISMATCH", 400, "File sha256 mismatch: expected {}, got {}"),
    SecurityAuthAgent => ("SECURITY_AUTH_AGENT", 401, "Agent authentication failed: {}"),
    SecurityAuthDb => ("SECURITY_AUTH_DB", 401, "Database authentication failed: {}"),

    TaskParamNotSet => ("TASK_PARAM_NOT_SET", 400, "Task parameter {} is not set"),
    TaskRemoteFailed => ("TASK_REMOTE_FAILED", 500, "Remote task {} on agent {} failed"),
    TaskMaintenanceConflict => ("TASK_MAINTENANCE_CONFLICT", 400, "Maintenance scope {} is held by dag {}"),
    TaskTimeout => ("TASK_TIMEOUT", 500, "Task {} timed out after {} seconds"),
    TaskNotFound => ("TASK_NOT_FOUND", 404, "Task {} not found"),
    TaskTemplateEmpty => ("TASK_TEMPLATE_EMPTY", 400, "Template {} has no tasks"),
    TaskOperatorNotAllowed => ("TASK_OPERATOR_NOT_ALLOWED", 400, "Operator {} is not allowed on dag {} in state {}"),
    TaskTypeNotRegistered => ("TASK_TYPE_NOT_REGISTERED", 500, "Task type {} is not registered"),
    TaskQueueFull => ("TASK_QUEUE_FULL", 503, "Executor waiting queue is full"),
    TaskCancelled => ("TASK_CANCELLED", 500, "Task {} was cancelled"),

    ObClusterIdInvalid => ("OB_CLUSTER_ID_INVALID", 400, "Cluster id {} is invalid"),
    ObClusterNameEmpty => ("OB_CLUSTER_NAME_EMPTY", 400, "Cluster name is empty"),
    ObClusterAlreadyInitialized => ("OB_CLUSTER_ALREADY_INITIALIZED", 400, "Cluster is already initialized"),
    ObClusterNotInitialized => ("OB_CLUSTER_NOT_INITIALIZED", 400, "Cluster is not initialized"),
    ObClusterScopeInvalid => ("OB_CLUSTER_SCOPE_INVALID", 400, "Scope is invalid: {}"),
    ObClusterStopModeConflict => ("OB_CLUSTER_STOP_MODE_CONFLICT", 400, "Stop mode conflicts: {}"),
    ObClusterForceStopRequired => ("OB_CLUSTER_FORCE_STOP_REQUIRED", 400, "Force stop is required"),
    ObClusterTenantReplicaInvalid => ("OB_CLUSTER_TENANT_REPLICA_INVALID", 400, "Stopping zone {} breaks the majority of tenants {}"),
    ObClusterZoneDeleteSelf => ("OB_CLUSTER_ZONE_DELETE_SELF", 400, "Cannot delete the zone {} of the current agent"),
    ObClusterZoneNotEmpty => ("OB_CLUSTER_ZONE_NOT_EMPTY", 400, "Zone {} is not empty"),
    ObClusterZoneNotExist => ("OB_CLUSTER_ZONE_NOT_EXIST", 404, "Zone {} does not exist"),
    ObClusterServerDeleteSelf => ("OB_CLUSTER_SERVER_DELETE_SELF", 400, "Cannot delete the current server {}"),
    ObClusterServerStoppedInMultiZone => ("OB_CLUSTER_SERVER_STOPPED_IN_MULTI_ZONE", 400, "Servers are stopped in multiple zones: {}"),

    BackupUriEmpty => ("BACKUP_URI_EMPTY", 400, "Backup uri is empty"),
    BackupModeInvalid => ("BACKUP_MODE_INVALID", 400, "Backup mode {} is invalid"),
    BackupStatusInvalid => ("BACKUP_STATUS_INVALID", 400, "Backup status {} is invalid"),
    BackupArchivelogStatusInvalid => ("BACKUP_ARCHIVELOG_STATUS_INVALID", 400, "Archive log status {} is invalid"),
    BackupBindingInvalid => ("BACKUP_BINDING_INVALID", 400, "Binding {} is invalid"),
    BackupDeletePolicyInvalid => ("BACKUP_DELETE_POLICY_INVALID", 400, "Delete policy {} is invalid"),
    BackupPieceSwitchIntervalInvalid => ("BACKUP_PIECE_SWITCH_INTERVAL_INVALID", 400, "Piece switch interval {} is invalid"),
    BackupLagTargetInvalid => ("BACKUP_LAG_TARGET_INVALID", 400, "Lag target {} is invalid"),

    UpgradePythonMissing => ("UPGRADE_PYTHON_MISSING", 400, "Python is not installed"),
    UpgradeModuleMissing => ("UPGRADE_MODULE_MISSING", 400, "Python module {} is missing"),
    UpgradeDepYmlMissing => ("UPGRADE_DEP_YML_MISSING", 400, "Upgrade dependency file is missing in package {}"),
    UpgradeTenantNotSynced => ("UPGRADE_TENANT_NOT_SYNCED", 400, "Tenant {} is not synced"),
    UpgradeTabletMerging => ("UPGRADE_TABLET_MERGING", 400, "Tablets are merging"),
    UpgradeCompactionRunning => ("UPGRADE_COMPACTION_RUNNING", 400, "Compaction is running"),
    UpgradeVersionMismatch => ("UPGRADE_VERSION_MISMATCH", 400, "Version {} does not match {}"),
    UpgradeRunningBackup => ("UPGRADE_RUNNING_BACKUP", 400, "Backup is running"),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An error kind plus its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    args: Vec<String>,
}

impl Error {
    /// Error without arguments.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            args: Vec::new(),
        }
    }

    /// Error with positional arguments.
    pub fn with_args<I, S>(kind: ErrorKind, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            kind,
            args: args.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Shorthand for `COMMON_UNEXPECTED` with a message.
    pub fn unexpected(message: impl ToString) -> Self {
        Self::with_args(ErrorKind::CommonUnexpected, [message])
    }

    /// Shorthand for `COMMON_ILLEGAL_ARGUMENT` with a message.
    pub fn illegal_argument(message: impl ToString) -> Self {
        Self::with_args(ErrorKind::CommonIllegalArgument, [message])
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Positional arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Stable code string.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// HTTP status derived from the kind.
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Serialisable `{code, message, args}` form.
    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            code: self.code().to_string(),
            message: self.to_string(),
            args: self.args.clone(),
            language: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args = self.args.iter();
        let mut pieces = self.kind.template().split("{}").peekable();
        while let Some(piece) = pieces.next() {
            f.write_str(piece)?;
            if pieces.peek().is_some() {
                match args.next() {
                    Some(arg) => f.write_str(arg)?,
                    None => f.write_str("?")?,
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::unexpected(format!("database: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::unexpected(format!("migration: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::unexpected(format!("json: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let peer = err
            .url()
            .and_then(|u| u.host_str().map(|h| format!("{}:{}", h, u.port().unwrap_or(80))))
            .unwrap_or_else(|| "unknown".to_string());
        Error::with_args(ErrorKind::AgentRpcFailed, [peer, err.to_string()])
    }
}

impl From<SecurityError> for Error {
    fn from(err: SecurityError) -> Self {
        let kind = match &err {
            SecurityError::HeaderDecrypt(_) => ErrorKind::SecurityHeaderDecrypt,
            SecurityError::UriMismatch { header, request } => {
                return Error::with_args(ErrorKind::SecurityUriMismatch, [header, request]);
            }
            SecurityError::Expired { .. } => ErrorKind::SecurityAuthDb,
            SecurityError::SessionInvalid(_) => return Error::new(ErrorKind::SecuritySessionInvalid),
            SecurityError::SessionExpired(_) => return Error::new(ErrorKind::SecuritySessionExpired),
            SecurityError::PermissionDenied { .. } => ErrorKind::SecurityPermissionDenied,
            _ => ErrorKind::CommonUnexpected,
        };
        Error::with_args(kind, [err.to_string()])
    }
}

/// Wire form of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Kind code.
    pub code: String,
    /// Rendered English message.
    pub message: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Language tag the caller asked for. Messages are only rendered in
    /// English; clients localize from `code` and `args`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ApiError {
    /// Rebuild the typed error, falling back to `COMMON_UNEXPECTED` for
    /// codes this agent does not know.
    pub fn to_error(&self) -> Error {
        match ErrorKind::from_code(&self.code) {
            Some(kind) => Error::with_args(kind, self.args.iter()),
            None => Error::unexpected(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique_and_round_trip() {
        let mut seen = HashSet::new();
        for kind in ErrorKind::ALL {
            assert!(seen.insert(kind.code()), "duplicate code {}", kind.code());
            assert_eq!(ErrorKind::from_code(kind.code()), Some(*kind));
        }
        assert_eq!(ErrorKind::from_code("NOPE"), None);
    }

    #[test]
    fn test_template_interpolation() {
        let err = Error::with_args(
            ErrorKind::ObClusterTenantReplicaInvalid,
            ["z2", "[t1]"],
        );
        assert_eq!(
            err.to_string(),
            "Stopping zone z2 breaks the majority of tenants [t1]"
        );

        // missing arguments render as '?'
        let err = Error::new(ErrorKind::TaskNotFound);
        assert_eq!(err.to_string(), "Task ? not found");
    }

    #[test]
    fn test_http_status_by_family() {
        assert_eq!(Error::illegal_argument("x").http_status(), 400);
        assert_eq!(Error::new(ErrorKind::SecurityAuthDb).http_status(), 401);
        assert_eq!(Error::new(ErrorKind::TaskNotFound).http_status(), 404);
        assert_eq!(Error::unexpected("boom").http_status(), 500);
    }

    #[test]
    fn test_api_error_round_trip() {
        let err = Error::with_args(ErrorKind::TaskMaintenanceConflict, ["GLOBAL", "011"]);
        let wire = serde_json::to_string(&err.to_api_error()).unwrap();
        let back: ApiError = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.to_error(), err);
    }

    #[test]
    fn test_security_error_mapping() {
        let err: Error = SecurityError::Expired { expired_at: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::SecurityAuthDb);

        let err: Error = SecurityError::PermissionDenied { uid: 7 }.into();
        assert_eq!(err.kind(), ErrorKind::SecurityPermissionDenied);
        assert_eq!(err.http_status(), 403);
    }
}
