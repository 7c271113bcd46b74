//! Centralized error types for the Embercast core library.
//!
//! Two layers live here:
//!
//! - [`CastError`], the `thiserror` enum used by library APIs.
//! - The stable wire error table: every client-visible failure is a row of
//!   `(id, HTTP status, UUID, message)`. Rows are referenced by symbolic
//!   [`ErrorId`] internally and by UUID externally; the UUIDs never change
//!   across releases so operators can match on them.

use thiserror::Error;

/// Symbolic identifiers for the wire error table.
///
/// Ordering and membership are stable; new rows are only appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorId {
    AdminDestNotRunning,
    AdminMetadataBadCall,
    AdminMetadataNoSuchAction,
    AdminMissingParameter,
    AdminMissingArgument,
    AdminMountNotAcceptUrlUpdates,
    AdminNoSuchDestination,
    AdminRoleAddUnsupported,
    AdminRoleDeleteUnsupported,
    AdminRoleNotFound,
    AdminSourceDoesNotExist,
    AdminSourceIsNotAvailable,
    AdminSuppliedMountpointsAreIdentical,
    AdminUnrecognisedCommand,
    AuthBusy,
    ConContentTypeNosys,
    ConInternalFormatAllocError,
    ConMissingPassParameter,
    ConMountInUse,
    ConMountpointNotStartingWithSlash,
    ConNoContentTypeGiven,
    ConPerCredClientLimit,
    ConSourceClientLimit,
    ConUnimplemented,
    ConUnknownRequest,
    ConUpgradeError,
    ConMountNoForDirectAccess,
    FservFileNotFound,
    FservFileNotReadable,
    FservRequestRangeNotSatisfiable,
    GenBufferRealloc,
    GenClientLimit,
    GenClientNeedsToAuthenticate,
    GenHeaderGenFailed,
    GenMemoryExhausted,
    SourceMountUnavailable,
    SourceStreamPreparationError,
    SourceMaxListeners,
    XsltParse,
    XsltProblem,
    RecursiveError,
}

/// One row of the wire error table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEntry {
    pub id: ErrorId,
    pub http_status: u16,
    pub uuid: &'static str,
    pub message: &'static str,
}

// Statuses marked provisional in the upstream protocol audit stay at 400
// until the documented API settles them.
static ERROR_TABLE: &[ErrorEntry] = &[
    ErrorEntry {
        id: ErrorId::AdminDestNotRunning,
        http_status: 400,
        uuid: "52735a81-16fe-4d7e-9984-5aed8a941055",
        message: "Destination not running",
    },
    ErrorEntry {
        id: ErrorId::AdminMetadataBadCall,
        http_status: 400,
        uuid: "85d33e67-5c4e-4511-b4fa-3ca69ccd03de",
        message: "illegal metadata call",
    },
    ErrorEntry {
        id: ErrorId::AdminMetadataNoSuchAction,
        http_status: 501,
        uuid: "14f4d814-98d9-468c-8a0b-ba5e74c9d771",
        message: "No such action",
    },
    ErrorEntry {
        id: ErrorId::AdminMissingParameter,
        http_status: 400,
        uuid: "cb11dc71-6149-454c-8d4e-47a3af26b03a",
        message: "Missing parameter",
    },
    ErrorEntry {
        id: ErrorId::AdminMissingArgument,
        http_status: 400,
        uuid: "8be9ef0a-2b32-450c-aec9-a414ca0c074c",
        message: "missing parameter",
    },
    ErrorEntry {
        id: ErrorId::AdminMountNotAcceptUrlUpdates,
        http_status: 501,
        uuid: "3bed51bb-a10f-4af3-9965-4e67181de7d6",
        message: "mountpoint will not accept URL updates",
    },
    ErrorEntry {
        id: ErrorId::AdminNoSuchDestination,
        http_status: 404,
        uuid: "c5f1ee06-46a0-4697-9f01-6e9fc333d555",
        message: "No such destination",
    },
    ErrorEntry {
        id: ErrorId::AdminRoleAddUnsupported,
        http_status: 501,
        uuid: "7e1a8426-2ae1-4a6b-bfd9-59d8f8153021",
        message: "Adding users to role not supported by role",
    },
    ErrorEntry {
        id: ErrorId::AdminRoleDeleteUnsupported,
        http_status: 501,
        uuid: "367fbad1-389e-4292-bba8-c97984e616cc",
        message: "Deleting users from role not supported by role",
    },
    ErrorEntry {
        id: ErrorId::AdminRoleNotFound,
        http_status: 404,
        uuid: "59fe9c81-8c34-49ff-800f-7ec42ea498be",
        message: "Role not found",
    },
    ErrorEntry {
        id: ErrorId::AdminSourceDoesNotExist,
        http_status: 404,
        uuid: "2f51a026-02e4-4fe4-bf9d-cc16557b3b65",
        message: "Source does not exist",
    },
    ErrorEntry {
        id: ErrorId::AdminSourceIsNotAvailable,
        http_status: 400,
        uuid: "00b9d977-f41d-455f-820f-6d457dffb246",
        message: "Source is not available",
    },
    ErrorEntry {
        id: ErrorId::AdminSuppliedMountpointsAreIdentical,
        http_status: 400,
        uuid: "4be9a010-7a3f-44e4-b74d-3c6d9c4f7236",
        message: "supplied mountpoints are identical",
    },
    ErrorEntry {
        id: ErrorId::AdminUnrecognisedCommand,
        http_status: 400,
        uuid: "811bddac-5be5-4580-9cde-7b849e66dfe5",
        message: "unrecognised command",
    },
    ErrorEntry {
        id: ErrorId::AuthBusy,
        http_status: 503,
        uuid: "26708754-8f98-4191-81d1-7fb7246200d6",
        message: "busy, please try again later",
    },
    ErrorEntry {
        id: ErrorId::ConContentTypeNosys,
        http_status: 415,
        uuid: "f684ad3c-513b-4d87-9a66-424788bc6adb",
        message: "Content-type not supported",
    },
    ErrorEntry {
        id: ErrorId::ConInternalFormatAllocError,
        http_status: 500,
        uuid: "47a4b11b-5d2a-46e2-8948-942e7b0af3e6",
        message: "internal format allocation problem",
    },
    ErrorEntry {
        id: ErrorId::ConMissingPassParameter,
        http_status: 400,
        uuid: "b59c3a05-e2b1-4a14-8798-bbe1ae46603b",
        message: "missing pass parameter",
    },
    ErrorEntry {
        id: ErrorId::ConMountInUse,
        http_status: 409,
        uuid: "c5724467-5f85-48c7-b45a-915c3150c292",
        message: "Mountpoint in use",
    },
    ErrorEntry {
        id: ErrorId::ConMountpointNotStartingWithSlash,
        http_status: 400,
        uuid: "1ae45ead-40fc-4de2-b56f-e54d3247f2ee",
        message: "source mountpoint not starting with /",
    },
    ErrorEntry {
        id: ErrorId::ConNoContentTypeGiven,
        http_status: 400,
        uuid: "2cd86778-ac30-49e7-a108-26d627a7923b",
        message: "No Content-type given",
    },
    ErrorEntry {
        id: ErrorId::ConPerCredClientLimit,
        http_status: 429,
        uuid: "9c72c1ec-f638-4d33-a077-6acbbff25317",
        message: "Reached limit of concurrent connections on those credentials",
    },
    ErrorEntry {
        id: ErrorId::ConSourceClientLimit,
        http_status: 503,
        uuid: "c770182d-c854-422a-a8e5-7142689234a3",
        message: "too many sources connected",
    },
    ErrorEntry {
        id: ErrorId::ConUnimplemented,
        http_status: 501,
        uuid: "58ce6cb4-72b4-49da-8ad2-feaf775bc61e",
        message: "Unimplemented",
    },
    ErrorEntry {
        id: ErrorId::ConUnknownRequest,
        http_status: 405,
        uuid: "78f590cc-8812-40d5-a4ef-17344ab75b35",
        message: "unknown request",
    },
    ErrorEntry {
        id: ErrorId::ConUpgradeError,
        http_status: 400,
        uuid: "ec16f654-f262-415f-ab91-95703ae33704",
        message: "Can not upgrade protocol",
    },
    ErrorEntry {
        id: ErrorId::ConMountNoForDirectAccess,
        http_status: 400,
        uuid: "652548c6-2a7d-4c73-a1c5-e53759032bd1",
        message: "Mountpoint is not available for direct access",
    },
    ErrorEntry {
        id: ErrorId::FservFileNotFound,
        http_status: 404,
        uuid: "18c32b43-0d8e-469d-b434-10133cdd06ad",
        message: "The file you requested could not be found",
    },
    ErrorEntry {
        id: ErrorId::FservFileNotReadable,
        http_status: 404,
        uuid: "c883d55d-fb41-4f4c-8800-563f5542f51d",
        message: "File not readable",
    },
    ErrorEntry {
        id: ErrorId::FservRequestRangeNotSatisfiable,
        http_status: 416,
        uuid: "5874cc51-770b-42b5-82d2-737b2b406b30",
        message: "Request Range Not Satisfiable",
    },
    ErrorEntry {
        id: ErrorId::GenBufferRealloc,
        http_status: 500,
        uuid: "cda8203e-f237-4090-8d43-544efdd6295c",
        message: "Buffer reallocation failed.",
    },
    ErrorEntry {
        id: ErrorId::GenClientLimit,
        http_status: 503,
        uuid: "87fd3e61-6702-4473-b506-f616d27a142f",
        message: "Connection limit reached",
    },
    ErrorEntry {
        id: ErrorId::GenClientNeedsToAuthenticate,
        http_status: 401,
        uuid: "25387198-0643-4577-9139-7c4f24f59d4a",
        message: "You need to authenticate",
    },
    ErrorEntry {
        id: ErrorId::GenHeaderGenFailed,
        http_status: 500,
        uuid: "a8b3c3fe-cb87-45fe-9a9d-ee4c2075d43a",
        message: "Header generation failed.",
    },
    ErrorEntry {
        id: ErrorId::GenMemoryExhausted,
        http_status: 503,
        uuid: "18411e73-713e-4910-b7e4-52a2e324b4e0",
        message: "memory exhausted",
    },
    ErrorEntry {
        id: ErrorId::SourceMountUnavailable,
        http_status: 404,
        uuid: "88d06875-fcf2-4417-84af-05866c97745c",
        message: "Mount unavailable",
    },
    ErrorEntry {
        id: ErrorId::SourceStreamPreparationError,
        http_status: 500,
        uuid: "9e50d94d-f03d-4515-8216-577bf8e9f70d",
        message: "Stream preparation error",
    },
    ErrorEntry {
        id: ErrorId::SourceMaxListeners,
        http_status: 503,
        uuid: "df147168-baaa-4959-82a4-746a1232927d",
        message: "Maximum listeners reached for this source",
    },
    ErrorEntry {
        id: ErrorId::XsltParse,
        http_status: 404,
        uuid: "f86b5b28-c1f8-49f6-a4cd-a18e2a6a44fd",
        message: "Could not parse XSLT file",
    },
    ErrorEntry {
        id: ErrorId::XsltProblem,
        http_status: 500,
        uuid: "d3c6e4b3-7d6e-4191-a81b-970273067ae3",
        message: "XSLT problem",
    },
    ErrorEntry {
        id: ErrorId::RecursiveError,
        http_status: 500,
        uuid: "13489d5c-eae6-4bf3-889e-ec1fa9a9b9ac",
        message: "Recursive error",
    },
];

/// Looks up a table row by symbolic id. Linear scan; the table is small.
#[must_use]
pub fn error_by_id(id: ErrorId) -> Option<&'static ErrorEntry> {
    ERROR_TABLE.iter().find(|e| e.id == id)
}

/// Looks up a table row by UUID, case-insensitively.
#[must_use]
pub fn error_by_uuid(uuid: &str) -> Option<&'static ErrorEntry> {
    ERROR_TABLE.iter().find(|e| e.uuid.eq_ignore_ascii_case(uuid))
}

impl ErrorId {
    /// The table row behind this id. Every variant has one.
    #[must_use]
    pub fn entry(self) -> &'static ErrorEntry {
        error_by_id(self).expect("every ErrorId has a table row")
    }

    /// HTTP status for the row.
    #[must_use]
    pub fn http_status(self) -> u16 {
        self.entry().http_status
    }

    /// Stable UUID for the row.
    #[must_use]
    pub fn uuid(self) -> &'static str {
        self.entry().uuid
    }

    /// Human-readable message for the row.
    #[must_use]
    pub fn message(self) -> &'static str {
        self.entry().message
    }
}

/// Library-level error type for the Embercast core.
#[derive(Debug, Error)]
pub enum CastError {
    /// Transport failure; flips the connection's error flag, never business state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unparsable request from a client.
    #[error("malformed request: {0}")]
    Request(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A client-visible failure carrying its wire error table row.
    #[error("{}", .0.message())]
    Wire(ErrorId),
}

/// Convenient Result alias for core operations.
pub type CastResult<T> = Result<T, CastError>;

impl From<ErrorId> for CastError {
    fn from(id: ErrorId) -> Self {
        Self::Wire(id)
    }
}
