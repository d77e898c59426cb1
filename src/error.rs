use thiserror::Error;

/// Errors from the S3-compatible object store tier.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error reported by the S3 client or a compatible endpoint
    #[error("object store error: {0}")]
    S3(String),

    /// Object not found
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network or connection failure while streaming a body
    #[error("connection error: {0}")]
    Connection(String),

    /// A JSON metadata document could not be encoded or decoded
    #[error("metadata document error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Errors from the metadata store (SQLite via sqlx).
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Row lookup by id returned nothing
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Unique-name constraint violated on dataset create
    #[error("dataset name '{0}' already exists")]
    DuplicateName(String),
}

/// Errors from chunked upload sessions.
#[derive(Debug, Error)]
pub enum UploadError {
    /// No session with this id (expired, cancelled or never created)
    #[error("unknown upload session: {0}")]
    UnknownSession(uuid::Uuid),

    /// File extension is not one of .tif/.tiff/.psb/.psd
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),

    /// Declared file size exceeds the configured maximum
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Chunk index outside `0..total_chunks`
    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    /// A chunk body exceeded the server-chosen chunk size
    #[error("chunk {index} too large: {size} bytes (chunk size {chunk_size})")]
    ChunkTooLarge {
        index: u32,
        size: u64,
        chunk_size: u64,
    },

    /// `complete` called before every chunk arrived
    #[error("upload incomplete: {received}/{total} chunks received")]
    MissingChunks { received: u32, total: u32 },

    /// Assembly needs roughly twice the file size of free disk
    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientDisk { needed: u64, available: u64 },

    /// Filesystem failure while writing or assembling chunks
    #[error("upload I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from raster drivers (window reads and header parsing).
#[derive(Debug, Error)]
pub enum RasterError {
    /// Filesystem failure while reading the source
    #[error("raster I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a container this system reads
    #[error("unsupported raster format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Sample type outside {u8, u16} (coercion policy rejects the rest)
    #[error("unsupported sample type: {0}")]
    UnsupportedSampleType(String),

    /// A window or chunk failed to decode (corrupt source region)
    #[error("corrupt region at ({left},{top}) {width}x{height}: {message}")]
    CorruptRegion {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        message: String,
    },

    /// PSB/PSD header failed validation
    #[error("invalid composite header: {0}")]
    InvalidHeader(String),

    /// Requested window lies outside the image bounds
    #[error("window out of bounds: ({left},{top}) {width}x{height} against {image_width}x{image_height}")]
    WindowOutOfBounds {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// Errors from pyramid generation.
#[derive(Debug, Error)]
pub enum TileError {
    /// Source driver failure that is not recoverable per-tile
    #[error("raster error: {0}")]
    Raster(#[from] RasterError),

    /// PNG/JPEG encode failure
    #[error("encode error: {0}")]
    Encode(String),

    /// Filesystem failure writing the tile tree
    #[error("tile I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Composite would not fit in available RAM (pre-check)
    #[error("insufficient memory: need {needed} bytes, {available} available")]
    InsufficientMemory { needed: u64, available: u64 },

    /// Tile tree would not fit on disk (pre-check)
    #[error("insufficient disk space: need {needed} bytes, {available} available")]
    InsufficientDisk { needed: u64, available: u64 },
}

impl TileError {
    /// Short token recorded in `extra_metadata.error` when a job fails.
    pub fn failure_token(&self) -> &'static str {
        match self {
            TileError::InsufficientMemory { .. } => "insufficient-memory",
            TileError::InsufficientDisk { .. } => "insufficient-disk",
            TileError::Raster(_) => "source-error",
            TileError::Encode(_) => "encode-error",
            TileError::Io(_) => "io-error",
        }
    }
}

/// Semantic error classes surfaced to the HTTP layer.
///
/// Handlers construct these; the `IntoResponse` impl in `server::handlers`
/// maps each class to its status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    UnsupportedMedia(String),

    #[error("{0}")]
    FailedDependency(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{} {} not found", entity, id))
            }
            DbError::DuplicateName(name) => {
                ApiError::Conflict(format!("dataset name '{}' already exists", name))
            }
            DbError::Sqlx(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::UnknownSession(_)
            | UploadError::ChunkOutOfRange { .. }
            | UploadError::ChunkTooLarge { .. }
            | UploadError::MissingChunks { .. } => ApiError::BadRequest(err.to_string()),
            UploadError::UnsupportedExtension(_) => ApiError::UnsupportedMedia(err.to_string()),
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            UploadError::InsufficientDisk { .. } => ApiError::ServiceUnavailable(err.to_string()),
            UploadError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RasterError> for ApiError {
    fn from(err: RasterError) -> Self {
        match err {
            RasterError::UnsupportedFormat { .. }
            | RasterError::UnsupportedSampleType(_)
            | RasterError::InvalidHeader(_) => ApiError::UnsupportedMedia(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ApiError::NotFound(format!("object not found: {}", key)),
            other => ApiError::FailedDependency(other.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
